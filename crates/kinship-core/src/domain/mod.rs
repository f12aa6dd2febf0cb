/// Relationship entity model
pub mod entity;

/// Relationship descriptions
pub mod relation;

/// Proposal model
pub mod proposal;

/// Repository interfaces
pub mod repository;

/// Replication channel interface
pub mod replication;
