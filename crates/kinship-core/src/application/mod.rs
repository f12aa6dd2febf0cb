/// Process-local entity cache
pub mod entity_cache;

/// Bounded graph walks: root, span, relation
pub mod traversal;

/// At-most-one pending proposal per identity
pub mod proposal_registry;

/// Timeout-bounded wait for proposal replies
pub mod response;

/// Publishing and applying entity snapshots
pub mod replication;

/// Mutating workflows and read queries
pub mod family_service;
