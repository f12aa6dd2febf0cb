use thiserror::Error;

use crate::domain::entity::{GroupId, UserId};

/// Core error type for the Kinship runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A parent/child walk revisited a node or ran past the depth bound
    #[error("Family tree loop detected at user {user_id} in group {group_id} after visiting {visited} members")]
    CycleDetected {
        /// Member at which the walk gave up
        user_id: UserId,
        /// Group the walk ran in
        group_id: GroupId,
        /// Number of members visited before giving up
        visited: usize,
    },

    /// The identity already holds a pending proposal slot
    #[error("User {0} already has a pending proposal")]
    AlreadyReserved(UserId),

    /// No pending proposal for the identity
    #[error("No pending proposal for user {0}")]
    ProposalNotFound(UserId),

    /// A durable write collided and the update fallback failed too
    #[error("Durable write conflict: {0}")]
    DurableWriteConflict(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Replication channel error
    #[error("Replication error: {0}")]
    ReplicationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Timed out waiting on an external party
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether this error came from a bounded traversal giving up
    pub fn is_cycle(&self) -> bool {
        matches!(self, CoreError::CycleDetected { .. })
    }

    /// Whether the durable store or channel failed, as opposed to the request itself
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            CoreError::StateStoreError(_)
                | CoreError::DurableWriteConflict(_)
                | CoreError::ReplicationError(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                CoreError::CycleDetected {
                    user_id: UserId(7),
                    group_id: GroupId(1),
                    visited: 3,
                },
                "Family tree loop detected at user 7 in group 1 after visiting 3 members",
            ),
            (CoreError::AlreadyReserved(UserId(5)), "User 5 already has a pending proposal"),
            (CoreError::ProposalNotFound(UserId(5)), "No pending proposal for user 5"),
            (CoreError::DurableWriteConflict("dup".to_string()), "Durable write conflict: dup"),
            (CoreError::StateStoreError("db_err".to_string()), "State store error: db_err"),
            (CoreError::ReplicationError("down".to_string()), "Replication error: down"),
            (CoreError::SerializationError("ser_err".to_string()), "Serialization error: ser_err"),
            (CoreError::ValidationError("invalid".to_string()), "Validation error: invalid"),
            (CoreError::Timeout("waited".to_string()), "Timeout: waited"),
            (CoreError::ConfigurationError("cfg".to_string()), "Configuration error: cfg"),
            (CoreError::Other("other_err".to_string()), "other_err"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationError(msg) => {
                assert!(msg.contains("expected value"));
            }
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_from_str() {
        let error: CoreError = "test error message".into();
        assert_eq!(error, CoreError::Other("test error message".to_string()));
    }

    #[test]
    fn test_classification() {
        let cycle = CoreError::CycleDetected {
            user_id: UserId(1),
            group_id: GroupId(0),
            visited: 2,
        };
        assert!(cycle.is_cycle());
        assert!(!cycle.is_infrastructure());
        assert!(CoreError::StateStoreError("x".into()).is_infrastructure());
        assert!(CoreError::ReplicationError("x".into()).is_infrastructure());
        assert!(!CoreError::AlreadyReserved(UserId(1)).is_infrastructure());
    }
}
