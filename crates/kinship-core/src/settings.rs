//! Tunables for the family graph

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::CoreError;

/// Limits and policies applied by the family service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilySettings {
    /// Hard cap on nodes visited by any single walk
    #[serde(default = "default_max_traversal_depth")]
    pub max_traversal_depth: usize,

    /// How long a recipient has to answer a proposal
    #[serde(default = "default_proposal_timeout_secs")]
    pub proposal_timeout_secs: u64,

    /// Maximum children per member
    #[serde(default = "default_max_children")]
    pub max_children: usize,

    /// Maximum size of a family after a join
    #[serde(default = "default_max_family_members")]
    pub max_family_members: usize,

    /// Allow unions between members that are already related
    #[serde(default)]
    pub allow_incest: bool,
}

fn default_max_traversal_depth() -> usize {
    2048
}

fn default_proposal_timeout_secs() -> u64 {
    60
}

fn default_max_children() -> usize {
    30
}

fn default_max_family_members() -> usize {
    500
}

impl FamilySettings {
    /// Proposal timeout as a duration
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_secs(self.proposal_timeout_secs)
    }

    /// Reject settings that would disable the traversal guard or make every proposal fail
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_traversal_depth == 0 {
            return Err(CoreError::ConfigurationError(
                "max_traversal_depth must be greater than zero".to_string(),
            ));
        }
        if self.proposal_timeout_secs == 0 {
            return Err(CoreError::ConfigurationError(
                "proposal_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_family_members < 2 {
            return Err(CoreError::ConfigurationError(
                "max_family_members must allow at least two members".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for FamilySettings {
    fn default() -> Self {
        Self {
            max_traversal_depth: default_max_traversal_depth(),
            proposal_timeout_secs: default_proposal_timeout_secs(),
            max_children: default_max_children(),
            max_family_members: default_max_family_members(),
            allow_incest: false,
        }
    }
}
