//! Two-party proposal model

use serde::{Deserialize, Serialize};

use super::entity::{GroupId, UserId};

/// Which side of a proposal an identity is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalRole {
    /// Started the proposal
    Initiator,
    /// Asked to respond
    Recipient,
}

/// Workflow type of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalKind {
    /// Initiator asks the recipient to become their partner
    Union,
    /// Initiator asks to become the recipient's parent
    Adoption,
    /// Initiator asks the recipient to become their parent
    ParentRequest,
}

/// The edge a proposal creates once accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposedEdge {
    /// Reciprocal partner edge
    Partner(UserId, UserId),
    /// Parent/child edge
    Parent {
        /// New parent
        parent: UserId,
        /// New child
        child: UserId,
    },
}

impl ProposalKind {
    /// Edge created when a proposal of this kind is accepted
    pub fn edge(&self, initiator: UserId, recipient: UserId) -> ProposedEdge {
        match self {
            ProposalKind::Union => ProposedEdge::Partner(initiator, recipient),
            ProposalKind::Adoption => ProposedEdge::Parent {
                parent: initiator,
                child: recipient,
            },
            ProposalKind::ParentRequest => ProposedEdge::Parent {
                parent: recipient,
                child: initiator,
            },
        }
    }

    /// Short name used in logs and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalKind::Union => "UNION",
            ProposalKind::Adoption => "ADOPTION",
            ProposalKind::ParentRequest => "PARENT_REQUEST",
        }
    }
}

/// Where a proposal was made; a reply must come from the same place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalContext {
    /// Group whose graph the proposal edits
    pub group_id: GroupId,
    /// Channel or session the recipient must answer in
    pub channel_id: u64,
}

/// One identity's slot in a pending proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRecord {
    /// Side of the proposal
    pub role: ProposalRole,
    /// Workflow type
    pub kind: ProposalKind,
    /// The other participant
    pub counterpart: UserId,
    /// Where the proposal lives
    pub context: ProposalContext,
}

/// A participant's answer to a pending proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalReply {
    /// Recipient agrees
    Accept,
    /// Recipient refuses
    Decline,
    /// Initiator withdraws
    Cancel,
}

/// Terminal state of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalOutcome {
    /// Recipient agreed and the edge was committed
    Accepted,
    /// Recipient refused
    Rejected,
    /// No answer before the deadline
    TimedOut,
    /// Initiator withdrew, or the wait was abandoned
    Cancelled,
}
