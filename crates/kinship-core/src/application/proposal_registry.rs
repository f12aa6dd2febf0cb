//! Proposal registry
//!
//! At most one pending proposal per identity, across every proposal kind. Slots
//! are reserved and released in pairs; [`ProposalTicket`] ties the release of
//! both slots, and of the recipient's reply slot, to the lifetime of the
//! waiting task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

use super::response::ResponseRouter;
use crate::domain::entity::UserId;
use crate::domain::proposal::{
    ProposalContext, ProposalKind, ProposalRecord, ProposalReply, ProposalRole,
};
use crate::CoreError;

/// Process-local table of pending proposal slots
#[derive(Debug, Default)]
pub struct ProposalRegistry {
    slots: Mutex<HashMap<UserId, ProposalRecord>>,
}

impl ProposalRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<UserId, ProposalRecord>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a slot for `user_id`, failing if it already holds one
    pub fn reserve(&self, user_id: UserId, record: ProposalRecord) -> Result<(), CoreError> {
        let mut slots = self.slots();
        if slots.contains_key(&user_id) {
            return Err(CoreError::AlreadyReserved(user_id));
        }
        slots.insert(user_id, record);
        Ok(())
    }

    /// Reserve both participants of a proposal, or neither
    pub fn reserve_pair(
        self: &Arc<Self>,
        initiator: UserId,
        recipient: UserId,
        kind: ProposalKind,
        context: ProposalContext,
    ) -> Result<ProposalTicket, CoreError> {
        if initiator == recipient {
            return Err(CoreError::ValidationError(
                "A proposal needs two different participants".to_string(),
            ));
        }

        let mut slots = self.slots();
        for user_id in [initiator, recipient] {
            if slots.contains_key(&user_id) {
                return Err(CoreError::AlreadyReserved(user_id));
            }
        }

        slots.insert(
            initiator,
            ProposalRecord {
                role: ProposalRole::Initiator,
                kind,
                counterpart: recipient,
                context,
            },
        );
        slots.insert(
            recipient,
            ProposalRecord {
                role: ProposalRole::Recipient,
                kind,
                counterpart: initiator,
                context,
            },
        );
        drop(slots);

        debug!(initiator = %initiator, recipient = %recipient, kind = kind.as_str(), "Reserved proposal slots");

        Ok(ProposalTicket {
            registry: Arc::clone(self),
            initiator,
            recipient,
            kind,
            context,
            responses: None,
        })
    }

    /// Pending slot held by `user_id`
    pub fn lookup(&self, user_id: UserId) -> Option<ProposalRecord> {
        self.slots().get(&user_id).copied()
    }

    /// Remove the slot held by `user_id`, if any
    pub fn release(&self, user_id: UserId) -> bool {
        self.slots().remove(&user_id).is_some()
    }

    /// Remove both slots under one lock
    pub fn release_pair(&self, a: UserId, b: UserId) {
        let mut slots = self.slots();
        slots.remove(&a);
        slots.remove(&b);
    }

    /// Number of reserved slots
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Whether no slot is reserved
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

/// Both slots of an open proposal; dropping the ticket releases them
#[derive(Debug)]
#[must_use = "dropping the ticket releases the proposal slots immediately"]
pub struct ProposalTicket {
    registry: Arc<ProposalRegistry>,
    initiator: UserId,
    recipient: UserId,
    kind: ProposalKind,
    context: ProposalContext,
    responses: Option<Arc<ResponseRouter>>,
}

impl ProposalTicket {
    /// Register the recipient's reply slot in `router`; the ticket discards it on drop
    pub fn open_reply_slot(&mut self, router: Arc<ResponseRouter>) -> oneshot::Receiver<ProposalReply> {
        let receiver = router.register(self.recipient, self.context);
        self.responses = Some(router);
        receiver
    }

    /// Member who started the proposal
    pub fn initiator(&self) -> UserId {
        self.initiator
    }

    /// Member asked to respond
    pub fn recipient(&self) -> UserId {
        self.recipient
    }

    /// Workflow type
    pub fn kind(&self) -> ProposalKind {
        self.kind
    }

    /// Where the proposal lives
    pub fn context(&self) -> ProposalContext {
        self.context
    }
}

impl Drop for ProposalTicket {
    fn drop(&mut self) {
        if let Some(router) = self.responses.take() {
            router.discard(self.recipient);
        }
        self.registry.release_pair(self.initiator, self.recipient);
        debug!(initiator = %self.initiator, recipient = %self.recipient, "Released proposal slots");
    }
}
