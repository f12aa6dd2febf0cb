//! Waiting for a human answer to a proposal

use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::domain::entity::UserId;
use crate::domain::proposal::{ProposalContext, ProposalOutcome, ProposalReply};
use crate::CoreError;

/// Wait for a reply, giving up after `timeout`
///
/// A sender dropped without replying counts as a cancellation.
pub async fn await_response(
    receiver: oneshot::Receiver<ProposalReply>,
    timeout: Duration,
) -> ProposalOutcome {
    match tokio::time::timeout(timeout, receiver).await {
        Ok(Ok(ProposalReply::Accept)) => ProposalOutcome::Accepted,
        Ok(Ok(ProposalReply::Decline)) => ProposalOutcome::Rejected,
        Ok(Ok(ProposalReply::Cancel)) | Ok(Err(_)) => ProposalOutcome::Cancelled,
        Err(_) => ProposalOutcome::TimedOut,
    }
}

#[derive(Debug)]
struct PendingReply {
    context: ProposalContext,
    sender: oneshot::Sender<ProposalReply>,
}

/// Routes replies to the task waiting on the recipient's answer
#[derive(Debug, Default)]
pub struct ResponseRouter {
    pending: DashMap<UserId, PendingReply>,
}

impl ResponseRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a reply slot for `recipient`, replacing any stale one
    pub fn register(&self, recipient: UserId, context: ProposalContext) -> oneshot::Receiver<ProposalReply> {
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(recipient, PendingReply { context, sender });
        receiver
    }

    /// Hand a reply from `channel_id` to the task waiting on `recipient`
    pub fn deliver(&self, recipient: UserId, channel_id: u64, reply: ProposalReply) -> Result<(), CoreError> {
        let Some((_, pending)) = self
            .pending
            .remove_if(&recipient, |_, pending| pending.context.channel_id == channel_id)
        else {
            if self.pending.contains_key(&recipient) {
                return Err(CoreError::ValidationError(format!(
                    "Reply for user {} came from channel {} which is not where the proposal was made",
                    recipient, channel_id
                )));
            }
            return Err(CoreError::ProposalNotFound(recipient));
        };

        pending
            .sender
            .send(reply)
            .map_err(|_| CoreError::ProposalNotFound(recipient))?;
        debug!(recipient = %recipient, ?reply, "Delivered proposal reply");
        Ok(())
    }

    /// Withdraw the proposal waiting on `recipient`, whatever channel it lives in
    pub fn cancel(&self, recipient: UserId) -> bool {
        match self.pending.remove(&recipient) {
            Some((_, pending)) => pending.sender.send(ProposalReply::Cancel).is_ok(),
            None => false,
        }
    }

    /// Drop the reply slot for `recipient` without answering
    pub fn discard(&self, recipient: UserId) {
        self.pending.remove(&recipient);
    }

    /// Whether a task is waiting on `recipient`
    pub fn is_pending(&self, recipient: UserId) -> bool {
        self.pending.contains_key(&recipient)
    }
}
