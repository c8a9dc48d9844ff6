use std::{collections::HashMap, time::Duration};

use log::{debug, trace};
use tokio::{sync::mpsc, task::AbortHandle};

use super::types::ParticipantId;

/// Identifies one scheduled disconnect timer. A ticket whose generation no
/// longer matches the pending entry is stale and must be ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceTicket {
    pub participant: ParticipantId,
    pub generation: u64,
}

#[derive(Debug)]
struct PendingTimer {
    generation: u64,
    handle: AbortHandle,
}

/// Cancelable disconnect timers keyed by participant.
///
/// Each timer is a task that sleeps and then posts its ticket on the expiry
/// channel; whoever owns the receiving end feeds tickets back to the
/// registry. Cancelling removes the entry if present and aborts the task,
/// so a ticket that still slips through finds no matching entry.
#[derive(Debug)]
pub struct GraceTimers {
    next_generation: u64,
    pending: HashMap<ParticipantId, PendingTimer>,
    expired_tx: mpsc::UnboundedSender<GraceTicket>,
}

impl GraceTimers {
    pub fn new(expired_tx: mpsc::UnboundedSender<GraceTicket>) -> Self {
        Self {
            next_generation: 0,
            pending: HashMap::new(),
            expired_tx,
        }
    }

    /// Start a timer for `participant`, replacing any pending one.
    /// Must be called from within a tokio runtime.
    pub fn schedule(&mut self, participant: &str, delay: Duration) -> GraceTicket {
        self.cancel(participant);
        self.next_generation += 1;

        let ticket = GraceTicket {
            participant: participant.to_string(),
            generation: self.next_generation,
        };
        let tx = self.expired_tx.clone();
        let fired = ticket.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trace!("Grace timer fired for {}", fired.participant);
            if tx.send(fired).is_err() {
                debug!("Grace timer fired after the registry went away");
            }
        })
        .abort_handle();

        debug!(
            "Scheduled grace timer #{} for {} ({:?})",
            ticket.generation, participant, delay
        );
        self.pending.insert(
            participant.to_string(),
            PendingTimer {
                generation: ticket.generation,
                handle,
            },
        );
        ticket
    }

    /// Remove-if-present; returns whether a timer was pending
    pub fn cancel(&mut self, participant: &str) -> bool {
        match self.pending.remove(participant) {
            Some(timer) => {
                timer.handle.abort();
                debug!("Cancelled grace timer #{} for {}", timer.generation, participant);
                true
            }
            None => false,
        }
    }

    /// Consume the pending entry if `ticket` is the current one
    pub fn claim(&mut self, ticket: &GraceTicket) -> bool {
        match self.pending.get(&ticket.participant) {
            Some(timer) if timer.generation == ticket.generation => {
                self.pending.remove(&ticket.participant);
                true
            }
            _ => {
                trace!("Ignoring stale grace ticket {:?}", ticket);
                false
            }
        }
    }

    pub fn is_pending(&self, participant: &str) -> bool {
        self.pending.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Drop for GraceTimers {
    fn drop(&mut self) {
        for timer in self.pending.values() {
            timer.handle.abort();
        }
    }
}
