//! Event bus for safepoint and checkpoint notifications

use flume::{Receiver, Sender, TrySendError};
use std::time::Duration;

/// Events published when a coordination episode changes phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Every mutator lock is held by the controller
    SafepointReached {
        threads: usize,
        time_to_safepoint: Duration,
    },
    /// The controller released every mutator
    SafepointEnded { threads: usize, total: Duration },
    /// Every mutator ran the checkpoint callback
    CheckpointCompleted {
        threads: usize,
        self_checkpoints: usize,
        priority_boosts: usize,
    },
    /// Some mutators missed the episode's diagnostic deadline
    TimeoutDetected {
        checkpoint: bool,
        unresponsive: Vec<usize>,
    },
}

/// Bounded broadcast-to-one channel.
///
/// Publishing never blocks the coordinator; once the buffer is full new
/// events are dropped until a subscriber drains it.
#[derive(Debug)]
pub(super) struct EventBus {
    sender: Sender<SyncEvent>,
    receiver: Receiver<SyncEvent>,
}

impl EventBus {
    pub(super) fn new(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity);
        Self { sender, receiver }
    }

    pub(super) fn publish(&self, event: SyncEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!(target: "pauseless_sync::safepoint", ?event, "event bus full, dropping");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub(super) fn subscribe(&self) -> Receiver<SyncEvent> {
        self.receiver.clone()
    }
}
