//! Episode state shared by safepoints and checkpoints

use std::sync::atomic::{AtomicU8, Ordering};

/// Which coordination episode, if any, is in flight.
///
/// Written only while the coordination lock is held; read anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EpisodeState {
    /// Mutators run freely
    NotSynchronized = 0,
    /// `begin()` is stealing locks and waiting for stragglers
    Synchronizing = 1,
    /// Every mutator lock is held by the controller
    Synchronized = 2,
    /// A checkpoint callback is being delivered
    Checkpointing = 3,
}

impl EpisodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EpisodeState::NotSynchronized,
            1 => EpisodeState::Synchronizing,
            2 => EpisodeState::Synchronized,
            3 => EpisodeState::Checkpointing,
            other => unreachable!("corrupt episode state {other}"),
        }
    }
}

#[derive(Debug)]
pub(super) struct AtomicEpisodeState(AtomicU8);

impl AtomicEpisodeState {
    pub(super) fn new() -> Self {
        Self(AtomicU8::new(EpisodeState::NotSynchronized as u8))
    }

    pub(super) fn load(&self) -> EpisodeState {
        EpisodeState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(super) fn store(&self, state: EpisodeState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
