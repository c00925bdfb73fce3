//! Owner-tracking monitor serializing episodes with thread attach/detach.
//!
//! Unlike a `MutexGuard`, ownership may be taken in one call (`begin`) and
//! given back in another (`end`), as long as both run on the same thread.

use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
pub(crate) struct CoordinationLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl CoordinationLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        assert_ne!(*owner, Some(me), "coordination lock is not reentrant");
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        *owner = Some(me);
    }

    pub(crate) fn release(&self) {
        let mut owner = self.owner.lock();
        assert_eq!(
            *owner,
            Some(thread::current().id()),
            "coordination lock released by a thread that does not own it"
        );
        *owner = None;
        self.released.notify_all();
    }

    pub(crate) fn is_held_by_current(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    pub(crate) fn guard(&self) -> CoordinationGuard<'_> {
        self.acquire();
        CoordinationGuard { lock: self }
    }
}

pub(crate) struct CoordinationGuard<'a> {
    lock: &'a CoordinationLock,
}

impl Drop for CoordinationGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
