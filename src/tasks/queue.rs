//! LIFO task queue: single producer, many lock-free consumers.
//!
//! Tasks live in an arena of nodes whose `next` links never change once
//! pushed. The head is one 64-bit word packing a generation tag (high half)
//! with the index of the top node (low half), and consumers pop by
//! compare-and-swap on that word. Pushing needs `&mut self`, so the arena
//! never moves while consumers hold `&self`.

use super::task::Task;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::TARGET;

/// Index marking the end of the chain.
const NIL: u32 = u32::MAX;

/// CAS failures in a single `grab` before the contention is logged.
const SPIN_LOG_THRESHOLD: u32 = 3;

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

struct TaskNode {
    task: Box<dyn Task>,
    next: u32,
}

/// A batch of tasks waiting to be handed to a task manager.
///
/// # Examples
///
/// ```
/// use pauseless_sync::tasks::{FnTask, TaskQueue};
///
/// let mut queue = TaskQueue::new();
/// queue.enqueue(FnTask::new("a", |_| {}));
/// queue.enqueue(FnTask::new("b", |_| {}));
/// assert_eq!(queue.len(), 2);
///
/// // Last in, first out.
/// assert_eq!(queue.grab().map(|task| task.name()), Some("b"));
/// assert_eq!(queue.grab().map(|task| task.name()), Some("a"));
/// assert!(queue.grab().is_none());
/// assert!(queue.is_empty());
/// ```
pub struct TaskQueue {
    nodes: Vec<TaskNode>,
    head: AtomicU64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            head: AtomicU64::new(pack(0, NIL)),
        }
    }

    /// A heap-allocated queue, for callers that hand queues around by pointer.
    pub fn boxed() -> Box<Self> {
        Box::new(Self::new())
    }

    pub fn enqueue<T: Task + 'static>(&mut self, task: T) {
        self.enqueue_boxed(Box::new(task));
    }

    pub fn enqueue_boxed(&mut self, task: Box<dyn Task>) {
        let head = self.head.get_mut();
        let (tag, top) = unpack(*head);
        let index = u32::try_from(self.nodes.len())
            .ok()
            .filter(|&index| index != NIL)
            .unwrap_or_else(|| panic!("task queue holds more than {} tasks", NIL - 1));
        self.nodes.push(TaskNode { task, next: top });
        *head = pack(tag.wrapping_add(1), index);
    }

    /// Pop the most recently enqueued task. Safe to call from many threads.
    pub fn grab(&self) -> Option<&dyn Task> {
        let mut spins = 0u32;
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack(current);
            if index == NIL {
                return None;
            }

            let node = &self.nodes[index as usize];
            let next = pack(tag.wrapping_add(1), node.next);
            match self
                .head
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if spins > SPIN_LOG_THRESHOLD {
                        tracing::debug!(target: TARGET, spins, "contended task grab");
                    }
                    return Some(&*node.task);
                }
                Err(actual) => {
                    current = actual;
                    spins += 1;
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Acquire)).1 == NIL
    }

    /// Tasks still reachable from the head. Walks the chain.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut index = unpack(self.head.load(Ordering::Acquire)).1;
        while index != NIL {
            count += 1;
            index = self.nodes[index as usize].next;
        }
        count
    }

    /// Drop every task, grabbed or not, and reset to empty.
    pub fn clear(&mut self) {
        self.nodes.clear();
        let head = self.head.get_mut();
        let (tag, _) = unpack(*head);
        *head = pack(tag.wrapping_add(1), NIL);
    }

    /// Move every task of `other` into this queue in O(1), leaving `other`
    /// empty.
    ///
    /// # Panics
    ///
    /// If this queue still has tasks that were not grabbed.
    pub fn enqueue_list(&mut self, other: &mut TaskQueue) {
        assert!(self.is_empty(), "enqueue_list into a non-empty task queue");
        if other.is_empty() {
            return;
        }
        std::mem::swap(&mut self.nodes, &mut other.nodes);
        std::mem::swap(self.head.get_mut(), other.head.get_mut());
        other.clear();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .field("arena", &self.nodes.len())
            .finish()
    }
}
