//! Shared queue of work item identifiers, pulled lazily by command streams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueuePop {
    Item(String),
    /// Empty and no more items will arrive.
    Finished,
    /// Empty for now.
    Empty,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<String>>,
    sealed: AtomicBool,
    changed: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue that already holds every item and is sealed.
    pub fn sealed_with<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue = Self::new();
        queue.extend(items);
        queue.seal();
        queue
    }

    /// Returns false when the queue is already sealed.
    pub fn push(&self, item: impl Into<String>) -> bool {
        if self.is_sealed() {
            return false;
        }
        self.lock().push_back(item.into());
        self.changed.notify_waiters();
        true
    }

    pub fn extend<I, S>(&self, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for item in items {
            self.push(item);
        }
    }

    /// No more items will be pushed. Idle streams then answer demand with `SetFinished`.
    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            tracing::debug!(remaining = self.len(), "Work queue sealed");
        }
        self.changed.notify_waiters();
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn pop(&self) -> QueuePop {
        match self.lock().pop_front() {
            Some(item) => QueuePop::Item(item),
            None if self.is_sealed() => QueuePop::Finished,
            None => QueuePop::Empty,
        }
    }

    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
