//! One worker's view of the command channel.
//!
//! Every pending command (immediate, newly visible sticky, or demand for
//! the next item) holds exactly one semaphore permit. `next_command`
//! acquires one and serves immediate commands first, then sticky ones,
//! then demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use super::queue::{QueuePop, WorkQueue};
use super::sticky::{StickyLog, StickyNode};
use super::{HubInner, NotifiableCommands};
use crate::bridge::protocol::{Command, ShutdownKind};

pub struct CommandStream {
    id: u64,
    permits: Semaphore,
    immediate: Mutex<VecDeque<Command>>,
    sticky_cursor: Mutex<Option<Arc<StickyNode>>>,
    log: Arc<StickyLog>,
    queue: Arc<WorkQueue>,
    demand: AtomicUsize,
    /// Fired whenever an immediate or sticky command becomes visible.
    urgent: Notify,
    closed: AtomicBool,
    closed_token: CancellationToken,
    hub: Weak<HubInner>,
}

impl CommandStream {
    /// Built under the hub's write lock: the initial permits cover the whole
    /// sticky log so it is replayed before anything else is awaited.
    pub(super) fn new(
        id: u64,
        log: Arc<StickyLog>,
        queue: Arc<WorkQueue>,
        hub: Weak<HubInner>,
    ) -> Self {
        let replay = log.len();
        Self {
            id,
            permits: Semaphore::new(replay),
            immediate: Mutex::new(VecDeque::new()),
            sticky_cursor: Mutex::new(None),
            log,
            queue,
            demand: AtomicUsize::new(0),
            urgent: Notify::new(),
            closed: AtomicBool::new(false),
            closed_token: CancellationToken::new(),
            hub,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for the next command. `None` means the stream is closed.
    pub async fn next_command(&self) -> Option<Command> {
        'next: loop {
            if self.is_closed() {
                return None;
            }
            let permit = self.permits.acquire().await.ok()?;
            permit.forget();
            if self.is_closed() {
                return None;
            }

            if let Some(command) = self.pop_immediate() {
                return Some(command);
            }
            if let Some(command) = self.pop_sticky() {
                return Some(command);
            }
            if !self.take_demand() {
                continue;
            }

            loop {
                let changed = self.queue.changed().notified();
                let urgent = self.urgent.notified();
                tokio::pin!(changed, urgent);
                changed.as_mut().enable();
                urgent.as_mut().enable();

                match self.queue.pop() {
                    QueuePop::Item(item) => {
                        tracing::debug!(stream = self.id, %item, "Dispatching work item");
                        return Some(Command::RunItem(item));
                    }
                    QueuePop::Finished => return Some(Command::SetFinished),
                    QueuePop::Empty => {}
                }

                if self.has_urgent() {
                    self.restore_demand();
                    continue 'next;
                }

                tokio::select! {
                    _ = &mut changed => {}
                    _ = &mut urgent => {
                        self.restore_demand();
                        continue 'next;
                    }
                    _ = self.closed_token.cancelled() => return None,
                }
            }
        }
    }

    /// Deliver a command to this stream only, without persisting it.
    pub(super) fn push_immediate(&self, command: Command) {
        if self.is_closed() {
            return;
        }
        self.immediate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(command);
        self.release_urgent();
    }

    /// A new command was appended to the sticky log.
    pub(super) fn sticky_appended(&self) {
        if self.is_closed() {
            return;
        }
        self.release_urgent();
    }

    /// Close the stream. Only the first call has an effect: pending permits
    /// are drained, every waiter is woken and the stream leaves the hub.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let pending = self.permits.available_permits();
        self.permits.forget_permits(pending);
        self.permits.close();
        self.closed_token.cancel();

        if let Some(hub) = self.hub.upgrade() {
            hub.deregister(self.id);
        }
        tracing::debug!(stream = self.id, dropped_permits = pending, "Command stream closed");
    }

    fn release_urgent(&self) {
        self.permits.add_permits(1);
        self.urgent.notify_waiters();
    }

    fn restore_demand(&self) {
        self.demand.fetch_add(1, Ordering::AcqRel);
        self.permits.add_permits(1);
    }

    fn take_demand(&self) -> bool {
        self.demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok()
    }

    fn pop_immediate(&self) -> Option<Command> {
        self.immediate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn pop_sticky(&self) -> Option<Command> {
        let mut cursor = self.sticky_cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let node = self.log.next_after(cursor.as_ref())?;
        let command = node.command().clone();
        *cursor = Some(node);
        Some(command)
    }

    fn has_urgent(&self) -> bool {
        let immediate = !self
            .immediate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty();
        immediate || {
            let cursor = self.sticky_cursor.lock().unwrap_or_else(PoisonError::into_inner);
            self.log.next_after(cursor.as_ref()).is_some()
        }
    }
}

impl NotifiableCommands for CommandStream {
    /// Record demand for one more work item.
    fn request_next(&self) {
        if self.is_closed() {
            return;
        }
        self.demand.fetch_add(1, Ordering::AcqRel);
        self.permits.add_permits(1);
    }

    fn skip_remaining(&self) {
        self.push_immediate(Command::SkipRemaining);
    }

    fn shutdown(&self, kind: ShutdownKind) {
        self.push_immediate(Command::Shutdown(kind));
    }

    fn noop(&self) {
        self.push_immediate(Command::Noop);
    }

    fn acknowledge_termination(&self) {
        self.push_immediate(Command::ByeAck);
    }
}

impl std::fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStream")
            .field("id", &self.id)
            .field("available_permits", &self.permits.available_permits())
            .field("demand", &self.demand.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}
