//! Command channel: controller-side producers feeding per-worker streams.
//!
//! - `CommandHub`: one per session; owns the sticky log and the live streams
//! - `CommandStream`: one per worker; drained by the command pump
//! - immediate notifier: delivered once to every live stream, not persisted
//! - sticky notifier: deduplicated into the log and replayed to late streams

mod queue;
mod sticky;
mod stream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

pub use queue::WorkQueue;
pub use stream::CommandStream;

use crate::bridge::protocol::{Command, ShutdownKind};
use sticky::StickyLog;

/// Producer-side view of a command channel.
pub trait NotifiableCommands: Send + Sync {
    fn request_next(&self);

    fn skip_remaining(&self);

    fn shutdown(&self, kind: ShutdownKind);

    fn noop(&self);

    fn acknowledge_termination(&self);
}

pub(crate) struct HubInner {
    log: Arc<StickyLog>,
    queue: Arc<WorkQueue>,
    streams: RwLock<Vec<Arc<CommandStream>>>,
    next_id: AtomicU64,
}

impl HubInner {
    fn streams(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<CommandStream>>> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id() != id);
    }

    fn broadcast_immediate(&self, command: Command) {
        let streams = self.streams();
        tracing::debug!(
            command = ?command,
            streams = streams.len(),
            "Broadcasting immediate command"
        );
        for stream in streams.iter() {
            stream.push_immediate(command.clone());
        }
    }

    fn append_sticky(&self, command: Command) {
        // Read lock: appends may run concurrently, but never alongside a
        // stream being built, so a new stream's replay count is exact.
        let streams = self.streams();
        if self.log.append_if_absent(&command) {
            tracing::debug!(command = ?command, streams = streams.len(), "Appended sticky command");
            for stream in streams.iter() {
                stream.sticky_appended();
            }
        } else {
            tracing::trace!(command = ?command, "Sticky command already logged");
        }
    }
}

/// Session-wide owner of command streams.
#[derive(Clone)]
pub struct CommandHub {
    inner: Arc<HubInner>,
}

impl CommandHub {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                log: Arc::new(StickyLog::new()),
                queue,
                streams: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.inner.queue
    }

    /// New stream for one worker. It first replays the sticky log.
    pub fn build(&self) -> Arc<CommandStream> {
        let mut streams = self
            .inner
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(CommandStream::new(
            id,
            Arc::clone(&self.inner.log),
            Arc::clone(&self.inner.queue),
            Arc::downgrade(&self.inner),
        ));
        streams.push(Arc::clone(&stream));
        tracing::debug!(stream = id, replay = self.inner.log.len(), "Built command stream");
        stream
    }

    pub fn immediate(&self) -> ImmediateNotifier {
        ImmediateNotifier {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn sticky(&self) -> StickyNotifier {
        StickyNotifier {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn live_streams(&self) -> usize {
        self.inner.streams().len()
    }

    /// Commands in the sticky log, in append order.
    pub fn sticky_commands(&self) -> Vec<Command> {
        self.inner.log.snapshot()
    }

    /// Close every live stream.
    pub fn close(&self) {
        let streams: Vec<_> = self.inner.streams().iter().cloned().collect();
        for stream in streams {
            stream.close();
        }
    }
}

/// Delivers each command once to the streams live at call time.
#[derive(Clone)]
pub struct ImmediateNotifier {
    inner: Arc<HubInner>,
}

impl NotifiableCommands for ImmediateNotifier {
    /// Demand is per stream; see [`CommandStream`].
    fn request_next(&self) {
        tracing::trace!("Ignoring demand on the immediate broadcast");
    }

    fn skip_remaining(&self) {
        self.inner.broadcast_immediate(Command::SkipRemaining);
    }

    fn shutdown(&self, kind: ShutdownKind) {
        self.inner.broadcast_immediate(Command::Shutdown(kind));
    }

    fn noop(&self) {
        self.inner.broadcast_immediate(Command::Noop);
    }

    fn acknowledge_termination(&self) {
        self.inner.broadcast_immediate(Command::ByeAck);
    }
}

/// Persists each distinct command for current and future streams.
#[derive(Clone)]
pub struct StickyNotifier {
    inner: Arc<HubInner>,
}

impl NotifiableCommands for StickyNotifier {
    fn request_next(&self) {
        tracing::trace!("Ignoring demand on the sticky broadcast");
    }

    fn skip_remaining(&self) {
        self.inner.append_sticky(Command::SkipRemaining);
    }

    fn shutdown(&self, kind: ShutdownKind) {
        self.inner.append_sticky(Command::Shutdown(kind));
    }

    fn noop(&self) {
        self.inner.append_sticky(Command::Noop);
    }

    fn acknowledge_termination(&self) {
        self.inner.append_sticky(Command::ByeAck);
    }
}
