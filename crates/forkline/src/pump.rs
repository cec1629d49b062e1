//! Dispatch loops moving commands and events between channels and a transport.
//!
//! Each loop is a tokio task. Errors are recorded on the [`PumpHandle`],
//! never propagated across tasks. Every loop counts down a shared
//! [`CountdownCloseable`] when it exits, however it exits; the transport
//! close step runs once the last one is done.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::{Sink, SinkExt, Stream};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::bridge::codec::FrameError;
use crate::bridge::protocol::{Command, Event};
use crate::bridge::transport::BoxedReader;
use crate::commands::CommandStream;
use crate::events::{EventChannel, EventHandler};

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("frame error: {0}")]
    Frame(FrameError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for PumpError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => Self::Io(io),
            other => Self::Frame(other),
        }
    }
}

/// Errors that only mean the peer is gone.
pub fn is_benign_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

fn is_benign(err: &PumpError) -> bool {
    match err {
        PumpError::Io(e) => is_benign_close(e),
        PumpError::Frame(FrameError::EndOfStream) => true,
        PumpError::Frame(_) => false,
    }
}

type Closer = Box<dyn FnOnce() + Send>;

struct CountdownInner {
    remaining: AtomicUsize,
    closer: Mutex<Option<Closer>>,
}

/// Runs a close step exactly once, after a fixed number of countdowns.
#[derive(Clone)]
pub struct CountdownCloseable {
    inner: Arc<CountdownInner>,
}

impl CountdownCloseable {
    /// With zero permits the close step runs immediately.
    pub fn new(permits: usize, closer: impl FnOnce() + Send + 'static) -> Self {
        let countdown = Self {
            inner: Arc::new(CountdownInner {
                remaining: AtomicUsize::new(permits),
                closer: Mutex::new(Some(Box::new(closer))),
            }),
        };
        if permits == 0 {
            countdown.run_closer();
        }
        countdown
    }

    /// Release one permit. Extra countdowns after zero are ignored.
    pub fn countdown(&self) {
        let previous = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.run_closer();
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    /// Counts down once when dropped.
    pub fn guard(&self) -> CountdownGuard {
        CountdownGuard {
            countdown: self.clone(),
        }
    }

    fn run_closer(&self) {
        let closer = self
            .inner
            .closer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(closer) = closer {
            tracing::trace!("Countdown reached zero, closing transport");
            closer();
        }
    }
}

pub struct CountdownGuard {
    countdown: CountdownCloseable,
}

impl Drop for CountdownGuard {
    fn drop(&mut self) {
        self.countdown.countdown();
    }
}

type ErrorSlot = Arc<Mutex<Option<Arc<PumpError>>>>;

fn record(slot: &ErrorSlot, worker_id: u32, pump: &'static str, err: PumpError) {
    if is_benign(&err) {
        tracing::debug!(worker_id, pump, error = %err, "Channel closed by peer");
        return;
    }
    tracing::error!(worker_id, pump, error = %err, "Dispatch loop failed");
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(err));
}

/// Handle to a running dispatch loop.
pub struct PumpHandle {
    name: &'static str,
    task: JoinHandle<()>,
    last_error: ErrorSlot,
}

impl PumpHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// The recorded non-benign error, if any.
    pub fn last_error(&self) -> Option<Arc<PumpError>> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for the loop to exit; returns its recorded error.
    pub async fn join(self) -> Option<Arc<PumpError>> {
        let Self {
            name,
            task,
            last_error,
        } = self;
        if let Err(e) = task.await {
            tracing::error!(pump = name, error = %e, "Dispatch task panicked");
        }
        last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Drain `stream` into `sink` until the stream closes or the sink fails.
pub fn spawn_command_pump<S>(
    worker_id: u32,
    stream: Arc<CommandStream>,
    mut sink: S,
    countdown: CountdownCloseable,
) -> PumpHandle
where
    S: Sink<Command, Error = FrameError> + Unpin + Send + 'static,
{
    let last_error: ErrorSlot = Arc::default();
    let slot = Arc::clone(&last_error);
    let task = tokio::spawn(async move {
        let _guard = countdown.guard();
        while let Some(command) = stream.next_command().await {
            tracing::trace!(worker_id, command = ?command, "Sending command");
            if let Err(e) = sink.send(command).await {
                record(&slot, worker_id, "command", e.into());
                break;
            }
        }
        stream.close();
        if let Err(e) = sink.close().await {
            record(&slot, worker_id, "command", e.into());
        }
        tracing::debug!(worker_id, "Command pump exiting");
    });
    PumpHandle {
        name: "command",
        task,
        last_error,
    }
}

/// Run `channel` into `handler` on its own task.
pub fn spawn_event_pump<S, H>(
    worker_id: u32,
    mut channel: EventChannel<S>,
    mut handler: H,
    countdown: CountdownCloseable,
) -> PumpHandle
where
    S: Stream<Item = Result<Event, FrameError>> + Unpin + Send + 'static,
    H: EventHandler + 'static,
{
    let last_error: ErrorSlot = Arc::default();
    let slot = Arc::clone(&last_error);
    let task = tokio::spawn(async move {
        let _guard = countdown.guard();
        if let Err(e) = channel.run(&mut handler).await {
            record(&slot, worker_id, "event", e.into());
        }
        tracing::debug!(worker_id, "Event pump exiting");
    });
    PumpHandle {
        name: "event",
        task,
        last_error,
    }
}

/// Log what a socket-mode worker prints straight to stdout.
pub fn spawn_native_output_consumer(
    worker_id: u32,
    reader: BoxedReader,
    countdown: CountdownCloseable,
) -> PumpHandle {
    let last_error: ErrorSlot = Arc::default();
    let slot = Arc::clone(&last_error);
    let task = tokio::spawn(async move {
        let _guard = countdown.guard();
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::warn!(
                        target: "forkline::worker_output",
                        worker_id,
                        %line,
                        "Corrupted channel: worker wrote directly to stdout"
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    record(&slot, worker_id, "native-output", e.into());
                    break;
                }
            }
        }
    });
    PumpHandle {
        name: "native-output",
        task,
        last_error,
    }
}
