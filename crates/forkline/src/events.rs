//! Event channel: decodes worker events and hands them to one handler.
//!
//! Events reach the handler in arrival order. The loop ends on end of
//! stream, explicit close/disable, or the first decode failure; the handler
//! then gets exactly one `on_close`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::FrameError;
use crate::bridge::protocol::Event;
use crate::bridge::transport::EventSource;
use crate::pump::is_benign_close;

/// Why an event loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The worker closed its end.
    EndOfStream,
    /// Closed by the controller.
    Closed,
    /// Disabled by the controller, then drained until the worker closed its end.
    Disabled,
    /// Corrupted frame; the connection is no longer trusted.
    Malformed(String),
    /// Read failure other than a benign close.
    Failed(String),
}

impl CloseReason {
    pub fn is_orderly(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Closed | Self::Disabled)
    }
}

/// Receives decoded events. Called from the event pump task only.
pub trait EventHandler: Send {
    fn handle_event(&mut self, event: Event);

    fn on_close(&mut self, reason: CloseReason) {
        let _ = reason;
    }
}

/// Stop/disable switches for a running event channel.
#[derive(Debug, Clone)]
pub struct EventChannelControl {
    disabled: Arc<AtomicBool>,
    closed: CancellationToken,
}

impl EventChannelControl {
    /// Stop forwarding to the handler. Frames are still read and dropped,
    /// so the transport stays open until the worker closes it.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    /// Stop dispatch after the read in progress.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn is_stopped(&self) -> bool {
        self.is_disabled() || self.is_closed()
    }
}

pub struct EventChannel<S = EventSource> {
    source: S,
    control: EventChannelControl,
    transport_closed: CancellationToken,
    worker_id: u32,
}

impl<S> EventChannel<S>
where
    S: Stream<Item = Result<Event, FrameError>> + Unpin + Send,
{
    pub fn new(worker_id: u32, source: S) -> Self {
        Self {
            source,
            control: EventChannelControl {
                disabled: Arc::new(AtomicBool::new(false)),
                closed: CancellationToken::new(),
            },
            transport_closed: CancellationToken::new(),
            worker_id,
        }
    }

    /// Reads end as soon as this token is cancelled, as if the peer closed.
    pub fn with_transport_close(mut self, token: CancellationToken) -> Self {
        self.transport_closed = token;
        self
    }

    pub fn control(&self) -> EventChannelControl {
        self.control.clone()
    }

    /// Next event. `Ok(None)` means this instance is closed; end of input
    /// is `Err(FrameError::EndOfStream)`. A disabled channel keeps reading
    /// and discards what it decodes, so the worker never sees a closed pipe.
    pub async fn decode_next(&mut self) -> Result<Option<Event>, FrameError> {
        loop {
            if self.control.is_closed() {
                return Ok(None);
            }
            let next = tokio::select! {
                next = self.source.next() => next,
                _ = self.transport_closed.cancelled() => None,
            };
            match next {
                Some(Ok(_)) if self.control.is_closed() => return Ok(None),
                Some(Ok(event)) if self.control.is_disabled() => {
                    tracing::trace!(
                        worker_id = self.worker_id,
                        kind = ?event.kind(),
                        "Discarding event"
                    );
                }
                Some(Ok(event)) => return Ok(Some(event)),
                Some(Err(e)) => return Err(e),
                None => return Err(FrameError::EndOfStream),
            }
        }
    }

    /// Forward events to `handler` until the channel stops.
    ///
    /// Returns the close reason, or the error that stopped the loop when it
    /// was neither end of stream nor a benign closed-channel error.
    pub async fn run<H: EventHandler + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> Result<CloseReason, FrameError> {
        let result = loop {
            match self.decode_next().await {
                Ok(Some(event)) => {
                    tracing::trace!(
                        worker_id = self.worker_id,
                        kind = ?event.kind(),
                        "Event received"
                    );
                    handler.handle_event(event);
                }
                Ok(None) => break Ok(CloseReason::Closed),
                Err(FrameError::EndOfStream) => break Ok(self.end_of_stream()),
                Err(FrameError::Io(e)) if is_benign_close(&e) => {
                    tracing::debug!(worker_id = self.worker_id, error = %e, "Event stream closed");
                    break Ok(self.end_of_stream());
                }
                Err(e) => break Err(e),
            }
        };

        let reason = match &result {
            Ok(reason) => reason.clone(),
            Err(e) if e.is_malformed() => {
                tracing::error!(worker_id = self.worker_id, error = %e, "Corrupted event stream");
                CloseReason::Malformed(e.to_string())
            }
            Err(e) => {
                tracing::error!(worker_id = self.worker_id, error = %e, "Event stream failed");
                CloseReason::Failed(e.to_string())
            }
        };
        tracing::debug!(worker_id = self.worker_id, reason = ?reason, "Event channel stopped");
        handler.on_close(reason);
        result
    }

    fn end_of_stream(&self) -> CloseReason {
        if self.control.is_disabled() {
            CloseReason::Disabled
        } else {
            CloseReason::EndOfStream
        }
    }
}
