//! Tracing layer for the worker process.
//!
//! Ships tracing events to the controller as console events, so worker
//! diagnostics show up in the controller's log with their level preserved.

use tokio::sync::mpsc;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::{ConsoleLevel, Event, FailureDetail};

/// Events from these targets are never shipped: encoding one would log again.
const SUPPRESSED_TARGETS: &[&str] = &["forkline::bridge::codec", "forkline::worker"];

pub struct WorkerTracingLayer {
    tx: mpsc::Sender<Event>,
}

impl WorkerTracingLayer {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    fn to_event(level: &Level, target: &str, message: String) -> Event {
        let message = if target.is_empty() {
            message
        } else {
            format!("[{target}] {message}")
        };
        match *level {
            Level::ERROR => Event::ConsoleError(Some(FailureDetail::new(message))),
            Level::WARN => Event::Console {
                level: ConsoleLevel::Warning,
                message: Some(message),
            },
            Level::INFO => Event::Console {
                level: ConsoleLevel::Info,
                message: Some(message),
            },
            Level::DEBUG | Level::TRACE => Event::Console {
                level: ConsoleLevel::Debug,
                message: Some(message),
            },
        }
    }
}

impl<S> Layer<S> for WorkerTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if SUPPRESSED_TARGETS.iter().any(|t| target.starts_with(t)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        // Dropped when the channel is full rather than blocking the caller.
        let _ = self
            .tx
            .try_send(Self::to_event(metadata.level(), target, visitor.message));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if let Some(inner) = self
                .message
                .strip_prefix('"')
                .and_then(|m| m.strip_suffix('"'))
            {
                self.message = inner.to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[test]
    fn ships_events_with_level() {
        let (tx, mut rx) = mpsc::channel(8);
        let subscriber = tracing_subscriber::registry().with(WorkerTracingLayer::new(tx));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "app", "loading fixtures");
            tracing::error!(target: "app", "database unreachable");
            tracing::warn!(target: "forkline::bridge::codec", "suppressed");
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Event::console_info("[app] loading fixtures")
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::ConsoleError(Some(FailureDetail::new("[app] database unreachable")))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_channel_drops_events() {
        let (tx, mut rx) = mpsc::channel(1);
        let subscriber = tracing_subscriber::registry().with(WorkerTracingLayer::new(tx));
        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!(target: "app", "first");
            tracing::debug!(target: "app", "second");
        });
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
