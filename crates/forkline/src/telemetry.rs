//! Tracing setup for controller and worker processes.
//!
//! Logs always go to stderr: in pipe mode a worker's stdout is the event
//! channel.

use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::protocol::Event;
use crate::worker_tracing_layer::WorkerTracingLayer;

/// Level for `forkline` targets when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "FORKLINE_LOG";
/// `json` switches the controller's output to JSON lines.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(level: &str) -> String {
    format!("forkline={level},forkline::bridge::codec=warn")
}

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
        EnvFilter::new(filter_directives(level))
    }
}

/// Install the controller subscriber. A second call is a no-op.
pub fn init_tracing() {
    let filter = env_filter();
    let use_json = std::env::var(LOG_FORMAT_ENV).as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

/// Install the worker subscriber: events go to stderr and are also shipped
/// to the controller through `tx` as console events.
pub fn init_worker_tracing(tx: mpsc::Sender<Event>) {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(WorkerTracingLayer::new(tx))
        .try_init();
}
