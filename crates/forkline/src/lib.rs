//! forkline: controller/worker fork channel for distributing work items.

mod telemetry;
mod worker_tracing_layer;

pub mod aggregator;
pub mod bridge;
pub mod client;
pub mod commands;
pub mod config;
pub mod events;
pub mod launcher;
pub mod pump;
pub mod worker;

pub use aggregator::{
    Attempt, AttemptHistory, Classification, MergedResult, Outcome, RunStatistics, classify,
};
pub use bridge::codec::{CommandCodec, EventCodec, FrameError};
pub use bridge::protocol::{
    Command, ConsoleLevel, Event, FailureDetail, LifecycleEvent, LifecycleKind, ReportEntry,
    RunMode, ShutdownKind, StreamKind,
};
pub use bridge::transport::{ConnectionDescriptor, ForkChannel, TransportError, create_transport};
pub use client::{ForkClient, ForkClientHandle};
pub use commands::{CommandHub, CommandStream, NotifiableCommands, WorkQueue};
pub use config::{ChannelConfig, ConfigError, TransportKind};
pub use events::{CloseReason, EventChannel, EventHandler};
pub use launcher::{
    AttachedWorker, CommandSpawner, ForkSession, LaunchError, RunningWorker, SpawnError,
    WorkerReport, WorkerSpawner,
};
pub use telemetry::{init_tracing, init_worker_tracing};
pub use worker::{
    EventEmitter, ItemReporter, RunningAttempt, WorkItemHandler, WorkerConnection, WorkerError,
    WorkerExit, run_worker,
};
pub use worker_tracing_layer::WorkerTracingLayer;
