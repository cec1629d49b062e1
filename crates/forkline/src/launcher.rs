//! Controller-side wiring: spawn a worker, bind its fork channel and start
//! the dispatch loops.
//!
//! The session owns what workers share: the work queue and command hub,
//! and the attempt history every worker's events fold into.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::process::{Child, Command};

use crate::aggregator::AttemptHistory;
use crate::bridge::transport::{ConnectionDescriptor, ForkChannel, TransportError, create_transport};
use crate::client::{ForkClient, ForkClientHandle};
use crate::commands::{CommandHub, WorkQueue};
use crate::config::ChannelConfig;
use crate::events::{CloseReason, EventChannel, EventChannelControl};
use crate::pump::{
    CountdownCloseable, PumpError, PumpHandle, spawn_command_pump, spawn_event_pump,
    spawn_native_output_consumer,
};
use crate::worker::CHANNEL_ENV;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What a spawner needs to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub worker_id: u32,
    pub descriptor: ConnectionDescriptor,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    /// The child must have piped stdin and stdout.
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError>;
}

/// Spawns a worker executable, passing the descriptor in [`CHANNEL_ENV`].
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(CHANNEL_ENV, config.descriptor.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Shared state for every worker of one run.
pub struct ForkSession {
    config: ChannelConfig,
    hub: CommandHub,
    history: Arc<AttemptHistory>,
}

impl ForkSession {
    pub fn new(config: ChannelConfig, queue: Arc<WorkQueue>) -> Self {
        Self {
            config,
            hub: CommandHub::new(queue),
            history: Arc::new(AttemptHistory::new()),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn hub(&self) -> &CommandHub {
        &self.hub
    }

    pub fn history(&self) -> &Arc<AttemptHistory> {
        &self.history
    }

    /// Connect `channel`, bind both directions and start the dispatch loops.
    ///
    /// Nothing is spawned when connecting fails, e.g. on a session id
    /// mismatch.
    pub async fn attach_worker(
        &self,
        mut channel: ForkChannel,
    ) -> Result<AttachedWorker, TransportError> {
        let worker_id = channel.worker_id();
        channel.connect().await?;
        let sink = channel.bind_command_channel()?;
        let source = channel.bind_event_channel(&self.config)?;
        let native_output = channel.take_native_output();

        let close_token = channel.close_token();
        let countdown =
            CountdownCloseable::new(channel.countdown_permits(), move || close_token.cancel());

        let stream = self.hub.build();
        let client = ForkClient::new(
            worker_id,
            Arc::clone(&stream),
            self.hub.immediate(),
            Arc::clone(&self.history),
        );
        let client_handle = client.handle();

        let events =
            EventChannel::new(worker_id, source).with_transport_close(channel.close_token());
        let control = events.control();

        let mut pumps = vec![
            spawn_command_pump(worker_id, stream, sink, countdown.clone()),
            spawn_event_pump(worker_id, events, client, countdown.clone()),
        ];
        if matches!(channel, ForkChannel::Socket(_)) {
            match native_output {
                Some(reader) => {
                    pumps.push(spawn_native_output_consumer(worker_id, reader, countdown))
                }
                None => countdown.countdown(),
            }
        }

        tracing::info!(worker_id, descriptor = %channel.connection_descriptor(), "Worker attached");
        Ok(AttachedWorker {
            channel,
            client: client_handle,
            control,
            pumps,
        })
    }

    /// Open a transport, spawn a worker for it and attach.
    pub async fn start_worker(
        &self,
        spawner: &dyn WorkerSpawner,
        worker_id: u32,
    ) -> Result<RunningWorker, LaunchError> {
        let mut channel = create_transport(&self.config, worker_id).await?;
        let spawn_config = WorkerSpawnConfig {
            worker_id,
            descriptor: channel.connection_descriptor(),
        };
        let mut child = spawner.spawn(&spawn_config)?;

        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            let _ = child.start_kill();
            return Err(SpawnError::Other("worker stdio is not piped".to_string()).into());
        };
        channel.attach_process_streams(stdout, stdin);

        match self.attach_worker(channel).await {
            Ok(worker) => Ok(RunningWorker { worker, child }),
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Failed to attach worker");
                let _ = child.start_kill();
                Err(e.into())
            }
        }
    }

    /// Close every command stream; workers see their channels end.
    pub fn close(&self) {
        self.hub.close();
    }
}

/// Summary of one worker's channel after its dispatch loops finished.
#[derive(Debug)]
pub struct WorkerReport {
    pub worker_id: u32,
    pub said_goodbye: bool,
    pub close_reason: Option<CloseReason>,
    pub errors: Vec<Arc<PumpError>>,
}

/// A worker whose dispatch loops are running.
pub struct AttachedWorker {
    channel: ForkChannel,
    client: ForkClientHandle,
    control: EventChannelControl,
    pumps: Vec<PumpHandle>,
}

impl AttachedWorker {
    pub fn worker_id(&self) -> u32 {
        self.channel.worker_id()
    }

    pub fn client(&self) -> &ForkClientHandle {
        &self.client
    }

    pub fn events(&self) -> &EventChannelControl {
        &self.control
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Force the transport closed; pending reads end as end of stream.
    pub fn close(&self) {
        self.channel.close();
    }

    /// Wait for every dispatch loop to exit.
    pub async fn wait(self) -> WorkerReport {
        let Self {
            channel,
            client,
            pumps,
            ..
        } = self;
        let mut errors = Vec::new();
        for pump in pumps {
            if let Some(e) = pump.join().await {
                errors.push(e);
            }
        }
        channel.close();
        WorkerReport {
            worker_id: client.worker_id(),
            said_goodbye: client.said_goodbye(),
            close_reason: client.close_reason(),
            errors,
        }
    }
}

/// An attached worker together with its process.
pub struct RunningWorker {
    worker: AttachedWorker,
    child: Child,
}

impl RunningWorker {
    pub fn worker(&self) -> &AttachedWorker {
        &self.worker
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the dispatch loops, then for the process to exit.
    pub async fn wait(self) -> std::io::Result<(WorkerReport, ExitStatus)> {
        let Self { worker, mut child } = self;
        let report = worker.wait().await;
        let status = child.wait().await?;
        tracing::debug!(worker_id = report.worker_id, status = %status, "Worker exited");
        Ok((report, status))
    }
}
