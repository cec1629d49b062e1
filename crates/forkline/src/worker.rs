//! Worker side of the fork channel.
//!
//! The worker pulls work: it sends `next-test`, runs whatever item comes
//! back, reports lifecycle events, and repeats until the controller says
//! the queue is finished, asks it to skip or shuts it down. It then says
//! goodbye and waits for the acknowledgement before closing its end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CommandCodec, EventCodec, FrameError};
use crate::bridge::protocol::{
    Command, ConsoleLevel, Event, FailureDetail, LifecycleKind, ReportEntry, RunMode,
    ShutdownKind, StreamKind,
};
use crate::bridge::transport::{BoxedReader, BoxedWriter, ConnectionDescriptor, TransportError};
use crate::config::ChannelConfig;

/// Environment variable carrying the rendered [`ConnectionDescriptor`].
pub const CHANNEL_ENV: &str = "FORKLINE_CHANNEL";

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("work item failed: {0}")]
    Item(String),
}

/// How a worker's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue was drained.
    Finished,
    /// The controller asked to skip the remaining items.
    Skipped,
    /// Orderly shutdown requested by the controller.
    Shutdown(ShutdownKind),
    /// Kill requested; no goodbye was sent.
    Killed,
    /// The command stream ended before the run finished.
    ControllerGone,
}

/// Read the connection descriptor the controller handed over.
pub fn descriptor_from_env() -> Result<ConnectionDescriptor, TransportError> {
    let value = std::env::var(CHANNEL_ENV)
        .map_err(|_| TransportError::InvalidDescriptor(format!("{CHANNEL_ENV} is not set")))?;
    value.parse()
}

/// Worker end of a fork channel, before it is split.
pub struct WorkerConnection {
    commands: FramedRead<BoxedReader, CommandCodec>,
    events: EventEmitter,
}

impl WorkerConnection {
    /// Connect using `descriptor`. Pipe mode uses this process's stdin and
    /// stdout; socket mode connects and presents the session id first.
    pub async fn connect(
        descriptor: &ConnectionDescriptor,
        config: &ChannelConfig,
    ) -> Result<Self, TransportError> {
        match descriptor {
            ConnectionDescriptor::Pipe { worker_id } => {
                tracing::debug!(worker_id, transport_type = "pipe", "Connecting to controller");
                Ok(Self::from_streams(tokio::io::stdin(), tokio::io::stdout(), config))
            }
            ConnectionDescriptor::Tcp { addr, session_id } => {
                tracing::debug!(%addr, transport_type = "tcp", "Connecting to controller");
                let connect = TcpStream::connect(*addr);
                let mut stream = tokio::time::timeout(config.connect_timeout, connect)
                    .await
                    .map_err(|_| TransportError::ConnectTimeout(config.connect_timeout))??;
                stream.set_nodelay(true)?;
                stream.write_all(session_id.as_bytes()).await?;
                stream.flush().await?;
                let (read, write) = stream.into_split();
                Ok(Self::from_streams(read, write, config))
            }
        }
    }

    /// Wrap an already-connected byte stream pair.
    pub fn from_streams<R, W>(reader: R, writer: W, config: &ChannelConfig) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        let max = config.max_segment_len;
        Self {
            commands: FramedRead::new(reader, CommandCodec::new().with_max_segment_len(max)),
            events: EventEmitter {
                inner: Arc::new(Mutex::new(FramedWrite::new(
                    writer,
                    EventCodec::new().with_max_segment_len(max),
                ))),
            },
        }
    }

    /// Emitter for events sent outside the worker loop, such as forwarded logs.
    pub fn emitter(&self) -> EventEmitter {
        self.events.clone()
    }

    pub fn split(self) -> (CommandReader, EventEmitter) {
        (
            CommandReader {
                inner: self.commands,
            },
            self.events,
        )
    }
}

pub struct CommandReader {
    inner: FramedRead<BoxedReader, CommandCodec>,
}

impl CommandReader {
    /// `Ok(None)` once the controller closed its end.
    pub async fn next_command(&mut self) -> Result<Option<Command>, FrameError> {
        match self.inner.next().await {
            Some(Ok(command)) => Ok(Some(command)),
            Some(Err(FrameError::EndOfStream)) | None => Ok(None),
            Some(Err(e)) => Err(e),
        }
    }
}

/// Shared writer for the event direction. Frames are written whole, so
/// clones may emit from different tasks.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<Mutex<FramedWrite<BoxedWriter, EventCodec>>>,
}

impl EventEmitter {
    pub async fn emit(&self, event: Event) -> Result<(), FrameError> {
        self.inner.lock().await.send(event).await
    }

    pub async fn next_test(&self) -> Result<(), FrameError> {
        self.emit(Event::NextTest).await
    }

    pub async fn stop_on_next_test(&self) -> Result<(), FrameError> {
        self.emit(Event::StopOnNextTest).await
    }

    pub async fn bye(&self) -> Result<(), FrameError> {
        self.emit(Event::Bye).await
    }

    pub async fn console(
        &self,
        level: ConsoleLevel,
        message: impl Into<String>,
    ) -> Result<(), FrameError> {
        self.emit(Event::Console {
            level,
            message: Some(message.into()),
        })
        .await
    }

    pub async fn console_error(&self, failure: FailureDetail) -> Result<(), FrameError> {
        self.emit(Event::ConsoleError(Some(failure))).await
    }

    pub async fn system_property(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), FrameError> {
        self.emit(Event::SystemProperty {
            run_mode: RunMode::Normal,
            attempt_id: None,
            key: Some(key.into()),
            value: Some(value.into()),
        })
        .await
    }

    pub async fn fatal_exit(&self, failure: FailureDetail) -> Result<(), FrameError> {
        self.emit(Event::FatalExit(Some(failure))).await
    }

    /// Forward events produced elsewhere (e.g. by
    /// [`WorkerTracingLayer`](crate::WorkerTracingLayer))
    /// until the sender side is dropped or a write fails.
    pub fn forward(&self, mut rx: mpsc::Receiver<Event>) -> tokio::task::JoinHandle<()> {
        let emitter = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if emitter.emit(event).await.is_err() {
                    break;
                }
            }
        })
    }

    async fn close(&self) -> Result<(), FrameError> {
        let mut inner = self.inner.lock().await;
        SinkExt::<Event>::close(&mut *inner).await
    }
}

/// Runs one work item, reporting through `reporter`.
///
/// Returning `Err(WorkerError::Item)` reports the item as errored and the
/// worker moves on. Any other error stops the worker.
#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    async fn run_item(&self, item: &str, reporter: &ItemReporter) -> Result<(), WorkerError>;
}

/// Started attempt that has not reported an outcome yet.
#[derive(Debug, Clone)]
struct OpenAttempt {
    run_mode: RunMode,
    attempt_id: i64,
    entry: ReportEntry,
    started: Instant,
}

type OpenSlot = Arc<std::sync::Mutex<Option<OpenAttempt>>>;

/// Reports attempts for one work item.
pub struct ItemReporter {
    emitter: EventEmitter,
    source: String,
    run_mode: RunMode,
    attempts: Arc<AtomicI64>,
    open: OpenSlot,
}

impl ItemReporter {
    fn new(emitter: EventEmitter, source: String, attempts: Arc<AtomicI64>) -> Self {
        Self {
            emitter,
            source,
            run_mode: RunMode::Normal,
            attempts,
            open: OpenSlot::default(),
        }
    }

    pub fn item(&self) -> &str {
        &self.source
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    /// Reporter for re-running after a failure; attempts it starts carry
    /// the rerun mode.
    pub fn rerun(&self) -> ItemReporter {
        ItemReporter {
            emitter: self.emitter.clone(),
            source: self.source.clone(),
            run_mode: RunMode::RerunAfterFailure,
            attempts: Arc::clone(&self.attempts),
            open: Arc::clone(&self.open),
        }
    }

    /// Emit `test-starting` for `name` under this item.
    pub async fn started(&self, name: impl Into<String>) -> Result<RunningAttempt, WorkerError> {
        let attempt_id = self.attempts.fetch_add(1, Ordering::Relaxed);
        let entry = ReportEntry::new(self.source.clone(), name);
        self.emitter
            .emit(Event::lifecycle(
                LifecycleKind::TestStarting,
                self.run_mode,
                attempt_id,
                entry.clone(),
            ))
            .await?;
        let started = Instant::now();
        *lock_open(&self.open) = Some(OpenAttempt {
            run_mode: self.run_mode,
            attempt_id,
            entry: entry.clone(),
            started,
        });
        Ok(RunningAttempt {
            emitter: self.emitter.clone(),
            run_mode: self.run_mode,
            attempt_id,
            entry,
            started,
            open: Arc::clone(&self.open),
        })
    }

    /// The most recently started attempt, unless it already finished.
    fn take_open(&self) -> Option<OpenAttempt> {
        lock_open(&self.open).take()
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }
}

fn lock_open(slot: &OpenSlot) -> std::sync::MutexGuard<'_, Option<OpenAttempt>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One started attempt. Finishing it consumes it.
pub struct RunningAttempt {
    emitter: EventEmitter,
    run_mode: RunMode,
    attempt_id: i64,
    entry: ReportEntry,
    started: Instant,
    open: OpenSlot,
}

impl RunningAttempt {
    pub fn attempt_id(&self) -> i64 {
        self.attempt_id
    }

    pub async fn stdout(&self, data: impl Into<String>, new_line: bool) -> Result<(), FrameError> {
        self.output(StreamKind::Stdout, data.into(), new_line).await
    }

    pub async fn stderr(&self, data: impl Into<String>, new_line: bool) -> Result<(), FrameError> {
        self.output(StreamKind::Stderr, data.into(), new_line).await
    }

    async fn output(
        &self,
        stream: StreamKind,
        data: String,
        new_line: bool,
    ) -> Result<(), FrameError> {
        self.emitter
            .emit(Event::StandardStream {
                stream,
                new_line,
                run_mode: self.run_mode,
                attempt_id: Some(self.attempt_id),
                data: Some(data),
            })
            .await
    }

    pub async fn succeeded(self) -> Result<(), FrameError> {
        self.finish(LifecycleKind::TestSucceeded, None).await
    }

    pub async fn failed(self, failure: FailureDetail) -> Result<(), FrameError> {
        self.finish(LifecycleKind::TestFailed, Some(failure)).await
    }

    pub async fn errored(self, failure: FailureDetail) -> Result<(), FrameError> {
        self.finish(LifecycleKind::TestError, Some(failure)).await
    }

    pub async fn assumption_failed(self, failure: FailureDetail) -> Result<(), FrameError> {
        self.finish(LifecycleKind::TestAssumptionFailure, Some(failure)).await
    }

    pub async fn skipped(mut self, reason: Option<String>) -> Result<(), FrameError> {
        self.entry.message = reason;
        self.finish(LifecycleKind::TestSkipped, None).await
    }

    async fn finish(
        self,
        kind: LifecycleKind,
        failure: Option<FailureDetail>,
    ) -> Result<(), FrameError> {
        {
            let mut open = lock_open(&self.open);
            if open.as_ref().is_some_and(|o| o.attempt_id == self.attempt_id) {
                *open = None;
            }
        }
        let elapsed = i32::try_from(self.started.elapsed().as_millis()).unwrap_or(i32::MAX);
        let mut entry = self.entry.with_elapsed_millis(elapsed);
        entry.failure = failure;
        self.emitter
            .emit(Event::lifecycle(kind, self.run_mode, self.attempt_id, entry))
            .await
    }
}

enum Next {
    Run(String),
    Stop(WorkerExit),
    Ignore,
}

fn interpret(command: Command) -> Next {
    match command {
        Command::RunItem(item) => Next::Run(item),
        Command::SetFinished => Next::Stop(WorkerExit::Finished),
        Command::SkipRemaining => Next::Stop(WorkerExit::Skipped),
        Command::Shutdown(ShutdownKind::Kill) => Next::Stop(WorkerExit::Killed),
        Command::Shutdown(kind) => Next::Stop(WorkerExit::Shutdown(kind)),
        Command::Noop | Command::ByeAck => Next::Ignore,
    }
}

/// Run the worker loop until the controller stops it.
pub async fn run_worker<H>(
    handler: Arc<H>,
    connection: WorkerConnection,
    config: &ChannelConfig,
) -> Result<WorkerExit, WorkerError>
where
    H: WorkItemHandler + ?Sized,
{
    let (mut reader, emitter) = connection.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<Command, FrameError>>();

    let reader_task = tokio::spawn(async move {
        loop {
            match reader.next_command().await {
                Ok(Some(command)) => {
                    tracing::trace!(command = ?command, "Command received");
                    if tx.send(Ok(command)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });

    let attempts = Arc::new(AtomicI64::new(1));
    let mut pending: VecDeque<Command> = VecDeque::new();
    let result = dispatch(handler.as_ref(), &emitter, &mut rx, &mut pending, &attempts).await;

    let exit = match result {
        Ok(exit) => exit,
        Err(e) => {
            reader_task.abort();
            return Err(e);
        }
    };

    match exit {
        WorkerExit::Killed => {
            tracing::warn!("Kill requested, exiting without goodbye");
            reader_task.abort();
            return Ok(exit);
        }
        WorkerExit::ControllerGone => {
            tracing::warn!("Controller closed the command stream");
            reader_task.abort();
            return Ok(exit);
        }
        _ => {}
    }

    tracing::debug!(exit = ?exit, "Saying goodbye");
    emitter.bye().await?;
    let acked = tokio::time::timeout(config.bye_ack_timeout, async {
        while let Some(command) = rx.recv().await {
            match command {
                Ok(Command::ByeAck) => return true,
                Ok(other) => tracing::trace!(command = ?other, "Ignoring command after goodbye"),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Command stream failed while waiting for acknowledgement"
                    );
                    return false;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    if !acked {
        tracing::warn!(timeout = ?config.bye_ack_timeout, "Goodbye was not acknowledged");
    }

    emitter.close().await?;
    reader_task.abort();
    Ok(exit)
}

async fn dispatch<H>(
    handler: &H,
    emitter: &EventEmitter,
    rx: &mut mpsc::UnboundedReceiver<Result<Command, FrameError>>,
    pending: &mut VecDeque<Command>,
    attempts: &Arc<AtomicI64>,
) -> Result<WorkerExit, WorkerError>
where
    H: WorkItemHandler + ?Sized,
{
    loop {
        // Commands that arrived while the last item ran take precedence
        // over asking for more work.
        while let Ok(command) = rx.try_recv() {
            pending.push_back(command?);
        }
        while let Some(command) = pending.pop_front() {
            match interpret(command) {
                Next::Stop(exit) => return Ok(exit),
                Next::Run(item) => {
                    tracing::warn!(%item, "Work item arrived without a request");
                }
                Next::Ignore => {}
            }
        }

        emitter.next_test().await?;

        let item = loop {
            let Some(command) = rx.recv().await else {
                return Ok(WorkerExit::ControllerGone);
            };
            match interpret(command?) {
                Next::Run(item) => break item,
                Next::Stop(exit) => return Ok(exit),
                Next::Ignore => {}
            }
        };

        let reporter = ItemReporter::new(emitter.clone(), item.clone(), Arc::clone(attempts));
        if let Some(exit) = run_one(handler, &reporter, rx, pending).await? {
            return Ok(exit);
        }
    }
}

/// Run one item inside its testset events. Returns `Some` only when a kill
/// interrupted it.
async fn run_one<H>(
    handler: &H,
    reporter: &ItemReporter,
    rx: &mut mpsc::UnboundedReceiver<Result<Command, FrameError>>,
    pending: &mut VecDeque<Command>,
) -> Result<Option<WorkerExit>, WorkerError>
where
    H: WorkItemHandler + ?Sized,
{
    let item = reporter.item().to_string();
    let emitter = reporter.emitter();
    let set_id = reporter.attempts.fetch_add(1, Ordering::Relaxed);
    let set_entry = ReportEntry {
        source: Some(item.clone()),
        ..ReportEntry::default()
    };
    emitter
        .emit(Event::lifecycle(
            LifecycleKind::TestsetStarting,
            RunMode::Normal,
            set_id,
            set_entry.clone(),
        ))
        .await?;

    tracing::debug!(%item, "Running work item");
    let started = Instant::now();
    let run = handler.run_item(&item, reporter);
    tokio::pin!(run);

    let mut commands_open = true;
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            command = rx.recv(), if commands_open => match command {
                Some(Ok(Command::Shutdown(ShutdownKind::Kill))) => {
                    return Ok(Some(WorkerExit::Killed));
                }
                Some(Ok(command)) => pending.push_back(command),
                Some(Err(e)) => return Err(e.into()),
                // Keep running; the next request notices the closed stream.
                None => commands_open = false,
            },
        }
    };

    match result {
        Ok(()) => {}
        Err(WorkerError::Item(message)) => {
            tracing::warn!(%item, error = %message, "Work item failed");
            // Close the attempt the handler left open, if any.
            let (run_mode, attempt_id, mut entry, since) = match reporter.take_open() {
                Some(open) => (open.run_mode, open.attempt_id, open.entry, open.started),
                None => (
                    reporter.run_mode(),
                    reporter.attempts.fetch_add(1, Ordering::Relaxed),
                    ReportEntry {
                        source: Some(item.clone()),
                        ..ReportEntry::default()
                    },
                    started,
                ),
            };
            let elapsed = i32::try_from(since.elapsed().as_millis()).unwrap_or(i32::MAX);
            entry.elapsed_millis = Some(elapsed);
            entry.failure = Some(FailureDetail::new(message));
            emitter
                .emit(Event::lifecycle(LifecycleKind::TestError, run_mode, attempt_id, entry))
                .await?;
        }
        Err(e) => return Err(e),
    }

    emitter
        .emit(Event::lifecycle(LifecycleKind::TestsetCompleted, RunMode::Normal, set_id, set_entry))
        .await?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::*;

    struct Controller {
        commands: FramedWrite<WriteHalf<DuplexStream>, CommandCodec>,
        events: FramedRead<ReadHalf<DuplexStream>, EventCodec>,
    }

    impl Controller {
        async fn expect(&mut self) -> Event {
            self.events.next().await.unwrap().unwrap()
        }

        async fn send(&mut self, command: Command) {
            self.commands.send(command).await.unwrap();
        }
    }

    fn pair(config: &ChannelConfig) -> (Controller, WorkerConnection) {
        let (controller_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (c_read, c_write) = tokio::io::split(controller_io);
        let (w_read, w_write) = tokio::io::split(worker_io);
        (
            Controller {
                commands: FramedWrite::new(c_write, CommandCodec::new()),
                events: FramedRead::new(c_read, EventCodec::new()),
            },
            WorkerConnection::from_streams(w_read, w_write, config),
        )
    }

    struct Passing;

    #[async_trait]
    impl WorkItemHandler for Passing {
        async fn run_item(&self, _item: &str, reporter: &ItemReporter) -> Result<(), WorkerError> {
            let attempt = reporter.started("works").await?;
            attempt.stdout("hello", true).await?;
            attempt.succeeded().await?;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl WorkItemHandler for Broken {
        async fn run_item(&self, _item: &str, _reporter: &ItemReporter) -> Result<(), WorkerError> {
            Err(WorkerError::Item("class initialization failed".into()))
        }
    }

    /// Starts an attempt, then gives up without finishing it.
    struct BrokenMidway;

    #[async_trait]
    impl WorkItemHandler for BrokenMidway {
        async fn run_item(&self, _item: &str, reporter: &ItemReporter) -> Result<(), WorkerError> {
            let _attempt = reporter.started("setup").await?;
            Err(WorkerError::Item("fixture failed".into()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl WorkItemHandler for Hanging {
        async fn run_item(&self, _item: &str, reporter: &ItemReporter) -> Result<(), WorkerError> {
            let _attempt = reporter.started("forever").await?;
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn lifecycle_kind(event: &Event) -> Option<LifecycleKind> {
        match event {
            Event::Lifecycle(l) => Some(l.kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn runs_items_until_finished() {
        let config = ChannelConfig::new();
        let (mut controller, connection) = pair(&config);
        let worker = tokio::spawn(async move {
            run_worker(Arc::new(Passing), connection, &config).await
        });

        assert_eq!(controller.expect().await, Event::NextTest);
        controller.send(Command::RunItem("a.ATest".into())).await;

        assert_eq!(

            lifecycle_kind(&controller.expect().await),

            Some(LifecycleKind::TestsetStarting)

        );
        match controller.expect().await {
            Event::Lifecycle(l) => {
                assert_eq!(l.kind, LifecycleKind::TestStarting);
                assert_eq!(l.item_id(), "a.ATest#works");
                assert_eq!(l.run_mode, RunMode::Normal);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            controller.expect().await,
            Event::StandardStream {
                stream: StreamKind::Stdout,
                new_line: true,
                ..
            }
        ));
        match controller.expect().await {
            Event::Lifecycle(l) => {
                assert_eq!(l.kind, LifecycleKind::TestSucceeded);
                assert!(l.entry.elapsed_millis.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            lifecycle_kind(&controller.expect().await),
            Some(LifecycleKind::TestsetCompleted)
        );

        assert_eq!(controller.expect().await, Event::NextTest);
        controller.send(Command::SetFinished).await;
        assert_eq!(controller.expect().await, Event::Bye);
        controller.send(Command::ByeAck).await;

        assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Finished);
        assert!(controller.events.next().await.is_none());
    }

    #[tokio::test]
    async fn item_errors_are_reported_and_the_worker_continues() {
        let config = ChannelConfig::new();
        let (mut controller, connection) = pair(&config);
        let worker = tokio::spawn(async move {
            run_worker(Arc::new(Broken), connection, &config).await
        });

        assert_eq!(controller.expect().await, Event::NextTest);
        controller.send(Command::RunItem("a.BTest".into())).await;
        assert_eq!(
            lifecycle_kind(&controller.expect().await),
            Some(LifecycleKind::TestsetStarting)
        );
        match controller.expect().await {
            Event::Lifecycle(l) => {
                assert_eq!(l.kind, LifecycleKind::TestError);
                assert_eq!(l.item_id(), "a.BTest");
                assert_eq!(
                    l.entry.failure.unwrap().message.as_deref(),
                    Some("class initialization failed")
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            lifecycle_kind(&controller.expect().await),
            Some(LifecycleKind::TestsetCompleted)
        );
        assert_eq!(controller.expect().await, Event::NextTest);

        controller.send(Command::SkipRemaining).await;
        assert_eq!(controller.expect().await, Event::Bye);
        controller.send(Command::ByeAck).await;
        assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Skipped);
    }

    #[tokio::test]
    async fn item_error_closes_the_attempt_left_open() {
        let config = ChannelConfig::new();
        let (mut controller, connection) = pair(&config);
        let worker = tokio::spawn(async move {
            run_worker(Arc::new(BrokenMidway), connection, &config).await
        });

        assert_eq!(controller.expect().await, Event::NextTest);
        controller.send(Command::RunItem("a.ETest".into())).await;
        assert_eq!(
            lifecycle_kind(&controller.expect().await),
            Some(LifecycleKind::TestsetStarting)
        );
        let Event::Lifecycle(starting) = controller.expect().await else {
            panic!("expected test-starting");
        };
        assert_eq!(starting.kind, LifecycleKind::TestStarting);
        match controller.expect().await {
            Event::Lifecycle(l) => {
                assert_eq!(l.kind, LifecycleKind::TestError);
                assert_eq!(l.item_id(), "a.ETest#setup");
                assert_eq!(l.attempt_id, starting.attempt_id);
                assert_eq!(l.run_mode, starting.run_mode);
                assert_eq!(
                    l.entry.failure.unwrap().message.as_deref(),
                    Some("fixture failed")
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            lifecycle_kind(&controller.expect().await),
            Some(LifecycleKind::TestsetCompleted)
        );

        assert_eq!(controller.expect().await, Event::NextTest);
        controller.send(Command::SetFinished).await;
        assert_eq!(controller.expect().await, Event::Bye);
        controller.send(Command::ByeAck).await;
        assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Finished);
    }

    #[tokio::test]
    async fn kill_interrupts_a_running_item_without_goodbye() {
        let config = ChannelConfig::new();
        let (mut controller, connection) = pair(&config);
        let worker = tokio::spawn(async move {
            run_worker(Arc::new(Hanging), connection, &config).await
        });

        assert_eq!(controller.expect().await, Event::NextTest);
        controller.send(Command::RunItem("a.CTest".into())).await;
        assert_eq!(
            lifecycle_kind(&controller.expect().await),
            Some(LifecycleKind::TestsetStarting)
        );
        assert_eq!(lifecycle_kind(&controller.expect().await), Some(LifecycleKind::TestStarting));

        controller.send(Command::Shutdown(ShutdownKind::Kill)).await;
        assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Killed);
    }

    #[tokio::test]
    async fn shutdown_while_waiting_stops_the_worker() {
        let config = ChannelConfig::new();
        let (mut controller, connection) = pair(&config);
        let worker = tokio::spawn(async move {
            run_worker(Arc::new(Passing), connection, &config).await
        });

        assert_eq!(controller.expect().await, Event::NextTest);
        controller.send(Command::Shutdown(ShutdownKind::Exit)).await;
        assert_eq!(controller.expect().await, Event::Bye);
        controller.send(Command::ByeAck).await;
        assert_eq!(
            worker.await.unwrap().unwrap(),
            WorkerExit::Shutdown(ShutdownKind::Exit)
        );
    }

    #[tokio::test]
    async fn missing_acknowledgement_times_out() {
        let config =
            ChannelConfig::new().with_bye_ack_timeout(std::time::Duration::from_millis(50));
        let (mut controller, connection) = pair(&config);
        let worker = tokio::spawn(async move {
            run_worker(Arc::new(Passing), connection, &config).await
        });

        assert_eq!(controller.expect().await, Event::NextTest);
        controller.send(Command::SetFinished).await;
        assert_eq!(controller.expect().await, Event::Bye);
        assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Finished);
    }

    #[tokio::test]
    async fn closed_controller_ends_the_run() {
        let config = ChannelConfig::new();
        let (mut controller, connection) = pair(&config);
        let worker = tokio::spawn(async move {
            run_worker(Arc::new(Passing), connection, &config).await
        });

        assert_eq!(controller.expect().await, Event::NextTest);
        SinkExt::<Command>::close(&mut controller.commands).await.unwrap();
        assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::ControllerGone);
    }

    #[tokio::test]
    async fn rerun_reporter_marks_attempts() {
        let config = ChannelConfig::new();
        let (mut controller, connection) = pair(&config);
        let (_reader, emitter) = connection.split();
        let reporter = ItemReporter::new(emitter, "a.DTest".into(), Arc::new(AtomicI64::new(1)));

        let first = reporter.started("flaky").await.unwrap();
        first.failed(FailureDetail::new("boom")).await.unwrap();
        let second = reporter.rerun().started("flaky").await.unwrap();
        assert_eq!(second.attempt_id(), 2);
        second.succeeded().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            if let Event::Lifecycle(l) = controller.expect().await {
                seen.push((l.kind, l.run_mode, l.attempt_id));
            }
        }
        assert_eq!(
            seen,
            vec![
                (LifecycleKind::TestStarting, RunMode::Normal, Some(1)),
                (LifecycleKind::TestFailed, RunMode::Normal, Some(1)),
                (LifecycleKind::TestStarting, RunMode::RerunAfterFailure, Some(2)),
                (LifecycleKind::TestSucceeded, RunMode::RerunAfterFailure, Some(2)),
            ]
        );
    }
}
