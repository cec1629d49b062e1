//! Controller and worker talking over in-memory pipes and loopback sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use forkline::{
    ChannelConfig, Classification, CloseReason, Command, CommandCodec, Event, EventCodec,
    FailureDetail, ForkChannel, ForkSession, FrameError, ItemReporter, LifecycleKind, ReportEntry,
    RunMode, StreamKind, TransportKind, WorkItemHandler, WorkQueue, WorkerConnection, WorkerError,
    WorkerExit, create_transport, run_worker,
};

struct Passing;

#[async_trait]
impl WorkItemHandler for Passing {
    async fn run_item(&self, _item: &str, reporter: &ItemReporter) -> Result<(), WorkerError> {
        let attempt = reporter.started("works").await?;
        attempt.stdout("ran", true).await?;
        attempt.succeeded().await?;
        Ok(())
    }
}

/// Fails the first run of every item, passes the rerun.
struct FailsOnce {
    runs: AtomicUsize,
}

#[async_trait]
impl WorkItemHandler for FailsOnce {
    async fn run_item(&self, _item: &str, reporter: &ItemReporter) -> Result<(), WorkerError> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let first = reporter.started("flaky").await?;
        first
            .failed(FailureDetail::new("expected 1 but was 2").with_summary("at Flaky.check"))
            .await?;

        let rerun = reporter.rerun();
        let second = rerun.started("flaky").await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        second.succeeded().await?;
        Ok(())
    }
}

/// Both directions of a piped worker: (controller stdout, controller stdin,
/// worker connection).
fn piped(config: &ChannelConfig) -> (DuplexStream, DuplexStream, WorkerConnection) {
    let (events_controller, events_worker) = tokio::io::duplex(64 * 1024);
    let (commands_controller, commands_worker) = tokio::io::duplex(64 * 1024);
    (
        events_controller,
        commands_controller,
        WorkerConnection::from_streams(commands_worker, events_worker, config),
    )
}

async fn attach_piped(
    session: &ForkSession,
    worker_id: u32,
    stdout: DuplexStream,
    stdin: DuplexStream,
) -> forkline::AttachedWorker {
    let mut channel = create_transport(session.config(), worker_id).await.unwrap();
    channel.attach_process_streams(stdout, stdin);
    session.attach_worker(channel).await.unwrap()
}

#[tokio::test]
async fn pipe_worker_drains_the_queue() {
    let config = ChannelConfig::new();
    let queue = Arc::new(WorkQueue::sealed_with(["a.ATest", "a.BTest", "a.CTest"]));
    let session = ForkSession::new(config.clone(), queue);

    let (stdout, stdin, connection) = piped(&config);
    let attached = attach_piped(&session, 1, stdout, stdin).await;
    let worker = tokio::spawn(async move {
        run_worker(Arc::new(Passing), connection, &config).await
    });

    let report = tokio::time::timeout(Duration::from_secs(5), attached.wait())
        .await
        .unwrap();
    assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Finished);

    assert!(report.said_goodbye);
    assert_eq!(report.close_reason, Some(CloseReason::EndOfStream));
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let history = session.history();
    for item in ["a.ATest#works", "a.BTest#works", "a.CTest#works"] {
        assert_eq!(history.classify(item), Classification::Success, "{item}");
    }
    let merged = history.merged("a.ATest#works").unwrap();
    assert_eq!(merged.output, vec!["ran\n".to_string()]);
    assert!(!history.statistics().had_failures());
    assert_eq!(session.hub().live_streams(), 0);
}

#[tokio::test]
async fn rerun_after_failure_is_a_flake() {
    let config = ChannelConfig::new();
    let queue = Arc::new(WorkQueue::sealed_with(["a.FlakyTest"]));
    let session = ForkSession::new(config.clone(), queue);

    let (stdout, stdin, connection) = piped(&config);
    let attached = attach_piped(&session, 1, stdout, stdin).await;
    let handler = Arc::new(FailsOnce {
        runs: AtomicUsize::new(0),
    });
    let worker = {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { run_worker(handler, connection, &config).await })
    };

    let report = tokio::time::timeout(Duration::from_secs(5), attached.wait())
        .await
        .unwrap();
    assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Finished);
    assert!(report.said_goodbye);
    assert_eq!(handler.runs.load(Ordering::Relaxed), 1);

    let merged = session.history().merged("a.FlakyTest#flaky").unwrap();
    assert_eq!(merged.classification, Classification::Flake);
    assert_eq!(merged.attempts.len(), 2);
    assert_eq!(merged.attempts[0].run_mode, RunMode::Normal);
    assert_eq!(merged.attempts[1].run_mode, RunMode::RerunAfterFailure);
    assert!(merged.attempts[1].elapsed_millis.unwrap() >= 5);
    assert_eq!(merged.failures.len(), 1);
    assert_eq!(merged.failures[0].message.as_deref(), Some("expected 1 but was 2"));
    assert_eq!(merged.failures[0].summary.as_deref(), Some("at Flaky.check"));

    let stats = session.history().statistics();
    assert_eq!(stats.flakes, 1);
    assert!(!stats.had_failures());
}

#[tokio::test]
async fn crash_without_goodbye_fails_the_running_item() {
    let config = ChannelConfig::new();
    let queue = Arc::new(WorkQueue::sealed_with(["a.CrashTest"]));
    let session = ForkSession::new(config.clone(), queue);

    let (events_controller, events_worker) = tokio::io::duplex(64 * 1024);
    let (commands_controller, commands_worker) = tokio::io::duplex(64 * 1024);
    let attached = attach_piped(&session, 3, events_controller, commands_controller).await;

    // Hand-rolled worker: ask for work, start it, then die.
    let mut events = FramedWrite::new(events_worker, EventCodec::new());
    let mut commands = FramedRead::new(commands_worker, CommandCodec::new());
    events.send(Event::NextTest).await.unwrap();
    assert_eq!(
        commands.next().await.unwrap().unwrap(),
        Command::RunItem("a.CrashTest".into())
    );
    events
        .send(Event::lifecycle(
            LifecycleKind::TestStarting,
            RunMode::Normal,
            1,
            ReportEntry::new("a.CrashTest", "boom"),
        ))
        .await
        .unwrap();
    drop(events);

    let report = tokio::time::timeout(Duration::from_secs(5), attached.wait())
        .await
        .unwrap();
    assert!(!report.said_goodbye);
    assert_eq!(report.close_reason, Some(CloseReason::EndOfStream));

    let merged = session.history().merged("a.CrashTest#boom").unwrap();
    assert_eq!(merged.classification, Classification::Error);
    assert_eq!(
        merged.failures[0].message.as_deref(),
        Some("The forked worker crashed")
    );
    assert!(session.history().statistics().had_failures());
}

#[tokio::test]
async fn stop_on_next_test_reaches_every_worker() {
    let config = ChannelConfig::new();
    let session = ForkSession::new(config.clone(), Arc::new(WorkQueue::new()));

    let (out_a, worker_out_a) = tokio::io::duplex(4096);
    let (in_a, _worker_in_a) = tokio::io::duplex(4096);
    let (out_b, _worker_out_b) = tokio::io::duplex(4096);
    let (in_b, worker_in_b) = tokio::io::duplex(4096);
    let _a = attach_piped(&session, 1, out_a, in_a).await;
    let _b = attach_piped(&session, 2, out_b, in_b).await;

    let mut events_a = FramedWrite::new(worker_out_a, EventCodec::new());
    let mut commands_b = FramedRead::new(worker_in_b, CommandCodec::new());
    events_a.send(Event::StopOnNextTest).await.unwrap();

    let command = tokio::time::timeout(Duration::from_secs(5), commands_b.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(command, Command::SkipRemaining);
}

#[tokio::test]
async fn socket_worker_connects_and_finishes() {
    let config = ChannelConfig::new().with_transport(TransportKind::Tcp);
    let queue = Arc::new(WorkQueue::sealed_with(["a.ATest"]));
    let session = ForkSession::new(config.clone(), queue);

    let mut channel = create_transport(&config, 5).await.unwrap();
    assert!(matches!(channel, ForkChannel::Socket(_)));
    let descriptor: forkline::ConnectionDescriptor =
        channel.connection_descriptor().to_string().parse().unwrap();

    let (native_controller, native_worker) = tokio::io::duplex(4096);
    let (stdin, _unused) = tokio::io::duplex(64);
    channel.attach_process_streams(native_controller, stdin);

    let worker_config = config.clone();
    let worker = tokio::spawn(async move {
        let connection = WorkerConnection::connect(&descriptor, &worker_config).await.unwrap();
        run_worker(Arc::new(Passing), connection, &worker_config).await
    });

    let attached = session.attach_worker(channel).await.unwrap();
    assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Finished);
    // Process exit closes its stdout.
    drop(native_worker);

    let report = tokio::time::timeout(Duration::from_secs(5), attached.wait())
        .await
        .unwrap();
    assert!(report.said_goodbye);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(
        session.history().classify("a.ATest#works"),
        Classification::Success
    );
}

/// Writes a chunk too large for the channel, then carries on.
struct Oversized;

#[async_trait]
impl WorkItemHandler for Oversized {
    async fn run_item(&self, _item: &str, reporter: &ItemReporter) -> Result<(), WorkerError> {
        let attempt = reporter.started("big").await?;
        let refused = attempt.stdout("x".repeat(100), true).await;
        assert!(matches!(
            refused,
            Err(FrameError::SegmentTooLong { len: 100, max: 64 })
        ));
        attempt.stdout("small", true).await?;
        attempt.succeeded().await?;
        Ok(())
    }
}

fn started(source: &str, name: &str, attempt_id: i64) -> Event {
    Event::lifecycle(
        LifecycleKind::TestStarting,
        RunMode::Normal,
        attempt_id,
        ReportEntry::new(source, name),
    )
}

fn stdout(attempt_id: Option<i64>, data: &str) -> Event {
    Event::StandardStream {
        stream: StreamKind::Stdout,
        new_line: true,
        run_mode: RunMode::Normal,
        attempt_id,
        data: Some(data.to_string()),
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn disabled_channel_keeps_draining_the_worker() {
    let config = ChannelConfig::new();
    let queue = Arc::new(WorkQueue::sealed_with(["a.NoisyTest"]));
    let session = ForkSession::new(config.clone(), queue);

    let (events_controller, events_worker) = tokio::io::duplex(64 * 1024);
    let (commands_controller, commands_worker) = tokio::io::duplex(64 * 1024);
    let attached = attach_piped(&session, 4, events_controller, commands_controller).await;

    let mut events = FramedWrite::new(events_worker, EventCodec::new());
    let mut commands = FramedRead::new(commands_worker, CommandCodec::new());
    events.send(Event::NextTest).await.unwrap();
    assert_eq!(
        commands.next().await.unwrap().unwrap(),
        Command::RunItem("a.NoisyTest".into())
    );
    events.send(started("a.NoisyTest", "loud", 1)).await.unwrap();
    eventually(|| !attached.client().in_flight().is_empty()).await;

    attached.events().disable();

    // Four times the pipe buffer; only completes if the controller reads.
    let line = "x".repeat(1024);
    tokio::time::timeout(Duration::from_secs(5), async {
        for _ in 0..256 {
            events.send(stdout(Some(1), &line)).await.unwrap();
        }
        events.send(Event::Bye).await.unwrap();
    })
    .await
    .unwrap();
    assert!(!attached.is_closed());
    assert_eq!(session.hub().live_streams(), 1);
    drop(events);

    let report = tokio::time::timeout(Duration::from_secs(5), attached.wait())
        .await
        .unwrap();
    assert_eq!(report.close_reason, Some(CloseReason::Disabled));
    assert!(!report.said_goodbye);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let history = session.history();
    assert_eq!(history.classify("a.NoisyTest#loud"), Classification::Unknown);
    assert!(!history.statistics().had_failures());
}

#[tokio::test]
async fn overlapping_attempts_keep_their_own_output() {
    let config = ChannelConfig::new();
    let queue = Arc::new(WorkQueue::sealed_with(["a.PairTest"]));
    let session = ForkSession::new(config.clone(), queue);

    let (events_controller, events_worker) = tokio::io::duplex(64 * 1024);
    let (commands_controller, commands_worker) = tokio::io::duplex(64 * 1024);
    let attached = attach_piped(&session, 6, events_controller, commands_controller).await;

    let mut events = FramedWrite::new(events_worker, EventCodec::new());
    let mut commands = FramedRead::new(commands_worker, CommandCodec::new());
    events.send(Event::NextTest).await.unwrap();
    assert_eq!(
        commands.next().await.unwrap().unwrap(),
        Command::RunItem("a.PairTest".into())
    );

    let finished = |kind, attempt_id, name: &str| {
        Event::lifecycle(
            kind,
            RunMode::Normal,
            attempt_id,
            ReportEntry::new("a.PairTest", name),
        )
    };
    for event in [
        started("a.PairTest", "left", 1),
        started("a.PairTest", "right", 2),
        stdout(Some(1), "from left"),
        stdout(Some(2), "from right"),
        stdout(None, "untagged"),
        stdout(Some(1), "left again"),
        finished(LifecycleKind::TestSucceeded, 1, "left"),
        finished(LifecycleKind::TestSucceeded, 2, "right"),
        Event::Bye,
    ] {
        events.send(event).await.unwrap();
    }
    drop(events);

    let report = tokio::time::timeout(Duration::from_secs(5), attached.wait())
        .await
        .unwrap();
    assert!(report.said_goodbye);
    assert_eq!(report.close_reason, Some(CloseReason::EndOfStream));

    let history = session.history();
    let left = history.merged("a.PairTest#left").unwrap();
    let right = history.merged("a.PairTest#right").unwrap();
    assert_eq!(left.classification, Classification::Success);
    assert_eq!(right.classification, Classification::Success);
    assert_eq!(left.output, vec!["from left\n", "left again\n"]);
    // Output that names no attempt goes to the latest one started.
    assert_eq!(right.output, vec!["from right\n", "untagged\n"]);
}

#[tokio::test]
async fn oversized_output_is_refused_without_breaking_the_channel() {
    let config = ChannelConfig::new().with_max_segment_len(64);
    let queue = Arc::new(WorkQueue::sealed_with(["a.BigTest"]));
    let session = ForkSession::new(config.clone(), queue);

    let (stdout, stdin, connection) = piped(&config);
    let attached = attach_piped(&session, 8, stdout, stdin).await;
    let worker = tokio::spawn(async move {
        run_worker(Arc::new(Oversized), connection, &config).await
    });

    let report = tokio::time::timeout(Duration::from_secs(5), attached.wait())
        .await
        .unwrap();
    assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Finished);
    assert!(report.said_goodbye);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let merged = session.history().merged("a.BigTest#big").unwrap();
    assert_eq!(merged.classification, Classification::Success);
    assert_eq!(merged.output, vec!["small\n"]);
}
