//! Controller-side handler for one worker's events.
//!
//! Turns control events into commands (demand, skip, acknowledge), folds
//! lifecycle events into the [`AttemptHistory`], and detects a worker that
//! went away without saying goodbye.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::aggregator::{Attempt, AttemptHistory, Outcome};
use crate::bridge::protocol::{
    ConsoleLevel, Event, FailureDetail, LifecycleEvent, LifecycleKind, RunMode, StreamKind,
};
use crate::commands::{CommandStream, ImmediateNotifier, NotifiableCommands};
use crate::events::{CloseReason, EventHandler};

const WORKER_CRASHED: &str = "The forked worker crashed";

/// Identity of one attempt on the wire.
type AttemptKey = (RunMode, Option<i64>);

struct InFlight {
    item: String,
    run_mode: RunMode,
    attempt_id: Option<i64>,
    started: Instant,
    output: Vec<String>,
}

#[derive(Default)]
struct ClientState {
    in_flight: HashMap<AttemptKey, InFlight>,
    /// Most recently started attempt; receives output that names no attempt.
    current: Option<AttemptKey>,
    fatal_error: Option<FailureDetail>,
    close_reason: Option<CloseReason>,
    system_properties: HashMap<String, String>,
}

struct Shared {
    worker_id: u32,
    said_goodbye: AtomicBool,
    state: Mutex<ClientState>,
    closed: CancellationToken,
}

impl ClientState {
    /// Remove the attempt a terminal event closes. Matches the event's own
    /// identity first, then any attempt of the same item.
    fn take_in_flight(&mut self, event: &LifecycleEvent, item: &str) -> Option<InFlight> {
        let key = (event.run_mode, event.attempt_id);
        let key = match self.in_flight.get(&key) {
            Some(flight) if flight.item == item => Some(key),
            _ => self
                .in_flight
                .iter()
                .find(|(_, flight)| flight.item == item)
                .map(|(key, _)| *key),
        }?;
        if self.current == Some(key) {
            self.current = None;
        }
        self.in_flight.remove(&key)
    }
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Event handler for one worker. Moved into the event pump; observe it
/// through a [`ForkClientHandle`].
pub struct ForkClient {
    shared: Arc<Shared>,
    stream: Arc<CommandStream>,
    broadcast: ImmediateNotifier,
    history: Arc<AttemptHistory>,
}

impl ForkClient {
    pub fn new(
        worker_id: u32,
        stream: Arc<CommandStream>,
        broadcast: ImmediateNotifier,
        history: Arc<AttemptHistory>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                worker_id,
                said_goodbye: AtomicBool::new(false),
                state: Mutex::new(ClientState::default()),
                closed: CancellationToken::new(),
            }),
            stream,
            broadcast,
            history,
        }
    }

    pub fn handle(&self) -> ForkClientHandle {
        ForkClientHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn worker_id(&self) -> u32 {
        self.shared.worker_id
    }

    fn on_lifecycle(&mut self, event: LifecycleEvent) {
        let item = event.item_id();
        match event.kind {
            LifecycleKind::TestsetStarting => {
                tracing::debug!(worker_id = self.worker_id(), %item, "Item set starting");
            }
            LifecycleKind::TestsetCompleted => {
                tracing::debug!(worker_id = self.worker_id(), %item, "Item set completed");
            }
            LifecycleKind::TestStarting => {
                tracing::debug!(
                    worker_id = self.worker_id(),
                    %item,
                    run_mode = ?event.run_mode,
                    "Item starting"
                );
                let key = (event.run_mode, event.attempt_id);
                let mut state = self.shared.state();
                state.in_flight.insert(
                    key,
                    InFlight {
                        item,
                        run_mode: event.run_mode,
                        attempt_id: event.attempt_id,
                        started: Instant::now(),
                        output: Vec::new(),
                    },
                );
                state.current = Some(key);
            }
            kind => {
                let Some(mut attempt) = Attempt::from_event(&event) else {
                    return;
                };
                let in_flight = self.shared.state().take_in_flight(&event, &item);
                if let Some(in_flight) = in_flight {
                    attempt.output = in_flight.output;
                    if attempt.elapsed_millis.is_none() {
                        let elapsed = in_flight.started.elapsed().as_millis();
                        attempt.elapsed_millis = Some(i32::try_from(elapsed).unwrap_or(i32::MAX));
                    }
                }
                tracing::info!(
                    worker_id = self.worker_id(),
                    %item,
                    outcome = ?kind,
                    elapsed_ms = attempt.elapsed_millis,
                    "Item finished"
                );
                self.history.record(item, attempt);
            }
        }
    }

    fn on_output(
        &mut self,
        stream: StreamKind,
        run_mode: RunMode,
        attempt_id: Option<i64>,
        data: Option<String>,
        new_line: bool,
    ) {
        let Some(data) = data else { return };
        let worker_id = self.worker_id();
        let stream_name = match stream {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        };
        tracing::debug!(
            target: "forkline::worker_output",
            worker_id,
            stream = stream_name,
            "{}",
            data.trim_end()
        );
        let mut state = self.shared.state();
        let ClientState {
            in_flight, current, ..
        } = &mut *state;
        let key = attempt_id
            .map(|id| (run_mode, Some(id)))
            .filter(|key| in_flight.contains_key(key))
            .or(*current);
        if let Some(entry) = key.and_then(|key| in_flight.get_mut(&key)) {
            let line = if new_line { format!("{data}\n") } else { data };
            entry.output.push(line);
        }
    }

    /// Record a worker-crash error for every item still in flight.
    fn fail_in_flight(&mut self, reason: &CloseReason) {
        let (in_flight, fatal) = {
            let mut state = self.shared.state();
            state.current = None;
            (std::mem::take(&mut state.in_flight), state.fatal_error.clone())
        };
        for flight in in_flight.into_values() {
            let item = flight.item;
            let failure = fatal.clone().unwrap_or_else(|| {
                FailureDetail::new(WORKER_CRASHED).with_summary(format!("{reason:?}"))
            });
            tracing::warn!(
                worker_id = self.worker_id(),
                %item,
                "Failing in-flight item due to worker crash"
            );
            let attempt = Attempt {
                run_mode: flight.run_mode,
                attempt_id: flight.attempt_id,
                outcome: Outcome::Error,
                elapsed_millis: i32::try_from(flight.started.elapsed().as_millis()).ok(),
                failure: Some(failure),
                output: flight.output,
            };
            self.history.record(item, attempt);
        }
    }
}

impl EventHandler for ForkClient {
    fn handle_event(&mut self, event: Event) {
        let worker_id = self.worker_id();
        match event {
            Event::NextTest => self.stream.request_next(),
            Event::StopOnNextTest => {
                tracing::info!(worker_id, "Worker requested skipping remaining items");
                self.broadcast.skip_remaining();
            }
            Event::Bye => {
                tracing::debug!(worker_id, "Worker said goodbye");
                self.shared.said_goodbye.store(true, Ordering::Release);
                self.stream.acknowledge_termination();
            }
            Event::Lifecycle(lifecycle) => self.on_lifecycle(lifecycle),
            Event::StandardStream {
                stream,
                new_line,
                run_mode,
                attempt_id,
                data,
            } => self.on_output(stream, run_mode, attempt_id, data, new_line),
            Event::Console { level, message } => {
                let message = message.unwrap_or_default();
                match level {
                    ConsoleLevel::Debug => {
                        tracing::debug!(target: "forkline::worker", worker_id, "{}", message)
                    }
                    ConsoleLevel::Info => {
                        tracing::info!(target: "forkline::worker", worker_id, "{}", message)
                    }
                    ConsoleLevel::Warning => {
                        tracing::warn!(target: "forkline::worker", worker_id, "{}", message)
                    }
                }
            }
            Event::ConsoleError(failure) => {
                let failure = failure.unwrap_or_default();
                tracing::error!(
                    target: "forkline::worker",
                    worker_id,
                    summary = failure.summary.as_deref().unwrap_or(""),
                    "{}",
                    failure.message.as_deref().unwrap_or("")
                );
            }
            Event::SystemProperty { key, value, .. } => {
                if let (Some(key), Some(value)) = (key, value) {
                    self.shared.state().system_properties.insert(key, value);
                }
            }
            Event::FatalExit(failure) => {
                let failure = failure.unwrap_or_else(|| FailureDetail::new(WORKER_CRASHED));
                tracing::error!(
                    worker_id,
                    message = failure.message.as_deref().unwrap_or(""),
                    "Worker reported a fatal error"
                );
                self.shared.state().fatal_error = Some(failure);
            }
        }
    }

    fn on_close(&mut self, reason: CloseReason) {
        let said_goodbye = self.shared.said_goodbye.load(Ordering::Acquire);
        let disabled = reason == CloseReason::Disabled;
        if !disabled && (!said_goodbye || !reason.is_orderly()) {
            tracing::warn!(
                worker_id = self.worker_id(),
                said_goodbye,
                reason = ?reason,
                "Worker channel closed unexpectedly"
            );
            self.fail_in_flight(&reason);
        }
        self.shared.state().close_reason = Some(reason);
        self.stream.close();
        self.shared.closed.cancel();
    }
}

/// Observer for a [`ForkClient`] running inside its event pump.
#[derive(Clone)]
pub struct ForkClientHandle {
    shared: Arc<Shared>,
}

impl ForkClientHandle {
    pub fn worker_id(&self) -> u32 {
        self.shared.worker_id
    }

    pub fn said_goodbye(&self) -> bool {
        self.shared.said_goodbye.load(Ordering::Acquire)
    }

    pub fn fatal_error(&self) -> Option<FailureDetail> {
        self.shared.state().fatal_error.clone()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.state().close_reason.clone()
    }

    pub fn system_property(&self, key: &str) -> Option<String> {
        self.shared.state().system_properties.get(key).cloned()
    }

    pub fn in_flight(&self) -> Vec<String> {
        let mut items: Vec<_> = self
            .shared
            .state()
            .in_flight
            .values()
            .map(|f| f.item.clone())
            .collect();
        items.sort();
        items.dedup();
        items
    }

    /// Wait until the event channel has closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}
