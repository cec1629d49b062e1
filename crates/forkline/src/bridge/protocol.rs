//! Wire vocabulary for controller-worker communication.
//!
//! Two frame families share one layout:
//! - **Commands** (controller -> worker): RunItem, SetFinished, SkipRemaining,
//!   Shutdown, Noop, ByeAck
//! - **Events** (worker -> controller): console lines, standard streams,
//!   lifecycle, control
//!
//! The segment list of every message kind is a static table; neither side
//! negotiates a schema per frame.

use serde::{Deserialize, Serialize};

/// Magic marker opening every command frame.
pub const COMMAND_MAGIC: &[u8] = b"fork-command";

/// Magic marker opening every event frame.
pub const EVENT_MAGIC: &[u8] = b"fork-event";

/// Typed field inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentType {
    RunMode,
    AttemptId,
    StringEncoding,
    DataString,
    DataInteger,
    EndOfFrame,
}

use SegmentType::{
    AttemptId, DataInteger, DataString, EndOfFrame, RunMode as RunModeSegment, StringEncoding,
};

const NO_DATA: &[SegmentType] = &[EndOfFrame];
const ONE_STRING: &[SegmentType] = &[StringEncoding, DataString, EndOfFrame];
const FAILURE_TRACE: &[SegmentType] =
    &[StringEncoding, DataString, DataString, DataString, EndOfFrame];
const STREAM_OUTPUT: &[SegmentType] =
    &[RunModeSegment, AttemptId, StringEncoding, DataString, EndOfFrame];
const KEY_VALUE: &[SegmentType] = &[
    RunModeSegment,
    AttemptId,
    StringEncoding,
    DataString,
    DataString,
    EndOfFrame,
];
const LIFECYCLE: &[SegmentType] = &[
    RunModeSegment,
    AttemptId,
    StringEncoding,
    DataString,
    DataString,
    DataString,
    DataString,
    DataString,
    DataString,
    DataInteger,
    DataString,
    DataString,
    DataString,
    EndOfFrame,
];

/// A message kind: opcode on the wire plus its fixed segment table.
pub trait FrameKind: Copy + std::fmt::Debug + Send + 'static {
    fn opcode(&self) -> &'static [u8];

    fn from_opcode(opcode: &[u8]) -> Option<Self>;

    fn segments(&self) -> &'static [SegmentType];
}

/// Which attempt of a work item an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Normal,
    RerunAfterFailure,
}

impl RunMode {
    pub const ALL: [RunMode; 2] = [RunMode::Normal, RunMode::RerunAfterFailure];

    pub fn as_wire(&self) -> &'static [u8] {
        match self {
            Self::Normal => b"normal-run",
            Self::RerunAfterFailure => b"rerun-test-after-failure",
        }
    }

    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_wire() == bytes)
    }
}

/// How the worker should terminate once it receives a shutdown command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownKind {
    /// Finish the current item, then exit normally.
    #[default]
    Default,
    /// Exit as soon as possible.
    Exit,
    /// Terminate without cleanup.
    Kill,
}

impl ShutdownKind {
    pub fn as_param(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Exit => "exit",
            Self::Kill => "kill",
        }
    }

    pub fn from_param(param: &str) -> Option<Self> {
        match param {
            "default" => Some(Self::Default),
            "exit" => Some(Self::Exit),
            "kill" => Some(Self::Kill),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    RunItem,
    SetFinished,
    SkipRemaining,
    Shutdown,
    Noop,
    ByeAck,
}

impl CommandKind {
    pub const ALL: [CommandKind; 6] = [
        CommandKind::RunItem,
        CommandKind::SetFinished,
        CommandKind::SkipRemaining,
        CommandKind::Shutdown,
        CommandKind::Noop,
        CommandKind::ByeAck,
    ];
}

impl FrameKind for CommandKind {
    fn opcode(&self) -> &'static [u8] {
        match self {
            Self::RunItem => b"run-testclass",
            Self::SetFinished => b"testset-finished",
            Self::SkipRemaining => b"skip-since-next-test",
            Self::Shutdown => b"shutdown",
            Self::Noop => b"noop",
            Self::ByeAck => b"bye-ack",
        }
    }

    fn from_opcode(opcode: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.opcode() == opcode)
    }

    fn segments(&self) -> &'static [SegmentType] {
        match self {
            Self::RunItem | Self::Shutdown => ONE_STRING,
            Self::SetFinished | Self::SkipRemaining | Self::Noop | Self::ByeAck => NO_DATA,
        }
    }
}

/// Controller -> worker message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Execute one work item (never persisted, always a fresh pull).
    RunItem(String),
    /// No more work items will be offered.
    SetFinished,
    SkipRemaining,
    Shutdown(ShutdownKind),
    /// Liveness ping from the controller.
    Noop,
    /// Controller received the worker's `bye`.
    ByeAck,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::RunItem(_) => CommandKind::RunItem,
            Self::SetFinished => CommandKind::SetFinished,
            Self::SkipRemaining => CommandKind::SkipRemaining,
            Self::Shutdown(_) => CommandKind::Shutdown,
            Self::Noop => CommandKind::Noop,
            Self::ByeAck => CommandKind::ByeAck,
        }
    }

    /// Sticky commands are replayed to every channel instance, including late joiners.
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            Self::SkipRemaining | Self::Shutdown(_) | Self::Noop | Self::ByeAck
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConsoleInfo,
    ConsoleDebug,
    ConsoleWarning,
    ConsoleError,
    StdOut,
    StdOutNewLine,
    StdErr,
    StdErrNewLine,
    SysProp,
    TestsetStarting,
    TestsetCompleted,
    TestStarting,
    TestSucceeded,
    TestFailed,
    TestSkipped,
    TestError,
    TestAssumptionFailure,
    JvmExitError,
    Bye,
    NextTest,
    StopOnNextTest,
}

impl EventKind {
    pub const ALL: [EventKind; 21] = [
        EventKind::ConsoleInfo,
        EventKind::ConsoleDebug,
        EventKind::ConsoleWarning,
        EventKind::ConsoleError,
        EventKind::StdOut,
        EventKind::StdOutNewLine,
        EventKind::StdErr,
        EventKind::StdErrNewLine,
        EventKind::SysProp,
        EventKind::TestsetStarting,
        EventKind::TestsetCompleted,
        EventKind::TestStarting,
        EventKind::TestSucceeded,
        EventKind::TestFailed,
        EventKind::TestSkipped,
        EventKind::TestError,
        EventKind::TestAssumptionFailure,
        EventKind::JvmExitError,
        EventKind::Bye,
        EventKind::NextTest,
        EventKind::StopOnNextTest,
    ];
}

impl FrameKind for EventKind {
    fn opcode(&self) -> &'static [u8] {
        match self {
            Self::ConsoleInfo => b"console-info-log",
            Self::ConsoleDebug => b"console-debug-log",
            Self::ConsoleWarning => b"console-warning-log",
            Self::ConsoleError => b"console-error-log",
            Self::StdOut => b"std-out-stream",
            Self::StdOutNewLine => b"std-out-stream-new-line",
            Self::StdErr => b"std-err-stream",
            Self::StdErrNewLine => b"std-err-stream-new-line",
            Self::SysProp => b"sys-prop",
            Self::TestsetStarting => b"testset-starting",
            Self::TestsetCompleted => b"testset-completed",
            Self::TestStarting => b"test-starting",
            Self::TestSucceeded => b"test-succeeded",
            Self::TestFailed => b"test-failed",
            Self::TestSkipped => b"test-skipped",
            Self::TestError => b"test-error",
            Self::TestAssumptionFailure => b"test-assumption-failure",
            Self::JvmExitError => b"jvm-exit-error",
            Self::Bye => b"bye",
            Self::NextTest => b"next-test",
            Self::StopOnNextTest => b"stop-on-next-test",
        }
    }

    fn from_opcode(opcode: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.opcode() == opcode)
    }

    fn segments(&self) -> &'static [SegmentType] {
        match self {
            Self::Bye | Self::NextTest | Self::StopOnNextTest => NO_DATA,
            Self::ConsoleInfo | Self::ConsoleDebug | Self::ConsoleWarning => ONE_STRING,
            Self::ConsoleError | Self::JvmExitError => FAILURE_TRACE,
            Self::StdOut | Self::StdOutNewLine | Self::StdErr | Self::StdErrNewLine => {
                STREAM_OUTPUT
            }
            Self::SysProp => KEY_VALUE,
            Self::TestsetStarting
            | Self::TestsetCompleted
            | Self::TestStarting
            | Self::TestSucceeded
            | Self::TestFailed
            | Self::TestSkipped
            | Self::TestError
            | Self::TestAssumptionFailure => LIFECYCLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleLevel {
    Info,
    Debug,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Failure trace carried by failed lifecycle events, console errors and fatal exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Trimmed trace, one line per relevant frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl FailureDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            summary: None,
            detail: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Absent when none of the three fields is set, matching the wire encoding.
    pub fn from_parts(
        message: Option<String>,
        summary: Option<String>,
        detail: Option<String>,
    ) -> Option<Self> {
        if message.is_none() && summary.is_none() && detail.is_none() {
            None
        } else {
            Some(Self {
                message,
                summary,
                detail,
            })
        }
    }
}

/// Payload of a lifecycle event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Owning group of the item, e.g. the test class.
    pub source: Option<String>,
    pub source_text: Option<String>,
    pub name: Option<String>,
    pub name_text: Option<String>,
    pub group: Option<String>,
    pub message: Option<String>,
    pub elapsed_millis: Option<i32>,
    pub failure: Option<FailureDetail>,
}

impl ReportEntry {
    pub fn new(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_elapsed_millis(mut self, elapsed: i32) -> Self {
        self.elapsed_millis = Some(elapsed);
        self
    }

    pub fn with_failure(mut self, failure: FailureDetail) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Key used to merge attempts: `source#name`, or whichever part is present.
    pub fn item_id(&self) -> String {
        match (self.source.as_deref(), self.name.as_deref()) {
            (Some(source), Some(name)) => format!("{source}#{name}"),
            (Some(source), None) => source.to_string(),
            (None, Some(name)) => name.to_string(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    TestsetStarting,
    TestsetCompleted,
    TestStarting,
    TestSucceeded,
    TestFailed,
    TestSkipped,
    TestError,
    TestAssumptionFailure,
}

impl LifecycleKind {
    pub fn event_kind(&self) -> EventKind {
        match self {
            Self::TestsetStarting => EventKind::TestsetStarting,
            Self::TestsetCompleted => EventKind::TestsetCompleted,
            Self::TestStarting => EventKind::TestStarting,
            Self::TestSucceeded => EventKind::TestSucceeded,
            Self::TestFailed => EventKind::TestFailed,
            Self::TestSkipped => EventKind::TestSkipped,
            Self::TestError => EventKind::TestError,
            Self::TestAssumptionFailure => EventKind::TestAssumptionFailure,
        }
    }

    pub fn from_event_kind(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::TestsetStarting => Some(Self::TestsetStarting),
            EventKind::TestsetCompleted => Some(Self::TestsetCompleted),
            EventKind::TestStarting => Some(Self::TestStarting),
            EventKind::TestSucceeded => Some(Self::TestSucceeded),
            EventKind::TestFailed => Some(Self::TestFailed),
            EventKind::TestSkipped => Some(Self::TestSkipped),
            EventKind::TestError => Some(Self::TestError),
            EventKind::TestAssumptionFailure => Some(Self::TestAssumptionFailure),
            _ => None,
        }
    }

    /// Terminal events close an attempt of a single work item.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TestSucceeded
                | Self::TestFailed
                | Self::TestSkipped
                | Self::TestError
                | Self::TestAssumptionFailure
        )
    }
}

/// Lifecycle event for a work item. Identity is (run mode, attempt id, item id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub run_mode: RunMode,
    pub attempt_id: Option<i64>,
    pub entry: ReportEntry,
}

impl LifecycleEvent {
    pub fn new(
        kind: LifecycleKind,
        run_mode: RunMode,
        attempt_id: Option<i64>,
        entry: ReportEntry,
    ) -> Self {
        Self {
            kind,
            run_mode,
            attempt_id,
            entry,
        }
    }

    pub fn item_id(&self) -> String {
        self.entry.item_id()
    }
}

/// Worker -> controller message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Console {
        level: ConsoleLevel,
        message: Option<String>,
    },
    ConsoleError(Option<FailureDetail>),
    StandardStream {
        stream: StreamKind,
        new_line: bool,
        run_mode: RunMode,
        attempt_id: Option<i64>,
        data: Option<String>,
    },
    SystemProperty {
        run_mode: RunMode,
        attempt_id: Option<i64>,
        key: Option<String>,
        value: Option<String>,
    },
    Lifecycle(LifecycleEvent),
    /// The worker is exiting because of an unrecoverable error.
    FatalExit(Option<FailureDetail>),
    /// The worker is about to exit and waits for `ByeAck`.
    Bye,
    /// The worker asks for the next work item.
    NextTest,
    /// The worker asks every worker to skip remaining items.
    StopOnNextTest,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Console { level, .. } => match level {
                ConsoleLevel::Info => EventKind::ConsoleInfo,
                ConsoleLevel::Debug => EventKind::ConsoleDebug,
                ConsoleLevel::Warning => EventKind::ConsoleWarning,
            },
            Self::ConsoleError(_) => EventKind::ConsoleError,
            Self::StandardStream {
                stream, new_line, ..
            } => match (stream, new_line) {
                (StreamKind::Stdout, false) => EventKind::StdOut,
                (StreamKind::Stdout, true) => EventKind::StdOutNewLine,
                (StreamKind::Stderr, false) => EventKind::StdErr,
                (StreamKind::Stderr, true) => EventKind::StdErrNewLine,
            },
            Self::SystemProperty { .. } => EventKind::SysProp,
            Self::Lifecycle(event) => event.kind.event_kind(),
            Self::FatalExit(_) => EventKind::JvmExitError,
            Self::Bye => EventKind::Bye,
            Self::NextTest => EventKind::NextTest,
            Self::StopOnNextTest => EventKind::StopOnNextTest,
        }
    }

    pub fn console_info(message: impl Into<String>) -> Self {
        Self::Console {
            level: ConsoleLevel::Info,
            message: Some(message.into()),
        }
    }

    pub fn lifecycle(
        kind: LifecycleKind,
        run_mode: RunMode,
        attempt_id: i64,
        entry: ReportEntry,
    ) -> Self {
        Self::Lifecycle(LifecycleEvent::new(kind, run_mode, Some(attempt_id), entry))
    }
}
