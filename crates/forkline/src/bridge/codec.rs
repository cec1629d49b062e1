//! Frame codecs for the command and event channels.
//!
//! Frames are self-delimiting: a header (magic, opcode) followed by the
//! segments of the kind's static table. The decoder keeps its position in a
//! [`Memento`] so a frame may arrive in arbitrarily small chunks. Works over
//! any AsyncRead/AsyncWrite through `FramedRead`/`FramedWrite`.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use encoding_rs::{Encoding, UTF_8};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{
    COMMAND_MAGIC, Command, CommandKind, ConsoleLevel, EVENT_MAGIC, Event, EventKind,
    FailureDetail, FrameKind, LifecycleEvent, LifecycleKind, ReportEntry, RunMode, SegmentType,
    ShutdownKind, StreamKind,
};

const DELIMITER: u8 = b':';
const NULL_STRING_LEN: i32 = -1;
const ABSENT: u8 = 0x00;
const ATTEMPT_PRESENT: u8 = 0x01;
const INTEGER_PRESENT: u8 = 0xff;

/// Upper bound for a single string segment unless configured otherwise.
pub const DEFAULT_MAX_SEGMENT_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("stream ended in the middle of a frame")]
    EndOfStream,

    #[error("segment length {len} exceeds limit {max}")]
    SegmentTooLong { len: usize, max: usize },

    #[error("decoder already failed on an earlier frame")]
    Terminated,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Corrupted input, as opposed to a short or failed read.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::SegmentTooLong { .. })
    }
}

/// A decoded segment value, or one to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentValue<'a> {
    RunMode(RunMode),
    AttemptId(Option<i64>),
    /// Charset switch for the strings that follow.
    Encoding,
    Str(Option<&'a str>),
    Int(Option<i32>),
}

impl SegmentValue<'_> {
    fn segment_type(&self) -> SegmentType {
        match self {
            Self::RunMode(_) => SegmentType::RunMode,
            Self::AttemptId(_) => SegmentType::AttemptId,
            Self::Encoding => SegmentType::StringEncoding,
            Self::Str(_) => SegmentType::DataString,
            Self::Int(_) => SegmentType::DataInteger,
        }
    }
}

/// Writes one frame. `segments` must follow the static table of `kind`;
/// the end-of-frame marker has no bytes and is implied.
///
/// A string longer than `max_segment_len` after charset encoding fails the
/// whole frame and leaves `dst` as it was.
pub fn encode_frame<K: FrameKind>(
    dst: &mut BytesMut,
    magic: &[u8],
    kind: K,
    segments: &[SegmentValue<'_>],
    charset: &'static Encoding,
    max_segment_len: usize,
) -> Result<(), FrameError> {
    debug_assert!(
        segments
            .iter()
            .map(SegmentValue::segment_type)
            .eq(kind
                .segments()
                .iter()
                .copied()
                .filter(|s| *s != SegmentType::EndOfFrame)),
        "segments do not match table of {kind:?}"
    );
    let charset = charset.output_encoding();
    let opcode = kind.opcode();
    let start = dst.len();

    dst.reserve(4 + magic.len() + opcode.len() + 1);
    dst.put_u8(DELIMITER);
    dst.put_slice(magic);
    dst.put_u8(DELIMITER);
    put_short_name(dst, opcode);

    for segment in segments {
        match segment {
            SegmentValue::RunMode(mode) => put_short_name(dst, mode.as_wire()),
            SegmentValue::AttemptId(None) => {
                dst.put_u8(ABSENT);
                dst.put_u8(DELIMITER);
            }
            SegmentValue::AttemptId(Some(id)) => {
                dst.put_u8(ATTEMPT_PRESENT);
                dst.put_i64(*id);
                dst.put_u8(DELIMITER);
            }
            SegmentValue::Encoding => put_short_name(dst, charset.name().as_bytes()),
            SegmentValue::Str(None) => {
                dst.put_i32(NULL_STRING_LEN);
                dst.put_u8(DELIMITER);
                dst.put_u8(DELIMITER);
            }
            SegmentValue::Str(Some(s)) => {
                let (bytes, _, _) = charset.encode(s);
                let len = match i32::try_from(bytes.len()) {
                    Ok(len) if bytes.len() <= max_segment_len => len,
                    _ => {
                        dst.truncate(start);
                        return Err(FrameError::SegmentTooLong {
                            len: bytes.len(),
                            max: max_segment_len,
                        });
                    }
                };
                dst.reserve(bytes.len() + 6);
                dst.put_i32(len);
                dst.put_u8(DELIMITER);
                dst.put_slice(&bytes);
                dst.put_u8(DELIMITER);
            }
            SegmentValue::Int(None) => {
                dst.put_u8(ABSENT);
                dst.put_u8(DELIMITER);
            }
            SegmentValue::Int(Some(v)) => {
                dst.put_u8(INTEGER_PRESENT);
                dst.put_i32(*v);
                dst.put_u8(DELIMITER);
            }
        }
    }
    Ok(())
}

fn put_short_name(dst: &mut BytesMut, name: &[u8]) {
    dst.put_u8(name.len() as u8);
    dst.put_u8(DELIMITER);
    dst.put_slice(name);
    dst.put_u8(DELIMITER);
}

/// Decoded value held by the memento until the frame completes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(Option<String>),
    Int(Option<i32>),
}

#[derive(Debug)]
struct PartialFrame<K> {
    kind: K,
    next_segment: usize,
    run_mode: Option<RunMode>,
    attempt_id: Option<i64>,
    values: Vec<Value>,
}

#[derive(Debug)]
struct CompletedFrame<K> {
    kind: K,
    run_mode: Option<RunMode>,
    attempt_id: Option<i64>,
    values: std::vec::IntoIter<Value>,
}

impl<K> CompletedFrame<K> {
    fn run_mode(&self) -> Result<RunMode, FrameError> {
        self.run_mode
            .ok_or_else(|| FrameError::malformed("frame without run mode"))
    }

    fn string(&mut self) -> Result<Option<String>, FrameError> {
        match self.values.next() {
            Some(Value::Str(s)) => Ok(s),
            _ => Err(FrameError::malformed("expected string segment")),
        }
    }

    fn integer(&mut self) -> Result<Option<i32>, FrameError> {
        match self.values.next() {
            Some(Value::Int(v)) => Ok(v),
            _ => Err(FrameError::malformed("expected integer segment")),
        }
    }
}

/// Decode cursor: partially consumed frame plus the active charset.
///
/// Owned by exactly one reader. A failure is terminal for the cursor.
#[derive(Debug)]
pub struct Memento<K> {
    charset: &'static Encoding,
    frame: Option<PartialFrame<K>>,
    failed: bool,
}

impl<K: FrameKind> Default for Memento<K> {
    fn default() -> Self {
        Self {
            charset: UTF_8,
            frame: None,
            failed: false,
        }
    }
}

impl<K: FrameKind> Memento<K> {
    pub fn charset(&self) -> &'static Encoding {
        self.charset
    }

    /// True while a frame header has been consumed but not its last segment.
    pub fn in_frame(&self) -> bool {
        self.frame.is_some()
    }

    fn decode(
        &mut self,
        src: &mut BytesMut,
        magic: &[u8],
        max_segment_len: usize,
    ) -> Result<Option<CompletedFrame<K>>, FrameError> {
        if self.failed {
            return Err(FrameError::Terminated);
        }
        let result = self.advance(src, magic, max_segment_len);
        if result.is_err() {
            self.failed = true;
            self.frame = None;
        }
        result
    }

    fn advance(
        &mut self,
        src: &mut BytesMut,
        magic: &[u8],
        max_segment_len: usize,
    ) -> Result<Option<CompletedFrame<K>>, FrameError> {
        if self.frame.is_none() {
            let Some((kind, used)) = read_header::<K>(src, magic)? else {
                return Ok(None);
            };
            src.advance(used);
            tracing::trace!(opcode = ?kind, "Frame header decoded");
            self.frame = Some(PartialFrame {
                kind,
                next_segment: 0,
                run_mode: None,
                attempt_id: None,
                values: Vec::new(),
            });
        }

        let Memento { charset, frame, .. } = self;
        loop {
            let Some(partial) = frame.as_mut() else {
                return Ok(None);
            };
            let segment = partial
                .kind
                .segments()
                .get(partial.next_segment)
                .copied()
                .unwrap_or(SegmentType::EndOfFrame);

            let used = match segment {
                SegmentType::EndOfFrame => {
                    return Ok(frame.take().map(|p| CompletedFrame {
                        kind: p.kind,
                        run_mode: p.run_mode,
                        attempt_id: p.attempt_id,
                        values: p.values.into_iter(),
                    }));
                }
                SegmentType::RunMode => match read_run_mode(src)? {
                    Some((mode, used)) => {
                        partial.run_mode = Some(mode);
                        used
                    }
                    None => return Ok(None),
                },
                SegmentType::AttemptId => match read_attempt_id(src)? {
                    Some((id, used)) => {
                        partial.attempt_id = id;
                        used
                    }
                    None => return Ok(None),
                },
                SegmentType::StringEncoding => match read_charset(src)? {
                    Some((encoding, used)) => {
                        *charset = encoding;
                        used
                    }
                    None => return Ok(None),
                },
                SegmentType::DataString => match read_string(src, *charset, max_segment_len)? {
                    Some((s, used)) => {
                        partial.values.push(Value::Str(s));
                        used
                    }
                    None => return Ok(None),
                },
                SegmentType::DataInteger => match read_integer(src)? {
                    Some((v, used)) => {
                        partial.values.push(Value::Int(v));
                        used
                    }
                    None => return Ok(None),
                },
            };
            src.advance(used);
            partial.next_segment += 1;
        }
    }
}

/// Bounds-checked look-ahead over the buffered bytes. Nothing is consumed
/// until a whole segment is available.
struct Peek<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Peek<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.bytes(N)?.try_into().ok()
    }

    fn delimiter(&mut self) -> Result<Option<()>, FrameError> {
        match self.u8() {
            Some(DELIMITER) => Ok(Some(())),
            Some(other) => Err(FrameError::malformed(format!(
                "expected delimiter at offset {}, found 0x{other:02x}",
                self.pos - 1
            ))),
            None => Ok(None),
        }
    }

    fn short_name(&mut self) -> Result<Option<&'a [u8]>, FrameError> {
        let Some(len) = self.u8() else { return Ok(None) };
        if self.delimiter()?.is_none() {
            return Ok(None);
        }
        let Some(name) = self.bytes(len as usize) else {
            return Ok(None);
        };
        Ok(self.delimiter()?.map(|_| name))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }
}

macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

fn read_header<K: FrameKind>(src: &[u8], magic: &[u8]) -> Result<Option<(K, usize)>, FrameError> {
    let mut peek = Peek::new(src);
    need!(peek.delimiter()?);

    // Reject a wrong marker as soon as its first bytes arrive.
    let seen = peek.remaining();
    let seen = &seen[..seen.len().min(magic.len())];
    if !magic.starts_with(seen) {
        return Err(FrameError::malformed("unexpected frame marker"));
    }
    need!(peek.bytes(magic.len()));
    need!(peek.delimiter()?);

    let opcode = need!(peek.short_name()?);
    let kind = K::from_opcode(opcode).ok_or_else(|| {
        FrameError::malformed(format!("unknown opcode {:?}", String::from_utf8_lossy(opcode)))
    })?;
    Ok(Some((kind, peek.pos)))
}

fn read_run_mode(src: &[u8]) -> Result<Option<(RunMode, usize)>, FrameError> {
    let mut peek = Peek::new(src);
    let name = need!(peek.short_name()?);
    let mode = RunMode::from_wire(name).ok_or_else(|| {
        FrameError::malformed(format!("unknown run mode {:?}", String::from_utf8_lossy(name)))
    })?;
    Ok(Some((mode, peek.pos)))
}

fn read_attempt_id(src: &[u8]) -> Result<Option<(Option<i64>, usize)>, FrameError> {
    let mut peek = Peek::new(src);
    let id = match need!(peek.u8()) {
        ABSENT => None,
        ATTEMPT_PRESENT => Some(i64::from_be_bytes(need!(peek.array::<8>()))),
        flag => {
            return Err(FrameError::malformed(format!(
                "invalid attempt id flag 0x{flag:02x}"
            )));
        }
    };
    need!(peek.delimiter()?);
    Ok(Some((id, peek.pos)))
}

fn read_charset(src: &[u8]) -> Result<Option<(&'static Encoding, usize)>, FrameError> {
    let mut peek = Peek::new(src);
    let name = need!(peek.short_name()?);
    let encoding = Encoding::for_label(name).ok_or_else(|| {
        FrameError::malformed(format!("unknown charset {:?}", String::from_utf8_lossy(name)))
    })?;
    Ok(Some((encoding, peek.pos)))
}

fn read_string(
    src: &mut BytesMut,
    charset: &'static Encoding,
    max_segment_len: usize,
) -> Result<Option<(Option<String>, usize)>, FrameError> {
    let mut peek = Peek::new(src);
    let len = i32::from_be_bytes(need!(peek.array::<4>()));
    need!(peek.delimiter()?);
    if len == NULL_STRING_LEN {
        need!(peek.delimiter()?);
        return Ok(Some((None, peek.pos)));
    }
    if len < 0 {
        return Err(FrameError::malformed(format!("negative string length {len}")));
    }
    let len = len as usize;
    if len > max_segment_len {
        return Err(FrameError::SegmentTooLong {
            len,
            max: max_segment_len,
        });
    }

    let Some(bytes) = peek.bytes(len) else {
        // Size the buffer for the rest of this segment in one go.
        let missing = peek.pos + len + 1 - src.len();
        src.reserve(missing);
        return Ok(None);
    };
    let (text, _) = charset.decode_without_bom_handling(bytes);
    let text = text.into_owned();
    need!(peek.delimiter()?);
    Ok(Some((Some(text), peek.pos)))
}

fn read_integer(src: &[u8]) -> Result<Option<(Option<i32>, usize)>, FrameError> {
    let mut peek = Peek::new(src);
    let value = match need!(peek.u8()) {
        ABSENT => None,
        INTEGER_PRESENT => Some(i32::from_be_bytes(need!(peek.array::<4>()))),
        flag => {
            return Err(FrameError::malformed(format!("invalid integer flag 0x{flag:02x}")));
        }
    };
    need!(peek.delimiter()?);
    Ok(Some((value, peek.pos)))
}

fn decode_eof_with<T>(
    decoded: Option<T>,
    buf: &BytesMut,
    in_frame: bool,
) -> Result<Option<T>, FrameError> {
    match decoded {
        Some(item) => Ok(Some(item)),
        None if buf.is_empty() && !in_frame => Ok(None),
        None => Err(FrameError::EndOfStream),
    }
}

/// Decodes commands (worker side) and encodes them (controller side).
#[derive(Debug)]
pub struct CommandCodec {
    memento: Memento<CommandKind>,
    max_segment_len: usize,
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandCodec {
    pub fn new() -> Self {
        Self {
            memento: Memento::default(),
            max_segment_len: DEFAULT_MAX_SEGMENT_LEN,
        }
    }

    pub fn with_max_segment_len(mut self, max: usize) -> Self {
        self.max_segment_len = max;
        self
    }

    fn to_command(mut frame: CompletedFrame<CommandKind>) -> Result<Command, FrameError> {
        Ok(match frame.kind {
            CommandKind::RunItem => match frame.string()? {
                Some(item) => Command::RunItem(item),
                None => return Err(FrameError::malformed("run item without identifier")),
            },
            CommandKind::Shutdown => {
                let param = frame.string()?.unwrap_or_default();
                let kind = if param.is_empty() {
                    ShutdownKind::Default
                } else {
                    ShutdownKind::from_param(&param).ok_or_else(|| {
                        FrameError::malformed(format!("unknown shutdown kind {param:?}"))
                    })?
                };
                Command::Shutdown(kind)
            }
            CommandKind::SetFinished => Command::SetFinished,
            CommandKind::SkipRemaining => Command::SkipRemaining,
            CommandKind::Noop => Command::Noop,
            CommandKind::ByeAck => Command::ByeAck,
        })
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.memento.decode(src, COMMAND_MAGIC, self.max_segment_len)? {
            Some(frame) => Self::to_command(frame).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let decoded = self.decode(buf)?;
        decode_eof_with(decoded, buf, self.memento.in_frame())
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let kind = item.kind();
        let max = self.max_segment_len;
        match &item {
            Command::RunItem(id) => encode_frame(
                dst,
                COMMAND_MAGIC,
                kind,
                &[SegmentValue::Encoding, SegmentValue::Str(Some(id))],
                UTF_8,
                max,
            ),
            Command::Shutdown(shutdown) => encode_frame(
                dst,
                COMMAND_MAGIC,
                kind,
                &[
                    SegmentValue::Encoding,
                    SegmentValue::Str(Some(shutdown.as_param())),
                ],
                UTF_8,
                max,
            ),
            Command::SetFinished | Command::SkipRemaining | Command::Noop | Command::ByeAck => {
                encode_frame(dst, COMMAND_MAGIC, kind, &[], UTF_8, max)
            }
        }?;
        tracing::trace!(opcode = ?kind, "Encoded command frame");
        Ok(())
    }
}

/// Decodes events (controller side) and encodes them (worker side).
#[derive(Debug)]
pub struct EventCodec {
    memento: Memento<EventKind>,
    charset: &'static Encoding,
    max_segment_len: usize,
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCodec {
    pub fn new() -> Self {
        Self {
            memento: Memento::default(),
            charset: UTF_8,
            max_segment_len: DEFAULT_MAX_SEGMENT_LEN,
        }
    }

    pub fn with_max_segment_len(mut self, max: usize) -> Self {
        self.max_segment_len = max;
        self
    }

    /// Charset used for strings this codec encodes.
    pub fn with_charset(mut self, charset: &'static Encoding) -> Self {
        self.charset = charset;
        self
    }

    /// Charset most recently announced by the peer.
    pub fn decode_charset(&self) -> &'static Encoding {
        self.memento.charset()
    }

    fn to_event(mut frame: CompletedFrame<EventKind>) -> Result<Event, FrameError> {
        let kind = frame.kind;
        let event = match kind {
            EventKind::Bye => Event::Bye,
            EventKind::NextTest => Event::NextTest,
            EventKind::StopOnNextTest => Event::StopOnNextTest,
            EventKind::ConsoleInfo | EventKind::ConsoleDebug | EventKind::ConsoleWarning => {
                let level = match kind {
                    EventKind::ConsoleDebug => ConsoleLevel::Debug,
                    EventKind::ConsoleWarning => ConsoleLevel::Warning,
                    _ => ConsoleLevel::Info,
                };
                Event::Console {
                    level,
                    message: frame.string()?,
                }
            }
            EventKind::ConsoleError => Event::ConsoleError(failure_detail(&mut frame)?),
            EventKind::JvmExitError => Event::FatalExit(failure_detail(&mut frame)?),
            EventKind::StdOut
            | EventKind::StdOutNewLine
            | EventKind::StdErr
            | EventKind::StdErrNewLine => {
                let stream = match kind {
                    EventKind::StdErr | EventKind::StdErrNewLine => StreamKind::Stderr,
                    _ => StreamKind::Stdout,
                };
                Event::StandardStream {
                    stream,
                    new_line: matches!(kind, EventKind::StdOutNewLine | EventKind::StdErrNewLine),
                    run_mode: frame.run_mode()?,
                    attempt_id: frame.attempt_id,
                    data: frame.string()?,
                }
            }
            EventKind::SysProp => Event::SystemProperty {
                run_mode: frame.run_mode()?,
                attempt_id: frame.attempt_id,
                key: frame.string()?,
                value: frame.string()?,
            },
            other => {
                let lifecycle = LifecycleKind::from_event_kind(other)
                    .ok_or_else(|| FrameError::malformed("unhandled event kind"))?;
                let run_mode = frame.run_mode()?;
                let entry = ReportEntry {
                    source: frame.string()?,
                    source_text: frame.string()?,
                    name: frame.string()?,
                    name_text: frame.string()?,
                    group: frame.string()?,
                    message: frame.string()?,
                    elapsed_millis: frame.integer()?,
                    failure: failure_detail(&mut frame)?,
                };
                Event::Lifecycle(LifecycleEvent::new(lifecycle, run_mode, frame.attempt_id, entry))
            }
        };
        Ok(event)
    }
}

fn failure_detail<K>(frame: &mut CompletedFrame<K>) -> Result<Option<FailureDetail>, FrameError> {
    let message = frame.string()?;
    let summary = frame.string()?;
    let detail = frame.string()?;
    Ok(FailureDetail::from_parts(message, summary, detail))
}

fn failure_segments(failure: Option<&FailureDetail>) -> [SegmentValue<'_>; 3] {
    [
        SegmentValue::Str(failure.and_then(|f| f.message.as_deref())),
        SegmentValue::Str(failure.and_then(|f| f.summary.as_deref())),
        SegmentValue::Str(failure.and_then(|f| f.detail.as_deref())),
    ]
}

impl Decoder for EventCodec {
    type Item = Event;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.memento.decode(src, EVENT_MAGIC, self.max_segment_len)? {
            Some(frame) => Self::to_event(frame).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let decoded = self.decode(buf)?;
        decode_eof_with(decoded, buf, self.memento.in_frame())
    }
}

impl Encoder<Event> for EventCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Event, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let kind = item.kind();
        let (charset, max) = (self.charset, self.max_segment_len);
        let before = dst.len();
        match &item {
            Event::Bye | Event::NextTest | Event::StopOnNextTest => {
                encode_frame(dst, EVENT_MAGIC, kind, &[], charset, max)
            }
            Event::Console { message, .. } => encode_frame(
                dst,
                EVENT_MAGIC,
                kind,
                &[SegmentValue::Encoding, SegmentValue::Str(message.as_deref())],
                charset,
                max,
            ),
            Event::ConsoleError(failure) | Event::FatalExit(failure) => {
                let [message, summary, detail] = failure_segments(failure.as_ref());
                encode_frame(
                    dst,
                    EVENT_MAGIC,
                    kind,
                    &[SegmentValue::Encoding, message, summary, detail],
                    charset,
                    max,
                )
            }
            Event::StandardStream {
                run_mode,
                attempt_id,
                data,
                ..
            } => encode_frame(
                dst,
                EVENT_MAGIC,
                kind,
                &[
                    SegmentValue::RunMode(*run_mode),
                    SegmentValue::AttemptId(*attempt_id),
                    SegmentValue::Encoding,
                    SegmentValue::Str(data.as_deref()),
                ],
                charset,
                max,
            ),
            Event::SystemProperty {
                run_mode,
                attempt_id,
                key,
                value,
            } => encode_frame(
                dst,
                EVENT_MAGIC,
                kind,
                &[
                    SegmentValue::RunMode(*run_mode),
                    SegmentValue::AttemptId(*attempt_id),
                    SegmentValue::Encoding,
                    SegmentValue::Str(key.as_deref()),
                    SegmentValue::Str(value.as_deref()),
                ],
                charset,
                max,
            ),
            Event::Lifecycle(event) => {
                let entry = &event.entry;
                let [message, summary, detail] = failure_segments(entry.failure.as_ref());
                encode_frame(
                    dst,
                    EVENT_MAGIC,
                    kind,
                    &[
                        SegmentValue::RunMode(event.run_mode),
                        SegmentValue::AttemptId(event.attempt_id),
                        SegmentValue::Encoding,
                        SegmentValue::Str(entry.source.as_deref()),
                        SegmentValue::Str(entry.source_text.as_deref()),
                        SegmentValue::Str(entry.name.as_deref()),
                        SegmentValue::Str(entry.name_text.as_deref()),
                        SegmentValue::Str(entry.group.as_deref()),
                        SegmentValue::Str(entry.message.as_deref()),
                        SegmentValue::Int(entry.elapsed_millis),
                        message,
                        summary,
                        detail,
                    ],
                    charset,
                    max,
                )
            }
        }?;
        let frame_len = dst.len() - before;
        // Not shipped back over the channel: the worker logs to stderr only.
        tracing::trace!(opcode = ?kind, frame_len, "Encoded event frame");
        if frame_len > 100_000 {
            tracing::info!(
                opcode = ?kind,
                frame_size_kb = frame_len / 1024,
                "Large event frame being encoded"
            );
        }
        Ok(())
    }
}
