//! Chrome Trace Event Format reader, writer and validator.
//!
//! This library covers the subset of the [Trace Event Format] used for
//! call-stack timelines: duration events (`B`/`E`), complete events (`X`),
//! instant events and metadata records. Files produced with [`TraceWriter`]
//! load in `chrome://tracing`, Perfetto and Speedscope.
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use trace_event::TraceFile;
//!
//! let file = File::open("trace.json").unwrap();
//! let trace = TraceFile::parse(file).unwrap();
//! let stats = trace.validate().unwrap();
//!
//! println!("Events: {}", trace.events.len());
//! println!("Max depth: {}", stats.max_depth);
//! ```
//!
//! [Trace Event Format]: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{Read, Write};
use thiserror::Error;

/// Errors that can occur while reading a trace file.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty trace file")]
    Empty,
}

/// Result type for trace parsing operations.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Errors that can occur while writing a trace file.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for trace writing operations.
pub type WriteResult<T> = std::result::Result<T, WriteError>;

/// Structural problems found by [`TraceFile::validate`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("event {index} at ts {ts} precedes the previous event at ts {previous}")]
    OutOfOrder { index: usize, ts: f64, previous: f64 },

    #[error("event {index} ends '{name}' on {pid}/{tid} with nothing open")]
    UnmatchedEnd {
        index: usize,
        pid: u32,
        tid: u32,
        name: String,
    },

    #[error("event {index} ends '{found}' on {pid}/{tid} but '{expected}' is innermost")]
    MismatchedEnd {
        index: usize,
        pid: u32,
        tid: u32,
        expected: String,
        found: String,
    },

    #[error("event {index} has negative duration for '{name}'")]
    NegativeDuration { index: usize, name: String },

    #[error("event {index} references thread {pid}/{tid} before its thread_name record")]
    UnnamedThread { index: usize, pid: u32, tid: u32 },

    #[error("'{name}' on {pid}/{tid} is never ended")]
    UnclosedBegin { pid: u32, tid: u32, name: String },
}

// ============================================================================
// Event types
// ============================================================================

/// Event phase, serialized as the single-character `ph` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// `B`: a duration begins.
    Begin,
    /// `E`: the innermost open duration on the thread ends.
    End,
    /// `X`: a complete event carrying its own `dur`.
    Complete,
    /// `i`: an instant event.
    Instant,
    /// `M`: a metadata record (process/thread names, sort indices).
    Metadata,
    /// Any other phase; kept so foreign traces still load.
    Other(char),
}

impl Phase {
    pub fn code(self) -> char {
        match self {
            Phase::Begin => 'B',
            Phase::End => 'E',
            Phase::Complete => 'X',
            Phase::Instant => 'i',
            Phase::Metadata => 'M',
            Phase::Other(c) => c,
        }
    }

    pub fn from_code(code: char) -> Self {
        match code {
            'B' => Phase::Begin,
            'E' => Phase::End,
            'X' => Phase::Complete,
            'i' | 'I' => Phase::Instant,
            'M' => Phase::Metadata,
            other => Phase::Other(other),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut buf = [0u8; 4];
        serializer.serialize_str(self.code().encode_utf8(&mut buf))
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(Phase::from_code(c)),
            _ => Err(D::Error::custom(format!("invalid phase '{raw}'"))),
        }
    }
}

/// A single trace event.
///
/// Timestamps and durations are in microseconds, as the format requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Event name; the span label for duration events.
    #[serde(default)]
    pub name: String,
    /// Comma-separated categories.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cat: String,
    /// Event phase.
    pub ph: Phase,
    /// Timestamp in microseconds.
    #[serde(default)]
    pub ts: f64,
    /// Duration in microseconds (complete events only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    /// Process ID.
    #[serde(default)]
    pub pid: u32,
    /// Thread ID.
    #[serde(default)]
    pub tid: u32,
    /// Free-form arguments shown in the viewer's detail pane.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
}

impl TraceEvent {
    fn new(ph: Phase, name: impl Into<String>, ts: f64, pid: u32, tid: u32) -> Self {
        Self {
            name: name.into(),
            cat: String::new(),
            ph,
            ts,
            dur: None,
            pid,
            tid,
            args: Map::new(),
        }
    }

    /// A `B` event opening a duration named `name`.
    pub fn begin(name: impl Into<String>, ts: f64, pid: u32, tid: u32) -> Self {
        Self::new(Phase::Begin, name, ts, pid, tid)
    }

    /// An `E` event closing the innermost open duration.
    pub fn end(name: impl Into<String>, ts: f64, pid: u32, tid: u32) -> Self {
        Self::new(Phase::End, name, ts, pid, tid)
    }

    /// An `X` event spanning `dur` microseconds from `ts`.
    pub fn complete(name: impl Into<String>, ts: f64, dur: f64, pid: u32, tid: u32) -> Self {
        let mut event = Self::new(Phase::Complete, name, ts, pid, tid);
        event.dur = Some(dur);
        event
    }

    /// A `process_name` metadata record.
    pub fn process_name(pid: u32, name: impl Into<String>) -> Self {
        Self::new(Phase::Metadata, "process_name", 0.0, pid, 0)
            .with_arg("name", Value::String(name.into()))
    }

    /// A `thread_name` metadata record.
    pub fn thread_name(pid: u32, tid: u32, name: impl Into<String>) -> Self {
        Self::new(Phase::Metadata, "thread_name", 0.0, pid, tid)
            .with_arg("name", Value::String(name.into()))
    }

    /// A `thread_sort_index` metadata record controlling track order.
    pub fn thread_sort_index(pid: u32, tid: u32, index: u64) -> Self {
        Self::new(Phase::Metadata, "thread_sort_index", 0.0, pid, tid)
            .with_arg("sort_index", Value::from(index))
    }

    pub fn with_cat(mut self, cat: impl Into<String>) -> Self {
        self.cat = cat.into();
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Whether this is a `thread_name` metadata record.
    pub fn is_thread_name(&self) -> bool {
        self.ph == Phase::Metadata && self.name == "thread_name"
    }
}

// ============================================================================
// Reading and validation
// ============================================================================

/// The two top-level layouts the format allows.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTrace {
    Array(Vec<TraceEvent>),
    Object {
        #[serde(rename = "traceEvents")]
        trace_events: Vec<TraceEvent>,
    },
}

/// Summary of a successfully validated trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceStats {
    /// Number of `B` and `X` events.
    pub intervals: usize,
    /// Number of `M` events.
    pub metadata: usize,
    /// Distinct `(pid, tid)` pairs carrying intervals.
    pub threads: usize,
    /// Deepest simultaneous nesting seen on any thread.
    pub max_depth: usize,
}

/// A parsed trace file.
#[derive(Debug, Clone, Default)]
pub struct TraceFile {
    /// Events in file order.
    pub events: Vec<TraceEvent>,
}

impl TraceFile {
    /// Parse a trace from any `Read`-able source.
    ///
    /// Accepts the JSON Array Format and the JSON Object Format. As the format
    /// allows, an array whose closing `]` is missing (a trace cut short while
    /// being written) is accepted too.
    pub fn parse<R: Read>(mut reader: R) -> Result<Self> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        let raw: RawTrace = if trimmed.starts_with('[') && !trimmed.ends_with(']') {
            let repaired = format!("{}]", trimmed.trim_end_matches(','));
            serde_json::from_str(&repaired)?
        } else {
            serde_json::from_str(trimmed)?
        };

        let events = match raw {
            RawTrace::Array(events) => events,
            RawTrace::Object { trace_events } => trace_events,
        };

        Ok(TraceFile { events })
    }

    /// Check that the trace is a well-formed, globally ordered timeline.
    ///
    /// Rules, applied in file order:
    /// - non-metadata timestamps never decrease;
    /// - every interval's thread was named by a `thread_name` record first;
    /// - each `E` closes the innermost open `B` of the same name on its
    ///   thread, no earlier than it began;
    /// - `X` durations are non-negative;
    /// - nothing is left open at the end.
    pub fn validate(&self) -> std::result::Result<TraceStats, ValidationError> {
        let mut stats = TraceStats::default();
        let mut named: HashSet<(u32, u32)> = HashSet::new();
        let mut open: HashMap<(u32, u32), Vec<(&str, f64)>> = HashMap::new();
        let mut threads: HashSet<(u32, u32)> = HashSet::new();
        let mut previous_ts: Option<f64> = None;

        for (index, event) in self.events.iter().enumerate() {
            let key = (event.pid, event.tid);

            if event.ph == Phase::Metadata {
                stats.metadata += 1;
                if event.is_thread_name() {
                    named.insert(key);
                }
                continue;
            }

            if let Some(previous) = previous_ts {
                if event.ts < previous {
                    return Err(ValidationError::OutOfOrder {
                        index,
                        ts: event.ts,
                        previous,
                    });
                }
            }
            previous_ts = Some(event.ts);

            if !named.contains(&key) {
                return Err(ValidationError::UnnamedThread {
                    index,
                    pid: event.pid,
                    tid: event.tid,
                });
            }

            match event.ph {
                Phase::Begin => {
                    stats.intervals += 1;
                    threads.insert(key);
                    let stack = open.entry(key).or_default();
                    stack.push((event.name.as_str(), event.ts));
                    stats.max_depth = stats.max_depth.max(stack.len());
                }
                Phase::End => {
                    let stack = open.entry(key).or_default();
                    let Some((name, start)) = stack.pop() else {
                        return Err(ValidationError::UnmatchedEnd {
                            index,
                            pid: event.pid,
                            tid: event.tid,
                            name: event.name.clone(),
                        });
                    };
                    // Chrome permits an unnamed E; a named one must match.
                    if !event.name.is_empty() && event.name != name {
                        return Err(ValidationError::MismatchedEnd {
                            index,
                            pid: event.pid,
                            tid: event.tid,
                            expected: name.to_string(),
                            found: event.name.clone(),
                        });
                    }
                    if event.ts < start {
                        return Err(ValidationError::NegativeDuration {
                            index,
                            name: name.to_string(),
                        });
                    }
                }
                Phase::Complete => {
                    stats.intervals += 1;
                    threads.insert(key);
                    if event.dur.is_some_and(|dur| dur < 0.0) {
                        return Err(ValidationError::NegativeDuration {
                            index,
                            name: event.name.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        let mut unclosed: Vec<_> = open
            .into_iter()
            .filter_map(|(key, stack)| stack.first().map(|(name, _)| (key, name.to_string())))
            .collect();
        unclosed.sort();
        if let Some(((pid, tid), name)) = unclosed.into_iter().next() {
            return Err(ValidationError::UnclosedBegin { pid, tid, name });
        }

        stats.threads = threads.len();
        Ok(stats)
    }

    /// Events on one thread, in file order.
    pub fn events_for_thread(&self, pid: u32, tid: u32) -> impl Iterator<Item = &TraceEvent> {
        self.events
            .iter()
            .filter(move |e| e.pid == pid && e.tid == tid && e.ph != Phase::Metadata)
    }

    /// The `thread_name` recorded for a thread, if any.
    pub fn thread_name(&self, pid: u32, tid: u32) -> Option<&str> {
        self.events
            .iter()
            .find(|e| e.is_thread_name() && e.pid == pid && e.tid == tid)
            .and_then(|e| e.args.get("name"))
            .and_then(Value::as_str)
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Streaming writer for the JSON Array Format.
///
/// Events are written one per line as they arrive, so a converter never
/// holds the whole timeline in memory. The closing bracket is written by
/// [`TraceWriter::finish`].
///
/// # Example
///
/// ```no_run
/// use trace_event::{TraceEvent, TraceWriter};
/// use std::fs::File;
///
/// let file = File::create("trace.json").unwrap();
/// let mut writer = TraceWriter::new(file);
///
/// writer.write_event(&TraceEvent::thread_name(1, 1, "main")).unwrap();
/// writer.write_event(&TraceEvent::begin("work", 0.0, 1, 1)).unwrap();
/// writer.write_event(&TraceEvent::end("work", 10.0, 1, 1)).unwrap();
/// writer.finish().unwrap();
/// ```
pub struct TraceWriter<W: Write> {
    writer: W,
    events_written: usize,
}

impl<W: Write> TraceWriter<W> {
    /// Create a new trace writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            events_written: 0,
        }
    }

    /// Write a single event.
    pub fn write_event(&mut self, event: &TraceEvent) -> WriteResult<()> {
        let separator = if self.events_written == 0 { "[\n" } else { ",\n" };
        self.writer.write_all(separator.as_bytes())?;
        serde_json::to_writer(&mut self.writer, event)?;
        self.events_written += 1;
        Ok(())
    }

    /// Number of events written so far.
    pub fn events_written(&self) -> usize {
        self.events_written
    }

    /// Close the array, flush, and return the underlying writer.
    pub fn finish(mut self) -> WriteResult<W> {
        if self.events_written == 0 {
            self.writer.write_all(b"[\n]\n")?;
        } else {
            self.writer.write_all(b"\n]\n")?;
        }
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn named_thread() -> String {
        r#"{"name":"thread_name","ph":"M","pid":1,"tid":2,"args":{"name":"worker"}}"#.to_string()
    }

    fn parse(body: &str) -> TraceFile {
        TraceFile::parse(Cursor::new(body)).unwrap()
    }

    #[test]
    fn parse_array_format() {
        let trace = parse(&format!(
            "[{},{}]",
            named_thread(),
            r#"{"name":"main","ph":"B","ts":1.5,"pid":1,"tid":2}"#
        ));

        assert_eq!(trace.events.len(), 2);
        assert_eq!(trace.events[1].ph, Phase::Begin);
        assert_eq!(trace.events[1].ts, 1.5);
        assert_eq!(trace.thread_name(1, 2), Some("worker"));
    }

    #[test]
    fn parse_object_format() {
        let trace = parse(&format!(r#"{{"traceEvents":[{}]}}"#, named_thread()));

        assert_eq!(trace.events.len(), 1);
        assert!(trace.events[0].is_thread_name());
    }

    #[test]
    fn parse_array_missing_closing_bracket() {
        let trace = parse(&format!(
            "[\n{},\n{},\n",
            named_thread(),
            r#"{"name":"main","ph":"B","ts":0,"pid":1,"tid":2}"#
        ));

        assert_eq!(trace.events.len(), 2);
    }

    #[test]
    fn parse_keeps_unknown_phases() {
        let trace = parse(r#"[{"name":"c","ph":"C","ts":3,"pid":1,"tid":1}]"#);
        assert_eq!(trace.events[0].ph, Phase::Other('C'));
    }

    #[test]
    fn parse_rejects_multi_char_phase() {
        let result = TraceFile::parse(Cursor::new(r#"[{"name":"x","ph":"BE","pid":1,"tid":1}]"#));
        assert!(matches!(result, Err(ParseError::Json(_))));
    }

    #[test]
    fn empty_input_fails() {
        let result = TraceFile::parse(Cursor::new("  \n"));
        assert!(matches!(result, Err(ParseError::Empty)));
    }

    #[test]
    fn validate_nested_intervals() {
        let trace = parse(&format!(
            "[{},{},{},{},{}]",
            named_thread(),
            r#"{"name":"main","ph":"B","ts":0,"pid":1,"tid":2}"#,
            r#"{"name":"foo","ph":"B","ts":10,"pid":1,"tid":2}"#,
            r#"{"name":"foo","ph":"E","ts":20,"pid":1,"tid":2}"#,
            r#"{"name":"main","ph":"E","ts":20,"pid":1,"tid":2}"#
        ));

        let stats = trace.validate().unwrap();
        assert_eq!(stats.intervals, 2);
        assert_eq!(stats.metadata, 1);
        assert_eq!(stats.threads, 1);
        assert_eq!(stats.max_depth, 2);
    }

    #[test]
    fn validate_rejects_mismatched_end() {
        let trace = parse(&format!(
            "[{},{},{},{}]",
            named_thread(),
            r#"{"name":"main","ph":"B","ts":0,"pid":1,"tid":2}"#,
            r#"{"name":"foo","ph":"B","ts":1,"pid":1,"tid":2}"#,
            r#"{"name":"main","ph":"E","ts":2,"pid":1,"tid":2}"#
        ));

        assert!(matches!(
            trace.validate(),
            Err(ValidationError::MismatchedEnd { index: 3, ref expected, .. }) if expected == "foo"
        ));
    }

    #[test]
    fn validate_rejects_unmatched_end() {
        let trace = parse(&format!(
            "[{},{}]",
            named_thread(),
            r#"{"name":"main","ph":"E","ts":2,"pid":1,"tid":2}"#
        ));

        assert!(matches!(
            trace.validate(),
            Err(ValidationError::UnmatchedEnd { index: 1, .. })
        ));
    }

    #[test]
    fn validate_rejects_out_of_order() {
        let trace = parse(&format!(
            "[{},{},{}]",
            named_thread(),
            r#"{"name":"main","ph":"B","ts":5,"pid":1,"tid":2}"#,
            r#"{"name":"main","ph":"E","ts":4,"pid":1,"tid":2}"#
        ));

        assert!(matches!(
            trace.validate(),
            Err(ValidationError::OutOfOrder { index: 2, .. })
        ));
    }

    #[test]
    fn validate_requires_thread_name_first() {
        let trace = parse(&format!(
            "[{},{}]",
            r#"{"name":"main","ph":"B","ts":0,"pid":1,"tid":2}"#,
            named_thread()
        ));

        assert!(matches!(
            trace.validate(),
            Err(ValidationError::UnnamedThread { index: 0, pid: 1, tid: 2 })
        ));
    }

    #[test]
    fn validate_rejects_unclosed_begin() {
        let trace = parse(&format!(
            "[{},{}]",
            named_thread(),
            r#"{"name":"main","ph":"B","ts":0,"pid":1,"tid":2}"#
        ));

        assert_eq!(
            trace.validate(),
            Err(ValidationError::UnclosedBegin {
                pid: 1,
                tid: 2,
                name: "main".to_string()
            })
        );
    }

    #[test]
    fn writer_produces_parseable_array() {
        let mut output = Vec::new();
        {
            let mut writer = TraceWriter::new(&mut output);
            writer
                .write_event(&TraceEvent::thread_name(7, 8, "app"))
                .unwrap();
            writer
                .write_event(&TraceEvent::begin("main", 0.0, 7, 8).with_cat("app"))
                .unwrap();
            writer
                .write_event(&TraceEvent::end("main", 2.5, 7, 8))
                .unwrap();
            assert_eq!(writer.events_written(), 3);
            writer.finish().unwrap();
        }

        let text = String::from_utf8(output.clone()).unwrap();
        assert!(text.starts_with("[\n"));
        assert!(text.ends_with("\n]\n"));
        assert!(text.contains(r#""ph":"B""#));

        let trace = TraceFile::parse(Cursor::new(output)).unwrap();
        assert_eq!(trace.events.len(), 3);
        assert_eq!(trace.events[1].cat, "app");
        assert_eq!(trace.validate().unwrap().intervals, 1);
    }

    #[test]
    fn writer_with_no_events_is_valid_json() {
        let output = TraceWriter::new(Vec::new()).finish().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(value, serde_json::json!([]));
    }

    #[test]
    fn metadata_constructors() {
        let process = TraceEvent::process_name(3, "server");
        assert_eq!(process.ph, Phase::Metadata);
        assert_eq!(process.args["name"], "server");

        let sort = TraceEvent::thread_sort_index(3, 4, 9);
        assert_eq!(sort.args["sort_index"], 9);
        assert!(!sort.is_thread_name());
    }

    #[test]
    fn complete_events_carry_duration() {
        let json = serde_json::to_string(&TraceEvent::complete("gc", 1.0, 4.0, 1, 1)).unwrap();
        assert!(json.contains(r#""ph":"X""#));
        assert!(json.contains(r#""dur":4.0"#));
    }
}
