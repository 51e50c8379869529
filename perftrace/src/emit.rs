//! Write span events as Chrome trace events.
//!
//! Each thread becomes a track: a `thread_name` and `thread_sort_index`
//! metadata record are written when the thread is announced, plus one
//! `process_name` record per process. Span opens become `B` events and
//! closes `E` events, stamped in microseconds, named after the frame and
//! categorized by the thread's display name.
//!
//! Timestamps must not go backwards, an open must land one level below the
//! innermost open span of its thread and a close must match that span.
//! Violations are reported as [`ConsistencyError`].

use crate::error::Result;
use crate::reconstruct::{SpanEvent, SpanEventKind};
use crate::registry::{ThreadEntry, ThreadId};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use thiserror::Error;
use trace_event::{TraceEvent, TraceWriter};

/// A span event sequence that cannot have come from a correct
/// reconstruction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("event for thread {0} emitted before the thread was announced")]
    UnknownThread(ThreadId),

    #[error("thread {0} announced twice")]
    DuplicateThread(ThreadId),

    #[error("event at {timestamp}ns emitted after an event at {previous}ns")]
    TimeWentBackwards { timestamp: u64, previous: u64 },

    #[error("'{label}' opened at depth {depth} on thread {thread} with {open} spans open")]
    DepthSkew {
        thread: ThreadId,
        label: String,
        depth: usize,
        open: usize,
    },

    #[error("'{label}' closed at depth {depth} on thread {thread} without a matching open")]
    UnmatchedClose {
        thread: ThreadId,
        label: String,
        depth: usize,
    },

    #[error("'{label}' on thread {thread} ends at {end}ns before it started at {start}ns")]
    NegativeDuration {
        thread: ThreadId,
        label: String,
        start: u64,
        end: u64,
    },

    #[error("{open} spans still open on thread {thread} at end of output")]
    Unclosed { thread: ThreadId, open: usize },
}

#[derive(Debug)]
struct Track {
    pid: u32,
    tid: u32,
    name: String,
    /// Labels and start times of open spans, root first.
    open: Vec<(String, u64)>,
}

/// Streams span events into a [`TraceWriter`].
pub struct TimelineEmitter<W: Write> {
    writer: TraceWriter<W>,
    tracks: HashMap<ThreadId, Track>,
    named_processes: HashSet<u32>,
    last_timestamp: Option<u64>,
    relative_time: bool,
    origin: Option<u64>,
    spans: u64,
}

impl<W: Write> TimelineEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: TraceWriter::new(writer),
            tracks: HashMap::new(),
            named_processes: HashSet::new(),
            last_timestamp: None,
            relative_time: false,
            origin: None,
            spans: 0,
        }
    }

    /// Rebase timestamps so the first span starts at zero.
    pub fn with_relative_time(mut self, relative_time: bool) -> Self {
        self.relative_time = relative_time;
        self
    }

    /// Write the metadata records for a newly registered thread.
    pub fn announce_thread(&mut self, entry: &ThreadEntry, process_name: &str) -> Result<()> {
        if self.tracks.contains_key(&entry.id) {
            return Err(ConsistencyError::DuplicateThread(entry.id).into());
        }

        if self.named_processes.insert(entry.pid) {
            self.writer
                .write_event(&TraceEvent::process_name(entry.pid, process_name))?;
        }
        self.writer
            .write_event(&TraceEvent::thread_name(entry.pid, entry.tid, &entry.name))?;
        self.writer.write_event(&TraceEvent::thread_sort_index(
            entry.pid,
            entry.tid,
            u64::from(entry.id.0),
        ))?;

        self.tracks.insert(
            entry.id,
            Track {
                pid: entry.pid,
                tid: entry.tid,
                name: entry.name.clone(),
                open: Vec::new(),
            },
        );
        Ok(())
    }

    /// Write one span boundary.
    pub fn emit(&mut self, event: &SpanEvent) -> Result<()> {
        if let Some(previous) = self.last_timestamp {
            if event.timestamp < previous {
                return Err(ConsistencyError::TimeWentBackwards {
                    timestamp: event.timestamp,
                    previous,
                }
                .into());
            }
        }

        let track = self
            .tracks
            .get_mut(&event.thread)
            .ok_or(ConsistencyError::UnknownThread(event.thread))?;

        match event.kind {
            SpanEventKind::Open => {
                if event.depth != track.open.len() {
                    return Err(ConsistencyError::DepthSkew {
                        thread: event.thread,
                        label: event.label.clone(),
                        depth: event.depth,
                        open: track.open.len(),
                    }
                    .into());
                }
                track.open.push((event.label.clone(), event.timestamp));
            }
            SpanEventKind::Close => {
                let matches = event.depth + 1 == track.open.len()
                    && track
                        .open
                        .last()
                        .is_some_and(|(label, _)| *label == event.label);
                if !matches {
                    return Err(ConsistencyError::UnmatchedClose {
                        thread: event.thread,
                        label: event.label.clone(),
                        depth: event.depth,
                    }
                    .into());
                }
                let (label, start) = track.open.pop().unwrap_or_default();
                if event.timestamp < start || event.start != start {
                    return Err(ConsistencyError::NegativeDuration {
                        thread: event.thread,
                        label,
                        start: event.start.max(start),
                        end: event.timestamp,
                    }
                    .into());
                }
                self.spans += 1;
            }
        }

        let origin = if self.relative_time {
            *self.origin.get_or_insert(event.timestamp)
        } else {
            0
        };
        let ts = (event.timestamp - origin) as f64 / 1000.0;

        let record = match event.kind {
            SpanEventKind::Open => {
                let record = TraceEvent::begin(&event.label, ts, track.pid, track.tid);
                match &event.module {
                    Some(module) => record.with_arg("module", Value::String(module.clone())),
                    None => record,
                }
            }
            SpanEventKind::Close => TraceEvent::end(&event.label, ts, track.pid, track.tid),
        }
        .with_cat(&track.name)
        .with_arg("depth", Value::from(event.depth));

        self.writer.write_event(&record)?;
        self.last_timestamp = Some(event.timestamp);
        Ok(())
    }

    /// Spans closed so far.
    pub fn spans(&self) -> u64 {
        self.spans
    }

    /// Whether `thread` has been announced.
    pub fn has_thread(&self, thread: ThreadId) -> bool {
        self.tracks.contains_key(&thread)
    }

    /// Tracks announced so far.
    pub fn threads(&self) -> usize {
        self.tracks.len()
    }

    /// Close the trace. Fails if any span is still open.
    pub fn finish(self) -> Result<W> {
        let mut unclosed: Vec<_> = self
            .tracks
            .iter()
            .filter(|(_, track)| !track.open.is_empty())
            .map(|(id, track)| (*id, track.open.len()))
            .collect();
        unclosed.sort();
        if let Some((thread, open)) = unclosed.first().copied() {
            return Err(ConsistencyError::Unclosed { thread, open }.into());
        }

        log::debug!("wrote {} trace events", self.writer.events_written());
        Ok(self.writer.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvertError;
    use std::io::Cursor;
    use trace_event::{Phase, TraceFile};

    fn entry(id: u32, pid: u32, tid: u32, name: &str) -> ThreadEntry {
        ThreadEntry {
            id: ThreadId(id),
            pid,
            tid,
            name: name.to_string(),
        }
    }

    fn span_event(kind: SpanEventKind, timestamp: u64, depth: usize, label: &str, start: u64) -> SpanEvent {
        SpanEvent {
            kind,
            timestamp,
            thread: ThreadId(0),
            depth,
            label: label.to_string(),
            module: Some("/bin/app".to_string()),
            start,
        }
    }

    fn open(timestamp: u64, depth: usize, label: &str) -> SpanEvent {
        span_event(SpanEventKind::Open, timestamp, depth, label, timestamp)
    }

    fn close(timestamp: u64, depth: usize, label: &str, start: u64) -> SpanEvent {
        span_event(SpanEventKind::Close, timestamp, depth, label, start)
    }

    fn emitter() -> TimelineEmitter<Vec<u8>> {
        let mut emitter = TimelineEmitter::new(Vec::new());
        emitter.announce_thread(&entry(0, 10, 11, "app"), "app").unwrap();
        emitter
    }

    fn consistency(result: Result<()>) -> ConsistencyError {
        match result {
            Err(ConvertError::InternalConsistency(e)) => e,
            other => panic!("expected consistency error, got {other:?}"),
        }
    }

    #[test]
    fn writes_metadata_then_intervals() {
        let mut emitter = emitter();
        emitter.emit(&open(1_000, 0, "main")).unwrap();
        emitter.emit(&open(2_500, 1, "foo")).unwrap();
        emitter.emit(&close(4_000, 1, "foo", 2_500)).unwrap();
        emitter.emit(&close(4_000, 0, "main", 1_000)).unwrap();
        assert_eq!(emitter.spans(), 2);

        let output = emitter.finish().unwrap();
        let trace = TraceFile::parse(Cursor::new(output)).unwrap();

        let phases: Vec<_> = trace.events.iter().map(|e| e.ph).collect();
        assert_eq!(
            phases,
            vec![
                Phase::Metadata,
                Phase::Metadata,
                Phase::Metadata,
                Phase::Begin,
                Phase::Begin,
                Phase::End,
                Phase::End,
            ]
        );
        assert_eq!(trace.thread_name(10, 11), Some("app"));

        let foo = &trace.events[4];
        assert_eq!(foo.name, "foo");
        assert_eq!(foo.cat, "app");
        assert_eq!(foo.ts, 2.5);
        assert_eq!((foo.pid, foo.tid), (10, 11));
        assert_eq!(foo.args["depth"], 1);
        assert_eq!(foo.args["module"], "/bin/app");

        let stats = trace.validate().unwrap();
        assert_eq!(stats.max_depth, 2);
    }

    #[test]
    fn process_name_written_once_per_pid() {
        let mut emitter = TimelineEmitter::new(Vec::new());
        emitter.announce_thread(&entry(0, 10, 10, "app"), "app").unwrap();
        emitter.announce_thread(&entry(1, 10, 12, "worker"), "app").unwrap();

        let output = emitter.finish().unwrap();
        let trace = TraceFile::parse(Cursor::new(output)).unwrap();
        let process_names = trace
            .events
            .iter()
            .filter(|e| e.name == "process_name")
            .count();
        assert_eq!(process_names, 1);
        assert_eq!(trace.thread_name(10, 12), Some("worker"));
    }

    #[test]
    fn relative_time_rebases_to_first_span() {
        let mut emitter = emitter().with_relative_time(true);
        emitter.emit(&open(5_000_000, 0, "main")).unwrap();
        emitter.emit(&close(5_002_000, 0, "main", 5_000_000)).unwrap();

        let trace = TraceFile::parse(Cursor::new(emitter.finish().unwrap())).unwrap();
        let times: Vec<_> = trace.events_for_thread(10, 11).map(|e| e.ts).collect();
        assert_eq!(times, vec![0.0, 2.0]);
    }

    #[test]
    fn rejects_unknown_thread() {
        let mut emitter = TimelineEmitter::new(Vec::new());
        assert_eq!(
            consistency(emitter.emit(&open(0, 0, "main"))),
            ConsistencyError::UnknownThread(ThreadId(0))
        );
    }

    #[test]
    fn rejects_duplicate_announcement() {
        let mut emitter = emitter();
        let result = emitter.announce_thread(&entry(0, 10, 11, "app"), "app");
        assert!(matches!(
            result,
            Err(ConvertError::InternalConsistency(ConsistencyError::DuplicateThread(_)))
        ));
    }

    #[test]
    fn rejects_close_without_open() {
        let mut emitter = emitter();
        assert!(matches!(
            consistency(emitter.emit(&close(5, 0, "main", 0))),
            ConsistencyError::UnmatchedClose { depth: 0, .. }
        ));
    }

    #[test]
    fn rejects_close_of_wrong_label() {
        let mut emitter = emitter();
        emitter.emit(&open(0, 0, "main")).unwrap();
        assert!(matches!(
            consistency(emitter.emit(&close(5, 0, "other", 0))),
            ConsistencyError::UnmatchedClose { .. }
        ));
    }

    #[test]
    fn rejects_skipped_depth() {
        let mut emitter = emitter();
        emitter.emit(&open(0, 0, "main")).unwrap();
        assert!(matches!(
            consistency(emitter.emit(&open(1, 2, "deep"))),
            ConsistencyError::DepthSkew { depth: 2, open: 1, .. }
        ));
    }

    #[test]
    fn rejects_negative_duration() {
        let mut emitter = emitter();
        emitter.emit(&open(10, 0, "main")).unwrap();
        assert!(matches!(
            consistency(emitter.emit(&close(10, 0, "main", 20))),
            ConsistencyError::NegativeDuration { .. }
        ));
    }

    #[test]
    fn rejects_time_going_backwards() {
        let mut emitter = emitter();
        emitter.emit(&open(10, 0, "main")).unwrap();
        assert_eq!(
            consistency(emitter.emit(&open(9, 1, "foo"))),
            ConsistencyError::TimeWentBackwards {
                timestamp: 9,
                previous: 10
            }
        );
    }

    #[test]
    fn finish_rejects_open_spans() {
        let mut emitter = emitter();
        emitter.emit(&open(0, 0, "main")).unwrap();
        assert!(matches!(
            emitter.finish(),
            Err(ConvertError::InternalConsistency(ConsistencyError::Unclosed { open: 1, .. }))
        ));
    }

    #[test]
    fn tracks_announced_threads() {
        let mut emitter = emitter();
        assert!(emitter.has_thread(ThreadId(0)));
        assert!(!emitter.has_thread(ThreadId(1)));

        emitter.announce_thread(&entry(1, 10, 12, "worker"), "app").unwrap();
        assert!(emitter.has_thread(ThreadId(1)));
        assert_eq!(emitter.threads(), 2);
    }
}
