//! Rebuild nested spans from point-in-time stack snapshots.
//!
//! Each thread keeps the stack it was last seen with, one open span per
//! depth. A new sample is diffed against it from the root end: the shared
//! root-anchored part stays open, everything below it on the old stack is
//! closed at the new sample's timestamp (deepest first) and everything below
//! it on the new stack is opened (outermost first).
//!
//! Depth is counted from the root, so a span at depth `d + 1` always lies
//! inside the span at depth `d` that was open at the same time.
//!
//! The diff anchors stability at the root. Workloads whose stacks vary near
//! the root while staying stable at the leaf (heavy tail calls, stack
//! switching) will see spans restart more often than the code really did.

use crate::perf::{Frame, Sample};
use crate::registry::ThreadId;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// A sample stamped earlier than its thread's previous sample, or earlier
/// than events already handed to the emitter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sample for thread {thread} at {timestamp}ns is older than {floor}ns")]
pub struct OutOfOrderSample {
    pub thread: ThreadId,
    pub timestamp: u64,
    pub floor: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpanEventKind {
    // Declared first so closes sort ahead of opens at equal timestamps.
    Close,
    Open,
}

/// A span boundary produced by the reconstructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanEvent {
    pub kind: SpanEventKind,
    /// Nanoseconds.
    pub timestamp: u64,
    pub thread: ThreadId,
    /// Distance from the root frame.
    pub depth: usize,
    pub label: String,
    pub module: Option<String>,
    /// When the span opened; equals `timestamp` for opens.
    pub start: u64,
}

/// A closed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub thread: ThreadId,
    pub depth: usize,
    pub label: String,
    pub start: u64,
    pub end: u64,
}

impl SpanEvent {
    /// The finished span, for close events.
    pub fn to_span(&self) -> Option<Span> {
        match self.kind {
            SpanEventKind::Open => None,
            SpanEventKind::Close => Some(Span {
                thread: self.thread,
                depth: self.depth,
                label: self.label.clone(),
                start: self.start,
                end: self.timestamp,
            }),
        }
    }
}

#[derive(Debug)]
struct OpenSpan {
    frame: Frame,
    start: u64,
}

#[derive(Debug)]
struct ThreadState {
    /// Root first; index is depth.
    open: Vec<OpenSpan>,
    last_timestamp: u64,
}

impl ThreadState {
    /// Close spans from the top of the stack down to `depth`, deepest first.
    fn close_from(&mut self, depth: usize, at: u64, thread: ThreadId, out: &mut Vec<SpanEvent>) {
        while self.open.len() > depth {
            let Some(span) = self.open.pop() else { break };
            out.push(SpanEvent {
                kind: SpanEventKind::Close,
                timestamp: at,
                thread,
                depth: self.open.len(),
                label: span.frame.label(),
                module: span.frame.module,
                start: span.start,
            });
        }
    }
}

/// Owns every live thread's open stack.
#[derive(Debug, Default)]
pub struct StackReconstructor {
    threads: BTreeMap<ThreadId, ThreadState>,
    /// Live threads keyed by their last sample, oldest first.
    by_last_seen: BTreeSet<(u64, ThreadId)>,
    idle_gap: Option<u64>,
    /// Events older than this may already have been released downstream.
    floor: u64,
    /// Newest accepted timestamp.
    latest: u64,
    out_of_order: u64,
}

impl StackReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flush threads that go `gap` nanoseconds without a sample.
    pub fn with_idle_gap(mut self, gap: Option<u64>) -> Self {
        self.idle_gap = gap;
        self
    }

    /// Apply one sample, appending the resulting span events to `out`.
    ///
    /// Events from idle threads flushed on the way are appended even when
    /// the sample itself is rejected.
    pub fn push(
        &mut self,
        thread: ThreadId,
        sample: &Sample,
        out: &mut Vec<SpanEvent>,
    ) -> Result<(), OutOfOrderSample> {
        let t = sample.timestamp;

        if let Some(last) = self.last_timestamp(thread) {
            if t < last {
                return Err(self.reject(thread, t, last));
            }
        }

        self.flush_idle(t, out);

        // The thread itself may just have been flushed as idle.
        match self.last_timestamp(thread) {
            Some(last) => {
                self.by_last_seen.remove(&(last, thread));
            }
            None if t < self.floor => {
                let floor = self.floor;
                return Err(self.reject(thread, t, floor));
            }
            None => {}
        }

        let state = self.threads.entry(thread).or_insert_with(|| ThreadState {
            open: Vec::new(),
            last_timestamp: t,
        });

        let shared = state
            .open
            .iter()
            .zip(sample.frames.iter().rev())
            .take_while(|(open, frame)| open.frame.identity() == frame.identity())
            .count();

        state.close_from(shared, t, thread, out);

        for frame in sample.frames.iter().rev().skip(shared) {
            out.push(SpanEvent {
                kind: SpanEventKind::Open,
                timestamp: t,
                thread,
                depth: state.open.len(),
                label: frame.label(),
                module: frame.module.clone(),
                start: t,
            });
            state.open.push(OpenSpan {
                frame: frame.clone(),
                start: t,
            });
        }

        state.last_timestamp = t;
        self.by_last_seen.insert((t, thread));
        self.latest = self.latest.max(t);
        self.raise_floor();
        Ok(())
    }

    /// Close every open span at its thread's last sample and forget all
    /// thread state. Threads are flushed in id order.
    pub fn finish(&mut self, out: &mut Vec<SpanEvent>) {
        for (thread, mut state) in std::mem::take(&mut self.threads) {
            let at = state.last_timestamp;
            state.close_from(0, at, thread, out);
        }
        self.by_last_seen.clear();
        self.floor = self.latest;
    }

    /// The earliest timestamp a future event could carry, or `None` when no
    /// thread is live and anything pending may be released.
    pub fn watermark(&self) -> Option<u64> {
        self.by_last_seen.first().map(|&(t, _)| t)
    }

    pub fn out_of_order_samples(&self) -> u64 {
        self.out_of_order
    }

    /// Number of threads currently holding state.
    pub fn live_threads(&self) -> usize {
        self.threads.len()
    }

    fn last_timestamp(&self, thread: ThreadId) -> Option<u64> {
        self.threads.get(&thread).map(|s| s.last_timestamp)
    }

    fn flush_idle(&mut self, now: u64, out: &mut Vec<SpanEvent>) {
        let Some(gap) = self.idle_gap else { return };

        while let Some(&(last, thread)) = self.by_last_seen.first() {
            if last.saturating_add(gap) >= now {
                break;
            }
            self.by_last_seen.pop_first();
            if let Some(mut state) = self.threads.remove(&thread) {
                log::trace!("thread {thread} idle since {last}ns, flushing");
                state.close_from(0, last, thread, out);
            }
        }
        self.raise_floor();
    }

    fn raise_floor(&mut self) {
        let released_upto = self.watermark().unwrap_or(self.latest);
        self.floor = self.floor.max(released_upto);
    }

    fn reject(&mut self, thread: ThreadId, timestamp: u64, floor: u64) -> OutOfOrderSample {
        self.out_of_order += 1;
        OutOfOrderSample {
            thread,
            timestamp,
            floor,
        }
    }
}
