//! Merge per-thread span events into one globally ordered stream.
//!
//! Every thread's events arrive already in order, so this is a k-way merge:
//! one FIFO per thread and a heap over the queue heads. Heads compete by
//! timestamp, then closes before opens, then thread id, then depth (closes
//! deepest first, opens outermost first). Order within a thread is never
//! changed, which keeps each thread's begin/end pairs properly nested even
//! when several samples share a timestamp.

use crate::reconstruct::{SpanEvent, SpanEventKind};
use crate::registry::ThreadId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeadKey {
    timestamp: u64,
    kind: SpanEventKind,
    thread: ThreadId,
    depth_rank: usize,
}

impl HeadKey {
    fn of(event: &SpanEvent) -> Self {
        let depth_rank = match event.kind {
            SpanEventKind::Close => usize::MAX - event.depth,
            SpanEventKind::Open => event.depth,
        };
        Self {
            timestamp: event.timestamp,
            kind: event.kind,
            thread: event.thread,
            depth_rank,
        }
    }
}

/// Buffers span events until no earlier event can still arrive.
#[derive(Debug, Default)]
pub struct EventMerger {
    queues: HashMap<ThreadId, VecDeque<SpanEvent>>,
    heads: BinaryHeap<Reverse<HeadKey>>,
    pending: usize,
}

impl EventMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: SpanEvent) {
        let queue = self.queues.entry(event.thread).or_default();
        if queue.is_empty() {
            self.heads.push(Reverse(HeadKey::of(&event)));
        }
        queue.push_back(event);
        self.pending += 1;
    }

    /// Next event in global order that is strictly older than `watermark`.
    /// With no watermark every buffered event is ready.
    pub fn pop_ready(&mut self, watermark: Option<u64>) -> Option<SpanEvent> {
        let Reverse(head) = *self.heads.peek()?;
        if watermark.is_some_and(|limit| head.timestamp >= limit) {
            return None;
        }
        self.heads.pop();

        let queue = self.queues.get_mut(&head.thread)?;
        let event = queue.pop_front()?;
        match queue.front() {
            Some(next) => self.heads.push(Reverse(HeadKey::of(next))),
            None => {
                self.queues.remove(&head.thread);
            }
        }
        self.pending -= 1;
        Some(event)
    }

    /// Events buffered and not yet released.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }
}

impl Extend<SpanEvent> for EventMerger {
    fn extend<I: IntoIterator<Item = SpanEvent>>(&mut self, events: I) {
        for event in events {
            self.push(event);
        }
    }
}
