//! Single-pass conversion from `perf script` text to a trace timeline.
//!
//! # Example
//!
//! ```no_run
//! use perftrace::{Converter, ConverterConfig};
//! use std::fs::File;
//! use std::io::{BufReader, BufWriter};
//!
//! let input = BufReader::new(File::open("perf.txt").unwrap());
//! let output = BufWriter::new(File::create("trace.json").unwrap());
//!
//! let summary = Converter::new(ConverterConfig::default())
//!     .convert(input, output)
//!     .unwrap();
//! println!("{} spans, {} dropped", summary.spans, summary.diagnostics.total_dropped());
//! ```

use crate::diagnostics::Diagnostics;
use crate::emit::TimelineEmitter;
use crate::error::Result;
use crate::merge::EventMerger;
use crate::perf::SampleParser;
use crate::reconstruct::StackReconstructor;
use crate::registry::ThreadRegistry;
use serde::Serialize;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Default idle gap: one second.
pub const DEFAULT_IDLE_GAP_NS: u64 = 1_000_000_000;

/// Conversion settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterConfig {
    /// Close a thread's spans once it has gone this long without a sample.
    ///
    /// Events are held back until every live thread has moved past them, so
    /// this also bounds how long a thread that stopped sampling can delay
    /// output. `None` keeps spans open until the end of input, and buffers
    /// everything after the last sample of any thread that exits early.
    pub idle_gap_ns: Option<u64>,
    /// Rebase output timestamps to the first span.
    pub relative_time: bool,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            idle_gap_ns: Some(DEFAULT_IDLE_GAP_NS),
            relative_time: false,
        }
    }
}

/// Outcome of a conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Samples that contributed to the timeline.
    pub samples: u64,
    /// Closed spans written.
    pub spans: u64,
    /// Threads with at least one accepted sample.
    pub threads: usize,
    /// Most span events held back at once, waiting for other threads.
    pub peak_buffered: usize,
    pub diagnostics: Diagnostics,
    /// The stop flag cut the input short.
    pub interrupted: bool,
}

/// Drives parser, reconstructor, merger and emitter over one input.
#[derive(Debug, Default)]
pub struct Converter {
    config: ConverterConfig,
    stop: Option<Arc<AtomicBool>>,
}

impl Converter {
    pub fn new(config: ConverterConfig) -> Self {
        Self { config, stop: None }
    }

    /// Stop reading when `flag` is set. Spans still open are closed at their
    /// thread's last sample and the output is completed as usual.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Convert all of `reader` into a Chrome trace on `writer`.
    ///
    /// A read error ends the input early: everything read so far is still
    /// written out as a complete trace before the error is returned.
    /// Consistency errors abort immediately.
    pub fn convert<R: BufRead, W: Write>(&self, reader: R, writer: W) -> Result<Summary> {
        let mut parser = SampleParser::new(reader);
        let mut registry = ThreadRegistry::new();
        let mut reconstructor = StackReconstructor::new().with_idle_gap(self.config.idle_gap_ns);
        let mut merger = EventMerger::new();
        let mut emitter =
            TimelineEmitter::new(writer).with_relative_time(self.config.relative_time);

        let mut events = Vec::new();
        let mut samples = 0u64;
        let mut peak_buffered = 0;
        let mut interrupted = false;
        let mut read_error = None;

        loop {
            if self.stop_requested() {
                log::info!("stop requested after {samples} samples");
                interrupted = true;
                break;
            }

            let sample = match parser.next() {
                Some(Ok(sample)) => sample,
                Some(Err(e)) => {
                    log::error!("read failed at line {}: {e}", parser.line_number());
                    read_error = Some(e);
                    break;
                }
                None => break,
            };

            let thread = registry.resolve(sample.pid, sample.tid, &sample.command);
            let pushed = reconstructor.push(thread, &sample, &mut events);
            merger.extend(events.drain(..));
            peak_buffered = peak_buffered.max(merger.pending());

            match pushed {
                Ok(()) => {
                    samples += 1;
                    if !emitter.has_thread(thread) {
                        if let Some(entry) = registry.get(thread) {
                            let process =
                                registry.process_name(entry.pid).unwrap_or(entry.name.as_str());
                            emitter.announce_thread(entry, process)?;
                        }
                    }
                }
                Err(e) => log::debug!("dropping sample: {e}"),
            }

            let watermark = reconstructor.watermark();
            while let Some(event) = merger.pop_ready(watermark) {
                emitter.emit(&event)?;
            }
        }

        reconstructor.finish(&mut events);
        merger.extend(events.drain(..));
        while let Some(event) = merger.pop_ready(None) {
            emitter.emit(&event)?;
        }

        let spans = emitter.spans();
        let threads = emitter.threads();
        emitter.finish()?;

        if let Some(e) = read_error {
            return Err(e.into());
        }

        let mut diagnostics = *parser.diagnostics();
        diagnostics.out_of_order_samples += reconstructor.out_of_order_samples();

        log::debug!(
            "converted {samples} samples into {spans} spans on {threads} threads, \
             at most {peak_buffered} events buffered"
        );

        Ok(Summary {
            samples,
            spans,
            threads,
            peak_buffered,
            diagnostics,
            interrupted,
        })
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use trace_event::{Phase, TraceFile};

    const NESTED: &str = "\
app 10/10 [000] 0.000000000: cycles:
\t1000 main+0x10 (/bin/app)

app 10/10 [000] 0.000000010: cycles:
\t2000 foo+0x4 (/bin/app)
\t1000 main+0x10 (/bin/app)

app 10/10 [000] 0.000000020: cycles:
\t3000 bar (/bin/app)
\t2000 foo+0x4 (/bin/app)
\t1000 main+0x10 (/bin/app)

app 10/10 [000] 0.000000030: cycles:
\t2000 foo+0x8 (/bin/app)
\t1000 main+0x10 (/bin/app)
";

    fn convert(config: ConverterConfig, input: &str) -> (Summary, TraceFile) {
        let mut output = Vec::new();
        let summary = Converter::new(config)
            .convert(Cursor::new(input), &mut output)
            .unwrap();
        let trace = TraceFile::parse(Cursor::new(output)).unwrap();
        (summary, trace)
    }

    /// (name, depth, begin, end) in nanoseconds, sorted.
    fn intervals(trace: &TraceFile) -> Vec<(String, u64, u64, u64)> {
        let mut open: Vec<(String, u64)> = Vec::new();
        let mut spans = Vec::new();
        for event in &trace.events {
            let ns = (event.ts * 1000.0).round() as u64;
            match event.ph {
                Phase::Begin => open.push((event.name.clone(), ns)),
                Phase::End => {
                    let (name, start) = open.pop().unwrap();
                    spans.push((name, open.len() as u64, start, ns));
                }
                _ => {}
            }
        }
        spans.sort();
        spans
    }

    #[test]
    fn nested_calls_become_nested_spans() {
        let (summary, trace) = convert(ConverterConfig::default(), NESTED);

        assert_eq!(
            intervals(&trace),
            vec![
                ("bar".to_string(), 2, 20, 30),
                ("foo".to_string(), 1, 10, 30),
                ("main".to_string(), 0, 0, 30),
            ]
        );
        assert_eq!(summary.samples, 4);
        assert_eq!(summary.spans, 3);
        assert_eq!(summary.threads, 1);
        assert!(summary.diagnostics.is_clean());
        assert!(!summary.interrupted);
        trace.validate().unwrap();
    }

    #[test]
    fn empty_input_is_an_empty_trace() {
        let mut output = Vec::new();
        let summary = Converter::default()
            .convert(Cursor::new(""), &mut output)
            .unwrap();

        assert_eq!(summary, Summary::default());
        assert_eq!(String::from_utf8(output).unwrap(), "[\n]\n");
    }

    #[test]
    fn relative_time_starts_at_zero() {
        let shifted = NESTED.replace(" 0.0000000", " 7.0000000");
        let config = ConverterConfig {
            relative_time: true,
            ..Default::default()
        };
        let (_, trace) = convert(config, &shifted);

        let first = trace
            .events
            .iter()
            .find(|e| e.ph == Phase::Begin)
            .unwrap();
        assert_eq!(first.ts, 0.0);
        assert_eq!(intervals(&trace)[2], ("main".to_string(), 0, 0, 30));
    }

    #[test]
    fn preset_stop_flag_writes_an_empty_trace() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut output = Vec::new();
        let summary = Converter::default()
            .with_stop_flag(flag)
            .convert(Cursor::new(NESTED), &mut output)
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.samples, 0);
        let trace = TraceFile::parse(Cursor::new(output)).unwrap();
        assert!(trace.events.is_empty());
    }

    #[test]
    fn dropped_records_are_counted_not_emitted() {
        let input = format!(
            "{NESTED}\nbroken header line\n\tdead (/bin/app)\n\napp 10/10 [000] 0.000000040: cycles:\n\napp 10/10 [000] 0.000000005: cycles:\n\t1000 main+0x10 (/bin/app)\n"
        );
        let (summary, trace) = convert(ConverterConfig::default(), &input);

        assert_eq!(summary.diagnostics.malformed_records, 1);
        assert_eq!(summary.diagnostics.empty_samples, 1);
        assert_eq!(summary.diagnostics.out_of_order_samples, 1);
        assert_eq!(summary.samples, 4);
        assert_eq!(intervals(&trace).len(), 3);
        assert!(!trace.events.iter().any(|e| e.name == "dead"));
    }

    fn record(tid: u32, ns: u64, frames: &[&str]) -> String {
        let mut out = format!(
            "app 10/{tid} [000] {}.{:09}: cycles:\n",
            ns / 1_000_000_000,
            ns % 1_000_000_000
        );
        for (i, frame) in frames.iter().enumerate() {
            out.push_str(&format!("\t{:x} {frame} (/bin/app)\n", 0x1000 + i));
        }
        out.push('\n');
        out
    }

    #[test]
    fn rejected_first_sample_does_not_announce_thread() {
        let input = [
            record(10, 100, &["main"]),
            record(10, 200, &["main"]),
            record(11, 50, &["worker"]),
        ]
        .concat();
        let (summary, trace) = convert(ConverterConfig::default(), &input);

        assert_eq!(summary.diagnostics.out_of_order_samples, 1);
        assert_eq!(summary.threads, 1);
        assert_eq!(trace.thread_name(10, 11), None);

        let input = format!("{input}{}", record(11, 300, &["worker"]));
        let (summary, trace) = convert(ConverterConfig::default(), &input);

        assert_eq!(summary.threads, 2);
        assert_eq!(trace.thread_name(10, 11), Some("app"));
        trace.validate().unwrap();
    }

    #[test]
    fn silent_thread_does_not_hold_back_output() {
        // One thread samples once and exits; another keeps running for 5s at
        // 1ms intervals, each sample swapping the leaf frame.
        let mut input = record(11, 0, &["worker"]);
        for i in 1..=5_000u64 {
            let leaf = if i % 2 == 0 { "a" } else { "b" };
            input.push_str(&record(10, i * 1_000_000, &[leaf, "main"]));
        }

        let (bounded, trace) = convert(ConverterConfig::default(), &input);
        trace.validate().unwrap();
        assert_eq!(bounded.samples, 5_001);
        // Roughly one idle gap's worth of events, not the whole capture.
        assert!(bounded.peak_buffered < 2_100, "{}", bounded.peak_buffered);

        let unbounded = ConverterConfig {
            idle_gap_ns: None,
            ..Default::default()
        };
        let (unbounded, _) = convert(unbounded, &input);
        assert!(unbounded.peak_buffered > 9_000);
    }
}
