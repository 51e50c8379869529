//! Parse Linux `perf script` output into samples.
//!
//! The parser reads the text printed by `perf script` for a capture recorded
//! with call graphs (`perf record -g` or `--call-graph dwarf`) and yields one
//! [`Sample`] per record, lazily, in input order.
//!
//! # Input format
//!
//! Each record is a header line followed by one line per stack frame, leaf
//! first, and a blank line:
//!
//! ```text
//! <comm> <pid>[/<tid>] [<cpu>] <secs>[.<frac>]: [<period>] [<event>:]
//! \t<hex-ip> <symbol>[+<offset>] [(<module>)]
//! \t...
//!
//! ```
//!
//! This is the layout of `perf script -F comm,pid,tid,cpu,time,event,ip,sym,dso`
//! and of narrower field sets such as `-F comm,pid,tid,time,ip,sym`.
//!
//! - `comm` may contain spaces and perf left-pads it; the remaining header
//!   fields are located relative to the timestamp, the last token of the
//!   form `<secs>[.<frac>]:`, so command words ending in `:` are fine.
//! - `tid` defaults to `pid` when perf prints only one of them.
//! - The timestamp is seconds with up to nine fractional digits and is kept
//!   as integer nanoseconds.
//! - Frame lines start with a tab. A space-indented line inside a record is
//!   also a frame unless it has a `<secs>[.<frac>]:` field, in which case it
//!   is treated as a header and counted as malformed if it does not parse.
//! - `[unknown]` symbols and modules are treated as absent.
//! - Lines starting with `#` (`perf script --header`) are skipped.
//!
//! A record that fails to parse is dropped and counted in
//! [`SampleParser::diagnostics`]; parsing resumes at the next header.
//!
//! # Example
//!
//! ```no_run
//! use perftrace::perf::SampleParser;
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! let input = BufReader::new(File::open("perf.txt").unwrap());
//! let mut parser = SampleParser::new(input);
//! for sample in parser.by_ref() {
//!     let sample = sample.unwrap();
//!     println!("{} {} frames", sample.timestamp, sample.frames.len());
//! }
//! println!("dropped: {}", parser.diagnostics().total_dropped());
//! ```

use crate::diagnostics::Diagnostics;
use std::io::{self, BufRead};
use std::mem;
use thiserror::Error;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Why a record was dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("malformed header at line {line}: {reason}")]
    MalformedHeader { line: usize, reason: &'static str },

    #[error("malformed frame at line {line}: {reason}")]
    MalformedFrame { line: usize, reason: &'static str },

    #[error("sample at line {line} has no frames")]
    EmptySample { line: usize },
}

/// One call-stack snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Command name as reported for this sample.
    pub command: String,
    pub pid: u32,
    pub tid: u32,
    pub cpu: Option<u32>,
    /// Capture timestamp in nanoseconds.
    pub timestamp: u64,
    pub period: Option<u64>,
    /// Sampling event, e.g. `cycles` or `cpu-clock`.
    pub event_name: Option<String>,
    /// Stack frames, leaf first.
    pub frames: Vec<Frame>,
}

/// One level of a sampled call stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    /// Instruction pointer.
    pub address: u64,
    pub symbol: Option<String>,
    /// Binary or shared library the address belongs to.
    pub module: Option<String>,
}

/// What makes two frames "the same" when diffing consecutive stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameIdentity<'a> {
    Symbol {
        symbol: &'a str,
        module: Option<&'a str>,
    },
    Address(u64),
}

impl Frame {
    /// `(symbol, module)` when the symbol is known, else the raw address.
    pub fn identity(&self) -> FrameIdentity<'_> {
        match &self.symbol {
            Some(symbol) => FrameIdentity::Symbol {
                symbol,
                module: self.module.as_deref(),
            },
            None => FrameIdentity::Address(self.address),
        }
    }

    /// Display name: the symbol, or the hex address when unresolved.
    pub fn label(&self) -> String {
        match &self.symbol {
            Some(symbol) => symbol.clone(),
            None => format!("0x{:x}", self.address),
        }
    }
}

/// Where the line-by-line state machine currently stands.
#[derive(Debug)]
enum ParserState {
    /// Between records.
    AwaitingHeader,
    /// Accumulating frames for a header that parsed.
    Collecting { sample: Sample, header_line: usize },
    /// Skipping the remaining lines of a rejected record.
    Discarding,
}

/// Streaming parser over `perf script` text.
///
/// Yields `Ok(Sample)` for every well-formed record and `Err` only for I/O
/// failures of the underlying reader, after which it is exhausted.
pub struct SampleParser<R> {
    reader: R,
    buf: Vec<u8>,
    line_num: usize,
    state: ParserState,
    diagnostics: Diagnostics,
    done: bool,
}

impl<R: BufRead> SampleParser<R> {
    /// Create a parser reading from the start of `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line_num: 0,
            state: ParserState::AwaitingHeader,
            diagnostics: Diagnostics::default(),
            done: false,
        }
    }

    /// Drop counters accumulated so far.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Number of lines consumed so far.
    pub fn line_number(&self) -> usize {
        self.line_num
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf)? == 0 {
            return Ok(None);
        }
        self.line_num += 1;

        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }
        // Symbol names are not guaranteed to be UTF-8.
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }

    /// Feed one line; returns a sample when this line completed one.
    fn handle_line(&mut self, line: &str) -> Option<Sample> {
        if line.trim().is_empty() {
            return self.finish_record();
        }

        if line.starts_with('#') {
            return None;
        }

        if line.starts_with('\t') {
            self.handle_frame_line(line);
            return None;
        }

        let header = parse_header(line);
        if line.starts_with(' ') && header.is_err() && !has_header_shape(line) {
            // perf pads the command column with spaces, so a space-indented
            // line is a header if it carries a `<secs>.<frac>:` field and a
            // frame otherwise.
            if !matches!(self.state, ParserState::AwaitingHeader) {
                self.handle_frame_line(line);
                return None;
            }
        }

        let finished = self.finish_record();
        match header {
            Ok(sample) => {
                self.state = ParserState::Collecting {
                    sample,
                    header_line: self.line_num,
                };
            }
            Err(reason) => {
                self.state = ParserState::Discarding;
                self.reject(RecordError::MalformedHeader {
                    line: self.line_num,
                    reason,
                });
            }
        }
        finished
    }

    fn handle_frame_line(&mut self, line: &str) {
        match self.state {
            ParserState::Collecting { .. } => {}
            ParserState::Discarding => return,
            ParserState::AwaitingHeader => {
                log::trace!("ignoring frame line {} outside any record", self.line_num);
                return;
            }
        }

        match parse_frame(line) {
            Ok(frame) => {
                if let ParserState::Collecting { sample, .. } = &mut self.state {
                    sample.frames.push(frame);
                }
            }
            Err(reason) => {
                self.state = ParserState::Discarding;
                self.reject(RecordError::MalformedFrame {
                    line: self.line_num,
                    reason,
                });
            }
        }
    }

    /// Close the record in progress, if any.
    fn finish_record(&mut self) -> Option<Sample> {
        match mem::replace(&mut self.state, ParserState::AwaitingHeader) {
            ParserState::Collecting {
                sample,
                header_line,
            } => {
                if sample.frames.is_empty() {
                    self.reject(RecordError::EmptySample { line: header_line });
                    None
                } else {
                    Some(sample)
                }
            }
            ParserState::AwaitingHeader | ParserState::Discarding => None,
        }
    }

    fn reject(&mut self, error: RecordError) {
        log::debug!("dropping record: {error}");
        match error {
            RecordError::MalformedHeader { .. } | RecordError::MalformedFrame { .. } => {
                self.diagnostics.malformed_records += 1;
            }
            RecordError::EmptySample { .. } => self.diagnostics.empty_samples += 1,
        }
    }
}

impl<R: BufRead> Iterator for SampleParser<R> {
    type Item = io::Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            match self.read_line() {
                Ok(Some(line)) => {
                    if let Some(sample) = self.handle_line(&line) {
                        return Some(Ok(sample));
                    }
                }
                Ok(None) => {
                    self.done = true;
                    return self.finish_record().map(Ok);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Parse a sample header line.
///
/// Examples:
///   `myapp  1234 [000] 12345.678901:     123456 cycles:`
///   `myapp  1234/5678 [000] 12345.678901234: cpu-clock:`
///   `Web Content 812/815 3.5:`
fn parse_header(line: &str) -> Result<Sample, &'static str> {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    // Command words may end in ':' themselves, so prefer the last token that
    // reads as a timestamp; the first ':' token is only a fallback for
    // reporting a broken one.
    let ts_index = timestamp_index(&tokens)
        .or_else(|| {
            tokens
                .iter()
                .enumerate()
                .skip(2)
                .find(|(_, token)| token.ends_with(':'))
                .map(|(i, _)| i)
        })
        .ok_or("no timestamp field")?;

    let before = &tokens[..ts_index];
    let (pid_index, cpu) = match before.last() {
        Some(last) if last.starts_with('[') => {
            let cpu = last
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or("invalid cpu")?;
            (ts_index - 2, Some(cpu))
        }
        _ => (ts_index - 1, None),
    };
    if pid_index == 0 {
        return Err("missing command");
    }

    let (pid, tid) = parse_pid_tid(before[pid_index])?;
    let command = before[..pid_index].join(" ");

    let timestamp = parse_timestamp(tokens[ts_index].trim_end_matches(':'))
        .ok_or("invalid timestamp")?;

    let after = &tokens[ts_index + 1..];
    let (period, event_name) = match after {
        [] => (None, None),
        [first, second, ..] if first.parse::<u64>().is_ok() => {
            (first.parse().ok(), Some(second.trim_end_matches(':').to_string()))
        }
        [first, ..] => (None, Some(first.trim_end_matches(':').to_string())),
    };

    Ok(Sample {
        command,
        pid,
        tid,
        cpu,
        timestamp,
        period,
        event_name: event_name.filter(|e| !e.is_empty()),
        frames: Vec::new(),
    })
}

/// Index of the last `<secs>[.<frac>]:` token. The command takes at least
/// one token and the pid one more.
fn timestamp_index(tokens: &[&str]) -> Option<usize> {
    tokens
        .iter()
        .enumerate()
        .skip(2)
        .rev()
        .find(|(_, token)| {
            token
                .strip_suffix(':')
                .is_some_and(|ts| parse_timestamp(ts).is_some())
        })
        .map(|(i, _)| i)
}

fn has_header_shape(line: &str) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    timestamp_index(&tokens).is_some()
}

fn parse_pid_tid(s: &str) -> Result<(u32, u32), &'static str> {
    if let Some((pid, tid)) = s.split_once('/') {
        let pid = pid.parse().map_err(|_| "invalid pid")?;
        let tid = tid.parse().map_err(|_| "invalid tid")?;
        Ok((pid, tid))
    } else {
        let pid = s.parse().map_err(|_| "invalid pid")?;
        Ok((pid, pid))
    }
}

/// `12345.678901` → nanoseconds, without going through floating point.
fn parse_timestamp(s: &str) -> Option<u64> {
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let secs: u64 = secs.parse().ok()?;
    let nanos: u64 = if frac.is_empty() {
        0
    } else {
        frac.parse::<u64>().ok()? * 10u64.pow(9 - frac.len() as u32)
    };
    secs.checked_mul(NANOS_PER_SEC)?.checked_add(nanos)
}

/// Parse a stack frame line.
///
/// Examples:
///   `\t 401234 main+0x54 (/usr/bin/myapp)`
///   `\t ffffffff81234567 native_write_msr+0x6 ([kernel.kallsyms])`
///   `\t 7f0a1b2c3d4e [unknown] ([unknown])`
///   `\t 401234 main`
fn parse_frame(line: &str) -> Result<Frame, &'static str> {
    let line = line.trim();

    // The module is the last parenthesized group; symbols may contain
    // parentheses of their own.
    let (body, module) = match line.rfind(" (") {
        Some(pos) if line.ends_with(')') => (&line[..pos], Some(&line[pos + 2..line.len() - 1])),
        _ => (line, None),
    };

    let body = body.trim();
    let (address, symbol) = match body.split_once(char::is_whitespace) {
        Some((address, rest)) => (address, rest.trim()),
        None => (body, ""),
    };
    if address.is_empty() {
        return Err("missing address");
    }
    let address = u64::from_str_radix(address.trim_start_matches("0x"), 16)
        .map_err(|_| "invalid address")?;

    Ok(Frame {
        address,
        symbol: known(strip_offset(symbol)),
        module: module.and_then(known),
    })
}

/// `main+0x54` → `main`. Only hex offsets are stripped, so `operator+`
/// survives.
fn strip_offset(symbol: &str) -> &str {
    match symbol.rfind("+0x") {
        Some(pos) if symbol[pos + 3..].bytes().all(|b| b.is_ascii_hexdigit()) => &symbol[..pos],
        _ => symbol,
    }
}

fn known(name: &str) -> Option<String> {
    match name.trim() {
        "" | "[unknown]" | "unknown" => None,
        name => Some(name.to_string()),
    }
}
