//! Turn sampled call stacks into a span timeline.
//!
//! This crate reads the text printed by Linux `perf script` and writes a
//! Chrome Trace Event Format timeline of nested spans, one track per thread,
//! viewable in Perfetto or `chrome://tracing`.
//!
//! # Stages
//!
//! - [`perf`] - Parse `perf script` records into samples
//! - [`registry`] - Assign stable ids and names to threads
//! - [`reconstruct`] - Diff consecutive stacks into span open/close events
//! - [`merge`] - Order events from all threads by timestamp
//! - [`emit`] - Write events as Chrome trace JSON
//! - [`pipeline`] - Run all of the above in one streaming pass
//!
//! # Example
//!
//! ```no_run
//! use perftrace::{Converter, ConverterConfig};
//! use std::io::{self, BufWriter};
//!
//! let config = ConverterConfig {
//!     idle_gap_ns: Some(100_000_000),
//!     ..Default::default()
//! };
//! let summary = Converter::new(config)
//!     .convert(io::stdin().lock(), BufWriter::new(io::stdout().lock()))
//!     .unwrap();
//! eprintln!("{} spans", summary.spans);
//! ```

pub mod diagnostics;
pub mod emit;
pub mod error;
pub mod merge;
pub mod perf;
pub mod pipeline;
pub mod reconstruct;
pub mod registry;

pub use diagnostics::Diagnostics;
pub use error::{ConvertError, Result};
pub use pipeline::{Converter, ConverterConfig, Summary};

// Re-export trace_event for convenience
pub use trace_event;
