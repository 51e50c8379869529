//! Drop counters reported to the caller at the end of a run.

use serde::Serialize;

/// Counts of records that were dropped instead of converted.
///
/// None of these abort a run; they are returned alongside the output so the
/// caller can decide how loudly to complain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Records whose header or frame lines failed to parse.
    pub malformed_records: u64,
    /// Headers that were followed by no frames.
    pub empty_samples: u64,
    /// Samples stamped earlier than their thread's previous sample.
    pub out_of_order_samples: u64,
}

impl Diagnostics {
    pub fn total_dropped(&self) -> u64 {
        self.malformed_records + self.empty_samples + self.out_of_order_samples
    }

    pub fn is_clean(&self) -> bool {
        self.total_dropped() == 0
    }
}
