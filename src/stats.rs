//! Per-context telemetry counters.
//!
//! Counters are recorded, not logged; callers snapshot them after a run.

use serde::{Deserialize, Serialize};

/// Counters accumulated over the life of one context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub entries_read: u64,
    pub entries_written: u64,
    pub body_bytes_read: u64,
    pub body_bytes_written: u64,
    pub warnings: u64,
    pub entries_extracted: u64,
    pub entries_skipped: u64,
    /// Requested capabilities this build cannot honor (inert extract flags).
    pub unsupported_flags: u64,
}

impl ArchiveStats {
    /// Fold another snapshot into this one.
    pub fn merge(&mut self, other: &ArchiveStats) {
        self.entries_read += other.entries_read;
        self.entries_written += other.entries_written;
        self.body_bytes_read += other.body_bytes_read;
        self.body_bytes_written += other.body_bytes_written;
        self.warnings += other.warnings;
        self.entries_extracted += other.entries_extracted;
        self.entries_skipped += other.entries_skipped;
        self.unsupported_flags += other.unsupported_flags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates() {
        let mut a = ArchiveStats {
            entries_read: 2,
            warnings: 1,
            ..Default::default()
        };
        let b = ArchiveStats {
            entries_read: 3,
            body_bytes_read: 100,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.entries_read, 5);
        assert_eq!(a.body_bytes_read, 100);
        assert_eq!(a.warnings, 1);
    }
}
