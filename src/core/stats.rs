//! Dump statistics
//!
//! Purely diagnostic. Nothing in the dump or load path reads these back.

use crate::core::error::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Counters for one root recording pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassStats {
    /// Objects walked for the first time in this pass
    pub walked: usize,
    /// Objects copied into a region in this pass
    pub archived: usize,
    /// Dependent types the owner's record already held when the pass began
    pub old_recorded_types: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpStats {
    pub roots_checked: usize,
    pub disqualified_roots: usize,
    pub recordings: usize,
    pub aborted_recordings: usize,
    pub walked: usize,
    pub archived: usize,
    /// Dependent types already on record when their owner was recorded again
    pub old_recorded_types: usize,
    pub recorded_types: usize,
    pub verifications: usize,
    pub closed_bytes: usize,
    pub open_bytes: usize,
    pub closed_relocations: usize,
    pub open_relocations: usize,
    pub table_entries: usize,
    pub table_bytes: usize,
}

impl DumpStats {
    pub fn add_pass(&mut self, pass: &PassStats) {
        self.recordings += 1;
        self.walked += pass.walked;
        self.archived += pass.archived;
        self.old_recorded_types += pass.old_recorded_types;
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn log_summary(&self) {
        info!(
            "Archived {} objects ({} walked) from {} recordings, {} aborted, {} roots disqualified",
            self.archived, self.walked, self.recordings, self.aborted_recordings, self.disqualified_roots
        );
        info!(
            "Regions: closed {} bytes ({} relocations), open {} bytes ({} relocations); table {} entries, {} bytes",
            self.closed_bytes,
            self.closed_relocations,
            self.open_bytes,
            self.open_relocations,
            self.table_entries,
            self.table_bytes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_pass_and_json() {
        let mut stats = DumpStats::default();
        stats.add_pass(&PassStats {
            walked: 4,
            archived: 3,
            old_recorded_types: 0,
        });
        stats.add_pass(&PassStats {
            walked: 2,
            archived: 0,
            old_recorded_types: 1,
        });
        stats.add_pass(&PassStats {
            walked: 1,
            archived: 1,
            old_recorded_types: 2,
        });

        assert_eq!(stats.recordings, 3);
        assert_eq!(stats.walked, 7);
        assert_eq!(stats.archived, 4);
        assert_eq!(stats.old_recorded_types, 3);

        let json = stats.to_json().unwrap();
        let parsed: DumpStats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, stats);
        assert!(json.contains("\"archived\": 4"));
        assert!(json.contains("\"old_recorded_types\": 3"));
    }
}
