use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Granularity at which (index, time) pairs are witnessed.
pub const TIME_TABLE_GRANULARITY: Duration = Duration::from_secs(5 * 60);

/// How long witnessed pairs are retained.
pub const TIME_TABLE_LIMIT: Duration = Duration::from_secs(72 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTableEntry {
    pub index: u64,
    pub time: DateTime<Utc>,
}

/// Coarse mapping between Raft indexes and wall-clock time, used to answer
/// "what index was current at time T" for garbage collection.
#[derive(Debug, Clone)]
pub struct TimeTable {
    granularity: Duration,
    limit: Duration,
    /// Newest first.
    entries: VecDeque<TimeTableEntry>,
}

impl TimeTable {
    pub fn new(granularity: Duration, limit: Duration) -> Self {
        Self {
            granularity,
            limit,
            entries: VecDeque::new(),
        }
    }

    /// Record that `index` was applied at `when`.
    pub fn witness(&mut self, index: u64, when: DateTime<Utc>) {
        if let Some(newest) = self.entries.front() {
            let since = when.signed_duration_since(newest.time);
            if since.to_std().map(|d| d < self.granularity).unwrap_or(true) {
                return;
            }
        }
        self.entries.push_front(TimeTableEntry { index, time: when });

        let cutoff = when - chrono::Duration::seconds(self.limit.as_secs() as i64);
        while self.entries.back().map(|e| e.time < cutoff).unwrap_or(false) {
            self.entries.pop_back();
        }
    }

    /// Highest witnessed index at or before `when`; 0 if none.
    pub fn nearest_index(&self, when: DateTime<Utc>) -> u64 {
        self.entries
            .iter()
            .find(|e| e.time <= when)
            .map(|e| e.index)
            .unwrap_or(0)
    }

    /// Time of the newest witnessed index at or below `index`.
    pub fn nearest_time(&self, index: u64) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|e| e.index <= index)
            .map(|e| e.time)
    }

    pub fn entries(&self) -> Vec<TimeTableEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn load(&mut self, entries: Vec<TimeTableEntry>) {
        self.entries = entries.into();
    }
}

impl Default for TimeTable {
    fn default() -> Self {
        Self::new(TIME_TABLE_GRANULARITY, TIME_TABLE_LIMIT)
    }
}
