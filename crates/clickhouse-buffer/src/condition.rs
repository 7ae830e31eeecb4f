//! Load conditions.
//!
//! Decides whether staged segments should be promoted to a load. Pure:
//! the caller supplies the clock and the staged row count.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    /// Load once this many milliseconds have passed since the last load.
    /// Also the period of the buffer's background timer.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: Option<u64>,

    /// Load once this many rows are staged on disk.
    #[serde(default)]
    pub max_rows: Option<usize>,
}

fn default_max_age_ms() -> Option<u64> {
    Some(5000)
}

impl Default for Conditions {
    fn default() -> Self {
        Self {
            max_age_ms: default_max_age_ms(),
            max_rows: None,
        }
    }
}

impl Conditions {
    /// Conditions that never trigger; loads must be requested explicitly.
    pub fn manual() -> Self {
        Self {
            max_age_ms: None,
            max_rows: None,
        }
    }

    /// `true` if either configured threshold is reached.
    ///
    /// `now_ms` and `last_load_ms` are wall-clock milliseconds; a clock that
    /// went backwards counts as zero elapsed time.
    pub fn is_met(&self, now_ms: i64, last_load_ms: i64, staged_rows: usize) -> bool {
        let age_met = self.max_age_ms.is_some_and(|max_age| {
            let elapsed = now_ms.saturating_sub(last_load_ms).max(0) as u64;
            elapsed >= max_age
        });
        let rows_met = self.max_rows.is_some_and(|max_rows| staged_rows >= max_rows);
        age_met || rows_met
    }
}
