#![forbid(unsafe_code)]

//! Compaction trigger: a standard 5-field cron expression evaluated against
//! wall time. The `cron` crate wants a seconds column, so the 5-field form
//! is promoted by prefixing `0`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tidepool_core::{Error, Result};

/// Parsed compaction schedule.
#[derive(Debug, Clone)]
pub struct CompactionSchedule {
    schedule: Schedule,
}

impl CompactionSchedule {
    /// Parse a 5-field cron expression (minute hour day-of-month month
    /// day-of-week).
    pub fn parse(expr: &str) -> Result<Self> {
        if expr.split_whitespace().count() != 5 {
            return Err(Error::config(format!(
                "cron expression must have 5 fields: {expr:?}"
            )));
        }
        let schedule = Schedule::from_str(&format!("0 {expr}"))
            .map_err(|e| Error::config(format!("cron expression {expr:?}: {e}")))?;
        Ok(Self { schedule })
    }

    /// Next fire time strictly after `after`, or `None` when the expression
    /// never fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}
