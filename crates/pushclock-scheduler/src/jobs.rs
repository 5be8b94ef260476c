//! Durable job registrations: one row per scheduled task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pushclock_core::error::Result;

use crate::cron;

/// How a job decides its fire instants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire once at an absolute instant.
    Date { run_at: DateTime<Utc> },
    /// Fire on every cron occurrence.
    Cron { expression: String },
}

impl Trigger {
    /// Instant after `now` at which the job should fire again, or `None`
    /// when the job is exhausted. Missed occurrences collapse into one.
    pub fn following(&self, now: DateTime<Utc>, tz: chrono_tz::Tz) -> Result<Option<DateTime<Utc>>> {
        match self {
            Self::Date { .. } => Ok(None),
            Self::Cron { expression } => cron::next_fire_in(expression, now, tz).map(Some),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Date { .. } => "date",
            Self::Cron { .. } => "cron",
        }
    }

    pub fn data(&self) -> String {
        match self {
            Self::Date { run_at } => run_at.to_rfc3339(),
            Self::Cron { expression } => expression.clone(),
        }
    }
}

/// A registered job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// `task_{id}` or `recurring_task_{id}`.
    pub id: String,
    pub task_id: i64,
    pub trigger: Trigger,
    pub next_run_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_date_trigger_is_exhausted_after_firing() {
        let trigger = Trigger::Date { run_at: Utc::now() };
        assert_eq!(trigger.following(Utc::now(), chrono_tz::UTC).unwrap(), None);
    }

    #[test]
    fn test_cron_trigger_skips_missed_occurrences() {
        let trigger = Trigger::Cron { expression: "0 * * * *".into() };
        // Several hourly slots were missed; only the next one from now counts
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 20, 0).unwrap();
        let next = trigger.following(now, chrono_tz::UTC).unwrap();
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap()));
    }
}
