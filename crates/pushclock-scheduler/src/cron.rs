//! Trigger Calculator: cron expression → next fire instant.
//!
//! Accepts 5 fields (`MIN HOUR DOM MON DOW`) and 6 fields
//! (`SEC MIN HOUR DOM MON DOW`). Day-of-week uses 0 or 7 for Sunday and
//! accepts names (`MON`..`SUN`). Parsing and matching are delegated to
//! `croner`; this module only normalizes input and maps errors.
//!
//! Example: `"0 9 * * *"` fires every day at 09:00,
//! `"30 0 9 * * *"` at 09:00:30.

use chrono::{DateTime, TimeZone, Utc};
use croner::Cron;

use pushclock_core::error::{PushclockError, Result};

/// Parse an expression into a reusable schedule.
pub fn parse(expression: &str) -> Result<Cron> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(PushclockError::InvalidExpression(format!(
            "'{expression}' has {} fields, expected 5 (MIN HOUR DOM MON DOW) or 6 (SEC MIN HOUR DOM MON DOW)",
            fields.len()
        )));
    }
    let normalized = fields.join(" ");
    Cron::new(&normalized)
        .with_seconds_optional()
        .parse()
        .map_err(|e| PushclockError::InvalidExpression(format!("'{expression}': {e}")))
}

/// Next fire instant strictly after `after`, evaluated in `after`'s zone.
pub fn next_fire<Tz: TimeZone>(expression: &str, after: &DateTime<Tz>) -> Result<DateTime<Tz>> {
    let cron = parse(expression)?;
    cron.find_next_occurrence(after, false)
        .map_err(|e| PushclockError::InvalidExpression(format!("'{expression}' never fires: {e}")))
}

/// Next fire instant after a UTC reference, with wall-clock fields read in `tz`.
pub fn next_fire_in(expression: &str, after: DateTime<Utc>, tz: chrono_tz::Tz) -> Result<DateTime<Utc>> {
    next_fire(expression, &after.with_timezone(&tz)).map(|t| t.with_timezone(&Utc))
}

/// Reject expressions that cannot be parsed or never fire.
pub fn validate(expression: &str, tz: chrono_tz::Tz) -> Result<()> {
    next_fire_in(expression, Utc::now(), tz).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_daily_rolls_to_next_day() {
        let next = next_fire("0 9 * * *", &at(2024, 1, 1, 10, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 2, 9, 0, 0));
    }

    #[test]
    fn test_six_fields_include_seconds() {
        let next = next_fire("30 0 9 * * *", &at(2024, 1, 1, 8, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 1, 9, 0, 30));
        assert_eq!(next.second(), 30);
    }

    #[test]
    fn test_strictly_after_reference() {
        let reference = at(2024, 1, 1, 9, 0, 0);
        let next = next_fire("0 9 * * *", &reference).unwrap();
        assert_eq!(next, at(2024, 1, 2, 9, 0, 0));
    }

    #[test]
    fn test_every_15_minutes() {
        let next = next_fire("*/15 * * * *", &at(2026, 2, 22, 10, 2, 0)).unwrap();
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn test_sunday_is_zero() {
        // 2024-01-01 is a Monday
        let next = next_fire("0 8 * * 0", &at(2024, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 7, 8, 0, 0));
        let named = next_fire("0 8 * * SUN", &at(2024, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(named, next);
    }

    #[test]
    fn test_monotonic_sequence() {
        let mut reference = at(2024, 1, 1, 0, 0, 0);
        for _ in 0..50 {
            let next = next_fire("*/7 * * * * *", &reference).unwrap();
            assert!(next > reference);
            reference = next;
        }
    }

    #[test]
    fn test_evaluated_in_zone() {
        // 09:00 in Shanghai is 01:00 UTC
        let next = next_fire_in("0 9 * * *", at(2024, 1, 1, 2, 0, 0), chrono_tz::Asia::Shanghai).unwrap();
        assert_eq!(next, at(2024, 1, 2, 1, 0, 0));
    }

    #[test]
    fn test_invalid_expressions() {
        let reference = at(2024, 1, 1, 0, 0, 0);
        for bad in ["bad", "", "* * *", "61 * * * *", "0 0 9 * * * *", "0 25 * * *"] {
            assert!(
                matches!(next_fire(bad, &reference), Err(PushclockError::InvalidExpression(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_impossible_date_never_fires() {
        let reference = at(2024, 1, 1, 0, 0, 0);
        assert!(matches!(
            next_fire("0 0 30 2 *", &reference),
            Err(PushclockError::InvalidExpression(_))
        ));
        assert!(validate("0 0 30 2 *", chrono_tz::UTC).is_err());
        assert!(validate("0 9 * * MON-FRI", chrono_tz::UTC).is_ok());
    }
}
