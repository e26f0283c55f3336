//! Timer definitions and due-date computation.

use crate::{expression::ExpressionEvaluator, CoreError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a timer event computes its due date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerDefinition {
    /// ISO-8601 duration relative to the moment the timer is scheduled, e.g. `PT10M`
    Duration(String),
    /// Absolute RFC-3339 instant
    Date(String),
    /// Repeating ISO-8601 interval, e.g. `R3/PT10M`
    Cycle(String),
}

/// Result of scheduling a timer definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSchedule {
    /// When the timer first fires
    pub due_date: DateTime<Utc>,
    /// Repeat expression for cycle timers
    pub repeat: Option<String>,
}

impl TimerDefinition {
    /// Compute the due date as if the timer were created at `now`
    pub fn schedule(
        &self,
        now: DateTime<Utc>,
        evaluator: &dyn ExpressionEvaluator,
        variables: &Value,
    ) -> Result<TimerSchedule, CoreError> {
        match self {
            TimerDefinition::Duration(expr) => {
                let text = evaluator.evaluate_to_string(expr, variables)?;
                Ok(TimerSchedule {
                    due_date: add_duration(now, &text)?,
                    repeat: None,
                })
            }
            TimerDefinition::Date(expr) => {
                let text = evaluator.evaluate_to_string(expr, variables)?;
                let due_date = DateTime::parse_from_rfc3339(text.trim())
                    .map_err(|e| CoreError::TimerError(format!("Invalid timer date '{}': {}", text, e)))?
                    .with_timezone(&Utc);
                Ok(TimerSchedule {
                    due_date,
                    repeat: None,
                })
            }
            TimerDefinition::Cycle(expr) => {
                let text = evaluator.evaluate_to_string(expr, variables)?;
                let interval = cycle_interval(&text)?;
                Ok(TimerSchedule {
                    due_date: add_duration(now, interval)?,
                    repeat: Some(text),
                })
            }
        }
    }
}

fn add_duration(now: DateTime<Utc>, text: &str) -> Result<DateTime<Utc>, CoreError> {
    now.checked_add_signed(parse_iso_duration(text)?)
        .ok_or_else(|| CoreError::TimerError(format!("Timer due date out of range: now + '{}'", text)))
}

/// The duration segment of a repeating interval: `R<n>/<duration>`,
/// `R<n>/<duration>/<end>` or `R<n>/<start>/<duration>`
fn cycle_interval(text: &str) -> Result<&str, CoreError> {
    let invalid = || {
        CoreError::TimerError(format!(
            "Invalid timer cycle '{}': expected R<n>/<duration>",
            text
        ))
    };
    let (count, rest) = text
        .trim()
        .strip_prefix('R')
        .and_then(|r| r.split_once('/'))
        .ok_or_else(invalid)?;
    if !count.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() > 2 {
        return Err(invalid());
    }
    segments
        .into_iter()
        .find(|segment| segment.starts_with('P'))
        .ok_or_else(invalid)
}

/// Parse an ISO-8601 duration (`PnDTnHnMnS`, `PnW`) into a chrono duration.
///
/// Years and months are not supported since they have no fixed length.
pub fn parse_iso_duration(text: &str) -> Result<Duration, CoreError> {
    let invalid = || CoreError::TimerError(format!("Invalid ISO-8601 duration: '{}'", text));
    let out_of_range = || CoreError::TimerError(format!("ISO-8601 duration out of range: '{}'", text));

    let body = text.trim().strip_prefix('P').ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::zero();
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_component = false;

    for c in body.chars() {
        match c {
            'T' if !in_time && number.is_empty() => in_time = true,
            '0'..='9' | '.' => number.push(c),
            unit => {
                let value: f64 = number.parse().map_err(|_| invalid())?;
                number.clear();
                let seconds = match (in_time, unit) {
                    (false, 'W') => value * 7.0 * 86_400.0,
                    (false, 'D') => value * 86_400.0,
                    (true, 'H') => value * 3_600.0,
                    (true, 'M') => value * 60.0,
                    (true, 'S') => value,
                    _ => return Err(invalid()),
                };
                let millis = (seconds * 1000.0).round();
                if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
                    return Err(out_of_range());
                }
                total = Duration::try_milliseconds(millis as i64)
                    .and_then(|component| total.checked_add(&component))
                    .ok_or_else(out_of_range)?;
                saw_component = true;
            }
        }
    }

    if !number.is_empty() || !saw_component {
        return Err(invalid());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::JmesPathExpressionEvaluator;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_durations() {
        assert_eq!(parse_iso_duration("PT10M").unwrap(), Duration::minutes(10));
        assert_eq!(parse_iso_duration("PT1H30M").unwrap(), Duration::minutes(90));
        assert_eq!(parse_iso_duration("P2D").unwrap(), Duration::days(2));
        assert_eq!(parse_iso_duration("P1DT1S").unwrap(), Duration::seconds(86_401));
        assert_eq!(parse_iso_duration("P1W").unwrap(), Duration::days(7));
        assert_eq!(parse_iso_duration("PT0.5S").unwrap(), Duration::milliseconds(500));
    }

    #[test]
    fn test_parse_invalid_durations() {
        for text in ["", "P", "PT", "10M", "P1M", "PT5", "PTXM", "P1Y"] {
            assert!(parse_iso_duration(text).is_err(), "{} should be invalid", text);
        }
    }

    #[test]
    fn test_schedule_duration_and_cycle() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let evaluator = JmesPathExpressionEvaluator::new();

        let schedule = TimerDefinition::Duration("PT10M".to_string())
            .schedule(now, &evaluator, &json!({}))
            .unwrap();
        assert_eq!(schedule.due_date, now + Duration::minutes(10));
        assert_eq!(schedule.repeat, None);

        let schedule = TimerDefinition::Cycle("R3/PT1H".to_string())
            .schedule(now, &evaluator, &json!({}))
            .unwrap();
        assert_eq!(schedule.due_date, now + Duration::hours(1));
        assert_eq!(schedule.repeat.as_deref(), Some("R3/PT1H"));
    }

    #[test]
    fn test_huge_durations_are_errors() {
        assert!(parse_iso_duration("P99999999999999999999D").is_err());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let evaluator = JmesPathExpressionEvaluator::new();
        let err = TimerDefinition::Duration("${d}".to_string())
            .schedule(now, &evaluator, &json!({"d": "P100000000D"}))
            .unwrap_err();
        assert!(matches!(err, CoreError::TimerError(_)), "{:?}", err);
    }

    #[test]
    fn test_cycle_forms() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let evaluator = JmesPathExpressionEvaluator::new();
        for cycle in [
            "R/PT1H",
            "R5/PT1H/2024-12-31T00:00:00Z",
            "R5/2024-03-01T00:00:00Z/PT1H",
        ] {
            let schedule = TimerDefinition::Cycle(cycle.to_string())
                .schedule(now, &evaluator, &json!({}))
                .unwrap();
            assert_eq!(schedule.due_date, now + Duration::hours(1), "{}", cycle);
            assert_eq!(schedule.repeat.as_deref(), Some(cycle));
        }
        for cycle in ["PT1H", "Rx/PT1H", "R3/2024-03-01T00:00:00Z"] {
            assert!(
                TimerDefinition::Cycle(cycle.to_string())
                    .schedule(now, &evaluator, &json!({}))
                    .is_err(),
                "{} should be invalid",
                cycle
            );
        }
    }

    #[test]
    fn test_schedule_date_from_expression() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let evaluator = JmesPathExpressionEvaluator::new();
        let schedule = TimerDefinition::Date("${deadline}".to_string())
            .schedule(now, &evaluator, &json!({"deadline": "2024-04-01T00:00:00Z"}))
            .unwrap();
        assert_eq!(
            schedule.due_date,
            Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
        );
    }
}
