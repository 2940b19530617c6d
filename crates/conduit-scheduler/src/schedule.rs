use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use crate::error::{Result, SchedulerError};
use crate::types::Trigger;

/// Compute the next UTC execution time for `trigger`, strictly after `from`.
///
/// Returns `None` when the trigger is exhausted (a `Once` trigger whose
/// instant has already passed).
pub fn next_run_time(trigger: &Trigger, from: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        Trigger::Once { at } => Ok(if *at > from { Some(*at) } else { None }),

        Trigger::Interval {
            minutes,
            hours,
            days,
            start_time,
        } => {
            let total_secs = minutes.unwrap_or(0) as i64 * 60
                + hours.unwrap_or(0) as i64 * 3600
                + days.unwrap_or(0) as i64 * 86400;
            if total_secs <= 0 {
                return Err(SchedulerError::InvalidTrigger(
                    "interval trigger must specify at least one of minutes/hours/days".into(),
                ));
            }
            let interval = Duration::seconds(total_secs);

            if let Some(start) = start_time {
                if from < *start {
                    return Ok(Some(*start));
                }
            }

            // Never fire "right now" — align to the next integer multiple of
            // the interval strictly past `from`, anchored at `start_time` (or
            // the epoch if none is set) to avoid startup stampedes.
            let anchor = start_time.unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap());
            let elapsed = (from - anchor).num_seconds().max(0);
            let periods_elapsed = elapsed / total_secs + 1;
            Ok(Some(anchor + interval * periods_elapsed as i32))
        }

        Trigger::Cron { expression } => {
            let cron_expr = to_seconds_prefixed(expression)?;
            let schedule = CronSchedule::from_str(&cron_expr)
                .map_err(|e| SchedulerError::InvalidTrigger(format!("bad cron expression: {e}")))?;
            Ok(schedule.after(&from).next())
        }
    }
}

/// The `cron` crate parses 6/7-field expressions with a leading seconds
/// field; the wire format here is the conventional 5-field `m h dom mon dow`,
/// so a `"0 "` seconds prefix is added before parsing.
fn to_seconds_prefixed(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(SchedulerError::InvalidTrigger(format!(
            "cron expression must have exactly 5 fields (m h dom mon dow), got {}: {expression}",
            fields.len()
        )));
    }
    Ok(format!("0 {expression}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_trigger_fires_when_future() {
        let at = Utc::now() + Duration::hours(1);
        let trigger = Trigger::Once { at };
        let next = next_run_time(&trigger, Utc::now()).unwrap();
        assert_eq!(next, Some(at));
    }

    #[test]
    fn once_trigger_exhausted_when_past() {
        let at = Utc::now() - Duration::hours(1);
        let trigger = Trigger::Once { at };
        let next = next_run_time(&trigger, Utc::now()).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn interval_trigger_never_returns_now() {
        let trigger = Trigger::Interval {
            minutes: Some(10),
            hours: None,
            days: None,
            start_time: None,
        };
        let now = Utc::now();
        let next = next_run_time(&trigger, now).unwrap().unwrap();
        assert!(next > now);
    }

    #[test]
    fn interval_trigger_respects_future_start_time() {
        let start = Utc::now() + Duration::hours(2);
        let trigger = Trigger::Interval {
            minutes: Some(30),
            hours: None,
            days: None,
            start_time: Some(start),
        };
        let next = next_run_time(&trigger, Utc::now()).unwrap();
        assert_eq!(next, Some(start));
    }

    #[test]
    fn cron_rejects_wrong_field_count() {
        let trigger = Trigger::Cron {
            expression: "* * *".into(),
        };
        assert!(next_run_time(&trigger, Utc::now()).is_err());
    }

    #[test]
    fn cron_every_minute_fires_within_a_minute() {
        let trigger = Trigger::Cron {
            expression: "* * * * *".into(),
        };
        let now = Utc::now();
        let next = next_run_time(&trigger, now).unwrap().unwrap();
        assert!(next > now);
        assert!(next - now <= Duration::minutes(1) + Duration::seconds(1));
    }
}
