//! Recurring trigger specifications.
//!
//! Every schedule type maps onto a six-field cron expression
//! (`sec min hour day-of-month month day-of-week`) evaluated in the
//! subject's timezone:
//!
//! | type             | expression                 |
//! |------------------|----------------------------|
//! | `daily`          | `0 M H * * *`              |
//! | `twice_daily`    | `0 M H,H+12 * * *`         |
//! | `every_n_hours`  | `0 M */N * * *`            |
//! | `every_two_days` | `0 M H */2 * *`            |
//! | `weekly`         | `0 M H * * <anchor dow>`   |
//! | `monthly`        | `0 M H <anchor dom> * *`   |
//!
//! Weekly and monthly schedules are anchored on the day the schedule was
//! created; the monthly day is capped at 28 so it fires in every month.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::domain::{ScheduleType, TimeOfDay};
use crate::{Error, Result};

/// Latest day of month that exists in every month.
const MAX_MONTHLY_DAY: u32 = 28;

/// A parsed cron expression bound to a timezone.
#[derive(Clone)]
pub struct TriggerSpec {
    expression: String,
    timezone: Tz,
    schedule: cron::Schedule,
}

impl fmt::Debug for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerSpec")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone)
            .finish()
    }
}

impl PartialEq for TriggerSpec {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.timezone == other.timezone
    }
}

impl TriggerSpec {
    pub fn parse(expression: &str, timezone: Tz) -> Result<Self> {
        let schedule = cron::Schedule::from_str(expression).map_err(|e| {
            Error::invalid_schedule(format!("invalid cron expression {expression:?}: {e}"))
        })?;
        Ok(Self {
            expression: expression.to_string(),
            timezone,
            schedule,
        })
    }

    /// Build the trigger for a schedule created at `anchor`.
    pub fn for_schedule(
        schedule_type: ScheduleType,
        time: TimeOfDay,
        hours_interval: Option<u32>,
        timezone: Tz,
        anchor: DateTime<Utc>,
    ) -> Result<Self> {
        let expression = cron_expression(schedule_type, time, hours_interval, timezone, anchor)?;
        Self::parse(&expression, timezone)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .take(count)
            .map(|at| at.with_timezone(&Utc))
            .collect()
    }
}

fn cron_expression(
    schedule_type: ScheduleType,
    time: TimeOfDay,
    hours_interval: Option<u32>,
    timezone: Tz,
    anchor: DateTime<Utc>,
) -> Result<String> {
    let (hour, minute) = (u32::from(time.hour()), u32::from(time.minute()));
    let local_anchor = anchor.with_timezone(&timezone);

    let expression = match schedule_type {
        ScheduleType::None => {
            return Err(Error::invalid_schedule(
                "schedule_type none has no recurring trigger",
            ));
        }
        ScheduleType::Daily => format!("0 {minute} {hour} * * *"),
        ScheduleType::TwiceDaily => {
            let mut hours = [hour, (hour + 12) % 24];
            hours.sort_unstable();
            format!("0 {minute} {},{} * * *", hours[0], hours[1])
        }
        ScheduleType::EveryNHours => {
            let interval = hours_interval
                .filter(|n| (1..=24).contains(n))
                .ok_or_else(|| {
                    Error::invalid_schedule("every_n_hours requires an interval between 1 and 24")
                })?;
            format!("0 {minute} */{interval} * * *")
        }
        ScheduleType::EveryTwoDays => format!("0 {minute} {hour} */2 * *"),
        ScheduleType::Weekly => {
            format!(
                "0 {minute} {hour} * * {}",
                weekday_name(local_anchor.weekday())
            )
        }
        ScheduleType::Monthly => {
            let day = local_anchor.day().min(MAX_MONTHLY_DAY);
            format!("0 {minute} {hour} {day} * *")
        }
    };
    Ok(expression)
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn anchor() -> DateTime<Utc> {
        // A Wednesday.
        Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap()
    }

    fn spec(schedule_type: ScheduleType, hh: u8, mm: u8, interval: Option<u32>) -> TriggerSpec {
        TriggerSpec::for_schedule(
            schedule_type,
            TimeOfDay::new(hh, mm).unwrap(),
            interval,
            chrono_tz::UTC,
            anchor(),
        )
        .unwrap()
    }

    #[test]
    fn test_expressions() {
        assert_eq!(spec(ScheduleType::Daily, 9, 0, None).expression(), "0 0 9 * * *");
        assert_eq!(
            spec(ScheduleType::TwiceDaily, 15, 30, None).expression(),
            "0 30 3,15 * * *"
        );
        assert_eq!(
            spec(ScheduleType::EveryNHours, 9, 15, Some(6)).expression(),
            "0 15 */6 * * *"
        );
        assert_eq!(
            spec(ScheduleType::EveryTwoDays, 8, 0, None).expression(),
            "0 0 8 */2 * *"
        );
        assert_eq!(spec(ScheduleType::Weekly, 8, 0, None).expression(), "0 0 8 * * Wed");
        assert_eq!(spec(ScheduleType::Monthly, 8, 0, None).expression(), "0 0 8 28 * *");
    }

    #[test]
    fn test_none_and_missing_interval_rejected() {
        let time = TimeOfDay::DEFAULT;
        assert!(
            TriggerSpec::for_schedule(ScheduleType::None, time, None, chrono_tz::UTC, anchor())
                .is_err()
        );
        assert!(
            TriggerSpec::for_schedule(
                ScheduleType::EveryNHours,
                time,
                None,
                chrono_tz::UTC,
                anchor()
            )
            .is_err()
        );
    }

    #[test]
    fn test_daily_next_fire() {
        let trigger = spec(ScheduleType::Daily, 9, 0, None);
        let next = trigger.next_after(anchor()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_respects_timezone() {
        let trigger = TriggerSpec::for_schedule(
            ScheduleType::Daily,
            TimeOfDay::new(9, 0).unwrap(),
            None,
            chrono_tz::Asia::Kolkata,
            anchor(),
        )
        .unwrap();

        // 09:00 IST is 03:30 UTC.
        let next = trigger.next_after(anchor()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 1, 3, 30, 0).unwrap());
    }

    #[test]
    fn test_every_n_hours_upcoming() {
        let trigger = spec(ScheduleType::EveryNHours, 0, 5, Some(8));
        let hours: Vec<u32> = trigger
            .upcoming(anchor(), 3)
            .iter()
            .map(|t| t.hour())
            .collect();
        assert_eq!(hours, vec![16, 0, 8]);
    }

    #[test]
    fn test_weekly_fires_on_anchor_weekday() {
        let trigger = spec(ScheduleType::Weekly, 10, 0, None);
        for at in trigger.upcoming(anchor(), 3) {
            assert_eq!(at.weekday(), Weekday::Wed);
        }
    }

    #[test]
    fn test_invalid_expression() {
        assert!(TriggerSpec::parse("not a cron", chrono_tz::UTC).is_err());
    }
}
