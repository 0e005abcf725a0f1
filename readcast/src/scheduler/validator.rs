//! Normalization and rejection of periodic-delivery requests.
//!
//! Validation is pure: it reads a [`ScheduleRequest`] and returns a new
//! [`ValidatedSchedule`], signalling recoverable problems as
//! [`ValidationWarning`]s and everything else as
//! [`Error::InvalidSchedule`](crate::Error::InvalidSchedule).

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{ScheduleType, TimeOfDay};
use crate::{Error, Result};

pub const MIN_HOURS_INTERVAL: i64 = 1;
pub const MAX_HOURS_INTERVAL: i64 = 24;
pub const MIN_CHUNKS_PER_DELIVERY: i64 = 1;
pub const MAX_CHUNKS_PER_DELIVERY: i64 = 10;
pub const DEFAULT_CHUNKS_PER_DELIVERY: usize = 2;

/// Raw scheduling input as received from a caller.
///
/// Numeric fields are signed so out-of-range input can be reported rather
/// than failing to deserialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub subject_id: String,
    pub total_chunks: i64,
    /// Defaults to `daily` when absent.
    #[serde(default)]
    pub schedule_type: Option<String>,
    #[serde(default)]
    pub schedule_time: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub hours_interval: Option<i64>,
    #[serde(default)]
    pub chunks_per_delivery: Option<i64>,
    #[serde(default)]
    pub immediate_chunks_count: Option<i64>,
}

/// A recoverable problem that was corrected during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationWarning {
    TimezoneReplaced { given: String, fallback: String },
    ChunksPerDeliveryReset { given: i64, replaced_with: usize },
    ImmediateCountClamped { given: i64, clamped_to: usize },
}

/// A recurring schedule that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSchedule {
    pub subject_id: String,
    pub total_chunks: usize,
    pub schedule_type: ScheduleType,
    pub schedule_time: TimeOfDay,
    pub timezone: Tz,
    pub hours_interval: Option<u32>,
    pub chunks_per_delivery: usize,
    pub immediate_chunks_count: usize,
    pub warnings: Vec<ValidationWarning>,
}

impl NormalizedSchedule {
    /// Chunks left for the recurring job after the immediate batch.
    pub fn remaining_chunks(&self) -> usize {
        self.total_chunks.saturating_sub(self.immediate_chunks_count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedSchedule {
    /// `schedule_type = none`: returned as given, nothing else was checked.
    Unscheduled(ScheduleRequest),
    Recurring(NormalizedSchedule),
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleValidator {
    default_timezone: Tz,
}

impl Default for ScheduleValidator {
    fn default() -> Self {
        Self::new(chrono_tz::UTC)
    }
}

impl ScheduleValidator {
    pub fn new(default_timezone: Tz) -> Self {
        Self { default_timezone }
    }

    pub fn default_timezone(&self) -> Tz {
        self.default_timezone
    }

    pub fn validate(&self, request: &ScheduleRequest) -> Result<ValidatedSchedule> {
        if request.subject_id.trim().is_empty() {
            return Err(Error::invalid_schedule("subject_id is required"));
        }

        let total_chunks = usize::try_from(request.total_chunks)
            .ok()
            .filter(|total| *total > 0)
            .ok_or_else(|| Error::invalid_schedule("total_chunks must be a positive integer"))?;

        let schedule_type = match request.schedule_type.as_deref() {
            None => ScheduleType::Daily,
            Some(raw) => raw.parse::<ScheduleType>().map_err(|_| {
                Error::invalid_schedule(format!("invalid schedule_type: {raw}"))
            })?,
        };

        if schedule_type == ScheduleType::None {
            return Ok(ValidatedSchedule::Unscheduled(request.clone()));
        }

        let mut warnings = Vec::new();

        let timezone = match request.timezone.as_deref() {
            None => self.default_timezone,
            Some(raw) => match raw.parse::<Tz>() {
                Ok(tz) => tz,
                Err(_) => {
                    warn!(
                        subject_id = %request.subject_id,
                        timezone = raw,
                        fallback = %self.default_timezone,
                        "Unrecognized timezone, using fallback"
                    );
                    warnings.push(ValidationWarning::TimezoneReplaced {
                        given: raw.to_string(),
                        fallback: self.default_timezone.name().to_string(),
                    });
                    self.default_timezone
                }
            },
        };

        let schedule_time = match request.schedule_time.as_deref() {
            Some(raw) if !raw.trim().is_empty() => raw.parse::<TimeOfDay>()?,
            _ => TimeOfDay::DEFAULT,
        };

        let hours_interval = if schedule_type == ScheduleType::EveryNHours {
            let interval = request.hours_interval.ok_or_else(|| {
                Error::invalid_schedule("hours_interval is required for every_n_hours schedules")
            })?;
            if !(MIN_HOURS_INTERVAL..=MAX_HOURS_INTERVAL).contains(&interval) {
                return Err(Error::invalid_schedule(format!(
                    "hours_interval must be between {MIN_HOURS_INTERVAL} and {MAX_HOURS_INTERVAL}, got {interval}"
                )));
            }
            Some(interval as u32)
        } else {
            None
        };

        let chunks_per_delivery = match request.chunks_per_delivery {
            None => DEFAULT_CHUNKS_PER_DELIVERY,
            Some(n) if (MIN_CHUNKS_PER_DELIVERY..=MAX_CHUNKS_PER_DELIVERY).contains(&n) => {
                n as usize
            }
            Some(n) => {
                warn!(
                    subject_id = %request.subject_id,
                    chunks_per_delivery = n,
                    "chunks_per_delivery out of range, using default"
                );
                warnings.push(ValidationWarning::ChunksPerDeliveryReset {
                    given: n,
                    replaced_with: DEFAULT_CHUNKS_PER_DELIVERY,
                });
                DEFAULT_CHUNKS_PER_DELIVERY
            }
        };

        let immediate_chunks_count = match request.immediate_chunks_count {
            None => 0,
            Some(n) => {
                let clamped = n.clamp(0, total_chunks as i64) as usize;
                if clamped as i64 != n {
                    warnings.push(ValidationWarning::ImmediateCountClamped {
                        given: n,
                        clamped_to: clamped,
                    });
                }
                clamped
            }
        };

        Ok(ValidatedSchedule::Recurring(NormalizedSchedule {
            subject_id: request.subject_id.clone(),
            total_chunks,
            schedule_type,
            schedule_time,
            timezone,
            hours_interval,
            chunks_per_delivery,
            immediate_chunks_count,
            warnings,
        }))
    }
}

/// Validate with a UTC fallback timezone.
pub fn validate(request: &ScheduleRequest) -> Result<ValidatedSchedule> {
    ScheduleValidator::default().validate(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ScheduleRequest {
        ScheduleRequest {
            subject_id: "reader-1".into(),
            total_chunks: 5,
            schedule_type: Some("daily".into()),
            schedule_time: Some("07:30".into()),
            timezone: Some("Europe/Berlin".into()),
            hours_interval: None,
            chunks_per_delivery: Some(3),
            immediate_chunks_count: Some(1),
        }
    }

    fn recurring(result: Result<ValidatedSchedule>) -> NormalizedSchedule {
        match result.unwrap() {
            ValidatedSchedule::Recurring(schedule) => schedule,
            other => panic!("expected recurring schedule, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_request_is_normalized() {
        let schedule = recurring(validate(&request()));
        assert_eq!(schedule.schedule_type, ScheduleType::Daily);
        assert_eq!(schedule.schedule_time, TimeOfDay::new(7, 30).unwrap());
        assert_eq!(schedule.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(schedule.chunks_per_delivery, 3);
        assert_eq!(schedule.immediate_chunks_count, 1);
        assert_eq!(schedule.remaining_chunks(), 4);
        assert!(schedule.warnings.is_empty());
    }

    #[test]
    fn test_missing_subject_or_chunks_fails() {
        let mut req = request();
        req.subject_id = "  ".into();
        assert!(validate(&req).unwrap_err().is_validation());

        for total in [0, -3] {
            let mut req = request();
            req.total_chunks = total;
            assert!(matches!(validate(&req), Err(Error::InvalidSchedule(_))));
        }
    }

    #[test]
    fn test_unknown_schedule_type_fails() {
        let mut req = request();
        req.schedule_type = Some("fortnightly".into());
        assert!(matches!(validate(&req), Err(Error::InvalidSchedule(_))));
    }

    #[test]
    fn test_none_short_circuits() {
        let mut req = request();
        req.schedule_type = Some("none".into());
        req.schedule_time = Some("99:99".into());
        req.chunks_per_delivery = Some(50);
        req.timezone = Some("Mars/Olympus".into());

        assert_eq!(validate(&req).unwrap(), ValidatedSchedule::Unscheduled(req));
    }

    #[test]
    fn test_bad_timezone_falls_back_with_warning() {
        let mut req = request();
        req.timezone = Some("Mars/Olympus".into());

        let schedule = recurring(validate(&req));
        assert_eq!(schedule.timezone, chrono_tz::UTC);
        assert_eq!(
            schedule.warnings,
            vec![ValidationWarning::TimezoneReplaced {
                given: "Mars/Olympus".into(),
                fallback: "UTC".into(),
            }]
        );

        let schedule =
            recurring(ScheduleValidator::new(chrono_tz::Asia::Kolkata).validate(&req));
        assert_eq!(schedule.timezone, chrono_tz::Asia::Kolkata);
    }

    #[test]
    fn test_bad_time_fails() {
        let mut req = request();
        req.schedule_time = Some("25:00".into());
        assert!(matches!(validate(&req), Err(Error::InvalidSchedule(_))));
    }

    #[test]
    fn test_missing_time_defaults_to_nine() {
        let mut req = request();
        req.schedule_time = None;
        assert_eq!(recurring(validate(&req)).schedule_time, TimeOfDay::DEFAULT);
    }

    #[test]
    fn test_every_n_hours_requires_interval() {
        let mut req = request();
        req.schedule_type = Some("every_n_hours".into());
        assert!(matches!(validate(&req), Err(Error::InvalidSchedule(_))));

        for bad in [0, 25, -1] {
            req.hours_interval = Some(bad);
            assert!(validate(&req).is_err(), "interval {bad} should fail");
        }

        for good in [1, 6, 24] {
            req.hours_interval = Some(good);
            assert_eq!(recurring(validate(&req)).hours_interval, Some(good as u32));
        }
    }

    #[test]
    fn test_chunks_per_delivery_reset_to_default() {
        for bad in [0, 11, -4] {
            let mut req = request();
            req.chunks_per_delivery = Some(bad);
            let schedule = recurring(validate(&req));
            assert_eq!(schedule.chunks_per_delivery, 2);
            assert_eq!(schedule.warnings.len(), 1);
        }
    }

    #[test]
    fn test_immediate_count_is_clamped() {
        let mut req = request();
        req.immediate_chunks_count = Some(9);
        assert_eq!(recurring(validate(&req)).immediate_chunks_count, 5);

        req.immediate_chunks_count = Some(-2);
        assert_eq!(recurring(validate(&req)).immediate_chunks_count, 0);

        req.immediate_chunks_count = None;
        assert_eq!(recurring(validate(&req)).immediate_chunks_count, 0);
    }

    #[test]
    fn test_input_is_not_modified() {
        let mut req = request();
        req.chunks_per_delivery = Some(40);
        let before = req.clone();
        let _ = validate(&req).unwrap();
        assert_eq!(req, before);
    }
}
