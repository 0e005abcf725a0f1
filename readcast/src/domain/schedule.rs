use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Recurrence of a subject's deliveries.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ScheduleType {
    None,
    Daily,
    TwiceDaily,
    EveryNHours,
    EveryTwoDays,
    Weekly,
    Monthly,
}

/// Lifecycle of a schedule. Never moves backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Completed,
}

/// What an ingestion request asks for.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessingMode {
    ImmediateOnly,
    ScheduleOnly,
    #[default]
    ImmediateAndSchedule,
}

impl ProcessingMode {
    pub fn includes_immediate(&self) -> bool {
        matches!(self, Self::ImmediateOnly | Self::ImmediateAndSchedule)
    }

    pub fn includes_schedule(&self) -> bool {
        matches!(self, Self::ScheduleOnly | Self::ImmediateAndSchedule)
    }
}

/// 24-hour wall-clock time, serialized as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub const DEFAULT: TimeOfDay = TimeOfDay { hour: 9, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }
}

impl Default for TimeOfDay {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for TimeOfDay {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::invalid_schedule(format!("invalid schedule_time {s:?}, expected HH:MM"));

        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(invalid());
        }
        let hour: u8 = hour.parse().map_err(|_| invalid())?;
        let minute: u8 = minute.parse().map_err(|_| invalid())?;

        Self::new(hour, minute).ok_or_else(|| {
            Error::invalid_schedule(format!(
                "invalid schedule_time {s:?}: hour must be 0-23, minute must be 0-59"
            ))
        })
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Persisted description of a subject's recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleMetadata {
    pub subject_id: String,
    pub job_name: String,
    pub schedule_type: ScheduleType,
    pub schedule_time: TimeOfDay,
    pub timezone: String,
    #[serde(default)]
    pub hours_interval: Option<u32>,
    /// Six-field cron expression evaluated in `timezone`.
    pub cron_expression: String,
    pub chunks_per_delivery: usize,
    /// First chunk the recurring job delivers.
    pub start_index: usize,
    pub total_chunks: usize,
    pub remaining_chunks: usize,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScheduleMetadata {
    pub fn is_active(&self) -> bool {
        self.status == ScheduleStatus::Active
    }

    /// Flip to completed. Returns `false` if it already was.
    pub fn complete(&mut self, at: DateTime<Utc>) -> bool {
        if self.status == ScheduleStatus::Completed {
            return false;
        }
        self.status = ScheduleStatus::Completed;
        self.completed_at = Some(at);
        true
    }
}
