//! Domain types shared by ingestion, scheduling and delivery.

pub mod chunk;
pub mod insight;
pub mod progress;
pub mod schedule;

pub use chunk::{Chunk, SubjectChunkSet};
pub use insight::{InsightRecord, merge_insights};
pub use progress::ProgressState;
pub use schedule::{ProcessingMode, ScheduleMetadata, ScheduleStatus, ScheduleType, TimeOfDay};
