//! Recurring delivery scheduling.

pub mod maintenance;
pub mod manager;
pub mod registry;
pub mod trigger;
pub mod validator;

pub use maintenance::{MaintenanceConfig, MaintenanceScheduler, SweepReport};
pub use manager::{
    CleanupReport, ExecutionOutcome, PeriodicDeliveryManager, ScheduleInfo, SetupOutcome, job_name,
};
pub use registry::{
    CronRegistry, Firing, FiringArgs, ManualRegistry, RegisteredJob, SchedulerRegistry,
};
pub use trigger::TriggerSpec;
pub use validator::{
    NormalizedSchedule, ScheduleRequest, ScheduleValidator, ValidatedSchedule, ValidationWarning,
    validate,
};
