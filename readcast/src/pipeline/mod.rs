//! Background delivery work.
//!
//! [`TaskQueue`] runs tasks with bounded concurrency and retry policies.
//! [`DeliveryPipeline`] turns a slice of chunks into insights and queues the
//! notifications that deliver them.

pub mod delivery;
pub mod task_queue;

pub use delivery::{BatchReport, DeliveryConfig, DeliveryDispatcher, DeliveryPipeline};
pub use task_queue::{
    QueueStats, RetryPolicy, TaskHandle, TaskQueue, TaskQueueConfig, TaskSnapshot, TaskStatus,
};
