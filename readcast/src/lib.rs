//! readcast library crate.
//!
//! Splits long texts into chunks, generates an explanation for each chunk
//! under a rate-limited quota and delivers chunk plus explanation to a
//! recipient, either immediately or on a recurring schedule.

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod notification;
pub mod pipeline;
pub mod scheduler;
pub mod services;
pub mod store;

pub use error::{Error, Result};
