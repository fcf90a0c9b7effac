//! synthgrid-core — shared types and configuration for the synthgrid
//! inference scheduler.
//!
//! - [`types`]: request identity, generation parameters, lifecycle states,
//!   the error taxonomy, and terminal outcomes
//! - [`config`]: the `synthgrid.toml` model, duration parsing, and startup
//!   validation

pub mod config;
pub mod types;

pub use config::{ConfigError, SchedulerConfig};
pub use types::*;
