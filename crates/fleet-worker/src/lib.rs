pub mod base;
pub mod telemetry;
pub mod worker;

// Supervisor: launches, monitors and restarts the worker pool
pub mod supervisor;

pub use base::error::{Error, Result};
