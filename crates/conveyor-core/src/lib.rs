//! Conveyor Core
//!
//! Core domain types, ports, and error handling for the Conveyor scheduler.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler and the server binary.

pub mod error;
pub mod events;
pub mod ids;
pub mod pipeline;
pub mod ports;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
