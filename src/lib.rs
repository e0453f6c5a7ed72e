#![forbid(unsafe_code)]

//! Agent lifecycle and heartbeat orchestrator.
//!
//! Launches containerized test agents for an execution, hands out work
//! through a heartbeat protocol, detects crashed or silent agents and
//! tears everything down once the work is exhausted.

pub mod api;
pub mod backend;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod runner;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
