//! Domain model module declarations.

pub mod agent;
pub mod container;
pub mod execution;
pub mod heartbeat;
