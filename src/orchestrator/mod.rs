//! Agent lifecycle orchestration.
//!
//! Covers liveness tracking, the heartbeat protocol, work assignment,
//! provisioning, graceful shutdown, finalization and the crash watchdog.

pub mod finalizer;
pub mod heartbeat;
pub mod liveness;
pub mod provisioning;
pub mod shutdown;
pub mod watchdog;
pub mod work_assignment;
