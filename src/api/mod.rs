//! Agent-facing HTTP API.

pub mod handler;
pub mod http;
