//! # Sparkie Gateway
//!
//! HTTP API over the scheduling engine: task lifecycle, the proactive
//! outreach poll, the worklog and an activity ping.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
