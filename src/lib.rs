//! Orchestrates parallel coding agents over a backlog of epics and issues.
//!
//! [`orchestrator::Orchestrator`] turns an epic into tasks, leases typed
//! workers from an [`pool::AgentPool`], runs each task in its own checkout
//! and passes the result through the quality checkpoint and the protocol
//! gate.

pub mod backlog;
pub mod checkout;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod patterns;
pub mod pool;
pub mod protocol;
pub mod quality;
pub mod util;
pub mod workers;
