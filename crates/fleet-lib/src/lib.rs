//! Fleet library for distributed load testing
//!
//! This crate provides the core functionality for:
//! - Provisioning load agents on elastic compute or a fixed machine pool
//! - Remote sessions and prerequisite verification
//! - The load-agent lifecycle and bounded waits
//! - Fleet orchestration, execution cycles and account purges
//! - Persistence collaborators and observability

pub mod account_cleanup;
pub mod aws_cli;
pub mod clusterable;
pub mod compute;
pub mod elastic;
pub mod error;
pub mod fixed_pool;
pub mod image;
pub mod launcher;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod session;
pub mod settings;
pub mod store;
pub mod verifier;
pub mod wait;

#[cfg(test)]
mod test_support;

pub use clusterable::{Clusterable, FleetContext, StopOptions};
pub use error::{FleetError, Result};
pub use lifecycle::{AgentState, LoadAgent};
pub use models::*;
pub use observability::{FleetMetrics, StructuredLogger};
pub use orchestrator::{ClusterStatus, FleetOrchestrator};
pub use settings::FleetSettings;
