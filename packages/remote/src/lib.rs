// ABOUTME: Registered-agent side of Hatchery for compute hosts the server cannot call into
// ABOUTME: Polls the server for work, runs it on the local container daemon and reports back

pub mod client;
pub mod config;
pub mod error;
pub mod stats;
pub mod worker;

pub use client::{AgentClient, HeartbeatAck, TaskPatch};
pub use config::{WorkerConfig, FORWARDED_SECRETS};
pub use error::{ClientError, Result};
pub use stats::HostStats;
pub use worker::Worker;
