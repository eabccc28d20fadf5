// ABOUTME: Core domain types, store contract and shared helpers for Hatchery
// ABOUTME: Every other crate in the workspace builds on these definitions

pub mod constants;
pub mod error;
pub mod store;
pub mod types;
pub mod utils;

pub use error::{CoreError, StoreError, StoreResult};
pub use store::{MemoryStore, Store};
pub use types::{
    ComputeTarget, HealthStatus, InspectOutcome, InspectRequest, InspectStatus, ResourceLimits,
    Sandbox, SandboxStatus, SshAuth, TargetConnection, TargetKind, Task, TaskStatus,
};
