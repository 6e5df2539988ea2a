//! Persistence: the shared card queue and the per-agent local cache.

pub mod local;
pub mod migrations;
pub mod shared;

pub use local::{ExperienceLogEntry, LocalCache};
pub use shared::{ActivePlan, AgentRecord, AgentStatus, JobStore, SharedExperience};
