//! Workdeck — a durable card queue for cooperating worker agents.
//!
//! Agents claim cards from a shared store exactly once, execute them (shell
//! commands, generated recipes, or a git change lifecycle), and report
//! outcomes through a fixed state machine. Each agent keeps a local cache
//! that buffers its observations and reconciles with the shared store.

pub mod agent;
pub mod cards;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod store;
