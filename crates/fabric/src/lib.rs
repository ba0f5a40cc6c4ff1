//! The worker fabric.
//!
//! A fabric manages a population of workers of one declared role: staggered
//! spawn, round-robin request dispatch with task-id correlation, crash
//! detection with automatic restart, and graceful shutdown. The
//! [ThreadManager] owns one fabric per role and builds direct links between
//! workers of different roles.

mod error;
mod fabric;
mod manager;
mod worker;

pub use error::FabricError;
pub use fabric::{FabricEvent, FabricOptions, WorkerFabric};
pub use manager::ThreadManager;
pub use worker::{ReplyHandle, Worker, WorkerBuilder, WorkerChannel, WorkerConnection, WorkerState};
