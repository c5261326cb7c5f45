//! # Taskloom
//!
//! Taskloom is a distributed task-orchestration core: it decomposes coarse
//! work items into DAGs of atomic tasks, assigns them to a pool of
//! heterogeneous worker agents over pluggable transports, tracks execution
//! through pollable jobs, and pushes progress to clients.
//!
//! ## Architecture
//!
//! - **Storage engine**: durable per-entity JSON files with cache, events,
//!   and transactions
//! - **Security gateway**: path validation, resource locks, sanitation,
//!   audit trail, authN/Z
//! - **Transports**: HTTP, WebSocket, SSE push, and a stdio tool-call loop
//!   behind one lifecycle
//! - **Jobs & notifications**: rate-limited polling handles plus a
//!   session-keyed push bus
//! - **Decomposition engine**: atomicity analysis, dependency inference, and
//!   execution planning
//! - **Orchestrator**: capability-aware agent selection, delivery, execution
//!   tracking, balancing
//!
//! The whole system is assembled once in [`world::Loom`] and torn down on a
//! shared stop signal.

/// Agent registry, queues, and heartbeat sweeper
pub mod agents;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Decomposition and dependency engine
pub mod decomposition;
/// Error types and handling
pub mod error;
/// Job registry and poll rate limiting
pub mod jobs;
/// Opaque completion-service client
pub mod llm;
/// Core data models
pub mod models;
/// System monitoring and metrics
pub mod monitoring;
/// Session-keyed push notifications
pub mod notifications;
/// Agent orchestration and execution tracking
pub mod orchestrator;
/// HTTP surface rate limiting
pub mod rate_limit;
/// Agent response processing
pub mod response;
/// Security gatekeeper
pub mod security;
/// Unified storage engine
pub mod storage;
/// Transport lifecycle and endpoints
pub mod transport;
/// System assembly and lifecycle
pub mod world;

#[cfg(test)]
mod tests;

pub use error::{ErrorKind, LoomError, Result};
