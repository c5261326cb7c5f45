//! Agent registry, per-agent task queues, and the heartbeat sweeper.

pub mod heartbeat;
pub mod queue;
pub mod registry;

pub use heartbeat::HeartbeatSweeper;
pub use queue::TaskQueues;
pub use registry::AgentRegistry;
