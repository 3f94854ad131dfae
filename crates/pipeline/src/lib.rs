//! Job execution pipeline.
//!
//! Wires the job store and the process supervisor together: a fixed pool of
//! executors leases pending jobs, a sweeper reclaims abandoned leases, and
//! [`gateway::JobGateway`] is the surface the HTTP layer talks to.

pub mod cancellation;
pub mod config;
pub mod context;
pub mod executor;
pub mod gateway;
pub mod pool;
pub mod sweeper;

pub use config::PipelineConfig;
pub use context::PipelineContext;
