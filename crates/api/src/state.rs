use std::sync::Arc;

use audionorm_pipeline::gateway::JobGateway;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; the gateway holds only pool handles and `Arc`s.
#[derive(Clone)]
pub struct AppState {
    /// Job submission, inspection and cancellation.
    pub gateway: JobGateway,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}
