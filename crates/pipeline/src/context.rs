use std::sync::Arc;

use audionorm_core::supervisor::ProcessSupervisor;
use audionorm_db::DbPool;

use crate::cancellation::CancellationRegistry;
use crate::config::PipelineConfig;
use crate::pool::PoolCapacity;

/// Shared handles injected into the executors, the sweeper and the gateway.
///
/// Cloning is cheap; every field is a pool handle or an `Arc`.
#[derive(Clone)]
pub struct PipelineContext {
    pub db: DbPool,
    pub supervisor: Arc<ProcessSupervisor>,
    pub config: Arc<PipelineConfig>,
    pub registry: Arc<CancellationRegistry>,
    pub capacity: Arc<PoolCapacity>,
}

impl PipelineContext {
    pub fn new(db: DbPool, supervisor: ProcessSupervisor, config: PipelineConfig) -> Self {
        let capacity = Arc::new(PoolCapacity::new(config.max_workers));
        Self {
            db,
            supervisor: Arc::new(supervisor),
            config: Arc::new(config),
            registry: Arc::new(CancellationRegistry::new()),
            capacity,
        }
    }
}
