use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("engine launch failed: {0}")]
    Launch(#[source] EngineError),
    #[error("engine launch was abandoned before completing")]
    LaunchAbandoned,
    #[error(transparent)]
    Engine(#[from] EngineError),
}
