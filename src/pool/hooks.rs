use std::sync::{Arc, Weak};

use metrics::counter;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::error::PoolError;
use super::resolver::Resolver;
use super::state::ProcessState;
use crate::domain::pool_key::PoolKey;
use crate::engine::{EngineError, EngineProcess, ProcessHooks};

/// A launched process together with the counters bound to it.
#[derive(Clone)]
pub(crate) struct LiveProcess {
    pub(crate) generation: u64,
    pub(crate) handle: Arc<dyn EngineProcess>,
    pub(crate) state: Arc<ProcessState>,
}

impl LiveProcess {
    /// Terminate the process once; later calls are no-ops.
    pub(crate) async fn terminate(&self, key: &PoolKey) -> Result<(), EngineError> {
        if !self.state.begin_dispose() {
            return Ok(());
        }
        counter!("renderpool_engine_dispose_total").increment(1);
        debug!(
            target = "pool::resolver",
            op = "terminate",
            pool_key = %key,
            generation = self.generation,
            created_pages = self.state.snapshot().created_page_count,
            "Disposing engine process"
        );
        self.handle.close().await
    }
}

/// Hooks attached to one launched process.
///
/// They capture the process snapshot taken at launch, never the resolver's
/// current state.
pub(crate) struct LifecycleHooks {
    key: PoolKey,
    resolver: Weak<Resolver>,
    process: LiveProcess,
}

impl LifecycleHooks {
    pub(crate) fn new(key: PoolKey, resolver: Weak<Resolver>, process: LiveProcess) -> Self {
        Self {
            key,
            resolver,
            process,
        }
    }

    fn dispose_in_background(&self, resolver: Option<Arc<Resolver>>) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(
                target = "pool::resolver",
                pool_key = %self.key,
                generation = self.process.generation,
                "No async runtime available to dispose drained engine process"
            );
            return;
        };

        let key = self.key.clone();
        let process = self.process.clone();
        runtime.spawn(async move {
            let result = match resolver {
                Some(resolver) => resolver.dispose_process_inner(&process).await,
                None => process.terminate(&key).await.map_err(PoolError::from),
            };
            if let Err(err) = result {
                warn!(
                    target = "pool::resolver",
                    op = "page_destroyed",
                    pool_key = %key,
                    generation = process.generation,
                    error = %err,
                    "Failed to dispose drained engine process"
                );
            }
        });
    }
}

impl ProcessHooks for LifecycleHooks {
    fn disconnected(&self) {
        if !self.process.state.is_end_of_life() {
            warn!(
                target = "pool::resolver",
                pool_key = %self.key,
                generation = self.process.generation,
                "Lost connection to engine process"
            );
        }
    }

    fn page_created(&self) {
        self.process.state.page_opened();
    }

    fn page_destroyed(&self) {
        let remaining = self.process.state.page_closed();
        let resolver = self.resolver.upgrade();

        let superseded = resolver
            .as_ref()
            .is_none_or(|resolver| !resolver.is_current(self.process.generation));
        if superseded {
            self.process.state.mark_end_of_life();
        }

        if remaining <= 0 && self.process.state.is_end_of_life() {
            self.dispose_in_background(resolver);
        }
    }
}
