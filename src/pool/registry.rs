//! Keyed cache of resolvers.
//!
//! The registry hands out one resolver per pool key. Creating a resolver for
//! a key it has not seen before first sweeps the cache: every cached resolver
//! gets a chance to dispose its idle process, and those that did are dropped.
//! Isolated resolves mint a key nobody else will ever ask for.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::resolver::{Resolver, ResolverConfig, ResolverSnapshot};
use crate::domain::{error::DomainError, pool_key::PoolKey};
use crate::engine::EngineLauncher;
use crate::util::lock::{rw_read, rw_write};
use crate::util::wait::{TimeoutError, wait_for_predicate_default};

const SOURCE: &str = "pool::registry";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Give the caller a dedicated resolver that is never reused.
    pub isolated: bool,
}

impl ResolveOptions {
    pub fn isolated() -> Self {
        Self { isolated: true }
    }
}

pub struct ResolverRegistry {
    launcher: Arc<dyn EngineLauncher>,
    config: ResolverConfig,
    resolvers: RwLock<HashMap<PoolKey, Arc<Resolver>>>,
    creation: AsyncMutex<()>,
}

impl ResolverRegistry {
    pub fn new(launcher: Arc<dyn EngineLauncher>, config: ResolverConfig) -> Self {
        Self {
            launcher,
            config,
            resolvers: RwLock::new(HashMap::new()),
            creation: AsyncMutex::new(()),
        }
    }

    /// Return the resolver cached for `base`, or sweep and create one.
    pub async fn resolve(
        &self,
        base: &str,
        options: ResolveOptions,
    ) -> Result<Arc<Resolver>, DomainError> {
        let key = if options.isolated {
            PoolKey::isolated(base)?
        } else {
            PoolKey::shared(base)?
        };

        if let Some(existing) = self.cached(&key) {
            return Ok(existing);
        }

        // Sweep outside the creation lock: a slow disposal elsewhere must
        // not hold up resolves of unrelated keys.
        self.sweep().await;

        let _creating = self.creation.lock().await;
        if let Some(existing) = self.cached(&key) {
            return Ok(existing);
        }

        let resolver = Resolver::new(key.clone(), self.launcher.clone(), self.config.clone());
        rw_write(&self.resolvers, SOURCE, "resolve").insert(key.clone(), resolver.clone());
        info!(
            target = "pool::registry",
            op = "resolve",
            pool_key = %key,
            isolated = options.isolated,
            "Created resolver"
        );
        Ok(resolver)
    }

    /// Ask every cached resolver to dispose its idle process and drop the
    /// ones that did.
    ///
    /// Returns the number of entries removed.
    pub async fn sweep(&self) -> usize {
        let entries: Vec<(PoolKey, Arc<Resolver>)> = rw_read(&self.resolvers, SOURCE, "sweep")
            .iter()
            .map(|(key, resolver)| (key.clone(), resolver.clone()))
            .collect();

        let mut removed = 0;
        for (key, resolver) in entries {
            match resolver.dispose_if_idle().await {
                Ok(true) => {
                    let mut resolvers = rw_write(&self.resolvers, SOURCE, "sweep");
                    if resolvers
                        .get(&key)
                        .is_some_and(|cached| Arc::ptr_eq(cached, &resolver))
                    {
                        resolvers.remove(&key);
                        removed += 1;
                    }
                }
                Ok(false) => {
                    debug!(
                        target = "pool::registry",
                        op = "sweep",
                        pool_key = %key,
                        "Resolver still busy; keeping it cached"
                    );
                }
                Err(err) => {
                    warn!(
                        target = "pool::registry",
                        op = "sweep",
                        pool_key = %key,
                        error = %err,
                        "Failed to dispose idle resolver"
                    );
                }
            }
        }
        removed
    }

    /// Wait until no cached resolver has a page open.
    ///
    /// Page counters drop when the engine reports a page gone, which can lag
    /// behind the close call that caused it.
    pub async fn wait_until_idle(&self) -> Result<(), TimeoutError> {
        wait_for_predicate_default(|| {
            self.snapshot().iter().all(|snapshot| {
                snapshot
                    .state
                    .as_ref()
                    .is_none_or(|state| state.active_page_count <= 0)
            })
        })
        .await
    }

    /// State of every cached resolver, ordered by key.
    pub fn snapshot(&self) -> Vec<ResolverSnapshot> {
        let resolvers: Vec<Arc<Resolver>> = rw_read(&self.resolvers, SOURCE, "snapshot")
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<ResolverSnapshot> =
            resolvers.iter().map(|resolver| resolver.snapshot()).collect();
        snapshots.sort_by(|left, right| left.key.as_str().cmp(right.key.as_str()));
        snapshots
    }

    pub fn len(&self) -> usize {
        rw_read(&self.resolvers, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, key: &PoolKey) -> Option<Arc<Resolver>> {
        rw_read(&self.resolvers, SOURCE, "cached").get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::pool::ResolverPhase;
    use crate::util::wait::wait_for_predicate;

    fn registry_with(engine: &MemoryEngine) -> ResolverRegistry {
        ResolverRegistry::new(Arc::new(engine.clone()), ResolverConfig::default())
    }

    #[tokio::test]
    async fn existing_key_is_returned_unchanged() {
        let engine = MemoryEngine::new();
        let registry = registry_with(&engine);

        let first = registry
            .resolve("default", ResolveOptions::default())
            .await
            .expect("resolver");
        let second = registry
            .resolve(" default ", ResolveOptions::default())
            .await
            .expect("resolver");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn isolated_resolves_never_share_a_resolver() {
        let engine = MemoryEngine::new();
        let registry = registry_with(&engine);

        let first = registry
            .resolve("default", ResolveOptions::isolated())
            .await
            .expect("resolver");
        let second = registry
            .resolve("default", ResolveOptions::isolated())
            .await
            .expect("resolver");
        let third = registry
            .resolve("default", ResolveOptions::isolated())
            .await
            .expect("resolver");

        assert_ne!(first.key(), second.key());
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&second, &third));
        assert!(first.key().is_isolated());
        assert!(first.key().as_str().starts_with("default-isolated-"));
    }

    #[tokio::test]
    async fn creating_a_new_key_sweeps_idle_resolvers() {
        let engine = MemoryEngine::new();
        let registry = registry_with(&engine);

        let idle = registry
            .resolve("idle", ResolveOptions::default())
            .await
            .expect("resolver");
        idle.new_page()
            .await
            .expect("page")
            .close()
            .await
            .expect("close");

        let busy = registry
            .resolve("busy", ResolveOptions::default())
            .await
            .expect("resolver");
        let open = busy.new_page().await.expect("page");
        assert_eq!(registry.len(), 1, "idle resolver swept while creating busy");

        registry
            .resolve("third", ResolveOptions::default())
            .await
            .expect("resolver");

        let keys: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|snapshot| snapshot.key.to_string())
            .collect();
        assert_eq!(keys, vec!["busy".to_string(), "third".to_string()]);
        assert!(engine.processes()[0].is_closed());
        assert_eq!(busy.snapshot().phase, ResolverPhase::EndOfLife);

        open.close().await.expect("close");
        let process = engine.processes()[1].clone();
        wait_for_predicate(|| process.is_closed(), Duration::from_secs(1))
            .await
            .expect("busy process disposed after its page closed");
    }

    #[tokio::test]
    async fn sweep_keeps_initializing_resolvers() {
        let engine = MemoryEngine::new().with_launch_delay(Duration::from_millis(200));
        let registry = registry_with(&engine);

        let launching = registry
            .resolve("launching", ResolveOptions::default())
            .await
            .expect("resolver");
        let pending = {
            let launching = launching.clone();
            tokio::spawn(async move { launching.new_page().await })
        };
        wait_for_predicate(
            || launching.snapshot().phase == ResolverPhase::Initializing,
            Duration::from_secs(1),
        )
        .await
        .expect("initializing");

        assert_eq!(registry.sweep().await, 0);
        assert_eq!(registry.len(), 1);

        let page = pending.await.expect("join").expect("page");
        page.close().await.expect("close");
        assert_eq!(registry.sweep().await, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn slow_disposal_does_not_hold_up_unrelated_resolves() {
        let engine = MemoryEngine::new().with_close_delay(Duration::from_millis(800));
        let registry = Arc::new(registry_with(&engine));

        let idle = registry
            .resolve("a", ResolveOptions::default())
            .await
            .expect("resolver");
        idle.new_page()
            .await
            .expect("page")
            .close()
            .await
            .expect("close");

        let sweeping = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve("b", ResolveOptions::default()).await })
        };
        let closing = engine.processes()[0].clone();
        wait_for_predicate(|| closing.is_closed(), Duration::from_secs(1))
            .await
            .expect("process for a is closing");

        let started = std::time::Instant::now();
        registry
            .resolve("c", ResolveOptions::default())
            .await
            .expect("resolver");
        assert!(
            started.elapsed() < Duration::from_millis(400),
            "resolve of c waited {:?} on the disposal of a",
            started.elapsed()
        );

        sweeping.await.expect("join").expect("resolver");
        let keys: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|snapshot| snapshot.key.to_string())
            .collect();
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn scenario_busy_default_resolver_retires_after_last_page() {
        let engine = MemoryEngine::new();
        let registry = registry_with(&engine);
        let resolver = registry
            .resolve("default", ResolveOptions::default())
            .await
            .expect("resolver");

        let first = resolver.new_page().await.expect("page");
        let second = resolver.new_page().await.expect("page");
        let third = resolver.new_page().await.expect("page");
        first.close().await.expect("close");
        second.close().await.expect("close");
        assert_eq!(resolver.state().expect("state").active_page_count, 1);

        assert!(!resolver.dispose_if_idle().await.expect("idle check"));
        assert!(resolver.state().expect("state").end_of_life);

        third.close().await.expect("close");
        let process = engine.last_process().expect("process");
        wait_for_predicate(|| process.is_closed(), Duration::from_secs(1))
            .await
            .expect("disposed without further calls");
    }

    #[tokio::test]
    async fn waiting_for_idle_lets_the_sweep_dispose_late_closed_pages() {
        let engine = MemoryEngine::new();
        let registry = registry_with(&engine);
        let resolver = registry
            .resolve("default", ResolveOptions::default())
            .await
            .expect("resolver");
        let page = resolver.new_page().await.expect("page");

        let closing = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            page.close().await
        });

        registry.wait_until_idle().await.expect("idle");
        assert_eq!(registry.sweep().await, 1);
        assert!(engine.processes()[0].is_closed());
        closing.await.expect("join").expect("close");
    }

    #[tokio::test]
    async fn invalid_base_key_is_rejected() {
        let registry = registry_with(&MemoryEngine::new());
        let err = registry
            .resolve("  ", ResolveOptions::default())
            .await
            .err()
            .expect("empty key rejected");
        assert!(err.to_string().contains("must not be empty"));
        assert!(registry.is_empty());
    }
}
