use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::domain::{network::NetworkEvent, pool_key::PoolKey, viewport::Viewport};
use crate::engine::{EngineError, EnginePage};

/// A page handed out by a resolver.
///
/// The caller owns the page and must [`Page::close`] it. A page dropped while
/// still open is closed in the background and logged as a leak.
pub struct Page {
    inner: Arc<dyn EnginePage>,
    pool_key: PoolKey,
    generation: u64,
}

impl Page {
    pub(crate) fn new(inner: Arc<dyn EnginePage>, pool_key: PoolKey, generation: u64) -> Self {
        Self {
            inner,
            pool_key,
            generation,
        }
    }

    pub fn pool_key(&self) -> &PoolKey {
        &self.pool_key
    }

    /// Launch generation of the process this page lives in.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn set_viewport(&self, viewport: Viewport) -> Result<(), EngineError> {
        self.inner.set_viewport(viewport).await
    }

    pub async fn goto(&self, url: &str) -> Result<(), EngineError> {
        self.inner.goto(url).await
    }

    pub async fn set_content(&self, html: &str) -> Result<(), EngineError> {
        self.inner.set_content(html).await
    }

    pub async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, EngineError> {
        self.inner.screenshot(full_page).await
    }

    pub async fn pdf(&self) -> Result<Vec<u8>, EngineError> {
        self.inner.pdf().await
    }

    pub fn url(&self) -> String {
        self.inner.url()
    }

    pub fn network_events(&self) -> UnboundedReceiver<NetworkEvent> {
        self.inner.network_events()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        if self.inner.is_closed() {
            return Ok(());
        }
        self.inner.close().await
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if self.inner.is_closed() {
            return;
        }
        warn!(
            target = "pool::page",
            pool_key = %self.pool_key,
            generation = self.generation,
            url = %self.inner.url(),
            "Page dropped without being closed; closing in background"
        );
        let inner = self.inner.clone();
        let pool_key = self.pool_key.clone();
        let generation = self.generation;
        if let Ok(runtime) = Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = inner.close().await {
                    debug!(
                        target = "pool::page",
                        pool_key = %pool_key,
                        generation,
                        error = %err,
                        "Closing dropped page failed"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::{EngineLauncher, LaunchProfile};
    use crate::util::wait::wait_for_predicate;

    /// A page whose process has gone away: every close attempt fails.
    #[derive(Default)]
    struct UnreachablePage {
        close_attempts: AtomicUsize,
    }

    #[async_trait]
    impl EnginePage for UnreachablePage {
        async fn set_viewport(&self, _viewport: Viewport) -> Result<(), EngineError> {
            Err(EngineError::Disconnected)
        }

        async fn goto(&self, _url: &str) -> Result<(), EngineError> {
            Err(EngineError::Disconnected)
        }

        async fn set_content(&self, _html: &str) -> Result<(), EngineError> {
            Err(EngineError::Disconnected)
        }

        async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>, EngineError> {
            Err(EngineError::Disconnected)
        }

        async fn pdf(&self) -> Result<Vec<u8>, EngineError> {
            Err(EngineError::Disconnected)
        }

        fn url(&self) -> String {
            "about:blank".to_string()
        }

        fn network_events(&self) -> UnboundedReceiver<NetworkEvent> {
            mpsc::unbounded_channel().1
        }

        async fn close(&self) -> Result<(), EngineError> {
            self.close_attempts.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Disconnected)
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn dropped_open_page_is_closed_in_background() {
        let engine = MemoryEngine::new();
        let process = engine
            .launch(&LaunchProfile::default())
            .await
            .expect("process");
        let inner = process.new_page().await.expect("page");
        let page = Page::new(inner.clone(), PoolKey::shared("default").expect("key"), 1);

        drop(page);
        wait_for_predicate(|| inner.is_closed(), Duration::from_secs(1))
            .await
            .expect("closed after drop");
    }

    #[tokio::test]
    async fn failed_background_close_is_swallowed() {
        let unreachable = Arc::new(UnreachablePage::default());
        let page = Page::new(
            unreachable.clone(),
            PoolKey::shared("default").expect("key"),
            3,
        );

        drop(page);
        wait_for_predicate(
            || unreachable.close_attempts.load(Ordering::SeqCst) == 1,
            Duration::from_secs(1),
        )
        .await
        .expect("close attempted once");
    }
}
