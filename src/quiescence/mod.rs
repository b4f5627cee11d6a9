//! Network quiescence detection for a single page.
//!
//! The detector subscribes to a page's network events and sorts tracked
//! requests into pending, finished and failed sets. Events are applied in
//! the order the page published them, whenever the detector is asked about
//! its state.

mod interceptor;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, warn};

use crate::domain::network::{NetworkEvent, NetworkRequest, RequestId};
use crate::pool::Page;

pub use interceptor::{IgnoreUrlPrefixes, RequestInterceptor};

pub struct NetworkQuiescenceDetector {
    page_url: String,
    events: Option<UnboundedReceiver<NetworkEvent>>,
    interceptor: Option<Arc<dyn RequestInterceptor>>,
    pending: HashMap<RequestId, NetworkRequest>,
    finished: HashMap<RequestId, NetworkRequest>,
    failed: HashMap<RequestId, NetworkRequest>,
}

impl NetworkQuiescenceDetector {
    pub fn attach(page: &Page) -> Self {
        Self {
            page_url: page.url(),
            events: Some(page.network_events()),
            interceptor: None,
            pending: HashMap::new(),
            finished: HashMap::new(),
            failed: HashMap::new(),
        }
    }

    pub fn with_interceptor(page: &Page, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        Self {
            interceptor: Some(interceptor),
            ..Self::attach(page)
        }
    }

    /// Suspend until no tracked request is pending.
    ///
    /// Returns immediately when nothing is pending, and also once the page
    /// closes since closing clears every set.
    pub async fn wait_for_idle(&mut self) {
        self.apply_buffered().await;
        while !self.pending.is_empty() {
            let next = match self.events.as_mut() {
                Some(events) => events.recv().await,
                None => None,
            };
            match next {
                Some(event) => self.apply(event).await,
                None => self.dispose(),
            }
        }
    }

    /// Apply every event the page has published so far without waiting for
    /// more.
    pub async fn apply_buffered(&mut self) {
        loop {
            let next = match self.events.as_mut() {
                Some(events) => events.try_recv(),
                None => return,
            };
            match next {
                Ok(event) => self.apply(event).await,
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.dispose();
                    return;
                }
            }
        }
    }

    pub fn has_failed_requests(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    pub fn finished_request_count(&self) -> usize {
        self.finished.len()
    }

    /// URLs of the requests that failed, for diagnostics.
    pub fn failed_request_urls(&self) -> Vec<String> {
        self.failed.values().map(|request| request.url.clone()).collect()
    }

    /// Stop listening and forget every request.
    pub fn dispose(&mut self) {
        if self.events.take().is_some() {
            debug!(
                target = "quiescence",
                page_url = %self.page_url,
                pending = self.pending.len(),
                "Detaching network quiescence detector"
            );
        }
        self.pending.clear();
        self.finished.clear();
        self.failed.clear();
    }

    async fn apply(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Request(request) => self.observe(request).await,
            NetworkEvent::Finished(id) => self.settle(&id, None),
            NetworkEvent::Failed { id, error } => self.settle(&id, Some(error)),
            NetworkEvent::PageClosed => self.dispose(),
        }
    }

    async fn observe(&mut self, request: NetworkRequest) {
        if let Some(interceptor) = &self.interceptor
            && interceptor.should_ignore(&request).await
        {
            debug!(
                target = "quiescence",
                url = %request.url,
                "Request ignored by interceptor"
            );
            return;
        }

        if !request.resource_type.is_tracked() {
            warn!(
                target = "quiescence",
                resource_type = %request.resource_type,
                url = %request.url,
                "Unmapped resource type"
            );
            return;
        }

        if !request.has_response {
            self.pending.insert(request.id.clone(), request);
        }
    }

    fn settle(&mut self, id: &RequestId, error: Option<String>) {
        let Some(request) = self.pending.remove(id) else {
            return;
        };
        match error {
            Some(error) => {
                debug!(
                    target = "quiescence",
                    url = %request.url,
                    error = %error,
                    "Tracked request failed"
                );
                self.failed.insert(id.clone(), request);
            }
            None => {
                self.finished.insert(id.clone(), request);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::network::ResourceType;
    use crate::domain::pool_key::PoolKey;
    use crate::engine::EnginePage;
    use crate::engine::memory::{MemoryEngine, MemoryPage};
    use crate::pool::{Resolver, ResolverConfig};

    async fn open_page() -> (Page, Arc<MemoryPage>) {
        let engine = MemoryEngine::new();
        let resolver = Resolver::new(
            PoolKey::shared("quiescence").expect("key"),
            Arc::new(engine.clone()),
            ResolverConfig::default(),
        );
        let page = resolver.new_page().await.expect("page");
        let memory_page = engine
            .last_process()
            .and_then(|process| process.pages().last().cloned())
            .expect("memory page");
        (page, memory_page)
    }

    fn request(id: &str, url: &str, resource_type: ResourceType) -> NetworkEvent {
        NetworkEvent::Request(NetworkRequest::new(id, url, resource_type))
    }

    #[tokio::test]
    async fn idle_page_resolves_immediately() {
        let (page, _) = open_page().await;
        let mut detector = NetworkQuiescenceDetector::attach(&page);

        tokio::time::timeout(Duration::from_millis(100), detector.wait_for_idle())
            .await
            .expect("no pending requests");
        page.close().await.expect("close");
    }

    #[tokio::test]
    async fn only_tracked_requests_without_response_are_pending() {
        let (page, emitter) = open_page().await;
        let mut detector = NetworkQuiescenceDetector::attach(&page);

        emitter.emit(request("1", "https://a.example/app.js", ResourceType::Script));
        emitter.emit(request("2", "https://a.example/", ResourceType::Document));
        emitter.emit(request("3", "https://a.example/font.woff2", ResourceType::Font));
        emitter.emit(request("4", "data:image/png;base64,AAAA", ResourceType::Image));
        emitter.emit(NetworkEvent::Request(
            NetworkRequest::new("5", "https://a.example/cached.css", ResourceType::Stylesheet)
                .with_response(),
        ));
        detector.apply_buffered().await;

        assert_eq!(detector.pending_request_count(), 1);
        page.close().await.expect("close");
    }

    #[tokio::test]
    async fn wait_resolves_once_last_pending_request_settles() {
        let (page, emitter) = open_page().await;
        let mut detector = NetworkQuiescenceDetector::attach(&page);

        emitter.emit(request("1", "https://a.example/data.json", ResourceType::Fetch));
        emitter.emit(request("2", "https://a.example/logo.png", ResourceType::Image));
        detector.apply_buffered().await;
        assert_eq!(detector.pending_request_count(), 2);

        let settle = {
            let emitter = emitter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                emitter.emit(NetworkEvent::Finished(RequestId::new("1")));
                tokio::time::sleep(Duration::from_millis(20)).await;
                emitter.emit(NetworkEvent::Failed {
                    id: RequestId::new("2"),
                    error: "net::ERR_CONNECTION_REFUSED".to_string(),
                });
            })
        };

        tokio::time::timeout(Duration::from_secs(1), detector.wait_for_idle())
            .await
            .expect("idle after both requests settle");
        settle.await.expect("join");

        assert_eq!(detector.pending_request_count(), 0);
        assert_eq!(detector.finished_request_count(), 1);
        assert!(detector.has_failed_requests());
        assert_eq!(
            detector.failed_request_urls(),
            vec!["https://a.example/logo.png".to_string()]
        );
        page.close().await.expect("close");
    }

    #[tokio::test]
    async fn wait_stays_pending_while_requests_are_open() {
        let (page, emitter) = open_page().await;
        let mut detector = NetworkQuiescenceDetector::attach(&page);

        emitter.emit(request("1", "https://a.example/slow", ResourceType::Xhr));
        emitter.emit(NetworkEvent::Finished(RequestId::new("unknown")));

        let outcome =
            tokio::time::timeout(Duration::from_millis(150), detector.wait_for_idle()).await;
        assert!(outcome.is_err(), "request 1 is still pending");
        assert_eq!(detector.pending_request_count(), 1);
        assert!(!detector.has_failed_requests());
        page.close().await.expect("close");
    }

    #[tokio::test]
    async fn interceptor_vetoes_tracking() {
        let (page, emitter) = open_page().await;
        let mut detector = NetworkQuiescenceDetector::with_interceptor(
            &page,
            Arc::new(IgnoreUrlPrefixes::new(["https://poll.example/"])),
        );

        emitter.emit(request("1", "https://poll.example/stream", ResourceType::Xhr));
        detector.apply_buffered().await;

        assert_eq!(detector.pending_request_count(), 0);
        tokio::time::timeout(Duration::from_millis(100), detector.wait_for_idle())
            .await
            .expect("ignored request does not block idleness");
        page.close().await.expect("close");
    }

    #[tokio::test]
    async fn closing_the_page_clears_state_and_releases_waiters() {
        let (page, emitter) = open_page().await;
        let mut detector = NetworkQuiescenceDetector::attach(&page);

        emitter.emit(request("1", "https://a.example/never.js", ResourceType::Script));
        detector.apply_buffered().await;
        assert_eq!(detector.pending_request_count(), 1);

        page.close().await.expect("close");
        assert!(emitter.is_closed());

        tokio::time::timeout(Duration::from_millis(100), detector.wait_for_idle())
            .await
            .expect("page close releases the wait");
        assert_eq!(detector.pending_request_count(), 0);
        assert!(!detector.has_failed_requests());
    }

    #[tokio::test]
    async fn explicit_dispose_forgets_everything() {
        let (page, emitter) = open_page().await;
        let mut detector = NetworkQuiescenceDetector::attach(&page);

        emitter.emit(request("1", "https://a.example/a.js", ResourceType::Script));
        emitter.emit(NetworkEvent::Failed {
            id: RequestId::new("1"),
            error: "net::ERR_ABORTED".to_string(),
        });
        detector.apply_buffered().await;
        assert!(detector.has_failed_requests());

        detector.dispose();
        assert!(!detector.has_failed_requests());
        assert_eq!(detector.pending_request_count(), 0);

        emitter.emit(request("2", "https://a.example/b.js", ResourceType::Script));
        detector.wait_for_idle().await;
        assert_eq!(detector.pending_request_count(), 0);
        page.close().await.expect("close");
    }
}
