//! Deterministic in-process engine.
//!
//! Used by the test-suite and by `engine.kind = "memory"` dry runs. It keeps
//! the same lifecycle contract as a real browser: every process starts with
//! one untracked blank page, page creation and destruction are reported to
//! the attached hooks, and closing a process releases them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use super::{EngineError, EngineLauncher, EnginePage, EngineProcess, LaunchProfile, ProcessHooks};
use crate::domain::{network::NetworkEvent, viewport::Viewport};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "engine::memory";

/// 1x1 transparent PNG returned by every screenshot.
pub const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

/// Minimal document returned by every PDF capture.
pub const PLACEHOLDER_PDF: &[u8] = b"%PDF-1.4\n1 0 obj << /Type /Catalog >> endobj\ntrailer << /Root 1 0 R >>\n%%EOF\n";

#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<EngineState>,
}

#[derive(Default)]
struct EngineState {
    launches: AtomicUsize,
    launch_delay: Mutex<Duration>,
    close_delay: Mutex<Duration>,
    failures: Mutex<VecDeque<String>>,
    processes: Mutex<Vec<Arc<MemoryProcess>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every launch, keeping resolvers in their initializing phase.
    pub fn with_launch_delay(self, delay: Duration) -> Self {
        *mutex_lock(&self.inner.launch_delay, SOURCE, "with_launch_delay") = delay;
        self
    }

    /// Delay every process close, as a browser flushing its profile would.
    pub fn with_close_delay(self, delay: Duration) -> Self {
        *mutex_lock(&self.inner.close_delay, SOURCE, "with_close_delay") = delay;
        self
    }

    /// Make the next launch fail with `message`.
    pub fn fail_next_launch(&self, message: impl Into<String>) {
        mutex_lock(&self.inner.failures, SOURCE, "fail_next_launch").push_back(message.into());
    }

    pub fn launch_count(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }

    /// Every process launched so far, in launch order.
    pub fn processes(&self) -> Vec<Arc<MemoryProcess>> {
        mutex_lock(&self.inner.processes, SOURCE, "processes").clone()
    }

    pub fn last_process(&self) -> Option<Arc<MemoryProcess>> {
        mutex_lock(&self.inner.processes, SOURCE, "last_process")
            .last()
            .cloned()
    }
}

#[async_trait]
impl EngineLauncher for MemoryEngine {
    async fn launch(&self, profile: &LaunchProfile) -> Result<Arc<dyn EngineProcess>, EngineError> {
        self.inner.launches.fetch_add(1, Ordering::SeqCst);

        let delay = *mutex_lock(&self.inner.launch_delay, SOURCE, "launch");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = mutex_lock(&self.inner.failures, SOURCE, "launch").pop_front();
        if let Some(message) = failure {
            return Err(EngineError::launch(message));
        }

        let mut processes = mutex_lock(&self.inner.processes, SOURCE, "launch");
        let close_delay = *mutex_lock(&self.inner.close_delay, SOURCE, "launch");
        let process = MemoryProcess::new(processes.len() + 1, profile.clone(), close_delay);
        processes.push(process.clone());
        debug!(
            target = "engine::memory",
            process_id = process.id,
            "Launched in-memory engine process"
        );
        Ok(process as Arc<dyn EngineProcess>)
    }
}

pub struct MemoryProcess {
    id: usize,
    profile: LaunchProfile,
    close_delay: Duration,
    weak_self: Weak<MemoryProcess>,
    next_page_id: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    hooks: Mutex<Option<Arc<dyn ProcessHooks>>>,
    pages: Mutex<Vec<Arc<MemoryPage>>>,
}

impl MemoryProcess {
    fn new(id: usize, profile: LaunchProfile, close_delay: Duration) -> Arc<Self> {
        let process = Arc::new_cyclic(|weak_self| Self {
            id,
            profile,
            close_delay,
            weak_self: weak_self.clone(),
            next_page_id: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            hooks: Mutex::new(None),
            pages: Mutex::new(Vec::new()),
        });
        process.open_untracked_page("about:blank");
        process
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn profile(&self) -> &LaunchProfile {
        &self.profile
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn open_page_count(&self) -> usize {
        mutex_lock(&self.pages, SOURCE, "open_page_count").len()
    }

    /// Open pages in creation order, the startup blank page first.
    pub fn pages(&self) -> Vec<Arc<MemoryPage>> {
        mutex_lock(&self.pages, SOURCE, "pages").clone()
    }

    /// Open a page the hooks never hear about, like a tab leaked by a caller.
    pub fn open_untracked_page(&self, url: &str) -> Arc<MemoryPage> {
        let page = self.spawn_page(false);
        *mutex_lock(&page.url, SOURCE, "open_untracked_page") = url.to_string();
        page
    }

    /// Simulate the process crashing or the connection dropping.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let hooks = mutex_lock(&self.hooks, SOURCE, "disconnect").clone();
        if let Some(hooks) = hooks {
            hooks.disconnected();
        }
    }

    fn spawn_page(&self, tracked: bool) -> Arc<MemoryPage> {
        let page = Arc::new(MemoryPage {
            id: self.next_page_id.fetch_add(1, Ordering::SeqCst),
            tracked,
            process: self.weak_self.clone(),
            url: Mutex::new("about:blank".to_string()),
            viewport: Mutex::new(None),
            closed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        });
        mutex_lock(&self.pages, SOURCE, "spawn_page").push(page.clone());
        page
    }

    fn page_closed(&self, page: &MemoryPage) {
        mutex_lock(&self.pages, SOURCE, "page_closed").retain(|open| open.id != page.id);
        if !page.tracked {
            return;
        }
        let hooks = mutex_lock(&self.hooks, SOURCE, "page_closed").clone();
        if let Some(hooks) = hooks {
            hooks.page_destroyed();
        }
    }
}

#[async_trait]
impl EngineProcess for MemoryProcess {
    fn attach(&self, hooks: Arc<dyn ProcessHooks>) {
        if self.is_closed() {
            return;
        }
        *mutex_lock(&self.hooks, SOURCE, "attach") = Some(hooks);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn new_page(&self) -> Result<Arc<dyn EnginePage>, EngineError> {
        if !self.is_connected() || self.is_closed() {
            return Err(EngineError::Disconnected);
        }
        let page = self.spawn_page(true);
        let hooks = mutex_lock(&self.hooks, SOURCE, "new_page").clone();
        if let Some(hooks) = hooks {
            hooks.page_created();
        }
        Ok(page as Arc<dyn EnginePage>)
    }

    async fn page_urls(&self) -> Result<Vec<String>, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::Disconnected);
        }
        let pages = mutex_lock(&self.pages, SOURCE, "page_urls").clone();
        Ok(pages.iter().map(|page| page.url()).collect())
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connected.store(false, Ordering::SeqCst);
        mutex_lock(&self.hooks, SOURCE, "close").take();
        let pages = std::mem::take(&mut *mutex_lock(&self.pages, SOURCE, "close"));
        for page in pages {
            page.mark_closed();
        }
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        debug!(
            target = "engine::memory",
            process_id = self.id,
            "Closed in-memory engine process"
        );
        Ok(())
    }
}

pub struct MemoryPage {
    id: u64,
    tracked: bool,
    process: Weak<MemoryProcess>,
    url: Mutex<String>,
    viewport: Mutex<Option<Viewport>>,
    closed: AtomicBool,
    subscribers: Mutex<Vec<UnboundedSender<NetworkEvent>>>,
}

impl MemoryPage {
    /// Deliver a network event to every subscriber.
    pub fn emit(&self, event: NetworkEvent) {
        mutex_lock(&self.subscribers, SOURCE, "emit")
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn viewport(&self) -> Option<Viewport> {
        *mutex_lock(&self.viewport, SOURCE, "viewport")
    }

    /// Returns `false` when the page was already closed.
    fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(NetworkEvent::PageClosed);
        mutex_lock(&self.subscribers, SOURCE, "mark_closed").clear();
        true
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::PageClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl EnginePage for MemoryPage {
    async fn set_viewport(&self, viewport: Viewport) -> Result<(), EngineError> {
        self.ensure_open()?;
        *mutex_lock(&self.viewport, SOURCE, "set_viewport") = Some(viewport);
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<(), EngineError> {
        self.ensure_open()?;
        let supported = ["http://", "https://", "about:", "data:"]
            .iter()
            .any(|scheme| url.starts_with(scheme));
        if !supported {
            return Err(EngineError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_UNKNOWN_URL_SCHEME".to_string(),
            });
        }
        *mutex_lock(&self.url, SOURCE, "goto") = url.to_string();
        Ok(())
    }

    async fn set_content(&self, _html: &str) -> Result<(), EngineError> {
        self.ensure_open()
    }

    async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>, EngineError> {
        self.ensure_open()?;
        Ok(PLACEHOLDER_PNG.to_vec())
    }

    async fn pdf(&self) -> Result<Vec<u8>, EngineError> {
        self.ensure_open()?;
        Ok(PLACEHOLDER_PDF.to_vec())
    }

    fn url(&self) -> String {
        mutex_lock(&self.url, SOURCE, "url").clone()
    }

    fn network_events(&self) -> UnboundedReceiver<NetworkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.is_closed() {
            let _ = tx.send(NetworkEvent::PageClosed);
        } else {
            mutex_lock(&self.subscribers, SOURCE, "network_events").push(tx);
        }
        rx
    }

    async fn close(&self) -> Result<(), EngineError> {
        if !self.mark_closed() {
            return Ok(());
        }
        if let Some(process) = self.process.upgrade() {
            process.page_closed(self);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
