use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::process::Child;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use super::connection::{CdpConnection, CdpEvent};
use super::page::ChromePage;
use crate::engine::{EngineError, EnginePage, EngineProcess, ProcessHooks};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "engine::chrome::process";
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// A running browser and the DevTools connection driving it.
pub(crate) struct ChromeProcess {
    pid: Option<u32>,
    connection: Arc<CdpConnection>,
    child: AsyncMutex<Option<Child>>,
    profile_dir: Mutex<Option<TempDir>>,
    hooks: Mutex<Option<Arc<dyn ProcessHooks>>>,
    /// Page targets that existed before discovery was switched on.
    baseline: Mutex<HashSet<String>>,
    /// Page targets reported to the hooks.
    tracked: Mutex<HashSet<String>>,
    pages: DashMap<String, Weak<ChromePage>>,
    closed: AtomicBool,
}

impl ChromeProcess {
    pub(crate) async fn start(
        child: Child,
        profile_dir: TempDir,
        ws_url: &str,
        command_timeout: Duration,
    ) -> Result<Arc<Self>, EngineError> {
        let (connection, browser_events) = CdpConnection::connect(ws_url, command_timeout).await?;
        let process = Arc::new(Self {
            pid: child.id(),
            connection,
            child: AsyncMutex::new(Some(child)),
            profile_dir: Mutex::new(Some(profile_dir)),
            hooks: Mutex::new(None),
            baseline: Mutex::new(HashSet::new()),
            tracked: Mutex::new(HashSet::new()),
            pages: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        let existing = process.page_targets().await?;
        mutex_lock(&process.baseline, SOURCE, "start")
            .extend(existing.into_iter().map(|(target_id, _)| target_id));

        tokio::spawn(watch_targets(Arc::downgrade(&process), browser_events));
        process
            .connection
            .call(None, "Target.setDiscoverTargets", json!({ "discover": true }))
            .await?;
        Ok(process)
    }

    async fn page_targets(&self) -> Result<Vec<(String, String)>, EngineError> {
        let listed = self
            .connection
            .call(None, "Target.getTargets", json!({}))
            .await?;
        let infos = listed
            .get("targetInfos")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::payload("`Target.getTargets` has no targetInfos"))?;
        Ok(infos
            .iter()
            .filter(|info| info.get("type").and_then(Value::as_str) == Some("page"))
            .filter_map(|info| {
                let target_id = info.get("targetId").and_then(Value::as_str)?;
                let url = info.get("url").and_then(Value::as_str).unwrap_or_default();
                Some((target_id.to_string(), url.to_string()))
            })
            .collect())
    }

    fn current_hooks(&self) -> Option<Arc<dyn ProcessHooks>> {
        mutex_lock(&self.hooks, SOURCE, "current_hooks").clone()
    }

    fn target_created(&self, info: &Value) {
        if info.get("type").and_then(Value::as_str) != Some("page") {
            return;
        }
        let Some(target_id) = info.get("targetId").and_then(Value::as_str) else {
            return;
        };
        if mutex_lock(&self.baseline, SOURCE, "target_created").contains(target_id) {
            return;
        }
        let Some(hooks) = self.current_hooks() else {
            return;
        };
        if mutex_lock(&self.tracked, SOURCE, "target_created").insert(target_id.to_string()) {
            hooks.page_created();
        }
    }

    fn target_destroyed(&self, target_id: &str) {
        if let Some((_, page)) = self.pages.remove(target_id)
            && let Some(page) = page.upgrade()
        {
            page.mark_closed();
        }
        mutex_lock(&self.baseline, SOURCE, "target_destroyed").remove(target_id);
        if !mutex_lock(&self.tracked, SOURCE, "target_destroyed").remove(target_id) {
            return;
        }
        if let Some(hooks) = self.current_hooks() {
            hooks.page_destroyed();
        }
    }

    fn connection_lost(&self) {
        for entry in self.pages.iter() {
            if let Some(page) = entry.value().upgrade() {
                page.mark_closed();
            }
        }
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(hooks) = self.current_hooks() {
            hooks.disconnected();
        }
    }
}

async fn watch_targets(process: Weak<ChromeProcess>, mut events: UnboundedReceiver<CdpEvent>) {
    while let Some(event) = events.recv().await {
        let Some(process) = process.upgrade() else {
            return;
        };
        match event.method.as_str() {
            "Target.targetCreated" => process.target_created(&event.params["targetInfo"]),
            "Target.targetDestroyed" => {
                if let Some(target_id) = event.params.get("targetId").and_then(Value::as_str) {
                    process.target_destroyed(target_id);
                }
            }
            _ => {}
        }
    }
    if let Some(process) = process.upgrade() {
        process.connection_lost();
    }
}

#[async_trait]
impl EngineProcess for ChromeProcess {
    fn attach(&self, hooks: Arc<dyn ProcessHooks>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        *mutex_lock(&self.hooks, SOURCE, "attach") = Some(hooks);
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn new_page(&self) -> Result<Arc<dyn EnginePage>, EngineError> {
        let page = ChromePage::open(self.connection.clone()).await?;
        self.pages
            .insert(page.target_id().to_string(), Arc::downgrade(&page));
        // Count the page before the caller sees it; the discovery event that
        // follows finds it already tracked.
        self.target_created(&json!({ "type": "page", "targetId": page.target_id() }));
        Ok(page as Arc<dyn EnginePage>)
    }

    async fn page_urls(&self) -> Result<Vec<String>, EngineError> {
        Ok(self
            .page_targets()
            .await?
            .into_iter()
            .map(|(_, url)| url)
            .collect())
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        mutex_lock(&self.hooks, SOURCE, "close").take();

        if let Err(err) = self.connection.call(None, "Browser.close", json!({})).await {
            debug!(
                target = "engine::chrome",
                pid = ?self.pid,
                error = %err,
                "Browser.close failed; killing process"
            );
        }
        self.connection.close();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(target = "engine::chrome", pid = ?self.pid, %status, "Browser exited");
                }
                Ok(Err(err)) => {
                    warn!(target = "engine::chrome", pid = ?self.pid, error = %err, "Waiting for browser failed");
                }
                Err(_) => {
                    if let Err(err) = child.kill().await {
                        warn!(target = "engine::chrome", pid = ?self.pid, error = %err, "Killing browser failed");
                    }
                }
            }
        }

        let profile_dir = mutex_lock(&self.profile_dir, SOURCE, "close").take();
        if let Some(profile_dir) = profile_dir
            && let Err(err) = profile_dir.close()
        {
            debug!(target = "engine::chrome", error = %err, "Removing browser profile failed");
        }
        Ok(())
    }
}
