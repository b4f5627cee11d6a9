use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::debug;

use super::connection::{CdpConnection, CdpEvent};
use crate::domain::network::{NetworkEvent, NetworkRequest, RequestId, ResourceType};
use crate::domain::viewport::Viewport;
use crate::engine::{EngineError, EnginePage};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "engine::chrome::page";

/// A page target driven through its own flattened DevTools session.
pub(crate) struct ChromePage {
    target_id: String,
    session_id: String,
    connection: Arc<CdpConnection>,
    url: Mutex<String>,
    closed: AtomicBool,
    subscribers: Mutex<Vec<UnboundedSender<NetworkEvent>>>,
    loads: watch::Sender<u64>,
}

impl ChromePage {
    pub(crate) async fn open(connection: Arc<CdpConnection>) -> Result<Arc<Self>, EngineError> {
        let created = connection
            .call(None, "Target.createTarget", json!({ "url": "about:blank" }))
            .await?;
        let target_id = string_field(&created, "targetId", "Target.createTarget")?;

        let attached = connection
            .call(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = string_field(&attached, "sessionId", "Target.attachToTarget")?;

        let events = connection.subscribe_session(&session_id);
        let (loads, _) = watch::channel(0);
        let page = Arc::new(Self {
            target_id,
            session_id,
            connection,
            url: Mutex::new("about:blank".to_string()),
            closed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            loads,
        });
        tokio::spawn(pump_events(Arc::downgrade(&page), events));

        page.session_call("Page.enable", json!({})).await?;
        page.session_call("Network.enable", json!({})).await?;
        Ok(page)
    }

    pub(crate) fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Close the local handle after the target went away.
    pub(crate) fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.unsubscribe_session(&self.session_id);
        let subscribers = std::mem::take(&mut *mutex_lock(&self.subscribers, SOURCE, "mark_closed"));
        for subscriber in subscribers {
            let _ = subscriber.send(NetworkEvent::PageClosed);
        }
    }

    async fn session_call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        self.ensure_open()?;
        self.connection
            .call(Some(&self.session_id), method, params)
            .await
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::PageClosed);
        }
        Ok(())
    }

    fn publish(&self, event: NetworkEvent) {
        mutex_lock(&self.subscribers, SOURCE, "publish")
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn handle(&self, event: CdpEvent) {
        match event.method.as_str() {
            "Page.loadEventFired" => {
                self.loads.send_modify(|count| *count += 1);
            }
            "Page.frameNavigated" => {
                let frame = &event.params["frame"];
                if frame.get("parentId").is_none()
                    && let Some(url) = frame.get("url").and_then(Value::as_str)
                {
                    *mutex_lock(&self.url, SOURCE, "frame_navigated") = url.to_string();
                }
            }
            _ => {
                if let Some(network) = translate_network_event(&event) {
                    self.publish(network);
                }
            }
        }
    }
}

async fn pump_events(page: Weak<ChromePage>, mut events: UnboundedReceiver<CdpEvent>) {
    while let Some(event) = events.recv().await {
        let Some(page) = page.upgrade() else {
            return;
        };
        page.handle(event);
    }
    if let Some(page) = page.upgrade() {
        page.mark_closed();
    }
}

/// Map a `Network.*` event onto the engine-neutral representation.
pub(crate) fn translate_network_event(event: &CdpEvent) -> Option<NetworkEvent> {
    let params = &event.params;
    let request_id = || params.get("requestId").and_then(Value::as_str).map(RequestId::new);
    match event.method.as_str() {
        "Network.requestWillBeSent" => {
            let id = params.get("requestId").and_then(Value::as_str)?;
            let url = params["request"].get("url").and_then(Value::as_str)?;
            let resource_type = params
                .get("type")
                .and_then(Value::as_str)
                .map(ResourceType::from_protocol)
                .unwrap_or_else(|| ResourceType::Other("Other".to_string()));
            Some(NetworkEvent::Request(NetworkRequest::new(
                id,
                url,
                resource_type,
            )))
        }
        "Network.loadingFinished" => request_id().map(NetworkEvent::Finished),
        "Network.loadingFailed" => {
            let id = request_id()?;
            let error = params
                .get("errorText")
                .and_then(Value::as_str)
                .unwrap_or("unknown network error")
                .to_string();
            Some(NetworkEvent::Failed { id, error })
        }
        _ => None,
    }
}

fn string_field(value: &Value, field: &str, method: &str) -> Result<String, EngineError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::payload(format!("`{method}` result has no `{field}`")))
}

fn decode_data(value: &Value, method: &str) -> Result<Vec<u8>, EngineError> {
    let data = string_field(value, "data", method)?;
    STANDARD
        .decode(data.as_bytes())
        .map_err(|err| EngineError::payload(format!("`{method}` returned invalid base64: {err}")))
}

#[async_trait]
impl EnginePage for ChromePage {
    async fn set_viewport(&self, viewport: Viewport) -> Result<(), EngineError> {
        self.session_call(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": viewport.width,
                "height": viewport.height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await?;
        self.session_call(
            "Emulation.setTouchEmulationEnabled",
            json!({ "enabled": viewport.has_touch }),
        )
        .await?;
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<(), EngineError> {
        let mut loads = self.loads.subscribe();
        let navigated = self
            .session_call("Page.navigate", json!({ "url": url }))
            .await?;

        if let Some(reason) = navigated.get("errorText").and_then(Value::as_str)
            && !reason.is_empty()
        {
            return Err(EngineError::Navigation {
                url: url.to_string(),
                reason: reason.to_string(),
            });
        }
        // Same-document navigations never fire a load event.
        if navigated.get("loaderId").is_none() {
            return Ok(());
        }

        match tokio::time::timeout(self.connection.command_timeout(), loads.changed()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(EngineError::PageClosed),
            Err(_) => Err(EngineError::Timeout {
                method: "Page.loadEventFired".to_string(),
            }),
        }
    }

    async fn set_content(&self, html: &str) -> Result<(), EngineError> {
        let tree = self.session_call("Page.getFrameTree", json!({})).await?;
        let frame_id = tree["frameTree"]["frame"]
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::payload("`Page.getFrameTree` result has no frame id"))?
            .to_string();
        self.session_call(
            "Page.setDocumentContent",
            json!({ "frameId": frame_id, "html": html }),
        )
        .await?;
        Ok(())
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, EngineError> {
        let mut params = json!({ "format": "png" });
        if full_page {
            let metrics = self.session_call("Page.getLayoutMetrics", json!({})).await?;
            let size = metrics
                .get("cssContentSize")
                .or_else(|| metrics.get("contentSize"))
                .ok_or_else(|| EngineError::payload("`Page.getLayoutMetrics` has no content size"))?;
            params["captureBeyondViewport"] = Value::Bool(true);
            params["clip"] = json!({
                "x": 0,
                "y": 0,
                "width": size["width"].as_f64().unwrap_or(0.0).ceil(),
                "height": size["height"].as_f64().unwrap_or(0.0).ceil(),
                "scale": 1,
            });
        }
        let captured = self.session_call("Page.captureScreenshot", params).await?;
        decode_data(&captured, "Page.captureScreenshot")
    }

    async fn pdf(&self) -> Result<Vec<u8>, EngineError> {
        let printed = self
            .session_call(
                "Page.printToPDF",
                json!({ "printBackground": true, "preferCSSPageSize": true }),
            )
            .await?;
        decode_data(&printed, "Page.printToPDF")
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
        if self.is_closed() {
            return Ok(());
        }
        self.mark_closed();
        match self
            .connection
            .call(
                None,
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
            )
            .await
        {
            Ok(_) | Err(EngineError::Disconnected) => Ok(()),
            Err(err) => {
                debug!(
                    target = "engine::chrome",
                    target_id = %self.target_id,
                    error = %err,
                    "Closing page target failed"
                );
                Err(err)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
