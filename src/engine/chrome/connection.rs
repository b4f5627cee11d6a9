//! DevTools protocol transport.
//!
//! One websocket per browser process. Commands are correlated with their
//! responses by id; events are routed to the page session that emitted them,
//! or to the browser channel when they carry no session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::engine::EngineError;

type Reply = oneshot::Sender<Result<Value, EngineError>>;

/// An event as delivered by the browser.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CdpEvent {
    pub(crate) method: String,
    pub(crate) params: Value,
}

/// A decoded websocket frame.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, String>,
    },
    Event {
        session_id: Option<String>,
        event: CdpEvent,
    },
}

impl Incoming {
    pub(crate) fn parse(text: &str) -> Result<Self, EngineError> {
        let mut value: Value = serde_json::from_str(text)
            .map_err(|err| EngineError::payload(format!("invalid DevTools frame: {err}")))?;

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let outcome = match value.get("error") {
                Some(error) => Err(error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown protocol error")
                    .to_string()),
                None => Ok(value.get_mut("result").map(Value::take).unwrap_or(Value::Null)),
            };
            return Ok(Self::Response { id, outcome });
        }

        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::payload("DevTools frame has neither id nor method"))?
            .to_string();
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let params = value.get_mut("params").map(Value::take).unwrap_or(Value::Null);
        Ok(Self::Event {
            session_id,
            event: CdpEvent { method, params },
        })
    }
}

pub(crate) struct CdpConnection {
    outgoing: mpsc::UnboundedSender<Message>,
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, (String, Reply)>>,
    sessions: Arc<DashMap<String, mpsc::UnboundedSender<CdpEvent>>>,
    closed: Arc<AtomicBool>,
    command_timeout: Duration,
}

impl CdpConnection {
    /// Connect to `ws_url`. The returned receiver yields browser-level events
    /// and ends when the socket closes.
    pub(crate) async fn connect(
        ws_url: &str,
        command_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CdpEvent>), EngineError> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|err| EngineError::launch(format!("DevTools connection failed: {err}")))?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (browser_tx, browser_rx) = mpsc::unbounded_channel();
        let pending: Arc<DashMap<u64, (String, Reply)>> = Arc::new(DashMap::new());
        let sessions: Arc<DashMap<String, mpsc::UnboundedSender<CdpEvent>>> =
            Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    debug!(target = "engine::chrome", error = %err, "DevTools write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        {
            let pending = pending.clone();
            let sessions = sessions.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(err) => {
                            debug!(target = "engine::chrome", error = %err, "DevTools read failed");
                            break;
                        }
                    };
                    match Incoming::parse(text.as_str()) {
                        Ok(Incoming::Response { id, outcome }) => {
                            if let Some((_, (method, reply))) = pending.remove(&id) {
                                let _ = reply.send(
                                    outcome.map_err(|message| EngineError::protocol(method, message)),
                                );
                            }
                        }
                        Ok(Incoming::Event {
                            session_id: Some(session_id),
                            event,
                        }) => {
                            if let Some(session) = sessions.get(&session_id) {
                                let _ = session.send(event);
                            }
                        }
                        Ok(Incoming::Event {
                            session_id: None,
                            event,
                        }) => {
                            let _ = browser_tx.send(event);
                        }
                        Err(err) => {
                            warn!(target = "engine::chrome", error = %err, "Skipping DevTools frame");
                        }
                    }
                }

                closed.store(true, Ordering::SeqCst);
                let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
                for id in ids {
                    if let Some((_, (_, reply))) = pending.remove(&id) {
                        let _ = reply.send(Err(EngineError::Disconnected));
                    }
                }
                sessions.clear();
                debug!(target = "engine::chrome", "DevTools connection closed");
            });
        }

        let connection = Arc::new(Self {
            outgoing,
            next_id: AtomicU64::new(0),
            pending,
            sessions,
            closed,
            command_timeout,
        });
        Ok((connection, browser_rx))
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Send a command and wait for its result.
    pub(crate) async fn call(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut frame = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            frame["sessionId"] = Value::String(session_id.to_string());
        }

        let (reply, response) = oneshot::channel();
        self.pending.insert(id, (method.to_string(), reply));
        if self
            .outgoing
            .send(Message::Text(frame.to_string().into()))
            .is_err()
        {
            self.pending.remove(&id);
            return Err(EngineError::Disconnected);
        }

        match tokio::time::timeout(self.command_timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(EngineError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(EngineError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Route events of `session_id` to the returned receiver.
    pub(crate) fn subscribe_session(&self, session_id: &str) -> mpsc::UnboundedReceiver<CdpEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.is_connected() {
            self.sessions.insert(session_id.to_string(), tx);
        }
        rx
    }

    /// Stop routing events of `session_id`; its receiver ends.
    pub(crate) fn unsubscribe_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub(crate) fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }
}
