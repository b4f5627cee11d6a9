//! Boundary to the headless rendering engine.
//!
//! The pool never talks to a browser directly. It launches processes through
//! an [`EngineLauncher`], observes them through [`ProcessHooks`], and hands
//! [`EnginePage`]s to callers. Two adapters ship with the crate: the Chrome
//! DevTools adapter used in production and an in-memory engine used by tests
//! and dry runs.

pub mod chrome;
pub mod memory;
mod profile;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::domain::{network::NetworkEvent, viewport::Viewport};

pub use profile::LaunchProfile;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("failed to launch engine process: {0}")]
    Launch(String),
    #[error("engine process is disconnected")]
    Disconnected,
    #[error("engine protocol error in `{method}`: {message}")]
    Protocol { method: String, message: String },
    #[error("navigation to `{url}` failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("engine command `{method}` timed out")]
    Timeout { method: String },
    #[error("page is closed")]
    PageClosed,
    #[error("unexpected engine payload: {0}")]
    Payload(String),
}

impl EngineError {
    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch(message.into())
    }

    pub fn protocol(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload(message.into())
    }
}

/// Starts rendering-engine processes.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, profile: &LaunchProfile) -> Result<Arc<dyn EngineProcess>, EngineError>;
}

/// Lifecycle callbacks a process reports to its owner.
///
/// Called synchronously from the engine's event path: implementations must
/// not block.
pub trait ProcessHooks: Send + Sync {
    fn disconnected(&self);
    fn page_created(&self);
    fn page_destroyed(&self);
}

/// A launched rendering-engine process.
///
/// Pages opened before [`EngineProcess::attach`] (the startup blank page) are
/// never reported to the hooks. Implementations release the attached hooks
/// once closed.
#[async_trait]
pub trait EngineProcess: Send + Sync {
    fn attach(&self, hooks: Arc<dyn ProcessHooks>);

    fn is_connected(&self) -> bool;

    async fn new_page(&self) -> Result<Arc<dyn EnginePage>, EngineError>;

    /// URLs of every page currently open in the process, tracked or not.
    async fn page_urls(&self) -> Result<Vec<String>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// One renderable surface inside a process.
#[async_trait]
pub trait EnginePage: Send + Sync {
    async fn set_viewport(&self, viewport: Viewport) -> Result<(), EngineError>;

    /// Navigate and wait for the load event.
    async fn goto(&self, url: &str) -> Result<(), EngineError>;

    async fn set_content(&self, html: &str) -> Result<(), EngineError>;

    /// PNG bytes of the viewport, or of the whole document when `full_page`.
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, EngineError>;

    async fn pdf(&self) -> Result<Vec<u8>, EngineError>;

    fn url(&self) -> String;

    /// Subscribe to network activity. Each call returns an independent stream
    /// that ends after [`NetworkEvent::PageClosed`].
    fn network_events(&self) -> UnboundedReceiver<NetworkEvent>;

    async fn close(&self) -> Result<(), EngineError>;

    fn is_closed(&self) -> bool;
}
