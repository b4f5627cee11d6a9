//! Network activity observed on a single page.

use std::fmt;

use serde::Serialize;

/// Engine-assigned identity of one network request on a page.
///
/// Redirects keep the identity of the request that started the chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource class reported by the engine for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Document,
    Image,
    Xhr,
    Fetch,
    Script,
    Stylesheet,
    Font,
    Media,
    Other(String),
}

impl ResourceType {
    /// Parse the DevTools protocol spelling (`"Image"`, `"XHR"`, ...).
    pub fn from_protocol(value: &str) -> Self {
        match value {
            "Document" => Self::Document,
            "Image" => Self::Image,
            "XHR" => Self::Xhr,
            "Fetch" => Self::Fetch,
            "Script" => Self::Script,
            "Stylesheet" => Self::Stylesheet,
            "Font" => Self::Font,
            "Media" => Self::Media,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether requests of this class hold back network quiescence.
    pub fn is_tracked(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Xhr | Self::Fetch | Self::Script | Self::Stylesheet
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Document => "document",
            Self::Image => "image",
            Self::Xhr => "xhr",
            Self::Fetch => "fetch",
            Self::Script => "script",
            Self::Stylesheet => "stylesheet",
            Self::Font => "font",
            Self::Media => "media",
            Self::Other(other) => other.as_str(),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as first observed on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub id: RequestId,
    pub url: String,
    pub resource_type: ResourceType,
    /// Set when the response was already available at observation time
    /// (memory cache hit or inline `data:` payload).
    pub has_response: bool,
}

impl NetworkRequest {
    pub fn new(id: impl Into<String>, url: impl Into<String>, resource_type: ResourceType) -> Self {
        let url = url.into();
        let has_response = url.starts_with("data:");
        Self {
            id: RequestId::new(id),
            url,
            resource_type,
            has_response,
        }
    }

    pub fn with_response(mut self) -> Self {
        self.has_response = true;
        self
    }
}

/// Events a page publishes to its network subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Request(NetworkRequest),
    Finished(RequestId),
    Failed { id: RequestId, error: String },
    /// The page was closed; no further events follow.
    PageClosed,
}
