//! Page captures on top of the resolver pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::future::BoxFuture;
use metrics::histogram;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::{error::DomainError, viewport::Viewport};
use crate::engine::EngineError;
use crate::pool::{Page, PoolError, ResolveOptions, ResolverRegistry};
use crate::quiescence::{IgnoreUrlPrefixes, NetworkQuiescenceDetector, RequestInterceptor};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POOL_KEY: &str = "default";

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub pool_key: String,
    pub viewport: Viewport,
    pub idle_timeout: Duration,
    pub ignored_url_prefixes: Vec<String>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            pool_key: DEFAULT_POOL_KEY.to_string(),
            viewport: Viewport::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ignored_url_prefixes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderSource {
    Url(String),
    Html(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RenderFormat {
    #[default]
    Png,
    Pdf,
    /// A full-page screenshot laid out on a single PDF page.
    PrintablePdf,
}

impl RenderFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Pdf | Self::PrintablePdf => "application/pdf",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub source: RenderSource,
    pub format: RenderFormat,
    pub full_page: bool,
    /// Render in a dedicated process that is never reused.
    pub isolated: bool,
    pub viewport: Option<Viewport>,
}

impl RenderRequest {
    pub fn url(url: impl Into<String>) -> Self {
        Self::new(RenderSource::Url(url.into()))
    }

    pub fn html(html: impl Into<String>) -> Self {
        Self::new(RenderSource::Html(html.into()))
    }

    fn new(source: RenderSource) -> Self {
        Self {
            source,
            format: RenderFormat::default(),
            full_page: true,
            isolated: false,
            viewport: None,
        }
    }

    pub fn with_format(mut self, format: RenderFormat) -> Self {
        self.format = format;
        self
    }

    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    fn validate(&self) -> Result<(), RenderError> {
        match &self.source {
            RenderSource::Url(raw) => {
                let parsed = Url::parse(raw)
                    .map_err(|err| RenderError::invalid(format!("invalid url `{raw}`: {err}")))?;
                if !matches!(parsed.scheme(), "http" | "https" | "data" | "about") {
                    return Err(RenderError::invalid(format!(
                        "unsupported url scheme `{}`",
                        parsed.scheme()
                    )));
                }
            }
            RenderSource::Html(html) if html.trim().is_empty() => {
                return Err(RenderError::invalid("html content must not be empty"));
            }
            RenderSource::Html(_) => {}
        }
        if let Some(viewport) = self.viewport
            && (viewport.width == 0 || viewport.height == 0)
        {
            return Err(RenderError::invalid("viewport dimensions must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub bytes: Vec<u8>,
    pub format: RenderFormat,
    pub had_failed_requests: bool,
    pub final_url: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid render request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("network did not become idle within {}ms", timeout.as_millis())]
    IdleTimeout { timeout: Duration },
}

impl RenderError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

/// Renders pages through a shared [`ResolverRegistry`].
#[derive(Clone)]
pub struct RenderService {
    registry: Arc<ResolverRegistry>,
    settings: RenderSettings,
    interceptor: Arc<dyn RequestInterceptor>,
}

impl RenderService {
    pub fn new(registry: Arc<ResolverRegistry>, settings: RenderSettings) -> Self {
        let interceptor = Arc::new(IgnoreUrlPrefixes::new(
            settings.ignored_url_prefixes.iter().cloned(),
        ));
        Self {
            registry,
            settings,
            interceptor,
        }
    }

    pub fn registry(&self) -> &Arc<ResolverRegistry> {
        &self.registry
    }

    /// Run `work` against a fresh page and close the page afterwards, whether
    /// `work` succeeded or not.
    pub async fn with_page<T, F>(&self, isolated: bool, work: F) -> Result<T, RenderError>
    where
        F: for<'p> FnOnce(&'p Page) -> BoxFuture<'p, Result<T, RenderError>>,
    {
        let resolver = self
            .registry
            .resolve(&self.settings.pool_key, ResolveOptions { isolated })
            .await?;
        let page = resolver.new_page().await?;

        let outcome = match page.set_viewport(self.settings.viewport).await {
            Ok(()) => work(&page).await,
            Err(err) => Err(err.into()),
        };

        if let Err(err) = page.close().await {
            debug!(
                target = "application::render",
                pool_key = %resolver.key(),
                error = %err,
                "Closing page failed"
            );
        }
        outcome
    }

    pub async fn capture(&self, request: RenderRequest) -> Result<RenderOutput, RenderError> {
        request.validate()?;
        let started_at = Instant::now();
        let idle_timeout = self.settings.idle_timeout;
        let interceptor = self.interceptor.clone();
        let viewport = request.viewport.unwrap_or(self.settings.viewport);
        let RenderRequest {
            source,
            format,
            full_page,
            isolated,
            viewport: requested_viewport,
        } = request;

        let outcome = self
            .with_page(isolated, move |page| {
                Box::pin(async move {
                    if let Some(requested) = requested_viewport {
                        page.set_viewport(requested).await?;
                    }

                    let mut detector = NetworkQuiescenceDetector::with_interceptor(page, interceptor);
                    match &source {
                        RenderSource::Url(url) => page.goto(url).await?,
                        RenderSource::Html(html) => page.set_content(html).await?,
                    }

                    tokio::time::timeout(idle_timeout, detector.wait_for_idle())
                        .await
                        .map_err(|_| RenderError::IdleTimeout {
                            timeout: idle_timeout,
                        })?;
                    let had_failed_requests = detector.has_failed_requests();
                    if had_failed_requests {
                        warn!(
                            target = "application::render",
                            urls = %detector.failed_request_urls().join(" "),
                            "Page loaded with failed requests"
                        );
                    }
                    detector.dispose();

                    let final_url = page.url();
                    let bytes = match format {
                        RenderFormat::Png => page.screenshot(full_page).await?,
                        RenderFormat::Pdf => page.pdf().await?,
                        RenderFormat::PrintablePdf => {
                            let png = page.screenshot(full_page).await?;
                            page.set_content(&printable_html(&png, viewport)).await?;
                            page.pdf().await?
                        }
                    };

                    Ok(RenderOutput {
                        bytes,
                        format,
                        had_failed_requests,
                        final_url,
                    })
                })
            })
            .await;

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!("renderpool_render_ms").record(elapsed_ms as f64);
        match &outcome {
            Ok(output) => info!(
                target = "application::render",
                op = "capture",
                result = "ok",
                format = ?output.format,
                bytes = output.bytes.len(),
                had_failed_requests = output.had_failed_requests,
                elapsed_ms,
                "Capture finished"
            ),
            Err(err) => warn!(
                target = "application::render",
                op = "capture",
                result = "error",
                error = %err,
                elapsed_ms,
                "Capture failed"
            ),
        }
        outcome
    }
}

/// HTML document showing `png` on one page sized to `viewport`.
pub fn printable_html(png: &[u8], viewport: Viewport) -> String {
    let width = viewport.width;
    let height = viewport.height;
    let data = STANDARD.encode(png);
    format!(
        r#"<html lang="nl">
<head>
<title></title>
<style>
@page {{ size: {width}px {height}px }}
@media print {{ body {{ width: {width}px; height: {height}px; }} }}
body {{ margin: 0; padding: 0; }}
img {{ width: 100%; height: 100%; }}
</style>
</head>
<body><img src="data:image/png;base64,{data}" alt=""/></body>
</html>
"#
    )
}
