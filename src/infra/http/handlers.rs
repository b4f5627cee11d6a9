//! Render endpoints.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::application::error::HttpError;
use crate::application::render::{RenderFormat, RenderRequest, RenderSource};
use crate::domain::viewport::Viewport;
use crate::pool::ResolverSnapshot;

use super::HttpState;

pub const FAILED_REQUESTS_HEADER: &str = "x-renderpool-failed-requests";

const SOURCE: &str = "infra::http::handlers";

/// Body of `POST /render`. Exactly one of `url` and `html` must be set.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderBody {
    pub url: Option<String>,
    pub html: Option<String>,
    #[serde(default)]
    pub format: RenderFormat,
    #[serde(default = "default_full_page")]
    pub full_page: bool,
    #[serde(default)]
    pub isolated: bool,
    pub viewport: Option<Viewport>,
}

fn default_full_page() -> bool {
    true
}

impl RenderBody {
    fn into_request(self) -> Result<RenderRequest, HttpError> {
        let source = match (self.url, self.html) {
            (Some(url), None) => RenderSource::Url(url),
            (None, Some(html)) => RenderSource::Html(html),
            _ => {
                return Err(HttpError::new(
                    SOURCE,
                    StatusCode::BAD_REQUEST,
                    "exactly one of `url` and `html` is required",
                    "render body carried no source or both sources",
                ));
            }
        };
        Ok(RenderRequest {
            source,
            format: self.format,
            full_page: self.full_page,
            isolated: self.isolated,
            viewport: self.viewport,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct PoolView {
    pub resolvers: Vec<ResolverSnapshot>,
}

pub async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn pool(State(state): State<HttpState>) -> Json<PoolView> {
    Json(PoolView {
        resolvers: state.render.registry().snapshot(),
    })
}

pub async fn render(
    State(state): State<HttpState>,
    body: Result<Json<RenderBody>, JsonRejection>,
) -> Result<Response, HttpError> {
    let Json(body) = body.map_err(|rejection| {
        HttpError::new(
            SOURCE,
            rejection.status(),
            rejection.body_text(),
            rejection.body_text(),
        )
    })?;
    let request = body.into_request()?;
    let output = state.render.capture(request).await?;

    let mut response = Bytes::from(output.bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(output.format.content_type()),
    );
    headers.insert(
        FAILED_REQUESTS_HEADER,
        HeaderValue::from_static(if output.had_failed_requests {
            "true"
        } else {
            "false"
        }),
    );
    Ok(response)
}
