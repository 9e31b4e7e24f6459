use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::session::Token;

const REQUEST_ID_HEADER: &str = "X-Request-Id";

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A fully resolved request, credential already chosen.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub request_id: Uuid,
    pub method: Method,
    pub path: String,
    pub credential: Option<Token>,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// No response was obtained.
#[derive(Debug, Clone, Error)]
pub enum TransportFailure {
    #[error("request timed out: {0}")]
    TimedOut(String),
    #[error("{0}")]
    Unreachable(String),
}

impl TransportFailure {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportFailure::TimedOut(err.to_string())
        } else {
            TransportFailure::Unreachable(err.to_string())
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: OutboundRequest) -> Result<RawResponse, TransportFailure>;
}

/// HTTP transport rooted at the backend's API base URL.
pub struct ReqwestTransport {
    http: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: OutboundRequest) -> Result<RawResponse, TransportFailure> {
        let mut builder = self
            .http
            .request(request.method, self.endpoint(&request.path))
            .header(REQUEST_ID_HEADER, request.request_id.to_string());
        if let Some(credential) = &request.credential {
            builder = builder.bearer_auth(credential.expose());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let response = builder
            .send()
            .await
            .map_err(TransportFailure::from_reqwest)?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(TransportFailure::from_reqwest)?;

        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}
