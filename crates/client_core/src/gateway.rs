use std::sync::{Arc, Mutex, PoisonError};

use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::error::ApiError;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    navigation::{is_auth_surface, Navigator, RedirectReason},
    session::{SessionStore, Token},
    transport::{OutboundRequest, RawResponse, RequestBody, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthRejected,
    NetworkUnreachable,
    ServerError,
    ValidationRejected,
    InvalidResponse,
    InvalidRequest,
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("credential rejected by server (status {status})")]
    AuthRejected { status: u16, detail: Option<String> },
    #[error("backend unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("server error {status}: {detail}")]
    ServerError { status: u16, detail: String },
    #[error("request rejected ({status}): {detail}")]
    ValidationRejected { status: u16, detail: String },
    #[error("unexpected response body: {0}")]
    InvalidResponse(String),
    #[error("could not encode request body: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::AuthRejected { .. } => ErrorKind::AuthRejected,
            GatewayError::NetworkUnreachable(_) => ErrorKind::NetworkUnreachable,
            GatewayError::ServerError { .. } => ErrorKind::ServerError,
            GatewayError::ValidationRejected { .. } => ErrorKind::ValidationRejected,
            GatewayError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            GatewayError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn is_auth_rejected(&self) -> bool {
        self.kind() == ErrorKind::AuthRejected
    }

    /// Server-provided message suitable for display, when there is one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            GatewayError::AuthRejected { detail, .. } => detail.as_deref(),
            GatewayError::ServerError { detail, .. }
            | GatewayError::ValidationRejected { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

/// Which credential a request carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// Whatever the session holds when the request leaves.
    Session,
    Explicit(Token),
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
    pub authorization: Authorization,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            authorization: Authorization::Session,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, GatewayError> {
        let value =
            serde_json::to_value(body).map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn with_form<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = RequestBody::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_bearer(mut self, token: Token) -> Self {
        self.authorization = Authorization::Explicit(token);
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.authorization = Authorization::Anonymous;
        self
    }
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl GatewayResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        serde_json::from_slice(&self.body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

/// Single funnel for backend calls.
///
/// Stamps each request with the session credential at send time and turns a
/// 401/403 answer into a forced session invalidation before the caller sees
/// the failure.
pub struct RequestGateway {
    transport: Arc<dyn Transport>,
    session: Arc<SessionStore>,
    navigator: Arc<dyn Navigator>,
    redirected_generation: Mutex<Option<u64>>,
}

impl RequestGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<SessionStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            transport,
            session,
            navigator,
            redirected_generation: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub async fn send(&self, spec: RequestSpec) -> Result<GatewayResponse, GatewayError> {
        let credential = match spec.authorization {
            Authorization::Session => self.session.current_credential(),
            Authorization::Explicit(token) => Some(token),
            Authorization::Anonymous => None,
        };
        let request_id = Uuid::new_v4();
        let method = spec.method;
        let path = spec.path;
        debug!(
            %request_id,
            %method,
            %path,
            has_credential = credential.is_some(),
            "sending request"
        );

        let outcome = self
            .transport
            .execute(OutboundRequest {
                request_id,
                method: method.clone(),
                path: path.clone(),
                credential: credential.clone(),
                body: spec.body,
            })
            .await;

        let response = match outcome {
            Ok(response) => response,
            Err(failure) => {
                warn!(%request_id, %method, %path, error = %failure, "request failed without a response");
                return Err(GatewayError::NetworkUnreachable(failure.to_string()));
            }
        };
        debug!(%request_id, status = response.status, "response received");

        let classified = classify(response);
        if let Err(err @ GatewayError::AuthRejected { .. }) = &classified {
            warn!(%request_id, %method, %path, error = %err, "credential rejected");
            self.invalidate(credential.as_ref());
        }
        classified
    }

    pub async fn send_json<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T, GatewayError> {
        self.send(spec).await?.json()
    }

    fn invalidate(&self, rejected: Option<&Token>) {
        let Some(generation) = self.session.logout_if_current(rejected) else {
            debug!("rejected credential is no longer the session credential; keeping session");
            return;
        };
        if rejected.is_some() {
            warn!("session invalidated after credential rejection");
        }

        let path = self.navigator.current_path();
        if is_auth_surface(&path) {
            debug!(%path, "already on an authentication surface; not redirecting");
            return;
        }

        {
            let mut redirected = self
                .redirected_generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *redirected == Some(generation) {
                return;
            }
            *redirected = Some(generation);
        }
        self.navigator
            .redirect_to_login(RedirectReason::SessionExpired);
    }
}

fn classify(response: RawResponse) -> Result<GatewayResponse, GatewayError> {
    let RawResponse { status, body } = response;
    if (200..300).contains(&status) {
        return Ok(GatewayResponse { status, body });
    }

    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("unexpected status");
    let error = ApiError::from_response(status, &body, reason);

    Err(match status {
        401 | 403 => GatewayError::AuthRejected {
            status,
            detail: Some(error.detail),
        },
        400..=499 => GatewayError::ValidationRejected {
            status,
            detail: error.detail,
        },
        _ => GatewayError::ServerError {
            status,
            detail: error.detail,
        },
    })
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
