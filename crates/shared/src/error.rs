use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            429 => ErrorCode::RateLimited,
            400..=499 => ErrorCode::Validation,
            _ => ErrorCode::Internal,
        }
    }
}

/// Error body decoded from a non-success backend response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {detail}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// Builds an error from a status code and raw body, falling back to
    /// `fallback` when the body carries nothing readable.
    pub fn from_response(status: u16, body: &[u8], fallback: &str) -> Self {
        let detail = extract_detail(body).unwrap_or_else(|| fallback.to_string());
        Self::new(ErrorCode::from_status(status), detail)
    }
}

/// Pulls the human-readable `detail` out of an error body.
///
/// Accepts `{"detail": "..."}`, the list form produced by request validation
/// (`{"detail": [{"msg": "..."}, ...]}`), or plain text.
pub fn extract_detail(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("detail") {
            Some(Value::String(detail)) => non_blank(detail),
            Some(Value::Array(items)) => {
                let messages: Vec<&str> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(Value::as_str))
                    .collect();
                if messages.is_empty() {
                    None
                } else {
                    Some(messages.join("; "))
                }
            }
            Some(other) => Some(other.to_string()),
            None => map
                .get("message")
                .and_then(Value::as_str)
                .and_then(non_blank),
        },
        Ok(Value::String(text)) => non_blank(&text),
        Ok(_) => None,
        Err(_) => std::str::from_utf8(body).ok().and_then(non_blank),
    }
}

fn non_blank(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
