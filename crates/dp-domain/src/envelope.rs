//! The uniform response envelope used by every external contract.

use serde::Serialize;

use crate::error::{Disposition, Error};

/// `{success, data?, error?}` — the shape every HTTP response takes.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(err: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError::from_error(err)),
        }
    }
}

impl ApiError {
    /// User-facing payload: the model-facing message plus a disposition
    /// hint. Redaction has already happened by the time an error is
    /// constructed (credentials never enter messages).
    pub fn from_error(err: &Error) -> Self {
        let disposition = match err.disposition() {
            Disposition::Retryable => "retryable",
            Disposition::NeedsConfig => "needs_config",
            Disposition::Unrecoverable => "unrecoverable",
        };
        Self {
            code: err.kind().to_string(),
            message: crate::redact::redact(&err.to_string()),
            details: Some(serde_json::json!({ "disposition": disposition })),
        }
    }
}
