use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};

use crate::types::ErrorResponse;

const BLOCKED_SUGGESTION: &str =
    "The site appears to be blocking requests from this server. Try again later or route the service through a VPN/proxy in a different region.";

/// Failure reported by a site adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Upstream refused the request (geo-restriction, bot wall, ...).
    #[error("blocked: {message}")]
    Blocked {
        message: String,
        details: Option<Value>,
    },

    #[error("{0}")]
    Failed(String),
}

impl AdapterError {
    pub fn blocked(message: impl Into<String>, details: Option<Value>) -> Self {
        AdapterError::Blocked {
            message: message.into(),
            details,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, AdapterError::Blocked { .. })
    }
}

/// Errors produced at the search/details gateway boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("site not found: {site}")]
    NotFound {
        site: String,
        available_sites: Vec<String>,
    },

    #[error("site disabled: {0}")]
    Disabled(String),

    #[error("blocked by {site}: {message}")]
    Blocked {
        site: String,
        message: String,
        details: Option<Value>,
    },

    #[error("{context}: {message}")]
    Upstream { context: String, message: String },
}

impl ApiError {
    /// Reclassify an adapter failure. `context` names the failed operation.
    pub fn from_adapter(site: &str, context: &str, err: AdapterError) -> Self {
        match err {
            AdapterError::Blocked { message, details } => ApiError::Blocked {
                site: site.to_string(),
                message,
                details,
            },
            AdapterError::Failed(message) => ApiError::Upstream {
                context: context.to_string(),
                message,
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::Disabled(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Blocked { .. } => StatusCode::FORBIDDEN,
            ApiError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Validation(message) => json!({ "error": message }),
            ApiError::NotFound {
                available_sites, ..
            } => json!({
                "error": "Site not found",
                "availableSites": available_sites,
            }),
            ApiError::Disabled(site) => json!({
                "error": "Site is disabled",
                "message": format!("The site '{}' is currently disabled", site),
            }),
            ApiError::Blocked {
                site,
                message,
                details,
            } => json!({
                "error": format!("Access to {} is blocked", site),
                "message": message,
                "suggestion": BLOCKED_SUGGESTION,
                "details": details,
            }),
            ApiError::Upstream { context, message } => json!({
                "error": context,
                "message": message,
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// Rejection from the thumbnail proxy pipeline. Display strings are the
/// client-facing messages and carry no internal detail.
#[derive(Debug, thiserror::Error)]
pub enum ProxyRejection {
    #[error("URL parameter is required")]
    MissingUrl,

    #[error("Invalid URL")]
    InvalidUrl,

    #[error("Only HTTPS URLs are allowed")]
    InsecureScheme,

    #[error("Access to private addresses is not allowed")]
    PrivateAddress,

    #[error("Domain not allowed")]
    DomainNotAllowed,

    #[error("Failed to fetch image")]
    UpstreamStatus(u16),

    #[error("URL does not point to an image")]
    NotAnImage,

    #[error("Failed to proxy image")]
    Internal,
}

impl ProxyRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyRejection::MissingUrl | ProxyRejection::InvalidUrl | ProxyRejection::NotAnImage => {
                StatusCode::BAD_REQUEST
            }
            ProxyRejection::InsecureScheme
            | ProxyRejection::PrivateAddress
            | ProxyRejection::DomainNotAllowed => StatusCode::FORBIDDEN,
            ProxyRejection::UpstreamStatus(code) => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyRejection::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyRejection {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Snapshot persistence failure. Never leaves the cache module.
#[derive(Debug, thiserror::Error)]
pub enum CacheIoError {
    #[error("cache snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache snapshot is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}
