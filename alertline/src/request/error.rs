use serde::Deserialize;
use thiserror::Error;

/// Uniform failure payload produced by every REST-facing call.
///
/// Whatever went wrong underneath (connection refused, DNS failure, an error status from the
/// backend) is reduced to this shape before it leaves the [`RequestClient`](super::RequestClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApiError {
    /// Human-readable description extracted from the failure
    pub message: String,
    /// HTTP status code, if a response reached us
    pub status: Option<u16>,
    /// True when no response was received at all
    pub is_network_error: bool,
    /// True when another attempt may succeed
    pub is_retryable: bool,
}

impl ApiError {
    /// The request never produced a response. Always retryable.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            is_network_error: true,
            is_retryable: true,
        }
    }

    /// The backend answered with a non-success status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            is_network_error: false,
            is_retryable: is_retryable_status(status),
        }
    }

    /// A response arrived but its body was not what we expected.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            is_network_error: false,
            is_retryable: false,
        }
    }

    /// The request could not be built (bad URL, unserialisable body).
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::invalid_response(message)
    }

    /// Classify a `reqwest` failure that happened before any response was received.
    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_builder() {
            return Self::invalid_request(format!("Invalid request: {error}"));
        }
        if let Some(status) = error.status() {
            return Self::http(status.as_u16(), error.to_string());
        }
        Self::network(format!("Network error: {error}"))
    }

    /// Classify a non-success response, consuming its body for the error message.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let status_text = status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        let body = response.text().await.unwrap_or_default();

        Self::http(status.as_u16(), extract_error_message(&body, &status_text))
    }

    /// Category used to pick the user-facing sentence.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::of(self)
    }

    /// Fixed user-facing sentence for this failure.
    pub fn user_message(&self) -> &'static str {
        self.category().user_message()
    }
}

/// Statuses worth another attempt: request-timeout, too-many-requests and the 5xx family.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Validation(Vec<ValidationIssue>),
    Message(String),
}

#[derive(Debug, Deserialize)]
struct ValidationIssue {
    #[serde(default)]
    loc: Vec<serde_json::Value>,
    msg: String,
}

impl ValidationIssue {
    fn field(&self) -> Option<String> {
        self.loc.last().map(|segment| match segment {
            serde_json::Value::String(name) => name.clone(),
            other => other.to_string(),
        })
    }
}

/// Pull the most useful message out of an error response body.
///
/// Preference order: validation issue list (`field: message` pairs joined by `; `), then a
/// single `detail` string, then the transport status text.
pub fn extract_error_message(body: &str, status_text: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) else {
        return status_text.to_string();
    };

    match parsed.detail {
        Some(ErrorDetail::Validation(issues)) if !issues.is_empty() => issues
            .iter()
            .map(|issue| match issue.field() {
                Some(field) => format!("{field}: {}", issue.msg),
                None => issue.msg.clone(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        Some(ErrorDetail::Message(detail)) if !detail.trim().is_empty() => detail,
        _ => status_text.to_string(),
    }
}

/// User-facing failure category. Every [`ApiError`] maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Unauthorized,
    Forbidden,
    NotFound,
    Timeout,
    RateLimited,
    Server,
    Generic,
}

impl ErrorCategory {
    pub fn of(error: &ApiError) -> Self {
        if error.is_network_error {
            return Self::Network;
        }

        match error.status {
            Some(401) => Self::Unauthorized,
            Some(403) => Self::Forbidden,
            Some(404) => Self::NotFound,
            Some(408) => Self::Timeout,
            Some(429) => Self::RateLimited,
            Some(500..=599) => Self::Server,
            _ => Self::Generic,
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::Network => {
                "Unable to reach the server. Please check your connection and try again."
            }
            Self::Unauthorized => "Your session has expired. Please sign in again.",
            Self::Forbidden => "You do not have permission to perform this action.",
            Self::NotFound => "Resource not found. It may have been removed.",
            Self::Timeout => "The request timed out. Please try again.",
            Self::RateLimited => "Too many requests. Please wait a moment and try again.",
            Self::Server => "The server encountered an error. Please try again later.",
            Self::Generic => "Something went wrong. Please try again.",
        }
    }
}
