use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Main error type for the federation engine
#[derive(Debug, Clone, Error)]
pub enum FedError {
    #[error("{0}")]
    Endpoint(#[from] EndpointError),

    #[error("Query timed out: {0}")]
    Timeout(String),

    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("Internal scheduling error: {0}")]
    InternalScheduling(String),

    #[error("Query {0} was aborted")]
    Aborted(u64),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Endpoint-sourced errors
#[derive(Debug, Clone, Error)]
pub enum EndpointError {
    #[error("@ {endpoint_id} - {message}")]
    RemoteEvaluation {
        endpoint_id: String,
        http_status: Option<String>,
        message: String,
    },

    #[error("@ {endpoint_id} - Connection failed: {message}")]
    Connection { endpoint_id: String, message: String },

    #[error("@ {endpoint_id} - Unsupported operation: {operation}")]
    Unsupported { endpoint_id: String, operation: String },

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

impl FedError {
    /// True for transient network faults that warrant a connection repair
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, FedError::Endpoint(EndpointError::Connection { .. }))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FedError::Timeout(_))
    }

    /// Endpoint the error is attributed to, if any
    pub fn endpoint_id(&self) -> Option<&str> {
        match self {
            FedError::Endpoint(EndpointError::RemoteEvaluation { endpoint_id, .. })
            | FedError::Endpoint(EndpointError::Connection { endpoint_id, .. })
            | FedError::Endpoint(EndpointError::Unsupported { endpoint_id, .. }) => Some(endpoint_id),
            FedError::Endpoint(EndpointError::UnknownEndpoint(id)) => Some(id),
            _ => None,
        }
    }
}

fn title_pattern() -> &'static Regex {
    static TITLE: OnceLock<Regex> = OnceLock::new();
    TITLE.get_or_init(|| Regex::new(r"(?s).*<title>(.*)</title>.*").expect("valid title regex"))
}

/// Extract the content of an HTML `<title>` element from an error page
pub fn extract_http_title(raw: &str) -> Option<String> {
    title_pattern()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Build a `RemoteEvaluation` error from a raw remote failure body.
///
/// Error pages carrying a `<title>` are reduced to `HTTP Error: <title>`
/// and the title is kept as the heuristic HTTP status.
pub fn remote_evaluation_error(endpoint_id: &str, raw: &str, additional_info: &str) -> FedError {
    let http_status = extract_http_title(raw);
    let base = match &http_status {
        Some(title) => format!("HTTP Error: {}", title),
        None => raw.trim().to_string(),
    };
    let message = if additional_info.is_empty() {
        base
    } else {
        format!("{}. {}", base, additional_info)
    };

    EndpointError::RemoteEvaluation {
        endpoint_id: endpoint_id.to_string(),
        http_status,
        message,
    }
    .into()
}

pub fn connection_error(endpoint_id: &str, message: impl Into<String>) -> FedError {
    EndpointError::Connection {
        endpoint_id: endpoint_id.to_string(),
        message: message.into(),
    }
    .into()
}

/// Result type alias for federation operations
pub type FedResult<T> = Result<T, FedError>;
