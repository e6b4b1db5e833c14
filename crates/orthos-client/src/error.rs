use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request to orthos failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("event stream: {0}")]
    WebSocket(String),

    #[error("unexpected response body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Daemon answered with a non-2xx status and an `ErrorResponse` body
    #[error("{code} ({status}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("event stream closed: {0}")]
    ConnectionClosed(String),
}

impl ClientError {
    /// Machine or task does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status: 404, .. })
    }

    /// Duplicate registration or a conflicting reservation
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Api { status: 409, .. })
    }

    /// Machine-readable code from the daemon, such as `VALIDATION_FAILED`
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_helpers() {
        let err = ClientError::Api {
            status: 409,
            code: "CONFLICT".to_string(),
            message: "lab-001 is reserved by bob".to_string(),
        };
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
        assert_eq!(err.code(), Some("CONFLICT"));
        assert_eq!(err.to_string(), "CONFLICT (409): lab-001 is reserved by bob");
        assert_eq!(ClientError::WebSocket("refused".into()).code(), None);
    }
}
