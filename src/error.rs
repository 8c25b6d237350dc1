use thiserror::Error;

/// Error kinds surfaced by every platform operation and command handler.
#[derive(Debug, Error)]
pub enum PrError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("platform unavailable: {0}")]
    PlatformUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    AuthRequired,
    PermissionDenied,
    NotFound,
    Conflict,
    RateLimited,
    PlatformUnavailable,
    Internal,
}

impl PrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PrError::InvalidInput(_) => ErrorKind::InvalidInput,
            PrError::AuthRequired(_) => ErrorKind::AuthRequired,
            PrError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            PrError::NotFound(_) => ErrorKind::NotFound,
            PrError::Conflict(_) => ErrorKind::Conflict,
            PrError::RateLimited(_) => ErrorKind::RateLimited,
            PrError::PlatformUnavailable(_) => ErrorKind::PlatformUnavailable,
            PrError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The bare message without the kind prefix, suitable for a summary line.
    pub fn rationale(&self) -> &str {
        match self {
            PrError::InvalidInput(m)
            | PrError::AuthRequired(m)
            | PrError::PermissionDenied(m)
            | PrError::NotFound(m)
            | PrError::Conflict(m)
            | PrError::RateLimited(m)
            | PrError::PlatformUnavailable(m)
            | PrError::Internal(m) => m,
        }
    }

    /// Errors that end the invocation instead of just the current command.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PlatformUnavailable | ErrorKind::Internal
        )
    }

    /// Map an HTTP status and response body to an error kind.
    pub fn from_status(status: u16, operation: &str, body: &str) -> Self {
        let detail = format!("{operation} failed ({status}): {}", truncate(body, 300));
        let lower = body.to_ascii_lowercase();
        match status {
            401 => PrError::AuthRequired(detail),
            403 if lower.contains("rate limit") => PrError::RateLimited(detail),
            429 => PrError::RateLimited(detail),
            403 => PrError::PermissionDenied(detail),
            404 => PrError::NotFound(detail),
            405 | 406 | 409 => PrError::Conflict(detail),
            400 | 422 if lower.contains("already exists") || lower.contains("merge conflict") => {
                PrError::Conflict(detail)
            }
            400 | 422 => PrError::InvalidInput(detail),
            s if s >= 500 => PrError::PlatformUnavailable(detail),
            _ => PrError::Internal(detail),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl From<std::io::Error> for PrError {
    fn from(e: std::io::Error) -> Self {
        PrError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for PrError {
    fn from(e: serde_json::Error) -> Self {
        PrError::Internal(format!("malformed payload: {e}"))
    }
}

impl From<git2::Error> for PrError {
    fn from(e: git2::Error) -> Self {
        PrError::Internal(format!("git: {}", e.message()))
    }
}

pub type Result<T> = std::result::Result<T, PrError>;
