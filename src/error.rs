use thiserror::Error;

/// Failure reported by one of the backend collaborators.
///
/// `Display` renders only the message so the dispatcher can show it verbatim
/// in the status line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Internal(String),
    /// Transport or protocol failure talking to the backend.
    #[error("{0}")]
    Unavailable(String),
}

impl ServiceError {
    /// Maps a callable-function status code to the matching variant.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code.to_ascii_uppercase().replace('-', "_").as_str() {
            "UNAUTHENTICATED" => Self::Unauthenticated(message),
            "INVALID_ARGUMENT" => Self::InvalidArgument(message),
            "NOT_FOUND" => Self::NotFound(message),
            "PERMISSION_DENIED" => Self::PermissionDenied(message),
            "UNAVAILABLE" => Self::Unavailable(message),
            _ => Self::Internal(message),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::Internal(_) => "INTERNAL",
            Self::Unavailable(_) => "UNAVAILABLE",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Unauthenticated(m)
            | Self::InvalidArgument(m)
            | Self::NotFound(m)
            | Self::PermissionDenied(m)
            | Self::Internal(m)
            | Self::Unavailable(m) => m,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(value: reqwest::Error) -> Self {
        Self::Unavailable(value.to_string())
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(value: std::io::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
