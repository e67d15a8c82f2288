//! Error taxonomy shared by every component of the intake pipeline.
use std::convert::Infallible;

#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(
        "document {document_id} was modified concurrently: expected version {expected}, found {actual}"
    )]
    ConcurrentModification {
        document_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unsupported file type: {0}")]
    InvalidType(String),
    #[error("file {name} is {size} bytes, the limit is {limit}")]
    FileTooLarge { name: String, size: u64, limit: u64 },
    #[error("approval blocked: {0}")]
    DuplicateDecisionRequired(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Machine readable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ValidationError,
    ResourceNotFound,
    PermissionDenied,
    ConcurrentModification,
    InvalidState,
    InvalidType,
    FileTooLarge,
    DuplicateDecisionRequired,
    StorageError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ConcurrentModification => "CONCURRENT_MODIFICATION",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::InvalidType => "INVALID_TYPE",
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::DuplicateDecisionRequired => "DUPLICATE_DECISION_REQUIRED",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DocumentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DocumentError::Validation(_) => ErrorCode::ValidationError,
            DocumentError::NotFound { .. } => ErrorCode::ResourceNotFound,
            DocumentError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            DocumentError::ConcurrentModification { .. } => ErrorCode::ConcurrentModification,
            DocumentError::InvalidState(_) => ErrorCode::InvalidState,
            DocumentError::InvalidType(_) => ErrorCode::InvalidType,
            DocumentError::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            DocumentError::DuplicateDecisionRequired(_) => ErrorCode::DuplicateDecisionRequired,
            DocumentError::Storage(_) => ErrorCode::StorageError,
            DocumentError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the caller can succeed by retrying after refetching or acting on the reason.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DocumentError::ConcurrentModification { .. }
                | DocumentError::DuplicateDecisionRequired(_)
                | DocumentError::Storage(_)
        )
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        DocumentError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<sled::Error> for DocumentError {
    fn from(value: sled::Error) -> Self {
        DocumentError::Storage(value.to_string())
    }
}

impl From<minicbor::decode::Error> for DocumentError {
    fn from(value: minicbor::decode::Error) -> Self {
        DocumentError::Internal(format!("corrupt record: {value}"))
    }
}

impl From<minicbor::encode::Error<Infallible>> for DocumentError {
    fn from(value: minicbor::encode::Error<Infallible>) -> Self {
        DocumentError::Internal(format!("failed to encode record: {value}"))
    }
}
