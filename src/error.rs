//! Error types and handling for the PDF workbench engine.

use std::io;
use std::result::Result as StdResult;

use thiserror::Error;

/// Custom result type for workbench operations
pub type Result<T> = StdResult<T, Error>;

/// Core error type for workbench operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// -------------------- Sub-Error Categories --------------------

/// Credential and authorization failures. Messages never reveal whether a
/// resource exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    #[error("authentication required")]
    MissingToken,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("admin privileges required")]
    InsufficientRole,

    #[error("access denied")]
    PathNotAllowed,
}

impl AuthError {
    /// HTTP status for this failure.
    pub fn status(&self) -> u16 {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken => 401,
            AuthError::InsufficientRole | AuthError::PathNotAllowed => 403,
        }
    }

    /// Stable denial reason recorded in the security log.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidToken => "invalid_token",
            AuthError::InsufficientRole => "insufficient_role",
            AuthError::PathNotAllowed => "invalid_path",
        }
    }
}

/// Request-shape failures, rejected before any side effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("invalid case ID")]
    InvalidCaseId(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NotFoundError {
    #[error("font not found")]
    Font(String),

    #[error("template not found: {0}")]
    Template(String),

    #[error("draft not found: {0}")]
    Draft(String),

    #[error("artifact not found: {0}")]
    Artifact(String),
}

/// PDF parse/fill/flatten failures. Nothing is persisted on this path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProcessingError {
    #[error("malformed PDF: {0}")]
    MalformedPdf(String),

    #[error("form fill failed: {0}")]
    FillFailed(String),

    #[error("flatten failed: {0}")]
    FlattenFailed(String),

    #[error("masking fault: {0}")]
    MaskingFault(String),
}

impl From<lopdf::Error> for ProcessingError {
    fn from(err: lopdf::Error) -> Self {
        ProcessingError::MalformedPdf(err.to_string())
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("version allocation contention for {case_id}/{template_id}")]
    VersionContention {
        case_id: String,
        template_id: String,
    },

    #[error("artifact store error: {0}")]
    Artifact(String),
}

impl Error {
    /// HTTP status code this error maps to at the API boundary.
    pub fn status(&self) -> u16 {
        match self {
            Error::Auth(e) => e.status(),
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::Processing(_) | Error::Storage(_) | Error::Config(_) | Error::Io(_) => 500,
        }
    }
}
