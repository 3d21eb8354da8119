use thiserror::Error;

/// Failures surfaced at the ingestion, query and listing entry points.
///
/// Storage internals work in `anyhow::Result` and are wrapped into
/// [`ServiceError::Storage`] when they cross the boundary.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("Uploaded CSV file is empty.")]
    EmptyFile,

    #[error("Could not parse CSV file: {0}")]
    Parse(String),

    #[error("Could not decode CSV file. Ensure it's UTF-8 encoded. ({0})")]
    Decode(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ServiceError {
    /// True for failures caused by the caller's input rather than the service.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ServiceError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
