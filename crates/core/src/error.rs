//! Error types for the UMS core.
//!
//! Generation, validation and diffing never fail with these errors; they return result records
//! carrying their own success flags. `CoreError` covers input rejected at the edges: override
//! store writes and configuration parsing.

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("edit note must be at least {min} characters (got {actual})")]
    NoteTooShort { min: usize, actual: usize },

    #[error("unsupported SQL dialect: {0}")]
    UnsupportedDialect(String),

    #[error("unknown output format: {0}")]
    UnknownFormat(String),

    #[error("unknown change type: {0}")]
    UnknownChangeType(String),

    #[error("measure model error: {0}")]
    Ums(#[from] ums::UmsError),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
