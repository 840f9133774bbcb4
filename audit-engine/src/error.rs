use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit chain integrity check failed at sequence {sequence}: {reason}")]
    IntegrityCheckError { sequence: u64, reason: String },

    #[error("Audit export failed: {0}")]
    ExportError(String),

    #[error("Audit serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Audit I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AuditError>;
