use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("invalid year: {0}")]
    InvalidYear(String),

    #[error("invalid quarter: {0} (expected 1..=4)")]
    InvalidQuarter(String),

    #[error("invalid dataset: {0}")]
    InvalidDataset(String),

    #[error("invalid year range: {start}..={end}")]
    InvalidRange { start: i32, end: i32 },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    ConfigValue(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("form returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("{stage} failed after {attempts} attempts: {last}")]
    DownloadExhausted {
        stage: &'static str,
        attempts: u32,
        last: String,
    },

    #[error("did not receive the download form; page saved to {0}")]
    #[diagnostic(help("the page layout changed or the session was rejected"))]
    NotAForm(PathBuf),

    #[error("failed to parse form page: {0}")]
    PageParse(String),

    #[error("missing hidden form field: {0}")]
    MissingHiddenField(String),

    #[error("expected a ZIP archive, got Content-Type={content_type}")]
    UnexpectedContentType { content_type: String },

    #[error("{what} {value} is not offered by the download form (have: {available})")]
    NotOffered {
        what: &'static str,
        value: String,
        available: String,
    },

    #[error("per-unit deadline ({limit_secs}s) exceeded")]
    #[diagnostic(help("the unit is still pending and will be retried on the next pass"))]
    DeadlineExceeded { limit_secs: u64 },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("transform failed for {path}: {message}")]
    Transform { path: String, message: String },

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("object already exists: {container}/{path}")]
    AlreadyExists { container: String, path: String },

    #[error("object not found: {container}/{path}")]
    ObjectNotFound { container: String, path: String },

    #[error("manifest error: {0}")]
    Manifest(String),
}
