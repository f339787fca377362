use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Problems with settings or inputs, reported before any PDF is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("batch size must be at least 1 (got {0})")]
    InvalidBatchSize(i64),

    #[error("{var} must be a whole number (got {value:?})")]
    InvalidEnv { var: &'static str, value: String },

    #[error("no API key: pass --api-key or set {env_var}")]
    MissingCredential { env_var: &'static str },

    #[error("input list not readable: {path}: {source}")]
    InputList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no valid PDF files to process")]
    NoInputs,

    #[error("config file error: {0}")]
    ConfigFile(String),
}

/// A PDF that could not be turned into raw fields.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("{path}: file not found")]
    NotFound { path: PathBuf },

    #[error("{path}: cannot open PDF: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("{path}: document is encrypted")]
    Encrypted { path: PathBuf },

    #[error("{path}: no AcroForm in document")]
    NoAcroForm { path: PathBuf },
}

impl ExtractionError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ExtractionError::NotFound { path }
            | ExtractionError::Open { path, .. }
            | ExtractionError::Encrypted { path }
            | ExtractionError::NoAcroForm { path } => path,
        }
    }
}

/// Failures talking to the reasoning service.
#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("batch {batch} failed after {attempts} attempts: {last}")]
    Exhausted {
        batch: usize,
        attempts: u32,
        #[source]
        last: Box<ReasoningError>,
    },
}

impl ReasoningError {
    /// Whether another attempt might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ReasoningError::Transport(_)
            | ReasoningError::Timeout
            | ReasoningError::RateLimited { .. }
            | ReasoningError::MalformedResponse(_) => true,
            ReasoningError::Status { status, .. } => *status >= 500,
            ReasoningError::Exhausted { .. } => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ReasoningError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ReasoningError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ReasoningError::Timeout
        } else {
            ReasoningError::Transport(e.to_string())
        }
    }
}

/// One malformed entry in a service response. Never fatal.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("entry `{id}` is not an object")]
    NotAnObject { id: String },

    #[error("entry `{id}` is missing `{key}`")]
    MissingKey { id: String, key: &'static str },

    #[error("entry `{id}` has invalid `{key}`: {reason}")]
    InvalidValue {
        id: String,
        key: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum FormfuseError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Reasoning(#[from] ReasoningError),

    #[error("cannot write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize output: {0}")]
    Serialize(#[from] serde_json::Error),
}
