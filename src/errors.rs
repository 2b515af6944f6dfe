//! Error types for the RAG core.
//!
//! Upstream failures are split into transient (retried with backoff) and
//! permanent (failed immediately, with a fallback where the pipeline has
//! one). Tenant-scope violations fail closed.

use thiserror::Error;

/// Main error type for the RAG core.
#[derive(Error, Debug)]
pub enum RagError {
    /// Retryable upstream failure: 429, 5xx, or a timed-out request.
    #[error("transient upstream failure (status {status:?}): {message}")]
    TransientUpstream {
        status: Option<u16>,
        message: String,
    },

    /// Non-retryable upstream failure: 4xx other than 429.
    #[error("permanent upstream failure (status {status}): {message}")]
    PermanentUpstream { status: u16, message: String },

    /// Structured output did not match the expected schema.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Embedding generation failed during ingestion.
    #[error("embedding failed: {0}")]
    EmbedFailure(String),

    /// An index write failed; the job must fail and indices stay consistent.
    #[error("index write failed: {0}")]
    IndexWrite(String),

    /// A data-plane operation was attempted without a valid tenant scope.
    /// Fail-closed: callers get empty results, never cross-tenant data.
    #[error("tenant scope violation: {0}")]
    TenantScope(String),

    /// Upstream quota exhausted; surfaced to the caller verbatim.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The client disconnected mid-stream.
    #[error("cancelled by client")]
    Cancelled,

    /// A deadline expired.
    #[error("operation timed out after {secs}s")]
    Timeout { secs: u64 },

    /// HTTP client errors.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization errors.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant failures.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for RAG core operations.
pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    /// Whether the retry policy may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        match self {
            RagError::TransientUpstream { .. } | RagError::Timeout { .. } => true,
            RagError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Classify an upstream HTTP status. 429 and 5xx are transient, other
    /// 4xx are permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || status >= 500 {
            RagError::TransientUpstream {
                status: Some(status),
                message,
            }
        } else {
            RagError::PermanentUpstream { status, message }
        }
    }

    /// Sanitised class name for caller-facing error reporting. Upstream
    /// details stay in the logs, keyed by correlation id.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::TransientUpstream { .. } => "transient_upstream",
            RagError::PermanentUpstream { .. } => "permanent_upstream",
            RagError::SchemaViolation(_) => "schema_violation",
            RagError::EmbedFailure(_) => "embed_failure",
            RagError::IndexWrite(_) => "index_write",
            RagError::TenantScope(_) => "tenant_scope",
            RagError::QuotaExceeded(_) => "quota_exceeded",
            RagError::Cancelled => "cancelled",
            RagError::Timeout { .. } => "timeout",
            RagError::Http(_) => "http",
            RagError::Json(_) => "serialization",
            RagError::Io(_) => "io",
            RagError::Config(_) => "config",
            RagError::Internal(_) => "internal",
        }
    }
}
