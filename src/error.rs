use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error accepted from upstream `compute` operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Upstream failure shared by every waiter of one in-flight computation.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Key or configuration field involved (e.g., "limits.checkout.max_requests")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Component that raised the error (e.g., "admission_limiter", "redis_store")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the coordination layer.
///
/// Local, recoverable conditions (cache miss, no in-flight entry) never show up
/// here; everything that does is a decision the caller has to see.
#[derive(Debug, Error)]
pub enum Error {
    #[error("rate limit exceeded for '{limiter}': limit={limit} remaining={remaining} reset_at_ms={reset_at_ms}")]
    RateLimited {
        limiter: String,
        limit: u32,
        remaining: u32,
        reset_at_ms: u64,
    },

    #[error("in-flight request '{key}' did not settle within {timeout:?}")]
    DeduplicationTimeout { key: String, timeout: Duration },

    #[error("upstream computation failed: {0}")]
    Upstream(SharedError),

    #[error("shared store unavailable: {message}{}", format_context(.context))]
    SharedStoreUnavailable {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Wrap an upstream failure so it can be handed to several waiters.
    pub fn upstream(err: impl Into<BoxError>) -> Self {
        let boxed: BoxError = err.into();
        Error::Upstream(Arc::from(boxed))
    }

    pub fn store_unavailable_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::SharedStoreUnavailable {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::SharedStoreUnavailable { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// HTTP status a route handler should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::RateLimited { .. } => 429,
            Error::Upstream(_) => 502,
            Error::SharedStoreUnavailable { .. } => 503,
            Error::DeduplicationTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Whether a fresh attempt may succeed without caller-side changes.
    ///
    /// Rate-limit denials are excluded: the layer never retries them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DeduplicationTimeout { .. } | Error::SharedStoreUnavailable { .. }
        )
    }
}
