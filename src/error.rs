use crate::pipeline::StageError;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "rate_limiter.rps", "pipeline.stages[1].concurrency")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "permit_pool", "keyed_lock")
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

/// Unified error type for the synchronization layer.
///
/// Errors produced by caller-supplied operations are never folded into this
/// type; see [`CallError`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Cancelled while waiting{}", format_context(.context))]
    Cancelled { context: ErrorContext },

    #[error("Circuit breaker open{}", .retry_after_ms.map(|ms| format!(" (retry in {}ms)", ms)).unwrap_or_default())]
    CircuitOpen { retry_after_ms: Option<u64> },

    #[error("Lock misuse: key {key} is not held")]
    LockMisuse { key: String },

    #[error("Stage failure: {0}")]
    Stage(#[from] StageError),

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
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
    /// Cancellation observed by the named primitive.
    pub fn cancelled(source: impl Into<String>) -> Self {
        Error::Cancelled {
            context: ErrorContext::new().with_source(source),
        }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    /// Whether the caller may reasonably try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::CircuitOpen { .. })
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Cancelled { context }
            | Error::Configuration { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Outcome of a guarded call: either the guard refused to run the operation,
/// or the operation ran and returned its own error.
#[derive(Debug)]
pub enum CallError<E> {
    /// Rejected by the synchronization layer (`CircuitOpen`, `Cancelled`, ...).
    Rejected(Error),
    /// The wrapped operation failed; the error is passed through unchanged.
    Operation(E),
}

impl<E> CallError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }

    pub fn operation(self) -> Option<E> {
        match self {
            CallError::Operation(e) => Some(e),
            CallError::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Error> {
        match self {
            CallError::Rejected(e) => Some(e),
            CallError::Operation(_) => None,
        }
    }
}

impl<E> From<Error> for CallError<E> {
    fn from(e: Error) -> Self {
        CallError::Rejected(e)
    }
}

impl<E: std::fmt::Display> std::fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Rejected(e) => write!(f, "{}", e),
            CallError::Operation(e) => write!(f, "{}", e),
        }
    }
}

impl<E> std::error::Error for CallError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Rejected(e) => Some(e),
            CallError::Operation(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_display_includes_source() {
        let err = Error::cancelled("permit_pool");
        assert!(err.is_cancelled());
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Cancelled while waiting (source: permit_pool)"
        );
    }

    #[test]
    fn test_circuit_open_display() {
        let err = Error::CircuitOpen {
            retry_after_ms: Some(250),
        };
        assert_eq!(err.to_string(), "Circuit breaker open (retry in 250ms)");
        let err = Error::CircuitOpen {
            retry_after_ms: None,
        };
        assert_eq!(err.to_string(), "Circuit breaker open");
    }

    #[test]
    fn test_lock_misuse_is_not_retryable() {
        let err = Error::LockMisuse {
            key: "\"orders\"".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.context().is_none());
    }

    #[test]
    fn test_call_error_accessors() {
        let rejected: CallError<std::io::Error> = Error::CircuitOpen {
            retry_after_ms: None,
        }
        .into();
        assert!(rejected.is_rejected());
        assert!(rejected.rejection().unwrap().is_circuit_open());

        let failed: CallError<&str> = CallError::Operation("boom");
        assert!(!failed.is_rejected());
        assert_eq!(failed.to_string(), "boom");
        assert_eq!(failed.operation(), Some("boom"));
    }
}
