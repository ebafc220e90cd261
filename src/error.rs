use thiserror::Error;

/// Maximum length of a browser-reported script error message kept in a
/// [`DrWebError::Script`] variant. Anything longer is truncated.
pub const SCRIPT_ERROR_MAX_LEN: usize = 500;

/// Error taxonomy for the whole engine.
///
/// Step-level failures are recoverable by default: the evaluator records a
/// diagnostic and continues with the next sibling step. `Fatal` (and query
/// load errors, which happen before evaluation) abort the query.
#[derive(Error, Debug)]
pub enum DrWebError {
    // Query load errors
    #[error("unknown key `{key}` in {context}")]
    UnknownKey { key: String, context: String },

    #[error("query schema error: {message}")]
    Schema { message: String },

    #[error("query validation failed: {message}")]
    Validation { message: String },

    // Expression runtime
    #[error("malformed expression `{expression}`: {message}")]
    ExpressionSyntax { expression: String, message: String },

    // Action pipeline
    #[error("action `{action}` is missing required attribute `{attribute}`")]
    MissingAttribute { action: String, attribute: String },

    #[error("no element matched locator `{locator}`")]
    TargetNotFound { locator: String },

    #[error("element matched by `{locator}` is not interactable")]
    TargetNotInteractable { locator: String },

    #[error("wait expired after {waited_ms}ms")]
    ActionTimeout { waited_ms: u64 },

    #[error("script execution failed: {message}")]
    Script { message: String },

    // Navigation
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    // Registry
    #[error("no processor registered for step kind `{kind}`")]
    NoProcessor { kind: String },

    #[error("processor for kind `{kind}` at priority {priority} is already registered")]
    DuplicateProcessor { kind: String, priority: i32 },

    #[error("processor `{processor}` declares no step kinds")]
    EmptyKinds { processor: String },

    // Lifecycle
    #[error("evaluation cancelled")]
    Cancelled,

    #[error("fatal engine error: {message}")]
    Fatal { message: String },
}

impl DrWebError {
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExpressionSyntax { expression: expression.into(), message: message.into() }
    }

    pub fn navigation(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Navigation { url: url.into(), message: message.into() }
    }

    /// Build a script error, truncating the browser-reported message.
    pub fn script(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > SCRIPT_ERROR_MAX_LEN {
            let mut cut = SCRIPT_ERROR_MAX_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self::Script { message }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal { message: message.into() }
    }

    /// Whether this error aborts the whole query rather than one step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Fatal { .. }
                | Self::UnknownKey { .. }
                | Self::Schema { .. }
                | Self::Validation { .. }
        )
    }

    /// Stable kind tag used in per-step diagnostics and the abort record.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownKey { .. } => "UnknownKey",
            Self::Schema { .. } => "SchemaError",
            Self::Validation { .. } => "ValidationError",
            Self::ExpressionSyntax { .. } => "ExpressionSyntaxError",
            Self::MissingAttribute { .. } => "MissingAttribute",
            Self::TargetNotFound { .. } => "TargetNotFound",
            Self::TargetNotInteractable { .. } => "TargetNotInteractable",
            Self::ActionTimeout { .. } => "ActionTimeout",
            Self::Script { .. } => "ScriptError",
            Self::Navigation { .. } => "NavigationError",
            Self::NoProcessor { .. } => "NoProcessor",
            Self::DuplicateProcessor { .. } => "DuplicateProcessor",
            Self::EmptyKinds { .. } => "EmptyKinds",
            Self::Cancelled => "Cancelled",
            Self::Fatal { .. } => "FatalError",
        }
    }

    /// Error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnknownKey { .. } | Self::Schema { .. } | Self::Validation { .. } => "query",
            Self::ExpressionSyntax { .. } => "expression",
            Self::MissingAttribute { .. }
            | Self::TargetNotFound { .. }
            | Self::TargetNotInteractable { .. }
            | Self::ActionTimeout { .. }
            | Self::Script { .. } => "action",
            Self::Navigation { .. } => "navigation",
            Self::NoProcessor { .. } | Self::DuplicateProcessor { .. } | Self::EmptyKinds { .. } => {
                "registry"
            }
            Self::Cancelled | Self::Fatal { .. } => "lifecycle",
        }
    }
}

/// Result type alias used throughout the engine.
pub type DrWebResult<T> = std::result::Result<T, DrWebError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DrWebError::fatal("session lost").is_fatal());
        assert!(DrWebError::schema("bad shape").is_fatal());
        assert!(!DrWebError::TargetNotFound { locator: "#x".into() }.is_fatal());
        assert!(!DrWebError::Cancelled.is_fatal());
    }

    #[test]
    fn test_kind_tags() {
        let err = DrWebError::expression("//[", "unbalanced bracket");
        assert_eq!(err.kind(), "ExpressionSyntaxError");
        assert_eq!(err.category(), "expression");

        let err = DrWebError::navigation("https://example.com", "connection refused");
        assert_eq!(err.kind(), "NavigationError");
    }

    #[test]
    fn test_script_error_truncation() {
        let err = DrWebError::script("x".repeat(SCRIPT_ERROR_MAX_LEN * 2));
        match err {
            DrWebError::Script { message } => assert_eq!(message.len(), SCRIPT_ERROR_MAX_LEN),
            other => panic!("unexpected variant: {other}"),
        }
    }
}
