//! Core error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the statechart interpreter.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read document '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid document: {reason}")]
    InvalidDocument { reason: String },

    #[error("SCXML input requires a converter: {path}")]
    XmlUnsupported { path: String },

    #[error("trace stream error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("invoke '{invoke_id}' failed: {reason}")]
    Invoke { invoke_id: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns whether the error came from reading or decoding input.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            CoreError::Io { .. }
                | CoreError::InvalidDocument { .. }
                | CoreError::XmlUnsupported { .. }
                | CoreError::Json(_)
        )
    }

    /// Returns a stable error code suitable for diagnostics output.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::Io { .. } => "IO_ERROR",
            CoreError::InvalidDocument { .. } => "INVALID_DOCUMENT",
            CoreError::XmlUnsupported { .. } => "XML_UNSUPPORTED",
            CoreError::Stream(_) => "STREAM_ERROR",
            CoreError::Invoke { .. } => "INVOKE_FAILED",
            CoreError::Json(_) => "BAD_JSON",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = CoreError::InvalidDocument {
            reason: "root must be an object".into(),
        };
        assert_eq!(err.error_code(), "INVALID_DOCUMENT");
        assert!(err.is_load_error());

        let err = CoreError::Invoke {
            invoke_id: "s.invoke0".into(),
            reason: "missing src".into(),
        };
        assert_eq!(err.to_string(), "invoke 's.invoke0' failed: missing src");
        assert!(!err.is_load_error());

        let err: CoreError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed").into();
        assert_eq!(err.error_code(), "STREAM_ERROR");
    }
}
