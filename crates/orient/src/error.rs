//! See [`Error`].

use miette::Diagnostic;
use thiserror::Error;

/// Error types for this crate.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("invalid shape: {reason}")]
    #[diagnostic(code(orient::invalid_shape))]
    InvalidShape { reason: String },

    #[error("shape mismatch: expected {expected}, got {actual}")]
    #[diagnostic(code(orient::shape_mismatch))]
    ShapeMismatch { expected: String, actual: String },

    #[error("failed to read config `{name}` from `{path}`")]
    #[diagnostic(help("check that the config directory contains `{name}`"))]
    ConfigIo {
        name: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config `{name}` from `{path}`")]
    ConfigParse {
        name: &'static str,
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl Error {
    pub(crate) fn invalid_shape(reason: impl Into<String>) -> Self {
        Error::InvalidShape {
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        Error::ShapeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Type alias for [`Result<T, Error>`].
pub type Result<T> = std::result::Result<T, Error>;
