use std::io;
use thiserror::Error;

/// Errors returned while building a [`CompressionLayer`](crate::CompressionLayer).
///
/// These are the only synchronous failures of the middleware: once a layer has
/// been built, negotiation and compression never reject a request.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A compression level outside the range the codec accepts.
    #[error("invalid {coding} compression level {level}: expected {min}..={max}")]
    InvalidLevel {
        /// Content coding the level was given for.
        coding: &'static str,
        /// The rejected level.
        level: i32,
        /// Smallest accepted level.
        min: i32,
        /// Largest accepted level.
        max: i32,
    },

    /// A coding name that is not a valid HTTP token, or that cannot be registered.
    #[error("invalid content coding name {0:?}")]
    InvalidCodingName(String),

    /// A content type pattern that could not be parsed.
    #[error("invalid content type pattern {0:?}")]
    InvalidContentType(String),

    /// The codec was disabled at compile time.
    #[error("{0} support is not compiled in")]
    Unsupported(&'static str),

    /// The provider failed to construct a compressing writer.
    #[error("failed to construct {coding} compressor")]
    Provider {
        /// Content coding whose provider failed.
        coding: String,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
}
