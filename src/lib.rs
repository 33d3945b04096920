//! HTTP response compression middleware for Tower.
//!
//! This crate provides a Tower layer that negotiates a content coding from the
//! client's `Accept-Encoding` header and compresses response bodies with it.
//! Zstd, Brotli, Gzip and Deflate are available behind cargo features, and any
//! other coding can be plugged in through [`CompressorProvider`].
//!
//! # Example
//!
//! ```ignore
//! use negotiated_compression::{CompressionLayer, Level, Prefer};
//! use tower::ServiceBuilder;
//!
//! let compression = CompressionLayer::builder()
//!     .gzip(Level::Default)
//!     .brotli(Level::Precise(5))
//!     .min_size(512)
//!     .prefer(Prefer::Client)
//!     .build()?;
//!
//! let service = ServiceBuilder::new()
//!     .layer(compression)
//!     .service(my_service);
//! ```
//!
//! # Negotiation
//!
//! Only registered codings the client accepts with a non-zero quality are
//! candidates; `*` stands for every coding the client does not name. With
//! [`Prefer::Server`] (the default) the registered priority decides, with
//! [`Prefer::Client`] the client's quality does. When a compressor cannot be
//! started the next candidate is tried.
//!
//! # Compression Rules
//!
//! The middleware will **not** compress responses when:
//! - No registered coding is acceptable to the client
//! - `Content-Encoding` header is already set
//! - `Content-Range` header is present (range responses)
//! - The body is empty
//! - The `Content-Type` is rejected by the configured [`ContentTypeFilter`]
//! - The body is shorter than the minimum size (default: 200 bytes)
//!
//! When the body length is not known from `Content-Length` or the body's size
//! hint, up to the minimum size is buffered before the response head is
//! released.
//!
//! The middleware will **always flush** after each chunk when:
//! - `X-Accel-Buffering: no` header is present
//! - `Content-Type` is `text/event-stream`
//! - `Content-Type` starts with `application/grpc-web`
//!
//! # Request and Response Modifications
//!
//! When a coding was negotiated the request's `Range` header is removed.
//!
//! When compression is configured, `Vary` includes `Accept-Encoding` on every
//! response. When compression is applied:
//! - `Content-Encoding` header is set to the coding used
//! - `Content-Length` header is removed (compressed size is unknown)
//! - `Accept-Ranges` header is removed
//!
//! A layer built without codings passes requests and responses through
//! unmodified.

#![deny(missing_docs)]

mod body;
mod codec;
mod config;
mod error;
mod future;
mod layer;
mod negotiate;
mod pool;
mod service;

#[cfg(test)]
mod testing;

pub use body::CompressionBody;
pub use codec::{Codec, CodecProvider, CompressingWriter, CompressorProvider};
pub use compression_core::Level;
pub use config::{
    Builder, Coding, Config, ContentTypeFilter, DEFAULT_MIN_SIZE, FilterMode, Prefer,
};
pub use error::ConfigError;
pub use future::ResponseFuture;
pub use layer::CompressionLayer;
pub use negotiate::{AcceptEntry, Negotiation, Quality, negotiate, parse_accept_encoding};
pub use service::CompressionService;
