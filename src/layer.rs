use crate::config::{Builder, Config};
use crate::pool::Pools;
use crate::service::CompressionService;
use std::sync::Arc;
use tower::Layer;

/// A Tower layer that compresses HTTP response bodies.
///
/// This layer wraps services and compresses response bodies with the coding
/// negotiated from the client's `Accept-Encoding` header. The configuration is
/// immutable once built, and every service produced by the layer shares it
/// along with a pool of compressors and buffers.
#[derive(Debug, Clone)]
pub struct CompressionLayer {
    config: Arc<Config>,
    pools: Pools,
}

impl CompressionLayer {
    /// Creates a new compression layer with default settings.
    ///
    /// Every codec compiled into the crate is registered at its default level,
    /// with a minimum size of [`DEFAULT_MIN_SIZE`](crate::DEFAULT_MIN_SIZE)
    /// bytes.
    pub fn new() -> Self {
        Self::from_config(Config::defaults())
    }

    /// Returns a builder for a custom configuration.
    ///
    /// A builder with no codings produces a layer that leaves every response
    /// untouched.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_config(config: Config) -> Self {
        tracing::debug!(
            codings = ?config.codings().iter().map(|c| c.name()).collect::<Vec<_>>(),
            min_size = config.min_size(),
            prefer = ?config.prefer(),
            "compression layer configured"
        );
        Self {
            config: Arc::new(config),
            pools: Pools::new(),
        }
    }

    /// Returns the configuration shared by services of this layer.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Default for CompressionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::new(inner, Arc::clone(&self.config), self.pools.clone())
    }
}
