use crate::body::CompressionBody;
use crate::config::Config;
use crate::future::{Negotiated, ResponseFuture};
use crate::negotiate::negotiate;
use crate::pool::Pools;
use http::{HeaderMap, Request, Response, header};
use http_body::Body;
use std::borrow::Cow;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// A Tower service that compresses HTTP response bodies.
///
/// Created by [`CompressionLayer`](crate::CompressionLayer). Clones share the
/// layer's configuration and pools.
#[derive(Debug, Clone)]
pub struct CompressionService<S> {
    inner: S,
    config: Arc<Config>,
    pools: Pools,
}

impl<S> CompressionService<S> {
    pub(crate) fn new(inner: S, config: Arc<Config>, pools: Pools) -> Self {
        Self {
            inner,
            config,
            pools,
        }
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CompressionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: Body + Unpin,
    ResBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        if self.config.is_noop() {
            return ResponseFuture::identity(self.inner.call(req));
        }

        let negotiation = negotiate(&self.config, accept_encoding(req.headers()).as_deref());
        if !negotiation.is_empty() {
            // Ranges would address the uncompressed representation
            req.headers_mut().remove(header::RANGE);
        }
        tracing::trace!(preferred = negotiation.preferred(), "negotiated response coding");

        let inner = self.inner.call(req);
        let negotiated = Negotiated::new(Arc::clone(&self.config), self.pools.clone(), negotiation);
        ResponseFuture::new(inner, negotiated)
    }
}

/// Joins every `Accept-Encoding` field line into one list.
fn accept_encoding(headers: &HeaderMap) -> Option<Cow<'_, str>> {
    let mut values = headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok());

    let first = values.next()?;
    let Some(second) = values.next() else {
        return Some(Cow::Borrowed(first));
    };

    let mut joined = format!("{first},{second}");
    for value in values {
        joined.push(',');
        joined.push_str(value);
    }
    Some(Cow::Owned(joined))
}
