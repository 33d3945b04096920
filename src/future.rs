use crate::body::{CompressionBody, Tail};
use crate::config::Config;
use crate::negotiate::Negotiation;
use crate::pool::{Pooled, Pools};
use bytes::{Buf, Bytes};
use http::response::Parts;
use http::{Response, header};
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

pin_project! {
    /// Future for compression service responses.
    ///
    /// Resolves once the inner service has responded and enough of the body
    /// has been read to decide whether to compress it. The returned head
    /// already reflects that decision.
    pub struct ResponseFuture<F, B> {
        #[pin]
        inner: F,
        phase: Phase<B>,
    }
}

enum Phase<B> {
    /// Waiting for the inner service; `None` leaves the response untouched.
    Waiting(Option<Negotiated>),
    /// Reading the body until the compression decision can be made.
    Buffering(Buffering<B>),
    Done,
}

impl<F, B> ResponseFuture<F, B> {
    pub(crate) fn new(inner: F, negotiated: Negotiated) -> Self {
        Self {
            inner,
            phase: Phase::Waiting(Some(negotiated)),
        }
    }

    /// A future that returns the inner response unmodified.
    pub(crate) fn identity(inner: F) -> Self {
        Self {
            inner,
            phase: Phase::Waiting(None),
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            match this.phase {
                Phase::Waiting(negotiated) => {
                    let response = ready!(this.inner.as_mut().poll(cx))?;
                    let Some(negotiated) = negotiated.take() else {
                        *this.phase = Phase::Done;
                        return Poll::Ready(Ok(response.map(CompressionBody::passthrough)));
                    };
                    match negotiated.inspect(response) {
                        Head::Decided(response) => {
                            *this.phase = Phase::Done;
                            return Poll::Ready(Ok(response));
                        }
                        Head::Buffer(buffering) => *this.phase = Phase::Buffering(buffering),
                    }
                }
                Phase::Buffering(buffering) => {
                    let filled = ready!(buffering.poll_fill(cx));
                    if let Phase::Buffering(buffering) = mem::replace(this.phase, Phase::Done) {
                        return Poll::Ready(Ok(buffering.finish(filled)));
                    }
                }
                Phase::Done => panic!("ResponseFuture polled after completion"),
            }
        }
    }
}

/// Per-request negotiation outcome plus the shared state needed to act on it.
pub(crate) struct Negotiated {
    config: Arc<Config>,
    pools: Pools,
    negotiation: Negotiation,
}

/// Result of inspecting the response head.
enum Head<B> {
    Decided(Response<CompressionBody<B>>),
    Buffer(Buffering<B>),
}

impl Negotiated {
    pub(crate) fn new(config: Arc<Config>, pools: Pools, negotiation: Negotiation) -> Self {
        Self {
            config,
            pools,
            negotiation,
        }
    }

    /// Decides from the head alone when possible, otherwise starts buffering.
    fn inspect<B: Body>(self, response: Response<B>) -> Head<B> {
        let (mut parts, body) = response.into_parts();

        // The representation may vary even if this response is not compressed
        add_vary_accept_encoding(&mut parts.headers);

        let skip = if self.negotiation.is_empty() {
            Some("no acceptable coding")
        } else if has_content_encoding(&parts.headers) {
            Some("already encoded")
        } else if has_content_range(&parts.headers) {
            Some("range response")
        } else if body.is_end_stream() {
            Some("empty body")
        } else if !self.config.content_types().allows(content_type(&parts.headers)) {
            Some("content type filtered")
        } else {
            None
        };
        if let Some(reason) = skip {
            tracing::trace!(reason, "not compressing response");
            return Head::Decided(Response::from_parts(parts, CompressionBody::passthrough(body)));
        }

        let min_size = self.config.min_size() as u64;
        let known_len = content_length(&parts.headers).or_else(|| body.size_hint().exact());
        match known_len {
            Some(len) if len < min_size => {
                tracing::trace!(len, min_size, "not compressing response below minimum size");
                Head::Decided(Response::from_parts(parts, CompressionBody::passthrough(body)))
            }
            Some(_) => Head::Decided(self.compress(parts, body, &[])),
            None if min_size == 0 || always_flush(&parts.headers) => {
                Head::Decided(self.compress(parts, body, &[]))
            }
            None => {
                let buffer = self.pools.buffers.acquire();
                Head::Buffer(Buffering {
                    parts,
                    body,
                    buffer,
                    negotiated: self,
                })
            }
        }
    }

    /// Rewrites the head for the first coding whose compressor starts.
    ///
    /// `prefix` holds body bytes already read from the inner body. Falls back
    /// to passing the response through if no compressor can be started.
    fn compress<B>(&self, mut parts: Parts, body: B, prefix: &[u8]) -> Response<CompressionBody<B>> {
        let always_flush = always_flush(&parts.headers);

        for coding in self.negotiation.codings() {
            let mut state = self.pools.encoders.acquire();
            match state.start(coding, prefix, always_flush) {
                Ok(()) => {
                    tracing::debug!(coding = coding.name(), always_flush, "compressing response");

                    // Add Content-Encoding header
                    parts
                        .headers
                        .insert(header::CONTENT_ENCODING, coding.header_value().clone());

                    // Remove Content-Length since compressed size is unknown
                    parts.headers.remove(header::CONTENT_LENGTH);

                    // Remove Accept-Ranges since we can't support ranges on compressed content
                    parts.headers.remove(header::ACCEPT_RANGES);

                    return Response::from_parts(parts, CompressionBody::compressed(body, state));
                }
                Err(error) => {
                    tracing::warn!(coding = coding.name(), %error, "failed to start compressor");
                }
            }
        }

        tracing::warn!("no compressor could be started, passing response through");
        let buffered = Bytes::copy_from_slice(prefix);
        Response::from_parts(parts, CompressionBody::replay(body, buffered, Tail::Open))
    }
}

/// A response whose head is held back while its body is read.
struct Buffering<B> {
    parts: Parts,
    body: B,
    buffer: Pooled<Vec<u8>>,
    negotiated: Negotiated,
}

/// Why buffering stopped.
enum Filled {
    /// The buffer reached the minimum size.
    Threshold,
    /// The body ended below the minimum size.
    End(Tail),
}

impl<B> Buffering<B>
where
    B: Body + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<Filled> {
        let min_size = self.negotiated.config.min_size();

        loop {
            match ready!(Pin::new(&mut self.body).poll_frame(cx)) {
                None => return Poll::Ready(Filled::End(Tail::Ended)),
                Some(Err(e)) => {
                    let error = io::Error::other(e.into());
                    return Poll::Ready(Filled::End(Tail::Failed(error)));
                }
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(mut data) => {
                        while data.has_remaining() {
                            let chunk = data.chunk();
                            self.buffer.extend_from_slice(chunk);
                            let len = chunk.len();
                            data.advance(len);
                        }
                        if self.buffer.len() >= min_size {
                            return Poll::Ready(Filled::Threshold);
                        }
                        if self.body.is_end_stream() {
                            return Poll::Ready(Filled::End(Tail::Ended));
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            return Poll::Ready(Filled::End(Tail::Trailers(trailers)));
                        }
                    }
                },
            }
        }
    }

    fn finish(self, filled: Filled) -> Response<CompressionBody<B>> {
        match filled {
            Filled::Threshold => self.negotiated.compress(self.parts, self.body, &self.buffer),
            Filled::End(tail) => {
                tracing::trace!(
                    len = self.buffer.len(),
                    "not compressing response below minimum size"
                );
                let buffered = Bytes::copy_from_slice(&self.buffer);
                Response::from_parts(self.parts, CompressionBody::replay(self.body, buffered, tail))
            }
        }
    }
}

/// Checks if Content-Encoding header is already present.
fn has_content_encoding(headers: &header::HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_ENCODING)
}

/// Checks if Content-Range header is present (range response).
fn has_content_range(headers: &header::HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_RANGE)
}

fn content_type(headers: &header::HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

/// Parses the Content-Length header, if present and valid.
fn content_length(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Adds Accept-Encoding to the Vary header if not already present.
fn add_vary_accept_encoding(headers: &mut header::HeaderMap) {
    // Check all Vary headers to see if Accept-Encoding is already present
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v == "*" || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    headers.append(
        header::VARY,
        header::HeaderValue::from_static("Accept-Encoding"),
    );
}

/// Checks if the response must be flushed after every chunk.
///
/// Such responses stream indefinitely, so their head cannot wait for the
/// minimum size to be buffered.
fn always_flush(headers: &header::HeaderMap) -> bool {
    headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"))
        || is_streaming_content_type(headers)
}

/// Checks if the content type is a streaming one (e.g., server-sent events).
fn is_streaming_content_type(headers: &header::HeaderMap) -> bool {
    content_type(headers).is_some_and(|ct| {
        ct.starts_with("text/event-stream") || ct.starts_with("application/grpc-web")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::CompressState;
    use crate::config::{Builder, FilterMode};
    use crate::negotiate::negotiate;
    use crate::testing::{CLOSE_MARKER, PlainProvider};
    use http::{HeaderMap, HeaderValue};
    use http_body::{Frame, SizeHint};
    use std::collections::VecDeque;
    use std::convert::Infallible;

    /// A body yielding predefined frames, optionally with an exact size.
    struct Chunks {
        frames: VecDeque<Poll<Result<Frame<Bytes>, io::Error>>>,
        exact: Option<u64>,
    }

    impl Chunks {
        fn new(chunks: &[&'static str]) -> Self {
            Self {
                frames: chunks
                    .iter()
                    .map(|c| Poll::Ready(Ok(Frame::data(Bytes::from_static(c.as_bytes())))))
                    .collect(),
                exact: None,
            }
        }

        fn sized(chunks: &[&'static str]) -> Self {
            let len = chunks.iter().map(|c| c.len() as u64).sum();
            Self {
                exact: Some(len),
                ..Self::new(chunks)
            }
        }

        fn then(mut self, frame: Result<Frame<Bytes>, io::Error>) -> Self {
            self.frames.push_back(Poll::Ready(frame));
            self
        }

        /// Returns `Pending` once at this point.
        fn stall(mut self) -> Self {
            self.frames.push_back(Poll::Pending);
            self
        }
    }

    impl Body for Chunks {
        type Data = Bytes;
        type Error = io::Error;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            match self.frames.pop_front() {
                Some(Poll::Pending) => {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
                Some(Poll::Ready(frame)) => Poll::Ready(Some(frame)),
                None => Poll::Ready(None),
            }
        }

        fn is_end_stream(&self) -> bool {
            self.frames.is_empty()
        }

        fn size_hint(&self) -> SizeHint {
            self.exact.map(SizeHint::with_exact).unwrap_or_default()
        }
    }

    fn make_response<I>(body: Chunks, headers: I) -> Response<Chunks>
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        let mut response = Response::new(body);
        for (name, value) in headers {
            response
                .headers_mut()
                .append(name, HeaderValue::from_static(value));
        }
        response
    }

    fn negotiated(builder: Builder, accept: &str) -> Negotiated {
        let config = Arc::new(builder.build_config().unwrap());
        let negotiation = negotiate(&config, Some(accept));
        Negotiated::new(config, Pools::new(), negotiation)
    }

    fn plain(min_size: usize) -> Negotiated {
        negotiated(
            Builder::new()
                .min_size(min_size)
                .compressor("plain", 0, PlainProvider::default()),
            "plain",
        )
    }

    fn wrap<B>(negotiated: Option<Negotiated>, response: Response<B>) -> Response<CompressionBody<B>>
    where
        B: Body + Unpin,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let inner = std::future::ready(Ok::<_, Infallible>(response));
        let future = match negotiated {
            Some(negotiated) => ResponseFuture::new(inner, negotiated),
            None => ResponseFuture::identity(inner),
        };
        let mut future = std::pin::pin!(future);

        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(response)) => response,
            _ => panic!("response should be ready"),
        }
    }

    fn collect<B>(body: &mut B) -> (Vec<u8>, Option<HeaderMap>, Option<io::Error>)
    where
        B: Body<Data = Bytes, Error = io::Error> + Unpin,
    {
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        let mut data = Vec::new();
        let mut trailers = None;
        let mut error = None;
        while let Poll::Ready(Some(frame)) = Pin::new(&mut *body).poll_frame(&mut cx) {
            match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(chunk) => data.extend_from_slice(&chunk),
                    Err(frame) => trailers = frame.into_trailers().ok(),
                },
                Err(e) => error = Some(e),
            }
        }
        (data, trailers, error)
    }

    fn with_marker(data: &str) -> Vec<u8> {
        let mut expected = data.as_bytes().to_vec();
        expected.extend_from_slice(CLOSE_MARKER);
        expected
    }

    #[test]
    fn test_short_body_passes_through() {
        let body: &'static str = "x".repeat(50).leak();
        let response = make_response(Chunks::new(&[body]), []);
        let mut wrapped = wrap(Some(plain(200)), response);

        assert!(!wrapped.body().is_compressed());
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(wrapped.headers().get(header::VARY).unwrap(), "Accept-Encoding");

        let (data, _, _) = collect(wrapped.body_mut());
        assert_eq!(data, body.as_bytes());
    }

    #[test]
    fn test_buffering_reaches_threshold() {
        let response = make_response(
            Chunks::new(&["hello ", "world ", "again"]),
            [("content-type", "text/plain")],
        );
        let negotiated = plain(10);
        let pools = negotiated.pools.clone();
        let mut wrapped = wrap(Some(negotiated), response);

        assert!(wrapped.body().is_compressed());
        assert_eq!(wrapped.headers().get(header::CONTENT_ENCODING).unwrap(), "plain");
        assert_eq!(pools.buffers.idle(), 1, "buffer returns to the pool");

        let (data, _, _) = collect(wrapped.body_mut());
        assert_eq!(data, with_marker("hello world again"));
    }

    #[test]
    fn test_pending_while_buffering_resumes() {
        let body = Chunks::new(&["hello "])
            .stall()
            .then(Ok(Frame::data(Bytes::from_static(b"world again"))));
        let negotiated = plain(10);
        let pools = negotiated.pools.clone();
        let inner = std::future::ready(Ok::<_, Infallible>(make_response(body, [])));
        let mut future = std::pin::pin!(ResponseFuture::<_, Chunks>::new(inner, negotiated));

        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        assert!(future.as_mut().poll(&mut cx).is_pending());
        assert_eq!(pools.buffers.idle(), 0, "buffer is held while pending");

        let mut wrapped = match future.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(response)) => response,
            _ => panic!("response should be ready after resuming"),
        };
        assert!(wrapped.body().is_compressed());
        assert_eq!(pools.buffers.idle(), 1);

        let (data, _, _) = collect(wrapped.body_mut());
        assert_eq!(data, with_marker("hello world again"));
    }

    #[test]
    fn test_known_length_compresses_without_buffering() {
        let response = make_response(
            Chunks::new(&["large enough content"]),
            [("content-length", "200"), ("accept-ranges", "bytes")],
        );
        let negotiated = plain(100);
        let pools = negotiated.pools.clone();
        let wrapped = wrap(Some(negotiated), response);

        assert!(wrapped.body().is_compressed());
        let state = wrapped.body().compressed_state().unwrap();
        assert_eq!(state.state(), CompressState::Reading);
        assert!(wrapped.headers().get(header::CONTENT_LENGTH).is_none());
        assert!(wrapped.headers().get(header::ACCEPT_RANGES).is_none());
        assert_eq!(pools.buffers.idle(), 0, "no buffer was needed");
    }

    #[test]
    fn test_known_length_below_min_size() {
        let response = make_response(Chunks::new(&["small"]), [("content-length", "5")]);
        let wrapped = wrap(Some(plain(100)), response);

        assert!(!wrapped.body().is_compressed());
        assert_eq!(wrapped.headers().get(header::CONTENT_LENGTH).unwrap(), "5");
    }

    #[test]
    fn test_exact_size_hint_below_min_size() {
        let response = make_response(Chunks::sized(&["small"]), []);
        let wrapped = wrap(Some(plain(100)), response);
        assert!(!wrapped.body().is_compressed());
    }

    #[test]
    fn test_exact_size_hint_above_min_size() {
        let response = make_response(Chunks::sized(&["0123456789"]), []);
        let wrapped = wrap(Some(plain(10)), response);
        assert!(wrapped.body().is_compressed());
    }

    #[test]
    fn test_min_size_zero_compresses_immediately() {
        let response = make_response(Chunks::new(&["a"]), []);
        let mut wrapped = wrap(Some(plain(0)), response);
        assert!(wrapped.body().is_compressed());
        // Flushing per chunk is reserved for streaming responses
        assert!(!wrapped.body().compressed_state().unwrap().always_flush());

        let (data, _, _) = collect(wrapped.body_mut());
        assert_eq!(data, with_marker("a"));
    }

    #[test]
    fn test_content_type_filtered() {
        let negotiated = negotiated(
            Builder::new()
                .min_size(0)
                .content_types(["image/*"], FilterMode::Deny)
                .compressor("plain", 0, PlainProvider::default()),
            "plain",
        );
        let response = make_response(Chunks::new(&["PNG data"]), [("content-type", "image/png")]);
        let wrapped = wrap(Some(negotiated), response);

        assert!(!wrapped.body().is_compressed());
        assert_eq!(wrapped.headers().get(header::VARY).unwrap(), "Accept-Encoding");
    }

    #[test]
    fn test_content_type_allowed() {
        let negotiated = negotiated(
            Builder::new()
                .min_size(0)
                .content_types(["text/*"], FilterMode::Allow)
                .compressor("plain", 0, PlainProvider::default()),
            "plain",
        );
        let response = make_response(
            Chunks::new(&["<html></html>"]),
            [("content-type", "text/html; charset=utf-8")],
        );
        assert!(wrap(Some(negotiated), response).body().is_compressed());
    }

    #[test]
    fn test_no_compress_when_content_encoding_present() {
        let response = make_response(
            Chunks::new(&["hello world"]),
            [("content-encoding", "identity")],
        );
        let wrapped = wrap(Some(plain(0)), response);
        assert!(!wrapped.body().is_compressed());
        assert_eq!(
            wrapped.headers().get(header::CONTENT_ENCODING).unwrap(),
            "identity"
        );
    }

    #[test]
    fn test_no_compress_range_response() {
        let response = make_response(
            Chunks::new(&["partial content"]),
            [("content-range", "bytes 0-99/200")],
        );
        assert!(!wrap(Some(plain(0)), response).body().is_compressed());
    }

    #[test]
    fn test_no_compress_empty_body() {
        let response = make_response(Chunks::new(&[]), []);
        assert!(!wrap(Some(plain(0)), response).body().is_compressed());
    }

    #[test]
    fn test_no_acceptable_coding_still_varies() {
        let negotiated = negotiated(
            Builder::new()
                .min_size(0)
                .compressor("plain", 0, PlainProvider::default()),
            "br, gzip",
        );
        let response = make_response(Chunks::new(&["hello"]), [("accept-ranges", "bytes")]);
        let wrapped = wrap(Some(negotiated), response);

        assert!(!wrapped.body().is_compressed());
        assert_eq!(wrapped.headers().get(header::VARY).unwrap(), "Accept-Encoding");
        assert_eq!(wrapped.headers().get(header::ACCEPT_RANGES).unwrap(), "bytes");
    }

    #[test]
    fn test_identity_leaves_response_untouched() {
        let response = make_response(
            Chunks::new(&["hello"]),
            [("content-length", "5"), ("accept-ranges", "bytes")],
        );
        let mut wrapped = wrap(None, response);

        assert!(!wrapped.body().is_compressed());
        assert!(wrapped.headers().get(header::VARY).is_none());
        assert_eq!(wrapped.headers().len(), 2);
        let (data, _, _) = collect(wrapped.body_mut());
        assert_eq!(data, b"hello");
    }

    #[test]
    fn test_vary_header_appended() {
        let response = make_response(Chunks::new(&["hello world"]), [("vary", "origin")]);
        let wrapped = wrap(Some(plain(0)), response);

        let vary_values: Vec<_> = wrapped
            .headers()
            .get_all(header::VARY)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(vary_values, vec!["origin", "Accept-Encoding"]);
    }

    #[test]
    fn test_vary_header_not_duplicated() {
        let response = make_response(
            Chunks::new(&["hello world"]),
            [("vary", "Origin, accept-encoding")],
        );
        let wrapped = wrap(Some(plain(0)), response);
        assert_eq!(wrapped.headers().get_all(header::VARY).iter().count(), 1);
    }

    #[test]
    fn test_vary_header_star_not_modified() {
        let response = make_response(Chunks::new(&["hello world"]), [("vary", "*")]);
        let wrapped = wrap(Some(plain(0)), response);
        assert_eq!(wrapped.headers().get(header::VARY).unwrap(), "*");
        assert_eq!(wrapped.headers().get_all(header::VARY).iter().count(), 1);
    }

    #[test]
    fn test_falls_back_to_next_coding() {
        let failing = PlainProvider::failing();
        let working = PlainProvider::default();
        let negotiated = negotiated(
            Builder::new()
                .min_size(0)
                .compressor("first", 10, failing)
                .compressor("second", 0, working.clone()),
            "first, second",
        );
        assert_eq!(negotiated.negotiation.preferred(), Some("first"));

        let response = make_response(Chunks::new(&["hello"]), []);
        let wrapped = wrap(Some(negotiated), response);

        assert!(wrapped.body().is_compressed());
        assert_eq!(wrapped.headers().get(header::CONTENT_ENCODING).unwrap(), "second");
        assert_eq!(working.created(), 1);
    }

    #[test]
    fn test_all_providers_fail_passes_buffer_through() {
        let writes_fail = PlainProvider::failing_writes();
        let negotiated = negotiated(
            Builder::new()
                .min_size(4)
                .compressor("first", 10, PlainProvider::failing())
                .compressor("second", 0, writes_fail.clone()),
            "*",
        );
        let response = make_response(
            Chunks::new(&["hel", "lo ", "world"]),
            [("content-length", "x"), ("accept-ranges", "bytes")],
        );
        let mut wrapped = wrap(Some(negotiated), response);

        assert!(!wrapped.body().is_compressed());
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(wrapped.headers().get(header::ACCEPT_RANGES).unwrap(), "bytes");
        assert_eq!(writes_fail.closed(), 1, "failed writer is still closed");

        let (data, _, _) = collect(wrapped.body_mut());
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn test_streaming_content_type_always_flushes() {
        for (name, value) in [
            ("content-type", "text/event-stream; charset=utf-8"),
            ("content-type", "application/grpc-web+proto"),
            ("x-accel-buffering", "NO"),
        ] {
            let response = make_response(Chunks::new(&["event: data\n\n"]), [(name, value)]);
            let wrapped = wrap(Some(plain(200)), response);

            let state = wrapped.body().compressed_state().expect("compressed");
            assert!(state.always_flush(), "{name}: {value}");
        }
    }

    #[test]
    fn test_no_always_flush_by_default() {
        let response = make_response(Chunks::new(&["normal data"]), []);
        let wrapped = wrap(Some(plain(0)), response);
        assert!(!wrapped.body().compressed_state().unwrap().always_flush());
    }

    #[test]
    fn test_trailers_while_buffering() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());
        let body = Chunks::new(&["tiny"]).then(Ok(Frame::trailers(trailers)));
        let mut wrapped = wrap(Some(plain(200)), make_response(body, []));

        assert!(!wrapped.body().is_compressed());
        let (data, trailers, error) = collect(wrapped.body_mut());
        assert_eq!(data, b"tiny");
        assert_eq!(trailers.unwrap().get("x-checksum").unwrap(), "abc123");
        assert!(error.is_none());
    }

    #[test]
    fn test_error_while_buffering_is_replayed() {
        let body = Chunks::new(&["partial"]).then(Err(io::Error::other("boom")));
        let mut wrapped = wrap(Some(plain(200)), make_response(body, []));

        assert!(!wrapped.body().is_compressed());
        let (data, _, error) = collect(wrapped.body_mut());
        assert_eq!(data, b"partial");
        assert_eq!(error.unwrap().to_string(), "boom");
    }

    #[test]
    fn test_add_vary_accept_encoding_idempotent() {
        let mut headers = HeaderMap::new();
        add_vary_accept_encoding(&mut headers);
        add_vary_accept_encoding(&mut headers);
        assert_eq!(headers.get_all(header::VARY).iter().count(), 1);
    }
}
