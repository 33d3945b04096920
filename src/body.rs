use crate::codec::CompressingWriter;
use crate::config::Coding;
use crate::pool::{Pooled, Recycle};
use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::io;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

/// Output buffers that grew beyond this are dropped instead of pooled.
const MAX_RETAINED_OUTPUT: usize = 64 * 1024;

pin_project! {
    /// A response body that may be compressed.
    ///
    /// This type wraps an inner body and either compresses it with the
    /// negotiated coding or passes it through unchanged. Bytes read while the
    /// compression decision was pending are emitted first.
    pub struct CompressionBody<B> {
        #[pin]
        kind: Kind<B>,
    }
}

pin_project! {
    #[project = KindProj]
    enum Kind<B> {
        Compressed {
            #[pin]
            inner: B,
            state: Pooled<CompressedState>,
        },
        Passthrough {
            #[pin]
            inner: B,
            replay: Replay,
        },
    }
}

/// What the inner body did before the decision was made.
#[derive(Debug, Default)]
pub(crate) enum Tail {
    /// The inner body still has frames to yield.
    #[default]
    Open,
    /// The inner body ended.
    Ended,
    /// The inner body ended with trailers.
    Trailers(HeaderMap),
    /// The inner body failed.
    Failed(io::Error),
}

/// Buffered bytes and the buffered end of the inner body, if any.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    buffered: Option<Bytes>,
    tail: Tail,
}

impl Replay {
    fn poll_frame<B>(
        &mut self,
        cx: &mut Context<'_>,
        inner: Pin<&mut B>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Some(data) = self.buffered.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }

        match mem::replace(&mut self.tail, Tail::Ended) {
            Tail::Open => {
                self.tail = Tail::Open;
                poll_passthrough(cx, inner)
            }
            Tail::Ended => Poll::Ready(None),
            Tail::Trailers(trailers) => Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
            Tail::Failed(error) => Poll::Ready(Some(Err(error))),
        }
    }
}

/// Pass through frames, converting data to Bytes.
fn poll_passthrough<B>(
    cx: &mut Context<'_>,
    inner: Pin<&mut B>,
) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match ready!(inner.poll_frame(cx)) {
        None => Poll::Ready(None),
        Some(Ok(frame)) => {
            let frame = frame.map_data(|mut data| data.copy_to_bytes(data.remaining()));
            Poll::Ready(Some(Ok(frame)))
        }
        Some(Err(e)) => Poll::Ready(Some(Err(io::Error::other(e.into())))),
    }
}

/// State and buffers for an actively compressed body.
///
/// Instances are pooled; [`Recycle::reset`] closes a writer that is still
/// open, so the compressor is released however the body ends.
#[derive(Default)]
pub(crate) struct CompressedState {
    writer: Option<Box<dyn CompressingWriter>>,
    coding: Option<Coding>,
    output: BytesMut,
    always_flush: bool,
    state: CompressState,
    pending_trailers: Option<HeaderMap>,
    bytes_in: u64,
}

/// State machine for compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum CompressState {
    /// Reading data from inner body and compressing.
    #[default]
    Reading,
    /// Finishing compression after inner body is done.
    Finishing,
    /// Emitting buffered trailers.
    Trailers,
    /// Compression is complete and the writer closed.
    Done,
}

impl CompressedState {
    /// Creates a writer for `coding` and compresses `prefix` with it.
    ///
    /// On error the writer, if one was created, stays in place and is closed
    /// when the state is recycled.
    pub(crate) fn start(
        &mut self,
        coding: &Coding,
        prefix: &[u8],
        always_flush: bool,
    ) -> io::Result<()> {
        self.writer = Some(coding.provider().create()?);
        self.coding = Some(coding.clone());
        self.always_flush = always_flush;

        let mut prefix = prefix;
        if prefix.has_remaining() {
            self.write_buf(&mut prefix)?;
        }
        Ok(())
    }

    /// Returns the current compression state.
    pub(crate) fn state(&self) -> CompressState {
        self.state
    }

    /// Returns whether always flush is enabled.
    #[cfg(test)]
    pub(crate) fn always_flush(&self) -> bool {
        self.always_flush
    }

    fn coding_name(&self) -> &str {
        self.coding.as_ref().map_or("", Coding::name)
    }

    /// Compresses everything remaining in `data`.
    fn write_buf(&mut self, data: &mut impl Buf) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        while data.has_remaining() {
            let chunk = data.chunk();
            writer.write(chunk, &mut self.output)?;
            let len = chunk.len();
            self.bytes_in += len as u64;
            data.advance(len);
        }

        if self.always_flush {
            writer.flush(&mut self.output)?;
        }
        Ok(())
    }

    /// Takes the compressed bytes produced so far.
    fn take_output(&mut self) -> Option<Frame<Bytes>> {
        (!self.output.is_empty()).then(|| Frame::data(self.output.split().freeze()))
    }

    fn fail(&mut self, error: io::Error) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.state = CompressState::Done;
        Poll::Ready(Some(Err(error)))
    }

    /// Polls the inner body and compresses data.
    fn poll_compressed<B>(
        &mut self,
        cx: &mut Context<'_>,
        mut inner: Pin<&mut B>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        loop {
            match self.state {
                CompressState::Done => return Poll::Ready(None),

                CompressState::Trailers => {
                    self.state = CompressState::Done;
                    return Poll::Ready(self.pending_trailers.take().map(|t| Ok(Frame::trailers(t))));
                }

                CompressState::Finishing => {
                    if let Some(writer) = self.writer.take() {
                        if let Err(e) = writer.close(&mut self.output) {
                            return self.fail(e);
                        }
                        tracing::trace!(
                            coding = self.coding_name(),
                            bytes_in = self.bytes_in,
                            "finished compressed body"
                        );
                    }
                    self.state = if self.pending_trailers.is_some() {
                        CompressState::Trailers
                    } else {
                        CompressState::Done
                    };
                    if let Some(frame) = self.take_output() {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                }

                CompressState::Reading => {
                    // Emit output left over from the buffered prefix first
                    if let Some(frame) = self.take_output() {
                        return Poll::Ready(Some(Ok(frame)));
                    }

                    match ready!(inner.as_mut().poll_frame(cx)) {
                        None => self.state = CompressState::Finishing,
                        Some(Err(e)) => return self.fail(io::Error::other(e.into())),
                        Some(Ok(frame)) => match frame.into_data() {
                            Ok(mut data) => {
                                if let Err(e) = self.write_buf(&mut data) {
                                    return self.fail(e);
                                }
                            }
                            Err(frame) => {
                                if let Ok(trailers) = frame.into_trailers() {
                                    // Finish compression before the trailers
                                    self.pending_trailers = Some(trailers);
                                    self.state = CompressState::Finishing;
                                }
                            }
                        },
                    }
                }
            }
        }
    }
}

impl Recycle for CompressedState {
    fn reset(&mut self) {
        if let Some(writer) = self.writer.take() {
            // The body was dropped or failed before the stream finished
            if let Err(error) = writer.close(&mut self.output) {
                tracing::warn!(coding = self.coding_name(), %error, "failed to close compressor");
            }
        }

        self.coding = None;
        if self.output.capacity() > MAX_RETAINED_OUTPUT {
            self.output = BytesMut::new();
        } else {
            self.output.clear();
        }
        self.always_flush = false;
        self.state = CompressState::Reading;
        self.pending_trailers = None;
        self.bytes_in = 0;
    }
}

impl<B> CompressionBody<B> {
    /// Creates a compressed body from a started compression state.
    pub(crate) fn compressed(inner: B, state: Pooled<CompressedState>) -> Self {
        Self {
            kind: Kind::Compressed { inner, state },
        }
    }

    /// Creates a passthrough body without compression.
    pub fn passthrough(inner: B) -> Self {
        Self::replay(inner, Bytes::new(), Tail::Open)
    }

    /// Creates a passthrough body emitting `buffered` and then `tail`.
    pub(crate) fn replay(inner: B, buffered: Bytes, tail: Tail) -> Self {
        let buffered = (!buffered.is_empty()).then_some(buffered);
        Self {
            kind: Kind::Passthrough {
                inner,
                replay: Replay { buffered, tail },
            },
        }
    }

    /// Returns whether this body is being compressed.
    pub fn is_compressed(&self) -> bool {
        matches!(self.kind, Kind::Compressed { .. })
    }

    #[cfg(test)]
    pub(crate) fn compressed_state(&self) -> Option<&CompressedState> {
        match &self.kind {
            Kind::Compressed { state, .. } => Some(&**state),
            Kind::Passthrough { .. } => None,
        }
    }
}

impl<B> Body for CompressionBody<B>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project().kind.project() {
            KindProj::Passthrough { inner, replay } => replay.poll_frame(cx, inner),
            KindProj::Compressed { inner, state } => state.poll_compressed(cx, inner),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Passthrough { inner, replay } => {
                replay.buffered.is_none()
                    && match replay.tail {
                        Tail::Open => inner.is_end_stream(),
                        Tail::Ended => true,
                        Tail::Trailers(_) | Tail::Failed(_) => false,
                    }
            }
            Kind::Compressed { state, .. } => state.state() == CompressState::Done,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Passthrough { inner, replay } => match (&replay.buffered, &replay.tail) {
                (None, Tail::Open) => inner.size_hint(),
                (Some(data), Tail::Ended | Tail::Trailers(_)) => {
                    SizeHint::with_exact(data.len() as u64)
                }
                (None, Tail::Ended | Tail::Trailers(_)) => SizeHint::with_exact(0),
                _ => SizeHint::default(),
            },
            // Compressed size is unknown
            Kind::Compressed { .. } => SizeHint::default(),
        }
    }
}
