use crate::error::ConfigError;
use bytes::BytesMut;
#[cfg(feature = "brotli")]
use compression_codecs::brotli::{BrotliEncoder, params::EncoderParams as BrotliParams};
#[cfg(feature = "deflate")]
use compression_codecs::zlib::ZlibEncoder;
#[cfg(feature = "gzip")]
use compression_codecs::gzip::GzipEncoder;
#[cfg(feature = "zstd")]
use compression_codecs::zstd::ZstdEncoder;
use compression_codecs::EncodeV2;
use compression_core::Level;
use compression_core::util::{PartialBuffer, WriteBuffer};
use std::io;
use std::ops::RangeInclusive;

const OUTPUT_CHUNK_SIZE: usize = 8 * 1024; // 8KB per encoder call

/// A compressing writer for a single response body.
///
/// Output is appended to the `sink` handed to each call. A writer is created
/// per response and closed exactly once, which the consuming
/// [`close`](CompressingWriter::close) enforces.
pub trait CompressingWriter: Send {
    /// Compresses `input`, appending any produced output to `sink`.
    fn write(&mut self, input: &[u8], sink: &mut BytesMut) -> io::Result<()>;

    /// Flushes everything written so far so the peer can decode it.
    fn flush(&mut self, sink: &mut BytesMut) -> io::Result<()>;

    /// Finishes the stream and releases the writer's resources.
    ///
    /// Must succeed even if nothing was ever written.
    fn close(self: Box<Self>, sink: &mut BytesMut) -> io::Result<()>;
}

/// Creates compressing writers for one content coding.
///
/// Providers are shared read-only by every request going through a layer.
pub trait CompressorProvider: Send + Sync + 'static {
    /// Creates a fresh writer for one response body.
    fn create(&self) -> io::Result<Box<dyn CompressingWriter>>;
}

/// Built-in compression codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Zstd compression.
    Zstd,
    /// Brotli compression.
    Brotli,
    /// Gzip compression.
    Gzip,
    /// Deflate compression.
    Deflate,
}

impl Codec {
    /// Returns the Content-Encoding header value for this codec.
    pub fn content_encoding(&self) -> &'static str {
        match self {
            Codec::Zstd => "zstd",
            Codec::Brotli => "br",
            Codec::Gzip => "gzip",
            Codec::Deflate => "deflate",
        }
    }

    /// Returns the default tie-break priority; higher is preferred.
    pub fn priority(&self) -> i32 {
        match self {
            Codec::Deflate => -300,
            Codec::Gzip => -200,
            Codec::Brotli => -100,
            Codec::Zstd => -50,
        }
    }

    /// Returns whether support for this codec was compiled in.
    pub fn is_supported(&self) -> bool {
        match self {
            Codec::Zstd => cfg!(feature = "zstd"),
            Codec::Brotli => cfg!(feature = "brotli"),
            Codec::Gzip => cfg!(feature = "gzip"),
            Codec::Deflate => cfg!(feature = "deflate"),
        }
    }

    /// Range accepted for [`Level::Precise`].
    fn level_range(&self) -> RangeInclusive<i32> {
        match self {
            // levels above 22 are rejected by libzstd
            Codec::Zstd => 1..=22,
            Codec::Brotli => 0..=11,
            Codec::Gzip | Codec::Deflate => 0..=9,
        }
    }

    /// Creates a new encoder for this codec.
    #[allow(unused_variables)]
    fn encoder(&self, level: Level) -> io::Result<Box<dyn EncodeV2 + Send>> {
        match self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => Ok(Box::new(ZstdEncoder::new(zstd_level(level)))),
            #[cfg(feature = "brotli")]
            Codec::Brotli => Ok(Box::new(BrotliEncoder::new(
                BrotliParams::default().quality(level),
            ))),
            #[cfg(feature = "gzip")]
            Codec::Gzip => Ok(Box::new(GzipEncoder::new(level.into()))),
            // HTTP's deflate coding is the zlib format
            #[cfg(feature = "deflate")]
            Codec::Deflate => Ok(Box::new(ZlibEncoder::new(level.into()))),
            #[allow(unreachable_patterns)]
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} support is not compiled in", self.content_encoding()),
            )),
        }
    }
}

#[cfg(feature = "zstd")]
fn zstd_level(level: Level) -> i32 {
    match level {
        Level::Fastest => 1,
        Level::Best => 19,
        Level::Precise(level) => level,
        _ => 3,
    }
}

/// A [`CompressorProvider`] backed by one of the built-in [`Codec`]s.
#[derive(Debug, Clone, Copy)]
pub struct CodecProvider {
    codec: Codec,
    level: Level,
}

impl CodecProvider {
    /// Creates a provider compressing with `codec` at `level`.
    ///
    /// Fails if the codec is not compiled in, if a precise level is out of
    /// range, or if an encoder cannot be constructed with these parameters.
    pub fn new(codec: Codec, level: Level) -> Result<Self, ConfigError> {
        if !codec.is_supported() {
            return Err(ConfigError::Unsupported(codec.content_encoding()));
        }
        if let Level::Precise(precise) = level {
            let range = codec.level_range();
            if !range.contains(&precise) {
                return Err(ConfigError::InvalidLevel {
                    coding: codec.content_encoding(),
                    level: precise,
                    min: *range.start(),
                    max: *range.end(),
                });
            }
        }

        let provider = Self { codec, level };
        let trial = provider.create().map_err(|source| ConfigError::Provider {
            coding: codec.content_encoding().to_owned(),
            source,
        })?;
        trial
            .close(&mut BytesMut::new())
            .map_err(|source| ConfigError::Provider {
                coding: codec.content_encoding().to_owned(),
                source,
            })?;
        Ok(provider)
    }

    /// Returns the codec this provider compresses with.
    pub fn codec(&self) -> Codec {
        self.codec
    }
}

impl CompressorProvider for CodecProvider {
    fn create(&self) -> io::Result<Box<dyn CompressingWriter>> {
        Ok(Box::new(EncoderWriter {
            encoder: self.codec.encoder(self.level)?,
        }))
    }
}

/// Adapts a `compression-codecs` encoder to [`CompressingWriter`].
struct EncoderWriter {
    encoder: Box<dyn EncodeV2 + Send>,
}

impl CompressingWriter for EncoderWriter {
    fn write(&mut self, input: &[u8], sink: &mut BytesMut) -> io::Result<()> {
        let mut input_buf = PartialBuffer::new(input);

        // Keep encoding until all input is consumed
        while input_buf.written_len() < input.len() {
            let consumed = input_buf.written_len();
            let ((), written) = with_output(sink, |output| {
                self.encoder
                    .encode(&mut input_buf, output)
                    .map_err(io::Error::other)
            })?;

            if written == 0 && input_buf.written_len() == consumed {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "encoder made no progress",
                ));
            }
        }
        Ok(())
    }

    fn flush(&mut self, sink: &mut BytesMut) -> io::Result<()> {
        loop {
            let (done, _) = with_output(sink, |output| {
                self.encoder.flush(output).map_err(io::Error::other)
            })?;
            if done {
                return Ok(());
            }
        }
    }

    fn close(mut self: Box<Self>, sink: &mut BytesMut) -> io::Result<()> {
        loop {
            let (done, _) = with_output(sink, |output| {
                self.encoder.finish(output).map_err(io::Error::other)
            })?;
            if done {
                return Ok(());
            }
        }
    }
}

/// Runs one encoder step against a fresh chunk at the end of `sink`.
///
/// The sink keeps exactly the bytes the step produced.
fn with_output<T>(
    sink: &mut BytesMut,
    step: impl FnOnce(&mut WriteBuffer<'_>) -> io::Result<T>,
) -> io::Result<(T, usize)> {
    let start = sink.len();
    sink.resize(start + OUTPUT_CHUNK_SIZE, 0);

    let (result, written) = {
        let mut output = WriteBuffer::new_initialized(&mut sink[start..]);
        let result = step(&mut output);
        (result, output.written_len())
    };

    sink.truncate(start + written);
    result.map(|value| (value, written))
}
