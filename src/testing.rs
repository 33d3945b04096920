//! Providers used by unit tests.

use crate::codec::{CompressingWriter, CompressorProvider};
use bytes::BytesMut;
use std::io;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Marker appended by [`PlainProvider`] writers when closed.
pub(crate) const CLOSE_MARKER: &[u8] = b"<eof>";

#[derive(Debug, Default)]
pub(crate) struct Stats {
    created: AtomicUsize,
    flushed: AtomicUsize,
    closed: AtomicUsize,
}

/// A provider whose writers copy their input and count their calls.
#[derive(Debug, Clone, Default)]
pub(crate) struct PlainProvider {
    stats: Arc<Stats>,
    fail_create: bool,
    fail_write: bool,
    fail_close: bool,
}

impl PlainProvider {
    pub(crate) fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub(crate) fn failing_writes() -> Self {
        Self {
            fail_write: true,
            ..Self::default()
        }
    }

    pub(crate) fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    pub(crate) fn created(&self) -> usize {
        self.stats.created.load(Ordering::SeqCst)
    }

    pub(crate) fn flushed(&self) -> usize {
        self.stats.flushed.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.stats.closed.load(Ordering::SeqCst)
    }
}

impl CompressorProvider for PlainProvider {
    fn create(&self) -> io::Result<Box<dyn CompressingWriter>> {
        if self.fail_create {
            return Err(io::Error::other("provider unavailable"));
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(PlainWriter {
            stats: Arc::clone(&self.stats),
            fail_write: self.fail_write,
            fail_close: self.fail_close,
        }))
    }
}

struct PlainWriter {
    stats: Arc<Stats>,
    fail_write: bool,
    fail_close: bool,
}

impl CompressingWriter for PlainWriter {
    fn write(&mut self, input: &[u8], sink: &mut BytesMut) -> io::Result<()> {
        if self.fail_write {
            return Err(io::Error::other("write failed"));
        }
        sink.extend_from_slice(input);
        Ok(())
    }

    fn flush(&mut self, _sink: &mut BytesMut) -> io::Result<()> {
        self.stats.flushed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(self: Box<Self>, sink: &mut BytesMut) -> io::Result<()> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(io::Error::other("close failed"));
        }
        sink.extend_from_slice(CLOSE_MARKER);
        Ok(())
    }
}

/// In-memory sink for formatted log lines.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `f` with a thread-local subscriber and returns what it logged.
pub(crate) fn capture_logs(f: impl FnOnce()) -> String {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let logs = buffer.0.lock().unwrap();
    String::from_utf8_lossy(&logs).into_owned()
}
