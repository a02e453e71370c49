//! Response writer wrappers: transparent mutators over a [`ResponseSink`].
//!
//! Each wrapper holds an inner sink and overrides `write` (and sometimes
//! `write_status`) while forwarding everything else. They compose by
//! nesting: the outermost wrapper in a fault list is the one the
//! downstream handler actually writes to.

use crate::ResponseSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Bandwidth-throttling writer: emits at most `bytes_per_second` bytes
/// before sleeping. A non-positive rate makes this a transparent
/// forwarder.
pub struct SlowWriter {
    inner: Arc<dyn ResponseSink>,
    bytes_per_second: f64,
    cancellation: CancellationToken,
}

impl SlowWriter {
    pub fn new(inner: Arc<dyn ResponseSink>, bytes_per_second: f64) -> Self {
        Self::with_cancellation(inner, bytes_per_second, CancellationToken::new())
    }

    pub fn with_cancellation(
        inner: Arc<dyn ResponseSink>,
        bytes_per_second: f64,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            inner,
            bytes_per_second,
            cancellation,
        }
    }
}

#[async_trait]
impl ResponseSink for SlowWriter {
    async fn write_status(&self, status: u16) {
        self.inner.write_status(status).await;
    }

    async fn set_header(&self, name: &str, value: &str) {
        self.inner.set_header(name, value).await;
    }

    async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        if self.bytes_per_second <= 0.0 {
            return self.inner.write(buf).await;
        }

        let chunk_len = (self.bytes_per_second.max(1.0)) as usize;
        let mut written = 0usize;
        let mut first_err = None;

        for chunk in buf.chunks(chunk_len.max(1)) {
            match self.inner.write(chunk).await {
                Ok(n) => written += n,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    break;
                }
            }
            let _ = self.inner.flush().await;

            let sleep_secs = chunk.len() as f64 / self.bytes_per_second;
            tokio::select! {
                _ = sleep(Duration::from_secs_f64(sleep_secs)) => {}
                _ = self.cancellation.cancelled() => break,
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.inner.flush().await
    }

    fn can_hijack(&self) -> bool {
        self.inner.can_hijack()
    }

    async fn hijack(&self) -> std::io::Result<()> {
        self.inner.hijack().await
    }
}

/// Byte-corrupting writer with a private PRNG so it never contends with
/// (or is biased by) the injector's selection PRNG.
pub struct CorruptingWriter {
    inner: Arc<dyn ResponseSink>,
    corrupt_rate: f64,
    rng: Mutex<StdRng>,
}

impl CorruptingWriter {
    pub fn new(inner: Arc<dyn ResponseSink>, corrupt_rate: f64) -> Self {
        Self {
            inner,
            corrupt_rate,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }
}

#[async_trait]
impl ResponseSink for CorruptingWriter {
    async fn write_status(&self, status: u16) {
        self.inner.write_status(status).await;
    }

    async fn set_header(&self, name: &str, value: &str) {
        self.inner.set_header(name, value).await;
    }

    async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        if self.corrupt_rate <= 0.0 {
            return self.inner.write(buf).await;
        }

        let mut corrupted = buf.to_vec();
        {
            let mut rng = self.rng.lock();
            for byte in corrupted.iter_mut() {
                if rng.random::<f64>() < self.corrupt_rate {
                    *byte = rng.random::<u8>();
                }
            }
        }
        self.inner.write(&corrupted).await
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.inner.flush().await
    }

    fn can_hijack(&self) -> bool {
        self.inner.can_hijack()
    }

    async fn hijack(&self) -> std::io::Result<()> {
        self.inner.hijack().await
    }
}

/// Truncating writer: caps total body bytes at `max_bytes`, but always
/// reports the caller's input length once the cap is reached so upstream
/// producers never see a short-write error.
pub struct TruncatingWriter {
    inner: Arc<dyn ResponseSink>,
    max_bytes: usize,
    written: AtomicUsize,
}

impl TruncatingWriter {
    pub fn new(inner: Arc<dyn ResponseSink>, max_bytes: usize) -> Self {
        Self {
            inner,
            max_bytes,
            written: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ResponseSink for TruncatingWriter {
    async fn write_status(&self, status: u16) {
        self.inner.write_status(status).await;
    }

    async fn set_header(&self, name: &str, value: &str) {
        self.inner.set_header(name, value).await;
    }

    async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.written.load(Ordering::SeqCst);
        let remaining = self.max_bytes.saturating_sub(written);

        if remaining == 0 {
            return Ok(buf.len());
        }

        let to_write = buf.len().min(remaining);
        self.inner.write(&buf[..to_write]).await?;
        self.written.fetch_add(to_write, Ordering::SeqCst);
        Ok(to_write)
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.inner.flush().await
    }

    fn can_hijack(&self) -> bool {
        self.inner.can_hijack()
    }

    async fn hijack(&self) -> std::io::Result<()> {
        self.inner.hijack().await
    }
}

/// Delayed writer: sleeps once before the first header or body write,
/// then passes everything through unchanged.
pub struct DelayedWriter {
    inner: Arc<dyn ResponseSink>,
    delay: Duration,
    fired: AtomicBool,
    cancellation: CancellationToken,
}

impl DelayedWriter {
    pub fn new(inner: Arc<dyn ResponseSink>, delay: Duration) -> Self {
        Self::with_cancellation(inner, delay, CancellationToken::new())
    }

    pub fn with_cancellation(
        inner: Arc<dyn ResponseSink>,
        delay: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            inner,
            delay,
            fired: AtomicBool::new(false),
            cancellation,
        }
    }

    async fn fire_once(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) && !self.delay.is_zero() {
            tokio::select! {
                _ = sleep(self.delay) => {}
                _ = self.cancellation.cancelled() => {}
            }
        }
    }
}

#[async_trait]
impl ResponseSink for DelayedWriter {
    async fn write_status(&self, status: u16) {
        self.fire_once().await;
        self.inner.write_status(status).await;
    }

    async fn set_header(&self, name: &str, value: &str) {
        self.inner.set_header(name, value).await;
    }

    async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.fire_once().await;
        self.inner.write(buf).await
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.inner.flush().await
    }

    fn can_hijack(&self) -> bool {
        self.inner.can_hijack()
    }

    async fn hijack(&self) -> std::io::Result<()> {
        self.inner.hijack().await
    }
}

/// Chunked dribble writer: an optional initial delay, then the body is
/// emitted in fixed-size chunks separated by `chunk_delay`.
pub struct ChunkedDribbleWriter {
    inner: Arc<dyn ResponseSink>,
    chunk_size: usize,
    chunk_delay: Duration,
    initial_delay: Duration,
    cancellation: CancellationToken,
}

impl ChunkedDribbleWriter {
    pub fn new(
        inner: Arc<dyn ResponseSink>,
        chunk_size: usize,
        chunk_delay: Duration,
        initial_delay: Duration,
    ) -> Self {
        Self::with_cancellation(
            inner,
            chunk_size,
            chunk_delay,
            initial_delay,
            CancellationToken::new(),
        )
    }

    pub fn with_cancellation(
        inner: Arc<dyn ResponseSink>,
        chunk_size: usize,
        chunk_delay: Duration,
        initial_delay: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
            chunk_delay,
            initial_delay,
            cancellation,
        }
    }
}

#[async_trait]
impl ResponseSink for ChunkedDribbleWriter {
    async fn write_status(&self, status: u16) {
        self.inner.write_status(status).await;
    }

    async fn set_header(&self, name: &str, value: &str) {
        self.inner.set_header(name, value).await;
    }

    async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.initial_delay.is_zero() {
            tokio::select! {
                _ = sleep(self.initial_delay) => {}
                _ = self.cancellation.cancelled() => return Ok(0),
            }
        }

        let mut written = 0usize;
        let mut chunks = buf.chunks(self.chunk_size).peekable();
        while let Some(chunk) = chunks.next() {
            match self.inner.write(chunk).await {
                Ok(n) => written += n,
                Err(_) => break,
            }
            let _ = self.inner.flush().await;

            if chunks.peek().is_some() && !self.chunk_delay.is_zero() {
                tokio::select! {
                    _ = sleep(self.chunk_delay) => {}
                    _ = self.cancellation.cancelled() => break,
                }
            }
        }

        Ok(written)
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.inner.flush().await
    }

    fn can_hijack(&self) -> bool {
        self.inner.can_hijack()
    }

    async fn hijack(&self) -> std::io::Result<()> {
        self.inner.hijack().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        status: StdMutex<Option<u16>>,
        body: StdMutex<Vec<u8>>,
        hijacked: AtomicBool,
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn write_status(&self, status: u16) {
            *self.status.lock().unwrap() = Some(status);
        }

        async fn set_header(&self, _name: &str, _value: &str) {}

        async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
            self.body.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn can_hijack(&self) -> bool {
            true
        }

        async fn hijack(&self) -> std::io::Result<()> {
            self.hijacked.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn truncating_writer_caps_and_reports_bytes_accepted() {
        let recording = Arc::new(RecordingSink::default());
        let writer = TruncatingWriter::new(recording.clone(), 5);

        let n = writer.write(b"Hello, World!").await.unwrap();
        assert_eq!(n, 5, "reports only the bytes actually accepted");
        assert_eq!(&*recording.body.lock().unwrap(), b"Hello");

        // Once the cap is reached, further writes are silently discarded
        // but still report the caller's input length.
        let n2 = writer.write(b"more").await.unwrap();
        assert_eq!(n2, 4);
        assert_eq!(&*recording.body.lock().unwrap(), b"Hello");
    }

    #[tokio::test]
    async fn slow_writer_takes_approximately_expected_time() {
        let recording = Arc::new(RecordingSink::default());
        let writer = SlowWriter::new(recording, 100.0);

        let start = std::time::Instant::now();
        writer.write(&[0u8; 13]).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(120), "elapsed={:?}", elapsed);
    }

    #[tokio::test]
    async fn slow_writer_is_transparent_when_disabled() {
        let recording = Arc::new(RecordingSink::default());
        let writer = SlowWriter::new(recording.clone(), 0.0);

        let start = std::time::Instant::now();
        writer.write(b"hello").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(20));
        assert_eq!(&*recording.body.lock().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn corrupting_writer_forwards_when_disabled() {
        let recording = Arc::new(RecordingSink::default());
        let writer = CorruptingWriter::new(recording.clone(), 0.0);

        writer.write(b"unchanged").await.unwrap();
        assert_eq!(&*recording.body.lock().unwrap(), b"unchanged");
    }

    #[tokio::test]
    async fn corrupting_writer_preserves_length() {
        let recording = Arc::new(RecordingSink::default());
        let writer = CorruptingWriter::new(recording.clone(), 1.0);

        let input = vec![0u8; 256];
        writer.write(&input).await.unwrap();
        assert_eq!(recording.body.lock().unwrap().len(), 256);
    }

    #[tokio::test]
    async fn delayed_writer_fires_once() {
        let recording = Arc::new(RecordingSink::default());
        let writer = DelayedWriter::new(recording.clone(), Duration::from_millis(30));

        let start = std::time::Instant::now();
        writer.write(b"a").await.unwrap();
        let first = start.elapsed();
        assert!(first >= Duration::from_millis(25));

        let start2 = std::time::Instant::now();
        writer.write(b"b").await.unwrap();
        assert!(start2.elapsed() < Duration::from_millis(10));

        assert_eq!(&*recording.body.lock().unwrap(), b"ab");
    }

    #[tokio::test]
    async fn chunked_dribble_emits_all_bytes() {
        let recording = Arc::new(RecordingSink::default());
        let writer =
            ChunkedDribbleWriter::new(recording.clone(), 4, Duration::from_millis(1), Duration::ZERO);

        writer.write(b"0123456789").await.unwrap();
        assert_eq!(&*recording.body.lock().unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn hijack_forwards_to_inner_sink() {
        let recording = Arc::new(RecordingSink::default());
        let writer = SlowWriter::new(recording.clone(), 0.0);

        assert!(writer.can_hijack());
        writer.hijack().await.unwrap();
        assert!(recording.hijacked.load(Ordering::SeqCst));
    }
}
