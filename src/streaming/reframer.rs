//! Recovers JPEG frame boundaries from an encoder's MJPEG byte stream
//!
//! The encoder writes back-to-back JPEG images to stdout with no framing
//! other than each image's End Of Image marker. Reads may split one image
//! across many chunks or batch several images into one chunk, so frames are
//! cut out of a residual buffer that always gets rescanned across chunk
//! boundaries.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

/// JPEG marker bytes
pub mod markers {
    pub const PREFIX: u8 = 0xFF;
    pub const EOI: u8 = 0xD9; // End of Image
}

/// Incremental frame extractor over an append-only byte stream
#[derive(Debug)]
pub struct FrameReframer {
    residual: BytesMut,
    /// Offset up to which the residual holds no complete marker
    scanned: usize,
    max_residual: usize,
    truncated_bytes: u64,
}

impl FrameReframer {
    /// Creates a reframer that keeps at most `max_residual` unframed bytes
    pub fn new(max_residual: usize) -> Self {
        Self {
            residual: BytesMut::with_capacity(max_residual.min(1 << 20)),
            scanned: 0,
            max_residual: max_residual.max(2),
            truncated_bytes: 0,
        }
    }

    /// Appends a chunk and returns every frame it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.residual.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(end) = self.find_marker() {
            frames.push(self.residual.split_to(end).freeze());
            self.scanned = 0;
        }

        if self.residual.len() > self.max_residual {
            // Lossy under overload: the next marker completes a cut frame
            let excess = self.residual.len() - self.max_residual;
            let _ = self.residual.split_to(excess);
            self.scanned = self.scanned.saturating_sub(excess);
            self.truncated_bytes += excess as u64;
            trace!(excess, "Residual buffer truncated");
        }

        frames
    }

    /// Returns the end offset (exclusive, marker included) of the first frame
    fn find_marker(&mut self) -> Option<usize> {
        // Step back one byte so a marker split across pushes is still seen
        let start = self.scanned.saturating_sub(1);
        let found = self.residual[start..]
            .windows(2)
            .position(|w| w[0] == markers::PREFIX && w[1] == markers::EOI);

        match found {
            Some(pos) => Some(start + pos + 2),
            None => {
                self.scanned = self.residual.len();
                None
            }
        }
    }

    /// Bytes waiting for an end marker
    pub fn residual_len(&self) -> usize {
        self.residual.len()
    }

    /// Total bytes discarded by residual truncation
    pub fn truncated_bytes(&self) -> u64 {
        self.truncated_bytes
    }
}

/// Reads frames from an async byte source, one at a time
pub struct FrameReader<R> {
    reader: R,
    reframer: FrameReframer,
    pending: std::collections::VecDeque<Bytes>,
    chunk: Vec<u8>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `buffer_size` is both the read chunk length and the residual cap
    pub fn new(reader: R, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(2);
        Self {
            reader,
            reframer: FrameReframer::new(buffer_size),
            pending: std::collections::VecDeque::new(),
            chunk: vec![0u8; buffer_size],
            finished: false,
        }
    }

    /// Next complete frame, or `None` once the source hits EOF or fails.
    ///
    /// A read error is the normal way an encoder pipe ends after a stop, so
    /// it is logged and not returned.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            if self.finished {
                return None;
            }

            match self.reader.read(&mut self.chunk).await {
                Ok(0) => {
                    debug!(residual = self.reframer.residual_len(), "Frame source reached EOF");
                    self.finished = true;
                }
                Ok(n) => {
                    let frames = self.reframer.push(&self.chunk[..n]);
                    self.pending.extend(frames);
                }
                Err(e) => {
                    debug!(error = %e, "Frame source read failed");
                    self.finished = true;
                }
            }
        }
    }

    /// Converts the reader into a lazy stream of frames
    pub fn into_stream(self) -> impl Stream<Item = Bytes> {
        stream::unfold(self, |mut reader| async move {
            reader.next_frame().await.map(|frame| (frame, reader))
        })
    }

    pub fn truncated_bytes(&self) -> u64 {
        self.reframer.truncated_bytes()
    }
}
