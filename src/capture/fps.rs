//! Frame rate extraction from encoder diagnostics

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::streaming::PreviewGate;

static RATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:fps|rate)=\s*(\d+)").expect("rate pattern is valid"));

/// Longest partial line kept before it is flushed as-is
const MAX_LINE: usize = 64 * 1024;

/// Extracts the integer rate from a progress line such as
/// `frame=  120 fps= 30 q=2.0 size=...`
pub fn parse_rate(line: &str) -> Option<u32> {
    RATE_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Splits a byte stream into lines at `\n` or `\r`, holding partial lines
/// until their terminator arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns the non-empty lines it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.flush_into(&mut lines);
            } else {
                self.partial.push(byte);
                if self.partial.len() >= MAX_LINE {
                    self.flush_into(&mut lines);
                }
            }
        }
        lines
    }

    /// Returns whatever is left once the stream ends
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if !self.partial.is_empty() {
            lines.push(String::from_utf8_lossy(&self.partial).into_owned());
            self.partial.clear();
        }
    }
}

/// Watches one encoder's stderr and republishes the observed frame rate
pub struct FpsMonitor {
    camera: String,
    rate_tx: watch::Sender<Option<u32>>,
    preview: Arc<PreviewGate>,
}

impl FpsMonitor {
    pub fn new(camera: String, rate_tx: watch::Sender<Option<u32>>, preview: Arc<PreviewGate>) -> Self {
        Self {
            camera,
            rate_tx,
            preview,
        }
    }

    /// Runs until the stream ends or fails
    pub async fn run<R: AsyncRead + Unpin>(self, mut reader: R) {
        let mut splitter = LineSplitter::new();
        let mut chunk = [0u8; 4096];

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in splitter.push(&chunk[..n]) {
                        self.handle_line(&line);
                    }
                }
                Err(e) => {
                    debug!(camera = %self.camera, error = %e, "Encoder diagnostics read failed");
                    break;
                }
            }
        }

        if let Some(line) = splitter.finish() {
            self.handle_line(&line);
        }

        debug!(camera = %self.camera, "FPS monitor stopped");
    }

    fn handle_line(&self, line: &str) {
        trace!(camera = %self.camera, line, "encoder");

        if let Some(fps) = parse_rate(line) {
            self.rate_tx.send_replace(Some(fps));
            self.preview.offer_rate(&self.camera, fps);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::LatestPreview;

    #[test]
    fn test_parse_rate() {
        assert_eq!(
            parse_rate("frame=  120 fps= 30 q=2.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s"),
            Some(30)
        );
        assert_eq!(parse_rate("rate=25"), Some(25));
        assert_eq!(parse_rate("fps=7.5"), Some(7));
        assert_eq!(parse_rate("bitrate=2097.2kbits/s speed=1x"), None);
        assert_eq!(parse_rate("Input #0, dshow, from 'video=USB Camera':"), None);
        assert_eq!(parse_rate(""), None);
    }

    #[test]
    fn test_splitter_holds_partial_lines() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"frame=1 fp").is_empty());
        assert_eq!(splitter.push(b"s=29\rframe=2"), vec!["frame=1 fps=29"]);
        assert_eq!(splitter.push(b" fps=30\r\n"), vec!["frame=2 fps=30"]);
        assert_eq!(splitter.push(b"tail"), Vec::<String>::new());
        assert_eq!(splitter.finish().as_deref(), Some("tail"));
        assert_eq!(splitter.finish(), None);
    }

    #[tokio::test]
    async fn test_monitor_publishes_latest_rate() {
        let sink = Arc::new(LatestPreview::default());
        let gate = Arc::new(PreviewGate::new(sink.clone(), Some("cam".to_string()), true));
        gate.set_streaming(true);

        let (tx, rx) = watch::channel(None);
        let monitor = FpsMonitor::new("cam".to_string(), tx, gate);

        let input: &[u8] = b"Stream mapping:\nframe=1 fps=0.0 q=2\rframe=30 fps= 29 q=2\rframe=60 fps= 30";
        monitor.run(input).await;

        assert_eq!(*rx.borrow(), Some(30));
        assert_eq!(sink.snapshot().fps, Some(30));
    }
}
