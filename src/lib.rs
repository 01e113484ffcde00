//! Multi-camera MJPEG streaming over HTTP
//!
//! FrameWave supervises one external encoder process (ffmpeg) per camera,
//! cuts its MJPEG output into individual JPEG frames and serves them to
//! browsers as `multipart/x-mixed-replace` streams, one port per camera:
//! - Zero-copy frame sharing using `bytes::Bytes`
//! - Bounded per-camera queues with an explicit overflow policy
//! - Frame rate reporting parsed from encoder diagnostics
//! - Optional HTTP Basic access control
//!
//! # Example
//!
//! ```no_run
//! use framewave::{CaptureOrchestrator, Config};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load("framewave.toml")?;
//! let orchestrator = CaptureOrchestrator::headless(config)?;
//!
//! let summary = orchestrator.start_all().await;
//! for (camera, reason) in &summary.failed {
//!     eprintln!("{camera}: {reason}");
//! }
//!
//! tokio::signal::ctrl_c().await?;
//! orchestrator.stop_all().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod orchestrator;
pub mod streaming;
pub mod web;

// Re-exports for convenience
pub use capture::{CaptureError, DeviceCapabilities, DeviceProber, EncoderSupervisor};
pub use config::{CameraConfig, Config, ConfigError, Resolution};
pub use orchestrator::{CameraStatus, CaptureOrchestrator, SessionError, StartSummary};
pub use streaming::{FrameChannel, FrameReframer, PreviewGate, PreviewSink};
pub use web::{MjpegServer, ServerError};
