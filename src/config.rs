//! Configuration management for FrameWave

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::streaming::{FanOut, OverflowPolicy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete FrameWave configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub distribution: DistributionConfig,

    #[serde(default)]
    pub preview: PreviewConfig,

    /// Known cameras, keyed by device name
    #[serde(default, rename = "camera")]
    pub cameras: Vec<CameraConfig>,
}

/// External encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EncoderConfig {
    /// Encoder executable (ffmpeg)
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Input backend override ("dshow", "v4l2", "avfoundation").
    /// Detected from the host platform when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_format: Option<String>,

    /// Real-time buffer size passed to the input backend; `"off"` or an
    /// empty string leaves the flag out
    #[serde(default = "default_rtbufsize")]
    pub rtbufsize: String,

    /// How long a stopping encoder may take before it is killed
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            input_format: None,
            rtbufsize: default_rtbufsize(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl EncoderConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Buffer size to pass on, or `None` when switched off
    pub fn rtbufsize(&self) -> Option<&str> {
        let size = self.rtbufsize.trim();
        if size.is_empty() || size.eq_ignore_ascii_case(RTBUFSIZE_OFF) {
            None
        } else {
            Some(size)
        }
    }
}

/// HTTP server configuration shared by every per-camera listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    /// Grace period for in-flight responses when a listener shuts down
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// HTTP Basic credentials. An empty username disables the check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthConfig {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

impl AuthConfig {
    pub fn is_enabled(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Per-camera frame queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DistributionConfig {
    /// Frames buffered per camera (30 frames = 1 sec @ 30fps)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    #[serde(default)]
    pub fan_out: FanOut,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            overflow: OverflowPolicy::default(),
            fan_out: FanOut::default(),
        }
    }
}

/// Live preview settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PreviewConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Camera shown in the preview; the first configured camera when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            camera: None,
        }
    }
}

/// Capture resolution, written as "WIDTHxHEIGHT"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("resolution must look like 1280x720, got {:?}", s));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width = w.trim().parse().map_err(|_| invalid())?;
        let height = h.trim().parse().map_err(|_| invalid())?;
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

/// Per-camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    /// Device name as reported by the capture backend
    pub name: String,

    #[serde(default)]
    pub resolution: Resolution,

    /// Target frames per second
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// JPEG quality (1-100, higher is better)
    #[serde(default = "default_quality")]
    pub quality: u32,

    /// HTTP port the stream is served on
    pub port: u16,

    #[serde(default)]
    pub enabled: bool,

    /// Highest frame rate the device advertises, filled in by probing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fps: Option<u32>,

    /// Read chunk and residual cap in bytes; derived from the resolution when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,

    #[serde(default = "default_adjustment")]
    pub brightness: u32,

    #[serde(default = "default_adjustment")]
    pub contrast: u32,

    #[serde(default = "default_adjustment")]
    pub saturation: u32,

    #[serde(default = "default_adjustment")]
    pub sharpness: u32,
}

/// Neutral value for brightness, contrast, saturation and sharpness
pub const NEUTRAL_ADJUSTMENT: u32 = 50;

/// Buffer size used when the resolution gives no usable estimate
pub const FALLBACK_BUFFER_SIZE: usize = 64 * 1024;

/// `rtbufsize` value that leaves the flag off the command line
pub const RTBUFSIZE_OFF: &str = "off";

impl CameraConfig {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            resolution: Resolution::default(),
            fps: default_fps(),
            quality: default_quality(),
            port,
            enabled: false,
            max_fps: None,
            buffer_size: None,
            brightness: NEUTRAL_ADJUSTMENT,
            contrast: NEUTRAL_ADJUSTMENT,
            saturation: NEUTRAL_ADJUSTMENT,
            sharpness: NEUTRAL_ADJUSTMENT,
        }
    }

    /// Effective read chunk / residual cap for this camera
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
            .filter(|&size| size > 0)
            .unwrap_or_else(|| estimate_buffer_size(self.resolution))
    }
}

/// Estimates a buffer holding several frames at the given resolution.
///
/// A raw 24-bit frame compressed roughly 20:1, plus 20% headroom, times five.
pub fn estimate_buffer_size(resolution: Resolution) -> usize {
    let raw = resolution.width as usize * resolution.height as usize * 3;
    let estimated_jpeg = raw / 20;
    let per_frame = estimated_jpeg + estimated_jpeg / 5;
    if per_frame == 0 {
        return FALLBACK_BUFFER_SIZE;
    }
    per_frame * 5
}

// Default value functions
fn default_program() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_rtbufsize() -> String {
    "100M".to_string()
}
fn default_stop_grace_ms() -> u64 {
    2000
}
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_capacity() -> usize {
    30
}
fn default_fps() -> u32 {
    30
}
fn default_quality() -> u32 {
    100
}
fn default_adjustment() -> u32 {
    NEUTRAL_ADJUSTMENT
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Looks up a camera by device name
    pub fn camera(&self, name: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.name == name)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacity = self.distribution.capacity;
        if capacity == 0 || capacity > 1000 {
            return Err(ConfigError::Invalid(format!(
                "distribution capacity must be between 1 and 1000, got {}",
                capacity
            )));
        }

        if self.server.auth.username.contains(':') {
            return Err(ConfigError::Invalid(
                "auth username must not contain ':'".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for camera in &self.cameras {
            if !names.insert(camera.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate camera name {:?}",
                    camera.name
                )));
            }

            validate_camera(camera)?;

            if camera.enabled && !ports.insert(camera.port) {
                return Err(ConfigError::Invalid(format!(
                    "{}: port {} is already used by another enabled camera",
                    camera.name, camera.port
                )));
            }
        }

        Ok(())
    }
}

/// Validates a single camera entry
pub fn validate_camera(cam: &CameraConfig) -> Result<(), ConfigError> {
    if cam.name.trim().is_empty() {
        return Err(ConfigError::Invalid("camera name must not be empty".to_string()));
    }

    if cam.resolution.width == 0 || cam.resolution.height == 0 {
        return Err(ConfigError::Invalid(format!(
            "{}: width and height must be > 0",
            cam.name
        )));
    }

    if cam.fps == 0 || cam.fps > 120 {
        return Err(ConfigError::Invalid(format!(
            "{}: FPS must be between 1 and 120, got {}",
            cam.name, cam.fps
        )));
    }

    if cam.quality == 0 || cam.quality > 100 {
        return Err(ConfigError::Invalid(format!(
            "{}: quality must be between 1 and 100, got {}",
            cam.name, cam.quality
        )));
    }

    if cam.port == 0 {
        return Err(ConfigError::Invalid(format!("{}: port must be > 0", cam.name)));
    }

    for (label, value) in [
        ("brightness", cam.brightness),
        ("contrast", cam.contrast),
        ("saturation", cam.saturation),
        ("sharpness", cam.sharpness),
    ] {
        if value > 100 {
            return Err(ConfigError::Invalid(format!(
                "{}: {} must be between 0 and 100, got {}",
                cam.name, label, value
            )));
        }
    }

    Ok(())
}
