//! Capture device enumeration through the encoder's probing modes

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::capture::platform::device_selector;
use crate::config::Resolution;

static DEVICE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)" \(video\)"#).expect("device pattern is valid"));

static MODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)x(\d+) fps=(\d+)").expect("mode pattern is valid"));

/// Resolutions and rate limit advertised by one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCapabilities {
    /// Unique resolutions, sorted by width then height
    pub resolutions: Vec<Resolution>,
    /// Highest advertised frame rate (0 when nothing was parsed)
    pub max_fps: u32,
}

/// Extracts video device names from a device listing
pub fn parse_device_names(output: &str) -> Vec<String> {
    DEVICE_PATTERN
        .captures_iter(output)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Extracts supported modes from an option listing.
///
/// Lines that do not parse are skipped; garbage input yields an empty result.
pub fn parse_capabilities(output: &str) -> DeviceCapabilities {
    let mut seen = HashSet::new();
    let mut caps = DeviceCapabilities::default();

    for m in MODE_PATTERN.captures_iter(output) {
        let (Ok(width), Ok(height), Ok(fps)) =
            (m[1].parse::<u32>(), m[2].parse::<u32>(), m[3].parse::<u32>())
        else {
            continue;
        };

        caps.max_fps = caps.max_fps.max(fps);

        let resolution = Resolution::new(width, height);
        if seen.insert(resolution) {
            caps.resolutions.push(resolution);
        }
    }

    caps.resolutions.sort_by_key(|r| (r.width, r.height));
    caps
}

/// Runs the encoder in probing mode
pub struct DeviceProber {
    program: PathBuf,
    input_format: String,
}

impl DeviceProber {
    pub fn new(program: PathBuf, input_format: impl Into<String>) -> Self {
        Self {
            program,
            input_format: input_format.into(),
        }
    }

    /// Names of the video capture devices the encoder can see
    pub async fn list_devices(&self) -> Vec<String> {
        let output = self
            .run(&["-list_devices", "true", "-f", self.input_format.as_str(), "-i", "dummy"])
            .await;
        let names = parse_device_names(&output);
        debug!(count = names.len(), "Probed capture devices");
        names
    }

    /// Modes supported by one device
    pub async fn capabilities(&self, device: &str) -> DeviceCapabilities {
        let selector = device_selector(&self.input_format, device);
        let output = self
            .run(&["-list_options", "true", "-f", self.input_format.as_str(), "-i", selector.as_str()])
            .await;
        let caps = parse_capabilities(&output);
        debug!(
            device,
            resolutions = caps.resolutions.len(),
            max_fps = caps.max_fps,
            "Probed device capabilities"
        );
        caps
    }

    /// Runs the encoder and returns stdout and stderr combined.
    ///
    /// Probing modes exit with a failure status by design, so only a spawn
    /// failure is reported, and then as empty output.
    async fn run(&self, args: &[&str]) -> String {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        super::hide_console(&mut command);

        match command.output().await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                text
            }
            Err(e) => {
                warn!(program = %self.program.display(), error = %e, "Failed to run device probe");
                String::new()
            }
        }
    }
}
