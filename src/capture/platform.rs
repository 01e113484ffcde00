//! Platform detection for encoder input backends

use std::env;

/// Platform information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformInfo {
    /// Windows (DirectShow)
    Windows,

    /// macOS (AVFoundation)
    MacOS,

    /// Linux and other Unix (Video4Linux2)
    Linux,
}

/// Detects current platform
pub fn detect_platform() -> PlatformInfo {
    match env::consts::OS {
        "windows" => PlatformInfo::Windows,
        "macos" => PlatformInfo::MacOS,
        _ => PlatformInfo::Linux, // Fallback
    }
}

impl PlatformInfo {
    /// The encoder's input format for capture devices
    pub fn input_format(self) -> &'static str {
        match self {
            PlatformInfo::Windows => "dshow",
            PlatformInfo::MacOS => "avfoundation",
            PlatformInfo::Linux => "v4l2",
        }
    }
}

/// Input selector for a device name under the given input format
pub fn device_selector(input_format: &str, device: &str) -> String {
    match input_format {
        "dshow" => format!("video={}", device),
        _ => device.to_string(),
    }
}
