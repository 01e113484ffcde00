//! Encoder command-line construction
//!
//! Pure functions from a camera's settings to the argument list of an
//! ffmpeg-compatible encoder that writes raw MJPEG to stdout and progress
//! lines to stderr.

use crate::capture::platform::device_selector;
use crate::config::{CameraConfig, EncoderConfig, NEUTRAL_ADJUSTMENT};

/// Best (smallest) quantizer the MJPEG encoder accepts
pub const QSCALE_BEST: u32 = 2;

/// Worst (largest) quantizer the MJPEG encoder accepts
pub const QSCALE_WORST: u32 = 31;

/// Maps quality 1..=100 onto the quantizer range, 100 → 2 and 1 → 31.
///
/// Values outside 1..=100 are clamped.
pub fn quality_to_qscale(quality: u32) -> u32 {
    let quality = quality.clamp(1, 100);
    QSCALE_BEST + (100 - quality) * (QSCALE_WORST - QSCALE_BEST) / 99
}

/// Rescales a 0..=100 adjustment to an offset where 50 is 0.0 (range -1..1)
fn centered(value: u32) -> f64 {
    (f64::from(value) - f64::from(NEUTRAL_ADJUSTMENT)) / f64::from(NEUTRAL_ADJUSTMENT)
}

/// Rescales a 0..=100 adjustment to a gain where 50 is 1.0 (range 0..2)
fn gain(value: u32) -> f64 {
    f64::from(value) / f64::from(NEUTRAL_ADJUSTMENT)
}

/// Builds the `-vf` filter chain: full-range scaling, resolution, frame rate,
/// then brightness/contrast/saturation and sharpening.
pub fn filter_chain(camera: &CameraConfig) -> String {
    format!(
        "scale=in_range=pc:out_range=pc,scale={res},fps={fps},\
         eq=brightness={b:.2}:contrast={c:.2}:saturation={s:.2},\
         unsharp=luma_msize_x=3:luma_msize_y=3:luma_amount={sh:.2}",
        res = camera.resolution,
        fps = camera.fps,
        b = centered(camera.brightness),
        c = gain(camera.contrast),
        s = gain(camera.saturation),
        sh = centered(camera.sharpness),
    )
}

/// Builds the full encoder argument list for one camera
pub fn build_args(camera: &CameraConfig, encoder: &EncoderConfig, input_format: &str) -> Vec<String> {
    let mut args: Vec<String> = vec!["-f".into(), input_format.into()];

    if let Some(size) = encoder.rtbufsize() {
        args.extend(["-rtbufsize".into(), size.to_string()]);
    }

    let selector = device_selector(input_format, &camera.name);
    let filters = filter_chain(camera);
    let qscale = quality_to_qscale(camera.quality).to_string();

    args.extend(
        [
            "-probesize",
            "32",
            "-i",
            selector.as_str(),
            "-pix_fmt",
            "yuv420p",
            "-color_range",
            "2",
            "-vf",
            filters.as_str(),
            "-c:v",
            "mjpeg",
            "-loglevel",
            "verbose",
            "-q:v",
            qscale.as_str(),
            "-f",
            "mjpeg",
            "-",
        ]
        .into_iter()
        .map(String::from),
    );

    args
}
