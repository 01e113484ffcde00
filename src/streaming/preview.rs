//! Live preview of the selected camera
//!
//! An embedding UI implements `PreviewSink`; the capture pipeline only talks
//! to the `PreviewGate`, which forwards frames and frame rates of the selected
//! camera while streaming is active and the preview is switched on.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives preview frames and rate updates
pub trait PreviewSink: Send + Sync + 'static {
    /// A complete JPEG frame from the selected camera
    fn show_frame(&self, camera: &str, frame: &Bytes);

    /// Latest frame rate reported by the selected camera's encoder
    fn show_rate(&self, camera: &str, fps: u32);

    /// Streaming stopped or the selection changed
    fn clear(&self);
}

/// Sink that discards everything, for headless use
#[derive(Debug, Default)]
pub struct NullPreview;

impl PreviewSink for NullPreview {
    fn show_frame(&self, _camera: &str, _frame: &Bytes) {}
    fn show_rate(&self, _camera: &str, _fps: u32) {}
    fn clear(&self) {}
}

/// Sink that remembers the most recent frame and rate
#[derive(Debug, Default)]
pub struct LatestPreview {
    state: Mutex<LatestState>,
}

#[derive(Debug, Default, Clone)]
pub struct LatestState {
    pub camera: Option<String>,
    pub frame: Option<Bytes>,
    pub fps: Option<u32>,
    pub frames_shown: u64,
}

impl LatestPreview {
    pub fn snapshot(&self) -> LatestState {
        self.state.lock().clone()
    }
}

impl PreviewSink for LatestPreview {
    fn show_frame(&self, camera: &str, frame: &Bytes) {
        let mut state = self.state.lock();
        if state.camera.as_deref() != Some(camera) {
            state.camera = Some(camera.to_string());
        }
        state.frame = Some(frame.clone());
        state.frames_shown += 1;
    }

    fn show_rate(&self, camera: &str, fps: u32) {
        let mut state = self.state.lock();
        if state.camera.as_deref() != Some(camera) {
            state.camera = Some(camera.to_string());
        }
        state.fps = Some(fps);
    }

    fn clear(&self) {
        *self.state.lock() = LatestState::default();
    }
}

/// Decides which camera reaches the preview sink
pub struct PreviewGate {
    sink: Arc<dyn PreviewSink>,
    selected: RwLock<Option<String>>,
    enabled: AtomicBool,
    streaming: AtomicBool,
}

impl PreviewGate {
    pub fn new(sink: Arc<dyn PreviewSink>, selected: Option<String>, enabled: bool) -> Self {
        Self {
            sink,
            selected: RwLock::new(selected),
            enabled: AtomicBool::new(enabled),
            streaming: AtomicBool::new(false),
        }
    }

    fn is_selected(&self, camera: &str) -> bool {
        self.streaming.load(Ordering::Acquire)
            && self.selected.read().as_deref() == Some(camera)
    }

    /// Forwards a frame if `camera` is previewed
    pub fn offer_frame(&self, camera: &str, frame: &Bytes) {
        if self.enabled.load(Ordering::Acquire) && self.is_selected(camera) {
            self.sink.show_frame(camera, frame);
        }
    }

    /// Forwards a rate if `camera` is selected, whether or not frames are shown
    pub fn offer_rate(&self, camera: &str, fps: u32) {
        if self.is_selected(camera) {
            self.sink.show_rate(camera, fps);
        }
    }

    pub fn select(&self, camera: Option<String>) {
        let mut selected = self.selected.write();
        if *selected != camera {
            *selected = camera;
            self.sink.clear();
        }
    }

    pub fn selected(&self) -> Option<String> {
        self.selected.read().clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was && !enabled {
            self.sink.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        let was = self.streaming.swap(streaming, Ordering::AcqRel);
        if was && !streaming {
            self.sink.clear();
        }
    }
}
