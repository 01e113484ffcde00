//! Multi-camera capture orchestration
//!
//! `CaptureOrchestrator` owns the camera configuration and every running
//! session behind a single lock. Each `start_all` cycle runs under one root
//! cancellation token; each camera's session gets a child of it.

mod registry;
mod session;

pub use registry::SessionRegistry;

use futures::future::join_all;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureError, DeviceProber, EncoderSupervisor};
use crate::config::{CameraConfig, Config, ConfigError};
use crate::streaming::{ChannelStats, NullPreview, PreviewGate, PreviewSink};
use crate::web::ServerError;
use session::{CaptureSession, SessionSettings};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera {camera}: {source}")]
    Bind {
        camera: String,
        #[source]
        source: ServerError,
    },

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown camera {0:?}")]
    UnknownCamera(String),
}

/// Outcome of one `start_all` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartSummary {
    /// Cameras whose pipeline was started by this call
    pub started: Vec<String>,
    /// Cameras that already had a live pipeline and were left alone
    pub already_running: Vec<String>,
    /// Cameras that failed to start, with the reason
    pub failed: Vec<(String, String)>,
}

impl StartSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Snapshot of one configured camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraStatus {
    pub name: String,
    pub port: u16,
    pub enabled: bool,
    pub streaming: bool,
    pub local_addr: Option<SocketAddr>,
    pub uptime_secs: Option<u64>,
    pub observed_fps: Option<u32>,
    pub channel: Option<ChannelStats>,
}

struct State {
    config: Config,
    sessions: SessionRegistry<CaptureSession>,
    root: Option<CancellationToken>,
    streaming: bool,
}

impl State {
    /// The live root token of this streaming cycle, created on first use
    fn root_token(&mut self) -> CancellationToken {
        match &self.root {
            Some(token) if !token.is_cancelled() => token.clone(),
            _ => {
                let token = CancellationToken::new();
                self.root = Some(token.clone());
                token
            }
        }
    }
}

pub struct CaptureOrchestrator {
    state: Mutex<State>,
    supervisor: EncoderSupervisor,
    preview: Arc<PreviewGate>,
    settings: SessionSettings,
}

impl CaptureOrchestrator {
    /// Creates an idle orchestrator; nothing runs until `start_all`
    pub fn new(config: Config, sink: Arc<dyn PreviewSink>) -> Result<Self, ConfigError> {
        config.validate()?;

        let selected = config
            .preview
            .camera
            .clone()
            .or_else(|| config.cameras.first().map(|c| c.name.clone()));
        let preview = Arc::new(PreviewGate::new(sink, selected, config.preview.enabled));

        let supervisor = EncoderSupervisor::new(config.encoder.clone());
        let settings = SessionSettings::from_config(&config);

        info!(
            cameras = config.cameras.len(),
            input_format = supervisor.input_format(),
            "Capture orchestrator ready"
        );

        Ok(Self {
            state: Mutex::new(State {
                config,
                sessions: SessionRegistry::new(),
                root: None,
                streaming: false,
            }),
            supervisor,
            preview,
            settings,
        })
    }

    /// An orchestrator without a preview consumer
    pub fn headless(config: Config) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(NullPreview))
    }

    pub fn preview(&self) -> &Arc<PreviewGate> {
        &self.preview
    }

    /// Device prober using the configured encoder
    pub fn prober(&self) -> DeviceProber {
        self.supervisor.prober()
    }

    /// Starts a pipeline for every enabled camera that lacks a live one.
    ///
    /// Calling it again while streaming leaves live pipelines alone and only
    /// restarts cameras whose encoder has exited.
    pub async fn start_all(&self) -> StartSummary {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state).await
    }

    /// Stops every pipeline. Safe to call when nothing is running.
    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await;
    }

    /// Replaces (or adds) one camera's settings and, while streaming,
    /// restarts all pipelines so they pick it up.
    ///
    /// Returns the restart summary, or `None` when not streaming.
    pub async fn reconfigure(
        &self,
        camera: CameraConfig,
    ) -> Result<Option<StartSummary>, SessionError> {
        let mut state = self.state.lock().await;
        upsert_config(&mut state.config, camera)?;

        if !state.streaming {
            return Ok(None);
        }

        self.stop_locked(&mut state).await;
        Ok(Some(self.start_locked(&mut state).await))
    }

    /// Replaces (or adds) one camera's settings, restarting only that
    /// camera's pipeline when streaming.
    pub async fn upsert_camera(&self, camera: CameraConfig) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        let name = camera.name.clone();
        let enabled = camera.enabled;
        upsert_config(&mut state.config, camera)?;

        if let Some(session) = state.sessions.remove(&name) {
            self.shutdown_session(session).await;
        }

        if state.streaming && enabled {
            self.start_camera(&mut state, &name).await?;
        }
        Ok(())
    }

    /// Forgets a camera, stopping its pipeline first
    pub async fn remove_camera(&self, name: &str) -> Result<CameraConfig, SessionError> {
        let mut state = self.state.lock().await;
        let index = state
            .config
            .cameras
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| SessionError::UnknownCamera(name.to_string()))?;

        if let Some(session) = state.sessions.remove(name) {
            self.shutdown_session(session).await;
        }

        info!(camera = %name, "Camera removed");
        Ok(state.config.cameras.remove(index))
    }

    pub async fn cameras(&self) -> Vec<CameraConfig> {
        self.state.lock().await.config.cameras.clone()
    }

    pub async fn is_streaming(&self) -> bool {
        self.state.lock().await.streaming
    }

    pub async fn status(&self) -> Vec<CameraStatus> {
        let mut state = self.state.lock().await;
        let State {
            config, sessions, ..
        } = &mut *state;

        config
            .cameras
            .iter()
            .map(|camera| {
                let mut status = CameraStatus {
                    name: camera.name.clone(),
                    port: camera.port,
                    enabled: camera.enabled,
                    streaming: false,
                    local_addr: None,
                    uptime_secs: None,
                    observed_fps: None,
                    channel: None,
                };
                if let Some(session) = sessions.get_mut(&camera.name) {
                    status.streaming = session.is_live();
                    status.local_addr = Some(session.local_addr());
                    status.uptime_secs = Some(session.uptime().as_secs());
                    status.observed_fps = session.observed_fps();
                    status.channel = Some(session.channel().stats());
                }
                status
            })
            .collect()
    }

    /// Latest encoder-reported frame rate of a streaming camera
    pub async fn observed_fps(&self, name: &str) -> Option<u32> {
        let state = self.state.lock().await;
        state.sessions.get(name).and_then(|s| s.observed_fps())
    }

    /// Address a browser can open for a configured camera
    pub async fn stream_url(&self, name: &str) -> Option<String> {
        let state = self.state.lock().await;
        let camera = state.config.camera(name)?;
        let host = match state.config.server.bind_ip.as_str() {
            "0.0.0.0" | "::" | "" => "localhost",
            ip => ip,
        };
        Some(format!("http://{}:{}/", host, camera.port))
    }

    /// Chooses which camera feeds the preview (`None` for no preview)
    pub fn select_preview(&self, camera: Option<String>) {
        debug!(camera = ?camera, "Preview camera selected");
        self.preview.select(camera);
    }

    pub fn set_preview_enabled(&self, enabled: bool) {
        self.preview.set_enabled(enabled);
    }

    async fn start_locked(&self, state: &mut State) -> StartSummary {
        state.streaming = true;
        self.preview.set_streaming(true);

        let root = state.root_token();

        let enabled: Vec<CameraConfig> = state
            .config
            .cameras
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect();

        let mut summary = StartSummary::default();
        for camera in enabled {
            if let Some(session) = state.sessions.get_mut(&camera.name) {
                if session.is_live() {
                    summary.already_running.push(camera.name.clone());
                    continue;
                }
            }

            if let Some(stale) = state.sessions.remove(&camera.name) {
                info!(camera = %camera.name, "Restarting camera whose pipeline ended");
                self.shutdown_session(stale).await;
            }

            match self.spawn_session(&camera, &root).await {
                Ok(session) => {
                    state.sessions.insert(camera.name.clone(), session);
                    summary.started.push(camera.name);
                }
                Err(e) => {
                    error!(camera = %camera.name, error = %e, "Failed to start camera");
                    summary.failed.push((camera.name, e.to_string()));
                }
            }
        }

        info!(
            started = summary.started.len(),
            already_running = summary.already_running.len(),
            failed = summary.failed.len(),
            "Streaming active"
        );
        summary
    }

    async fn start_camera(&self, state: &mut State, name: &str) -> Result<(), SessionError> {
        let camera = state
            .config
            .camera(name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownCamera(name.to_string()))?;

        let root = state.root_token();

        let session = self.spawn_session(&camera, &root).await?;
        if let Some(previous) = state.sessions.insert(camera.name, session) {
            warn!(camera = %name, "Replaced a session that was still registered");
            self.shutdown_session(previous).await;
        }
        Ok(())
    }

    async fn spawn_session(
        &self,
        camera: &CameraConfig,
        root: &CancellationToken,
    ) -> Result<CaptureSession, SessionError> {
        CaptureSession::start(
            camera,
            &self.settings,
            &self.supervisor,
            Arc::clone(&self.preview),
            root,
        )
        .await
    }

    async fn stop_locked(&self, state: &mut State) {
        if let Some(root) = state.root.take() {
            root.cancel();
        }

        let sessions = state.sessions.take_all();
        let count = sessions.len();
        join_all(sessions.into_iter().map(|s| self.shutdown_session(s))).await;

        self.preview.set_streaming(false);
        if state.streaming {
            info!(sessions = count, "Streaming stopped");
        }
        state.streaming = false;
    }

    async fn shutdown_session(&self, session: CaptureSession) {
        session
            .shutdown(self.settings.encoder_grace, self.settings.server_grace)
            .await;
    }
}

/// Validates the updated camera list before committing it
fn upsert_config(config: &mut Config, camera: CameraConfig) -> Result<(), ConfigError> {
    let mut candidate = config.clone();
    match candidate.cameras.iter_mut().find(|c| c.name == camera.name) {
        Some(existing) => *existing = camera,
        None => candidate.cameras.push(camera),
    }
    candidate.validate()?;
    *config = candidate;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    fn config(cameras: Vec<CameraConfig>) -> Config {
        Config {
            encoder: EncoderConfig {
                program: PathBuf::from("/nonexistent/framewave-encoder"),
                ..EncoderConfig::default()
            },
            cameras,
            ..Config::default()
        }
    }

    fn enabled(name: &str, port: u16) -> CameraConfig {
        let mut camera = CameraConfig::new(name, port);
        camera.enabled = true;
        camera
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_stop_all_when_idle() {
        let orchestrator = CaptureOrchestrator::headless(config(vec![])).unwrap();
        orchestrator.stop_all().await;
        orchestrator.stop_all().await;
        assert!(!orchestrator.is_streaming().await);
    }

    #[tokio::test]
    async fn test_spawn_failures_are_per_camera() {
        let cameras = vec![
            enabled("cam0", free_port()),
            enabled("cam1", free_port()),
            CameraConfig::new("disabled", free_port()),
        ];
        let orchestrator = CaptureOrchestrator::headless(config(cameras)).unwrap();

        let summary = orchestrator.start_all().await;
        assert!(summary.started.is_empty());
        let failed: Vec<&str> = summary.failed.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(failed, vec!["cam0", "cam1"]);
        assert!(summary.failed[0].1.contains("spawn"));
        assert!(orchestrator.is_streaming().await);

        orchestrator.stop_all().await;
        assert!(!orchestrator.is_streaming().await);
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let orchestrator = CaptureOrchestrator::headless(config(vec![enabled("cam0", port)])).unwrap();
        let summary = orchestrator.start_all().await;

        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].1.contains("bind"), "{}", summary.failed[0].1);
        orchestrator.stop_all().await;
    }

    #[tokio::test]
    async fn test_reconfigure_when_idle_only_updates_config() {
        let orchestrator = CaptureOrchestrator::headless(config(vec![enabled("cam0", 18090)])).unwrap();

        let mut updated = enabled("cam0", 18091);
        updated.quality = 40;
        let restarted = orchestrator.reconfigure(updated).await.unwrap();

        assert_eq!(restarted, None);
        let cameras = orchestrator.cameras().await;
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].port, 18091);
        assert_eq!(cameras[0].quality, 40);
        assert!(!orchestrator.is_streaming().await);
    }

    #[tokio::test]
    async fn test_upsert_rejects_port_clash() {
        let orchestrator = CaptureOrchestrator::headless(config(vec![enabled("cam0", 18092)])).unwrap();

        let result = orchestrator.upsert_camera(enabled("cam1", 18092)).await;
        assert_matches!(result, Err(SessionError::Config(ConfigError::Invalid(_))));
        assert_eq!(orchestrator.cameras().await.len(), 1);

        orchestrator.upsert_camera(CameraConfig::new("cam1", 18092)).await.unwrap();
        assert_eq!(orchestrator.cameras().await.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_camera() {
        let orchestrator = CaptureOrchestrator::headless(config(vec![enabled("cam0", 18093)])).unwrap();

        assert_matches!(
            orchestrator.remove_camera("missing").await,
            Err(SessionError::UnknownCamera(name)) if name == "missing"
        );
        let removed = orchestrator.remove_camera("cam0").await.unwrap();
        assert_eq!(removed.port, 18093);
        assert!(orchestrator.cameras().await.is_empty());
    }

    #[tokio::test]
    async fn test_status_and_urls_when_idle() {
        let orchestrator = CaptureOrchestrator::headless(config(vec![enabled("cam0", 18094)])).unwrap();

        let status = orchestrator.status().await;
        assert_eq!(status.len(), 1);
        assert!(!status[0].streaming);
        assert_eq!(status[0].channel, None);

        assert_eq!(
            orchestrator.stream_url("cam0").await.as_deref(),
            Some("http://localhost:18094/")
        );
        assert_eq!(orchestrator.stream_url("missing").await, None);
        assert_eq!(orchestrator.observed_fps("cam0").await, None);
    }

    #[test]
    fn test_preview_defaults_to_first_camera() {
        let orchestrator = CaptureOrchestrator::headless(config(vec![
            enabled("cam0", 18095),
            enabled("cam1", 18096),
        ]))
        .unwrap();
        assert_eq!(orchestrator.preview().selected().as_deref(), Some("cam0"));

        orchestrator.select_preview(Some("cam1".to_string()));
        orchestrator.set_preview_enabled(false);
        assert_eq!(orchestrator.preview().selected().as_deref(), Some("cam1"));
        assert!(!orchestrator.preview().is_enabled());
    }
}
