//! One camera's running pipeline: encoder, pump, rate monitor and server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SessionError;
use crate::capture::{CaptureError, EncoderProcess, EncoderSupervisor, FpsMonitor};
use crate::config::{CameraConfig, Config};
use crate::streaming::{FanOut, FrameChannel, FrameReader, OverflowPolicy, PreviewGate};
use crate::web::{Credentials, MjpegServer};

/// Time allowed for the pump and rate tasks once their pipes are closed
const TASK_GRACE: Duration = Duration::from_secs(1);

/// Frames between periodic stats log lines
const STATS_INTERVAL: u64 = 100;

/// Settings every session is started with
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub bind_ip: String,
    pub credentials: Option<Credentials>,
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    pub fan_out: FanOut,
    pub encoder_grace: Duration,
    pub server_grace: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_ip: config.server.bind_ip.clone(),
            credentials: Credentials::from_config(&config.server.auth),
            capacity: config.distribution.capacity,
            overflow: config.distribution.overflow,
            fan_out: config.distribution.fan_out,
            encoder_grace: config.encoder.stop_grace(),
            server_grace: config.server.shutdown_grace(),
        }
    }
}

/// Runtime handles of one streaming camera
pub(crate) struct CaptureSession {
    camera: String,
    local_addr: SocketAddr,
    started_at: Instant,
    channel: FrameChannel,
    token: CancellationToken,
    encoder: EncoderProcess,
    rate_rx: watch::Receiver<Option<u32>>,
    pump: JoinHandle<()>,
    monitor: JoinHandle<()>,
    server: JoinHandle<()>,
}

impl CaptureSession {
    /// Binds the listener, spawns the encoder and wires up the tasks.
    ///
    /// The listener is bound first so a port conflict never leaves an
    /// encoder running.
    pub async fn start(
        camera: &CameraConfig,
        settings: &SessionSettings,
        supervisor: &EncoderSupervisor,
        preview: Arc<PreviewGate>,
        parent: &CancellationToken,
    ) -> Result<Self, SessionError> {
        let token = parent.child_token();
        let channel = FrameChannel::new(settings.capacity, settings.overflow, settings.fan_out);

        let server = MjpegServer::bind(
            &camera.name,
            &settings.bind_ip,
            camera.port,
            channel.clone(),
            token.clone(),
            settings.credentials.clone(),
        )
        .await
        .map_err(|source| SessionError::Bind {
            camera: camera.name.clone(),
            source,
        })?;
        let local_addr = server.local_addr();

        let mut encoder = supervisor.start(camera)?;
        let missing = |pipe| CaptureError::MissingPipe {
            camera: camera.name.clone(),
            pipe,
        };
        let stdout = encoder.take_stdout().ok_or_else(|| missing("stdout"))?;
        let stderr = encoder.take_stderr().ok_or_else(|| missing("stderr"))?;

        let (rate_tx, rate_rx) = watch::channel(None);
        let monitor = tokio::spawn(
            FpsMonitor::new(camera.name.clone(), rate_tx, Arc::clone(&preview)).run(stderr),
        );

        let reader = FrameReader::new(stdout, camera.buffer_size());
        let pump = tokio::spawn(pump_frames(
            camera.name.clone(),
            reader,
            channel.clone(),
            preview,
            token.clone(),
        ));

        let server = tokio::spawn(server.serve(settings.server_grace));

        info!(
            camera = %camera.name,
            addr = %local_addr,
            buffer_size = camera.buffer_size(),
            "Capture session started"
        );

        Ok(Self {
            camera: camera.name.clone(),
            local_addr,
            started_at: Instant::now(),
            channel,
            token,
            encoder,
            rate_rx,
            pump,
            monitor,
            server,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn channel(&self) -> &FrameChannel {
        &self.channel
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Latest frame rate the encoder reported
    pub fn observed_fps(&self) -> Option<u32> {
        *self.rate_rx.borrow()
    }

    /// False once the encoder exited, its output ended or the session was cancelled
    pub fn is_live(&mut self) -> bool {
        !self.token.is_cancelled() && !self.pump.is_finished() && self.encoder.is_running()
    }

    /// Stops everything, bounded by the encoder and server grace periods
    pub async fn shutdown(self, encoder_grace: Duration, server_grace: Duration) {
        let CaptureSession {
            camera,
            started_at,
            channel,
            token,
            encoder,
            pump,
            monitor,
            mut server,
            ..
        } = self;

        debug!(camera = %camera, "Stopping capture session");
        token.cancel();
        channel.close();

        if let Err(e) = encoder.stop(encoder_grace).await {
            warn!(camera = %camera, error = %e, "Failed to stop encoder");
        }

        // The server bounds its own connection draining by the same grace
        match timeout(server_grace + TASK_GRACE, &mut server).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(camera = %camera, error = %e, "MJPEG server task failed"),
            Err(_) => {
                warn!(
                    camera = %camera,
                    grace_secs = server_grace.as_secs(),
                    "MJPEG server did not stop in time, aborting"
                );
                server.abort();
            }
        }

        for (label, mut task) in [("pump", pump), ("fps monitor", monitor)] {
            if timeout(TASK_GRACE, &mut task).await.is_err() {
                debug!(camera = %camera, task = label, "Task still running, aborting");
                task.abort();
            }
        }

        let stats = channel.stats();
        info!(
            camera = %camera,
            uptime_secs = started_at.elapsed().as_secs(),
            published = stats.frames_published,
            dropped = stats.frames_dropped,
            delivered = stats.frames_delivered,
            "Capture session stopped"
        );
    }
}

/// Moves frames from the encoder output into the channel and the preview.
///
/// Ends when the output ends or the session is cancelled; either way the
/// channel is closed and the session token cancelled so viewers and the
/// server wind down with it.
async fn pump_frames<R: AsyncRead + Unpin>(
    camera: String,
    mut reader: FrameReader<R>,
    channel: FrameChannel,
    preview: Arc<PreviewGate>,
    token: CancellationToken,
) {
    let mut frames = 0u64;

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = reader.next_frame() => frame,
        };

        let Some(frame) = frame else {
            info!(camera = %camera, frames, "Encoder output ended");
            break;
        };

        preview.offer_frame(&camera, &frame);
        channel.publish(frame);
        frames += 1;

        if frames % STATS_INTERVAL == 0 {
            let stats = channel.stats();
            info!(
                camera = %camera,
                frames,
                dropped = stats.frames_dropped,
                delivered = stats.frames_delivered,
                viewers = stats.subscribers,
                truncated_bytes = reader.truncated_bytes(),
                "Stats"
            );
        }
    }

    channel.close();
    token.cancel();
}
