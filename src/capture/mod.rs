//! External encoder process supervision

pub mod encoder;
pub mod fps;
mod platform;
pub mod probe;

pub use fps::FpsMonitor;
pub use platform::{detect_platform, device_selector, PlatformInfo};
pub use probe::{DeviceCapabilities, DeviceProber};

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::{CameraConfig, EncoderConfig};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to spawn encoder for {camera}: {source}")]
    Spawn {
        camera: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder for {camera} has no {pipe} pipe")]
    MissingPipe { camera: String, pipe: &'static str },

    #[error("failed to stop encoder for {camera}: {source}")]
    Stop {
        camera: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(windows)]
pub(crate) fn hide_console(command: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
pub(crate) fn hide_console(_command: &mut Command) {}

/// Spawns encoder processes from camera settings
#[derive(Debug, Clone)]
pub struct EncoderSupervisor {
    config: EncoderConfig,
    input_format: String,
}

impl EncoderSupervisor {
    pub fn new(config: EncoderConfig) -> Self {
        let input_format = config
            .input_format
            .clone()
            .unwrap_or_else(|| detect_platform().input_format().to_string());

        Self {
            config,
            input_format,
        }
    }

    pub fn input_format(&self) -> &str {
        &self.input_format
    }

    pub fn stop_grace(&self) -> Duration {
        self.config.stop_grace()
    }

    /// Argument list the encoder is started with for `camera`
    pub fn args_for(&self, camera: &CameraConfig) -> Vec<String> {
        encoder::build_args(camera, &self.config, &self.input_format)
    }

    /// A prober that uses the same encoder binary and input backend
    pub fn prober(&self) -> DeviceProber {
        DeviceProber::new(self.config.program.clone(), self.input_format.clone())
    }

    /// Starts an encoder for one camera with stdin, stdout and stderr piped
    pub fn start(&self, camera: &CameraConfig) -> Result<EncoderProcess, CaptureError> {
        let args = self.args_for(camera);

        info!(
            camera = %camera.name,
            resolution = %camera.resolution,
            fps = camera.fps,
            quality = camera.quality,
            "Starting encoder"
        );
        debug!(camera = %camera.name, program = %self.config.program.display(), ?args, "Encoder command");

        let mut command = Command::new(&self.config.program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console(&mut command);

        let mut child = command.spawn().map_err(|source| CaptureError::Spawn {
            camera: camera.name.clone(),
            source,
        })?;

        let missing = |pipe| CaptureError::MissingPipe {
            camera: camera.name.clone(),
            pipe,
        };
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let stdin = child.stdin.take();

        info!(camera = %camera.name, pid = ?child.id(), "Encoder started");

        Ok(EncoderProcess {
            camera: camera.name.clone(),
            child,
            stdin,
            stdout: Some(stdout),
            stderr: Some(stderr),
        })
    }
}

/// Handle to one running encoder
#[derive(Debug)]
pub struct EncoderProcess {
    camera: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl EncoderProcess {
    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// MJPEG output; can be taken once
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Diagnostic text; can be taken once
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Checks whether the process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Asks the encoder to quit and kills it once `grace` has passed.
    ///
    /// The quit command goes out first. On Unix a process still running after
    /// a quarter of the grace also gets SIGTERM.
    pub async fn stop(mut self, grace: Duration) -> Result<(), CaptureError> {
        if !self.is_running() {
            debug!(camera = %self.camera, "Encoder already exited");
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + grace;
        self.send_quit().await;

        let mut exited = tokio::time::timeout(grace / 4, self.child.wait()).await;
        if exited.is_err() {
            self.terminate();
            exited = tokio::time::timeout_at(deadline, self.child.wait()).await;
        }

        match exited {
            Ok(Ok(status)) => {
                info!(camera = %self.camera, %status, "Encoder exited");
                Ok(())
            }
            Ok(Err(source)) => Err(CaptureError::Stop {
                camera: self.camera,
                source,
            }),
            Err(_) => {
                warn!(camera = %self.camera, grace_ms = grace.as_millis() as u64, "Encoder ignored stop request, killing");
                self.child.kill().await.map_err(|source| CaptureError::Stop {
                    camera: self.camera.clone(),
                    source,
                })?;
                info!(camera = %self.camera, "Encoder killed");
                Ok(())
            }
        }
    }

    /// Sends `q` on stdin and closes it
    async fn send_quit(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.write_all(b"q").await {
                debug!(camera = %self.camera, error = %e, "Could not write quit command");
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            debug!(camera = %self.camera, pid, "Encoder still running, sending SIGTERM");
            // SAFETY: pid belongs to a child we have not reaped yet
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(camera = %self.camera, pid, "SIGTERM delivery failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    #[test]
    fn test_spawn_failure_is_per_camera_error() {
        let supervisor = EncoderSupervisor::new(EncoderConfig {
            program: PathBuf::from("/nonexistent/framewave-encoder"),
            ..EncoderConfig::default()
        });

        let camera = CameraConfig::new("cam0", 18081);
        let result = supervisor.start(&camera);
        assert_matches!(result, Err(CaptureError::Spawn { camera, .. }) if camera == "cam0");
    }

    #[test]
    fn test_input_format_override() {
        let supervisor = EncoderSupervisor::new(EncoderConfig {
            input_format: Some("lavfi".to_string()),
            ..EncoderConfig::default()
        });
        assert_eq!(supervisor.input_format(), "lavfi");

        let args = supervisor.args_for(&CameraConfig::new("testsrc", 18082));
        assert_eq!(&args[..2], ["-f", "lavfi"]);
    }

    #[cfg(unix)]
    fn process(program: &str, args: &[&str]) -> EncoderProcess {
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::piped()).kill_on_drop(true);
        let mut child = command.spawn().unwrap();
        let stdin = child.stdin.take();
        EncoderProcess {
            camera: "cam".to_string(),
            child,
            stdin,
            stdout: None,
            stderr: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_process() {
        let process = process("sleep", &["30"]);

        let started = std::time::Instant::now();
        process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_lets_encoder_quit_on_command_before_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("terminated");
        let script = format!(
            "trap 'echo term > \"{}\"; exit 1' TERM; read cmd; exit 0",
            marker.display()
        );
        let process = process("sh", &["-c", &script]);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        process.stop(Duration::from_secs(4)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!marker.exists(), "Quit command should be enough");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_process_ignoring_term() {
        let process = process("sh", &["-c", "trap '' TERM; while true; do sleep 1; done"]);
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        process.stop(Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
