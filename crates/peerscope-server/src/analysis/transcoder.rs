//! Transcoder boundary.
//!
//! The media transcoder is an external collaborator: given the path of a
//! persisted session description it produces a byte stream of encoded
//! frames. The production implementation spawns ffmpeg reading the SDP and
//! emitting MJPEG on stdout; tests use [`ScriptedTranscoder`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::config::FfmpegConfig;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to launch transcoder: {0}")]
    Launch(#[source] std::io::Error),

    #[error("transcoder stdout is not piped")]
    MissingStdout,
}

/// Terminal outcome of a transcode run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeExit {
    Clean,
    Abnormal(String),
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn spawn(&self, sdp_path: &Path) -> Result<TranscodeSession, TranscodeError>;
}

/// Frame source plus the control half used to kill or reap the collaborator.
pub struct TranscodeSession {
    pub frames: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Box<dyn TranscodeControl>,
}

impl TranscodeSession {
    pub fn new(
        frames: impl AsyncRead + Send + Unpin + 'static,
        control: impl TranscodeControl + 'static,
    ) -> Self {
        Self {
            frames: Box::new(frames),
            control: Box::new(control),
        }
    }
}

#[async_trait]
pub trait TranscodeControl: Send {
    /// Tear the collaborator down; safe to call at any point.
    async fn kill(&mut self);

    /// Reap the collaborator after its stream ended.
    async fn wait(&mut self) -> TranscodeExit;
}

/// ffmpeg invocation matching the recording branch's SDP contract: SDP
/// input over the loopback RTP sink, scaled MJPEG frames on stdout.
pub struct FfmpegTranscoder {
    config: FfmpegConfig,
}

impl FfmpegTranscoder {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, sdp_path: &Path) -> Result<TranscodeSession, TranscodeError> {
        let mut child = Command::new(&self.config.bin)
            .arg("-nostdin")
            .args(["-protocol_whitelist", "file,rtp,udp,pipe"])
            .args(["-f", "sdp"])
            .arg("-i")
            .arg(sdp_path)
            .args(["-c:v", "mjpeg"])
            .args(["-f", "image2pipe"])
            .args(["-s", &self.config.output_size])
            .args(["-q:v", &self.config.quality.to_string()])
            .args(["-r", &self.config.fps.to_string()])
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TranscodeError::Launch)?;

        let stdout = child.stdout.take().ok_or(TranscodeError::MissingStdout)?;
        if let Some(stderr) = child.stderr.take() {
            let sdp = sdp_path.to_path_buf();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(target: "transcoder", sdp = %sdp.display(), "{line}");
                }
            });
        }

        tracing::info!(pid = ?child.id(), sdp = %sdp_path.display(), "transcoder spawned");
        Ok(TranscodeSession::new(stdout, FfmpegControl { child }))
    }
}

struct FfmpegControl {
    child: Child,
}

#[async_trait]
impl TranscodeControl for FfmpegControl {
    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "transcoder already gone on kill");
        }
    }

    async fn wait(&mut self) -> TranscodeExit {
        match self.child.wait().await {
            Ok(status) if status.success() => TranscodeExit::Clean,
            Ok(status) => TranscodeExit::Abnormal(format!("transcoder exited with {status}")),
            Err(e) => TranscodeExit::Abnormal(format!("failed to reap transcoder: {e}")),
        }
    }
}

/// Test transcoder that replays a canned byte stream and reports a scripted
/// exit. The session description path is recorded for assertions.
pub struct ScriptedTranscoder {
    stream: Vec<u8>,
    exit: TranscodeExit,
    spawned_with: std::sync::Mutex<Vec<PathBuf>>,
}

impl ScriptedTranscoder {
    pub fn new(stream: Vec<u8>, exit: TranscodeExit) -> Self {
        Self {
            stream,
            exit,
            spawned_with: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// SDP paths this transcoder was spawned with, in order.
    pub fn spawned_with(&self) -> Vec<PathBuf> {
        self.spawned_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn spawn(&self, sdp_path: &Path) -> Result<TranscodeSession, TranscodeError> {
        self.spawned_with
            .lock()
            .unwrap()
            .push(sdp_path.to_path_buf());
        Ok(TranscodeSession::new(
            std::io::Cursor::new(self.stream.clone()),
            ScriptedControl {
                exit: self.exit.clone(),
            },
        ))
    }
}

pub struct ScriptedControl {
    pub exit: TranscodeExit,
}

#[async_trait]
impl TranscodeControl for ScriptedControl {
    async fn kill(&mut self) {}

    async fn wait(&mut self) -> TranscodeExit {
        self.exit.clone()
    }
}
