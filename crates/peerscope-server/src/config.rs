//! Server configuration.
//!
//! Values are layered: built-in defaults, then an optional `peerscope.toml`
//! next to the working directory, then `PEERSCOPE__*` environment variables
//! (double underscore as the section separator, e.g.
//! `PEERSCOPE__RECORDING__PORT=5008`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::engine::{ListenIp, RtpCodec};
use peerscope_protocol::MediaKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP/WebSocket server binds to
    pub listen_addr: SocketAddr,
    /// Origins allowed by the CORS layer
    pub allowed_origins: Vec<String>,
    pub engine: EngineConfig,
    pub recording: RecordingConfig,
    pub analysis: AnalysisConfig,
}

/// Settings handed to the SFU engine collaborator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// SFU worker binary, resolved via PATH when relative
    pub worker_bin: PathBuf,
    pub log_level: String,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Codecs offered by every room router
    pub media_codecs: Vec<RtpCodec>,
    pub webrtc_transport: WebRtcTransportConfig,
    pub plain_transport: PlainTransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebRtcTransportConfig {
    pub listen_ips: Vec<ListenIp>,
    pub initial_available_outgoing_bitrate: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlainTransportConfig {
    pub listen_ip: ListenIp,
}

/// Local sink the recording branch sends RTP to; the transcoder reads from
/// these ports.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    pub ip: IpAddr,
    pub port: u16,
    pub rtcp_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Analysis workers per room pipeline
    pub pool_size: usize,
    pub backend: AnalyzerBackend,
    pub frame_format: FrameFormat,
    /// Frames larger than this abort the pipeline
    pub max_frame_bytes: usize,
    /// Where per-room session descriptions are persisted
    pub sdp_dir: PathBuf,
    pub ffmpeg: FfmpegConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerBackend {
    /// Built-in frame-header probe; no ML runtime required
    Stats,
}

/// How the transcoder's output stream is delimited into frames.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FrameFormat {
    Mjpeg,
    LengthPrefixed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FfmpegConfig {
    pub bin: PathBuf,
    pub output_size: String,
    pub fps: u32,
    pub quality: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5000),
            allowed_origins: vec!["http://localhost:4200".to_string()],
            engine: EngineConfig::default(),
            recording: RecordingConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_bin: PathBuf::from("peerscope-sfu-worker"),
            log_level: "warn".to_string(),
            log_tags: ["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
                .into_iter()
                .map(String::from)
                .collect(),
            rtc_min_port: 10_000,
            rtc_max_port: 10_100,
            media_codecs: vec![RtpCodec {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: 97,
                clock_rate: 90_000,
            }],
            webrtc_transport: WebRtcTransportConfig::default(),
            plain_transport: PlainTransportConfig::default(),
        }
    }
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                announced_ip: None,
            }],
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

impl Default for PlainTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: ListenIp {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                announced_ip: None,
            },
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 5006,
            rtcp_port: 5007,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            pool_size: 6,
            backend: AnalyzerBackend::Stats,
            frame_format: FrameFormat::Mjpeg,
            max_frame_bytes: 2 * 1024 * 1024,
            sdp_dir: std::env::temp_dir().join("peerscope").join("sdp"),
            ffmpeg: FfmpegConfig::default(),
        }
    }
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("ffmpeg"),
            output_size: "320x240".to_string(),
            fps: 10,
            quality: 0.5,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name("peerscope").required(false))
            .add_source(
                config::Environment::with_prefix("PEERSCOPE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration sources")?;

        let cfg: Config = raw
            .try_deserialize()
            .context("failed to parse configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Startup-fatal sanity checks; a misconfigured process must not serve.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.analysis.pool_size == 0 {
            bail!("analysis.pool_size must be at least 1");
        }
        if self.engine.rtc_min_port > self.engine.rtc_max_port {
            bail!(
                "engine.rtc_min_port ({}) exceeds engine.rtc_max_port ({})",
                self.engine.rtc_min_port,
                self.engine.rtc_max_port
            );
        }
        if self.engine.media_codecs.is_empty() {
            bail!("engine.media_codecs must list at least one codec");
        }
        if !self
            .engine
            .media_codecs
            .iter()
            .any(|c| c.kind == MediaKind::Video)
        {
            bail!("engine.media_codecs must include a video codec for the analysis branch");
        }
        if self.engine.webrtc_transport.listen_ips.is_empty() {
            bail!("engine.webrtc_transport.listen_ips must not be empty");
        }
        if self.recording.port == self.recording.rtcp_port {
            bail!("recording.port and recording.rtcp_port must differ");
        }
        Ok(())
    }

    /// First configured video codec; drives the recording session description.
    pub fn video_codec(&self) -> &RtpCodec {
        self.engine
            .media_codecs
            .iter()
            .find(|c| c.kind == MediaKind::Video)
            .expect("validated configuration always carries a video codec")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut cfg = Config::default();
        cfg.analysis.pool_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_rtc_port_range_is_rejected() {
        let mut cfg = Config::default();
        cfg.engine.rtc_min_port = 20_000;
        cfg.engine.rtc_max_port = 10_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn audio_only_codec_list_is_rejected() {
        let mut cfg = Config::default();
        cfg.engine.media_codecs = vec![RtpCodec {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: 111,
            clock_rate: 48_000,
        }];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn colliding_recording_ports_are_rejected() {
        let mut cfg = Config::default();
        cfg.recording.rtcp_port = cfg.recording.port;
        assert!(cfg.validate().is_err());
    }
}
