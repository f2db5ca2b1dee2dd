//! SFU engine boundary.
//!
//! The coordinator never performs ICE/DTLS/SRTP or RTP routing itself; it
//! drives an external SFU engine through the opaque handles defined here.
//! Handles are only stored, forwarded to, and closed; their internals
//! (ICE/DTLS payloads, RTP parameters) travel as raw JSON between the client
//! and the engine.
//!
//! Hierarchy and close semantics follow the usual SFU model: closing a
//! router closes every transport created from it, and closing a transport
//! closes the producers and consumers riding on it. Every close is
//! idempotent.

pub mod testing;
pub mod worker;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use peerscope_protocol::{MediaKind, TransportParams};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn SFU worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("SFU worker channel closed")]
    ChannelClosed,

    #[error("SFU worker died")]
    WorkerDied,

    #[error("engine rejected {method}: {message}")]
    Rejected { method: String, message: String },

    #[error("malformed engine response: {0}")]
    Protocol(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// One codec entry in a router's media capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub preferred_payload_type: u8,
    pub clock_rate: u32,
}

impl RtpCodec {
    /// Codec name as used in an `a=rtpmap` line ("video/VP8" → "VP8").
    pub fn name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(self.mime_type.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    pub ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
}

/// Settings for the shared SFU worker process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSettings {
    pub log_level: String,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportOptions {
    pub listen_ip: ListenIp,
    pub comedia: bool,
    pub rtcp_mux: bool,
}

/// Connect parameters; WebRTC transports finish DTLS, plain transports bind
/// a remote RTP/RTCP destination.
#[derive(Debug, Clone)]
pub enum TransportConnect {
    WebRtc {
        dtls_parameters: Value,
    },
    Plain {
        ip: IpAddr,
        port: u16,
        rtcp_port: Option<u16>,
    },
}

/// Handler fired once when the worker process dies unexpectedly.
pub type DiedHandler = Box<dyn FnOnce() + Send + 'static>;

#[async_trait]
pub trait SfuEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn SfuWorker>>;
}

#[async_trait]
pub trait SfuWorker: Send + Sync {
    async fn create_router(&self, media_codecs: &[RtpCodec]) -> EngineResult<Arc<dyn SfuRouter>>;

    /// Subscribe to the worker's death. The handler fires at most once, and
    /// never for an orderly [`SfuWorker::close`].
    fn on_died(&self, handler: DiedHandler);

    async fn close(&self) -> EngineResult<()>;
}

#[async_trait]
pub trait SfuRouter: Send + Sync {
    fn id(&self) -> &str;

    /// RTP capabilities clients need before consuming; fixed at creation.
    fn rtp_capabilities(&self) -> Value;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn SfuTransport>>;

    async fn create_plain_transport(
        &self,
        options: &PlainTransportOptions,
    ) -> EngineResult<Arc<dyn SfuTransport>>;

    async fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> EngineResult<bool>;

    async fn close(&self) -> EngineResult<()>;
}

#[async_trait]
pub trait SfuTransport: Send + Sync {
    fn id(&self) -> &str;

    /// ICE/DTLS parameters for the client side; `None` for plain transports.
    fn params(&self) -> Option<TransportParams>;

    async fn connect(&self, params: TransportConnect) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> EngineResult<Arc<dyn SfuProducer>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn SfuConsumer>>;

    async fn close(&self) -> EngineResult<()>;
}

#[async_trait]
pub trait SfuProducer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    async fn close(&self) -> EngineResult<()>;
}

#[async_trait]
pub trait SfuConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    /// Engine-reported consumer type, e.g. "simple" or "simulcast".
    fn consumer_type(&self) -> &str;
    fn producer_paused(&self) -> bool;

    async fn resume(&self) -> EngineResult<()>;
    async fn set_preferred_layers(&self, spatial: u8, temporal: u8) -> EngineResult<()>;
    /// Transport-level statistics; fails once the consumer is closed.
    async fn stats(&self) -> EngineResult<Value>;
    async fn close(&self) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_name_strips_the_media_prefix() {
        let codec = RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: 97,
            clock_rate: 90_000,
        };
        assert_eq!(codec.name(), "VP8");
    }
}
