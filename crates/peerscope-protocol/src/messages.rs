use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{ConsumerParams, MediaKind, TransportParams};

/// Signaling operations a client can request for its room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    /// Fetch the room router's RTP capabilities
    GetRouterRtpCapabilities,

    /// Create the room's send-side WebRTC transport
    CreateProducerTransport,

    /// Create the room's receive-side WebRTC transport
    CreateConsumerTransport,

    /// Finish DTLS negotiation for the send-side transport
    ConnectProducerTransport { dtls_parameters: Value },

    /// Finish DTLS negotiation for the receive-side transport
    ConnectConsumerTransport { dtls_parameters: Value },

    /// Publish a media track over the send-side transport
    Produce { kind: MediaKind, rtp_parameters: Value },

    /// Subscribe to the room's published track
    Consume { rtp_capabilities: Value },

    /// Fork the room's video into the server-side analysis branch
    StartAnalysis,
}

/// Envelope for a client request, carrying the client-chosen correlation id
/// echoed back in the matching reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    pub request_id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Messages sent from server to client via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Session established for the requested room
    SessionReady { room: String, connection_id: Uuid },

    /// Reply to [`ClientRequest::GetRouterRtpCapabilities`]
    RouterRtpCapabilities {
        request_id: u64,
        rtp_capabilities: Value,
    },

    /// Reply to the transport creation requests
    TransportCreated {
        request_id: u64,
        params: TransportParams,
    },

    /// Reply to the transport connect requests
    TransportConnected { request_id: u64 },

    /// Reply to [`ClientRequest::Produce`]
    Produced { request_id: u64, id: String },

    /// Reply to [`ClientRequest::Consume`]
    Consumed {
        request_id: u64,
        params: ConsumerParams,
    },

    /// Reply to [`ClientRequest::StartAnalysis`]; `already_active` is set when
    /// the room was already being analyzed and no new resources were created
    AnalysisStarted {
        request_id: u64,
        consumer_id: String,
        already_active: bool,
    },

    /// A request failed; `request_id` is absent for failures that cannot be
    /// correlated (e.g. an unparseable message)
    Error {
        request_id: Option<u64>,
        code: String,
        message: String,
    },

    /// Server-pushed analysis event stream
    AnalysisResult { event: AnalysisEvent },
}

/// One event on the per-room analysis stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AnalysisEvent {
    /// A frame was analyzed; `frame` is the base64-encoded source frame
    Result {
        frame: String,
        result: Value,
        timestamp: DateTime<Utc>,
    },

    /// An analysis failure. With `frame` set the failure is scoped to that
    /// frame and the stream continues; without it the failure is terminal
    /// and the pipeline is torn down.
    Error {
        frame: Option<String>,
        message: String,
    },

    /// The transcoder reached end of stream; no further events follow
    End,
}

impl AnalysisEvent {
    /// Whether this event ends the analysis stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisEvent::End | AnalysisEvent::Error { frame: None, .. }
        )
    }
}
