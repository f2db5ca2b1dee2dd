//! End-to-end signaling tests over a real WebSocket.
//!
//! The server runs in-process against the mock SFU engine and a scripted
//! transcoder, so the full path (upgrade, negotiation, analysis fan-out,
//! disconnect teardown) is exercised without external collaborators.
//!
//! Run with: cargo test -p peerscope-server --test signaling

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use peerscope_protocol::{
    AnalysisEvent, ClientRequest, MediaKind, ServerMessage, SignalRequest,
};
use peerscope_server::analysis::analyzer::FrameStatsFactory;
use peerscope_server::analysis::transcoder::{ScriptedTranscoder, TranscodeExit};
use peerscope_server::config::Config;
use peerscope_server::create_app;
use peerscope_server::engine::testing::MockEngine;

/// Minimal JPEG-shaped frame with a SOF0 segment carrying `w` x `h`.
fn fake_jpeg(w: u16, h: u16) -> Vec<u8> {
    let mut frame = vec![0xFF, 0xD8];
    frame.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
    frame.extend_from_slice(&h.to_be_bytes());
    frame.extend_from_slice(&w.to_be_bytes());
    frame.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
    frame.extend_from_slice(&[0xFF, 0xD9]);
    frame
}

struct TestServer {
    addr: std::net::SocketAddr,
    engine: Arc<MockEngine>,
    transcoder: Arc<ScriptedTranscoder>,
    #[allow(dead_code)]
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    _tmp: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let tmp = tempfile::tempdir()?;
        let mut config = Config::default();
        config.analysis.sdp_dir = tmp.path().to_path_buf();
        config.analysis.pool_size = 2;

        let engine = Arc::new(MockEngine::new());
        let mut stream = Vec::new();
        for _ in 0..3 {
            stream.extend_from_slice(&fake_jpeg(320, 240));
        }
        let transcoder = Arc::new(ScriptedTranscoder::new(stream, TranscodeExit::Clean));

        let (router, _sessions) = create_app(
            config,
            engine.clone(),
            transcoder.clone(),
            Arc::new(FrameStatsFactory),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            engine,
            transcoder,
            shutdown_tx: Some(shutdown_tx),
            _tmp: tmp,
        })
    }

    fn ws_url(&self, room: &str) -> String {
        format!("ws://{}/ws?room={room}", self.addr)
    }
}

struct SignalClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl SignalClient {
    async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.expect("websocket connect failed");
        Self { ws, next_id: 0 }
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            let msg = timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("server message timed out")
                .expect("socket closed unexpectedly")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).expect("unparseable server message");
            }
        }
    }

    /// Next non-push message; analysis events arriving in between are
    /// returned to the caller via `pushed`.
    async fn recv_reply(&mut self, pushed: &mut Vec<AnalysisEvent>) -> ServerMessage {
        loop {
            match self.recv().await {
                ServerMessage::AnalysisResult { event } => pushed.push(event),
                reply => return reply,
            }
        }
    }

    async fn request(
        &mut self,
        request: ClientRequest,
        pushed: &mut Vec<AnalysisEvent>,
    ) -> ServerMessage {
        self.next_id += 1;
        let payload = serde_json::to_string(&SignalRequest {
            request_id: self.next_id,
            request,
        })
        .unwrap();
        self.ws
            .send(Message::Text(payload.into()))
            .await
            .expect("websocket send failed");
        self.recv_reply(pushed).await
    }
}

#[tokio::test]
async fn full_signaling_scenario_with_analysis() {
    let server = TestServer::start().await.unwrap();
    let mut client = SignalClient::connect(&server.ws_url("abc")).await;
    let mut pushed = Vec::new();

    match client.recv().await {
        ServerMessage::SessionReady { room, .. } => assert_eq!(room, "abc"),
        other => panic!("expected sessionReady, got {other:?}"),
    }

    match client
        .request(ClientRequest::GetRouterRtpCapabilities, &mut pushed)
        .await
    {
        ServerMessage::RouterRtpCapabilities {
            rtp_capabilities, ..
        } => assert!(rtp_capabilities.get("codecs").is_some()),
        other => panic!("expected capabilities, got {other:?}"),
    }

    let producer_transport = match client
        .request(ClientRequest::CreateProducerTransport, &mut pushed)
        .await
    {
        ServerMessage::TransportCreated { params, .. } => params,
        other => panic!("expected transportCreated, got {other:?}"),
    };
    assert!(!producer_transport.id.is_empty());

    match client
        .request(
            ClientRequest::ConnectProducerTransport {
                dtls_parameters: json!({ "role": "client" }),
            },
            &mut pushed,
        )
        .await
    {
        ServerMessage::TransportConnected { .. } => {}
        other => panic!("expected transportConnected, got {other:?}"),
    }

    match client
        .request(ClientRequest::CreateConsumerTransport, &mut pushed)
        .await
    {
        ServerMessage::TransportCreated { .. } => {}
        other => panic!("expected transportCreated, got {other:?}"),
    }
    match client
        .request(
            ClientRequest::ConnectConsumerTransport {
                dtls_parameters: json!({ "role": "client" }),
            },
            &mut pushed,
        )
        .await
    {
        ServerMessage::TransportConnected { .. } => {}
        other => panic!("expected transportConnected, got {other:?}"),
    }

    let producer_id = match client
        .request(
            ClientRequest::Produce {
                kind: MediaKind::Video,
                rtp_parameters: json!({ "codecs": [] }),
            },
            &mut pushed,
        )
        .await
    {
        ServerMessage::Produced { id, .. } => id,
        other => panic!("expected produced, got {other:?}"),
    };

    match client
        .request(
            ClientRequest::Consume {
                rtp_capabilities: json!({ "codecs": [] }),
            },
            &mut pushed,
        )
        .await
    {
        ServerMessage::Consumed { params, .. } => {
            assert_eq!(params.producer_id, producer_id);
            assert_eq!(params.kind, MediaKind::Video);
        }
        other => panic!("expected consumed, got {other:?}"),
    }

    match client
        .request(ClientRequest::StartAnalysis, &mut pushed)
        .await
    {
        ServerMessage::AnalysisStarted {
            consumer_id,
            already_active,
            ..
        } => {
            assert!(!consumer_id.is_empty());
            assert!(!already_active);
        }
        other => panic!("expected analysisStarted, got {other:?}"),
    }

    // the transcoder was launched against the persisted session description
    let spawned = server.transcoder.spawned_with();
    assert_eq!(spawned.len(), 1);
    assert!(spawned[0].ends_with("abc.sdp"));

    // three analyzed frames stream back in submission order, then the end
    let mut results = pushed;
    while results.iter().filter(|e| matches!(e, AnalysisEvent::Result { .. })).count() < 3
        || !results.iter().any(|e| matches!(e, AnalysisEvent::End))
    {
        match client.recv().await {
            ServerMessage::AnalysisResult { event } => results.push(event),
            other => panic!("expected analysis events, got {other:?}"),
        }
    }
    let mut frame_index = 0;
    for event in &results {
        match event {
            AnalysisEvent::Result { frame, result, .. } => {
                frame_index += 1;
                assert!(!frame.is_empty());
                assert_eq!(result["frameIndex"], json!(frame_index));
                assert_eq!(result["width"], json!(320));
            }
            AnalysisEvent::End => {}
            other => panic!("unexpected analysis event: {other:?}"),
        }
    }
    assert_eq!(frame_index, 3);
}

#[tokio::test]
async fn signaling_against_a_fresh_room_fails_without_setup() {
    let server = TestServer::start().await.unwrap();
    let mut client = SignalClient::connect(&server.ws_url("bare")).await;
    let mut pushed = Vec::new();

    assert!(matches!(client.recv().await, ServerMessage::SessionReady { .. }));

    // producing without a transport is a structured error, not a hang-up
    match client
        .request(
            ClientRequest::Produce {
                kind: MediaKind::Video,
                rtp_parameters: json!({}),
            },
            &mut pushed,
        )
        .await
    {
        ServerMessage::Error { code, .. } => assert_eq!(code, "resourceMissing"),
        other => panic!("expected error, got {other:?}"),
    }

    // the socket is still usable afterwards
    match client
        .request(ClientRequest::GetRouterRtpCapabilities, &mut pushed)
        .await
    {
        ServerMessage::RouterRtpCapabilities { .. } => {}
        other => panic!("expected capabilities, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_messages_get_an_uncorrelated_error() {
    let server = TestServer::start().await.unwrap();
    let mut client = SignalClient::connect(&server.ws_url("abc")).await;

    assert!(matches!(client.recv().await, ServerMessage::SessionReady { .. }));

    client
        .ws
        .send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();

    match client.recv().await {
        ServerMessage::Error { request_id, code, .. } => {
            assert!(request_id.is_none());
            assert_eq!(code, "badRequest");
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn path_traversal_room_keys_are_rejected() {
    let server = TestServer::start().await.unwrap();
    let mut client = SignalClient::connect(&server.ws_url("..%2F..%2Fetc")).await;

    match client.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "invalidRoom"),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_tears_the_session_down() {
    let server = TestServer::start().await.unwrap();
    let mut client = SignalClient::connect(&server.ws_url("gone")).await;
    let mut pushed = Vec::new();

    assert!(matches!(client.recv().await, ServerMessage::SessionReady { .. }));
    client
        .request(ClientRequest::CreateProducerTransport, &mut pushed)
        .await;
    client
        .request(
            ClientRequest::Produce {
                kind: MediaKind::Video,
                rtp_parameters: json!({}),
            },
            &mut pushed,
        )
        .await;

    drop(client);

    timeout(Duration::from_secs(2), async {
        loop {
            let closed = server.engine.closed_ids();
            if closed.iter().any(|id| id.starts_with("producer"))
                && closed.iter().any(|id| id.starts_with("router"))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session resources were not released after disconnect");

    // the key is free again for a fresh session
    let mut client = SignalClient::connect(&server.ws_url("gone")).await;
    assert!(matches!(client.recv().await, ServerMessage::SessionReady { .. }));
    match client
        .request(ClientRequest::GetRouterRtpCapabilities, &mut pushed)
        .await
    {
        ServerMessage::RouterRtpCapabilities { .. } => {}
        other => panic!("expected capabilities, got {other:?}"),
    }
}
