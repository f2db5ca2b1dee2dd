//! Out-of-process SFU engine adapter.
//!
//! Spawns the configured SFU worker binary and drives it over a
//! newline-delimited JSON channel on stdin/stdout: every request carries a
//! correlation id, a method, an optional target handle id, and a data
//! payload; the worker answers `{"id", "accepted", "data" | "error"}`.
//! Worker stderr is drained into the log. When the worker process exits the
//! channel fails every pending call and fires the registered `died`
//! handlers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};

use super::{
    DiedHandler, EngineError, EngineResult, PlainTransportOptions, RtpCodec, SfuConsumer,
    SfuEngine, SfuProducer, SfuRouter, SfuTransport, SfuWorker, TransportConnect,
    WebRtcTransportOptions, WorkerSettings,
};
use peerscope_protocol::{MediaKind, TransportParams};

/// Engine implementation backed by a worker subprocess per
/// [`SfuEngine::create_worker`] call.
pub struct WorkerEngine {
    bin: PathBuf,
}

impl WorkerEngine {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }
}

#[async_trait]
impl SfuEngine for WorkerEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn SfuWorker>> {
        let mut child = Command::new(&self.bin)
            .arg("--log-level")
            .arg(&settings.log_level)
            .arg("--log-tags")
            .arg(settings.log_tags.join(","))
            .arg("--rtc-min-port")
            .arg(settings.rtc_min_port.to_string())
            .arg("--rtc-max-port")
            .arg(settings.rtc_max_port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("worker stdout not piped".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "sfu_worker", "{line}");
                }
            });
        }

        let pid = child.id();
        tracing::info!(?pid, "SFU worker spawned");

        let channel = Channel::start(stdin, stdout, child);
        Ok(Arc::new(ChannelWorker { channel }))
    }
}

/// Correlated request/response channel to one worker process.
struct Channel {
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<EngineResult<Value>>>>,
    writer: Mutex<ChildStdin>,
    died_handlers: StdMutex<Vec<DiedHandler>>,
    dead: AtomicBool,
    closing: AtomicBool,
    child: Mutex<Option<Child>>,
}

impl Channel {
    fn start(stdin: ChildStdin, stdout: tokio::process::ChildStdout, child: Child) -> Arc<Self> {
        let channel = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: StdMutex::new(HashMap::new()),
            writer: Mutex::new(stdin),
            died_handlers: StdMutex::new(Vec::new()),
            dead: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            child: Mutex::new(Some(child)),
        });

        let reader = channel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => reader.handle_line(&line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading from SFU worker");
                        break;
                    }
                }
            }
            reader.mark_dead();
        });

        channel
    }

    fn handle_line(&self, line: &str) {
        let msg: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable line from SFU worker");
                return;
            }
        };
        let Some(id) = msg.get("id").and_then(Value::as_u64) else {
            // Unsolicited worker notification; only logged, death is
            // detected through process exit.
            tracing::debug!(target: "sfu_worker", %msg, "worker notification");
            return;
        };
        let Some(tx) = self.pending.lock().unwrap().remove(&id) else {
            tracing::warn!(id, "response for unknown request id from SFU worker");
            return;
        };
        let accepted = msg.get("accepted").and_then(Value::as_bool).unwrap_or(false);
        let result = if accepted {
            Ok(msg.get("data").cloned().unwrap_or(Value::Null))
        } else {
            Err(EngineError::Rejected {
                method: msg
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                message: msg
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string(),
            })
        };
        let _ = tx.send(result);
    }

    fn mark_dead(&self) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending: Vec<_> = {
            let mut map = self.pending.lock().unwrap();
            map.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(EngineError::WorkerDied));
        }
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        tracing::error!("SFU worker died");
        let handlers: Vec<_> = self.died_handlers.lock().unwrap().drain(..).collect();
        for handler in handlers {
            handler();
        }
    }

    fn on_died(&self, handler: DiedHandler) {
        if self.dead.load(Ordering::Acquire) && !self.closing.load(Ordering::Acquire) {
            handler();
            return;
        }
        self.died_handlers.lock().unwrap().push(handler);
    }

    async fn call(&self, method: &str, target: Option<&str>, data: Value) -> EngineResult<Value> {
        if self.dead.load(Ordering::Acquire) {
            return Err(EngineError::WorkerDied);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let line = json!({
            "id": id,
            "method": method,
            "target": target,
            "data": data,
        })
        .to_string();

        {
            let mut writer = self.writer.lock().await;
            let write = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            };
            if write.await.is_err() {
                self.pending.lock().unwrap().remove(&id);
                return Err(EngineError::ChannelClosed);
            }
        }

        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Like [`Channel::call`] but for close-style requests, where a worker
    /// that is already gone means the resource is gone too.
    async fn call_close(&self, method: &str, target: Option<&str>) -> EngineResult<()> {
        match self.call(method, target, Value::Null).await {
            Ok(_) => Ok(()),
            Err(EngineError::WorkerDied | EngineError::ChannelClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.mark_dead();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill SFU worker");
            }
        }
    }
}

struct ChannelWorker {
    channel: Arc<Channel>,
}

#[async_trait]
impl SfuWorker for ChannelWorker {
    async fn create_router(&self, media_codecs: &[RtpCodec]) -> EngineResult<Arc<dyn SfuRouter>> {
        let data = self
            .channel
            .call(
                "worker.createRouter",
                None,
                json!({ "mediaCodecs": media_codecs }),
            )
            .await?;
        Ok(Arc::new(ChannelRouter {
            id: string_field(&data, "id")?,
            rtp_capabilities: field(&data, "rtpCapabilities")?.clone(),
            channel: self.channel.clone(),
        }))
    }

    fn on_died(&self, handler: DiedHandler) {
        self.channel.on_died(handler);
    }

    async fn close(&self) -> EngineResult<()> {
        self.channel.shutdown().await;
        Ok(())
    }
}

struct ChannelRouter {
    id: String,
    rtp_capabilities: Value,
    channel: Arc<Channel>,
}

#[async_trait]
impl SfuRouter for ChannelRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn SfuTransport>> {
        let data = self
            .channel
            .call(
                "router.createWebRtcTransport",
                Some(&self.id),
                serde_json::to_value(options)
                    .map_err(|e| EngineError::Protocol(e.to_string()))?,
            )
            .await?;
        let params = TransportParams {
            id: string_field(&data, "id")?,
            ice_parameters: field(&data, "iceParameters")?.clone(),
            ice_candidates: field(&data, "iceCandidates")?.clone(),
            dtls_parameters: field(&data, "dtlsParameters")?.clone(),
        };
        Ok(Arc::new(ChannelTransport {
            id: params.id.clone(),
            params: Some(params),
            channel: self.channel.clone(),
        }))
    }

    async fn create_plain_transport(
        &self,
        options: &PlainTransportOptions,
    ) -> EngineResult<Arc<dyn SfuTransport>> {
        let data = self
            .channel
            .call(
                "router.createPlainTransport",
                Some(&self.id),
                serde_json::to_value(options)
                    .map_err(|e| EngineError::Protocol(e.to_string()))?,
            )
            .await?;
        Ok(Arc::new(ChannelTransport {
            id: string_field(&data, "id")?,
            params: None,
            channel: self.channel.clone(),
        }))
    }

    async fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> EngineResult<bool> {
        let data = self
            .channel
            .call(
                "router.canConsume",
                Some(&self.id),
                json!({
                    "producerId": producer_id,
                    "rtpCapabilities": rtp_capabilities,
                }),
            )
            .await?;
        field(&data, "canConsume")?
            .as_bool()
            .ok_or_else(|| EngineError::Protocol("canConsume is not a bool".into()))
    }

    async fn close(&self) -> EngineResult<()> {
        self.channel.call_close("router.close", Some(&self.id)).await
    }
}

struct ChannelTransport {
    id: String,
    params: Option<TransportParams>,
    channel: Arc<Channel>,
}

#[async_trait]
impl SfuTransport for ChannelTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn params(&self) -> Option<TransportParams> {
        self.params.clone()
    }

    async fn connect(&self, params: TransportConnect) -> EngineResult<()> {
        let data = match params {
            TransportConnect::WebRtc { dtls_parameters } => {
                json!({ "dtlsParameters": dtls_parameters })
            }
            TransportConnect::Plain { ip, port, rtcp_port } => {
                json!({ "ip": ip, "port": port, "rtcpPort": rtcp_port })
            }
        };
        self.channel
            .call("transport.connect", Some(&self.id), data)
            .await?;
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> EngineResult<Arc<dyn SfuProducer>> {
        let data = self
            .channel
            .call(
                "transport.produce",
                Some(&self.id),
                json!({ "kind": kind, "rtpParameters": rtp_parameters }),
            )
            .await?;
        Ok(Arc::new(ChannelProducer {
            id: string_field(&data, "id")?,
            kind,
            channel: self.channel.clone(),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn SfuConsumer>> {
        let data = self
            .channel
            .call(
                "transport.consume",
                Some(&self.id),
                json!({
                    "producerId": producer_id,
                    "rtpCapabilities": rtp_capabilities,
                    "paused": paused,
                }),
            )
            .await?;
        let kind: MediaKind = serde_json::from_value(field(&data, "kind")?.clone())
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        Ok(Arc::new(ChannelConsumer {
            id: string_field(&data, "id")?,
            kind,
            rtp_parameters: field(&data, "rtpParameters")?.clone(),
            consumer_type: string_field(&data, "type")?,
            producer_paused: field(&data, "producerPaused")?.as_bool().unwrap_or(false),
            channel: self.channel.clone(),
        }))
    }

    async fn close(&self) -> EngineResult<()> {
        self.channel
            .call_close("transport.close", Some(&self.id))
            .await
    }
}

struct ChannelProducer {
    id: String,
    kind: MediaKind,
    channel: Arc<Channel>,
}

#[async_trait]
impl SfuProducer for ChannelProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) -> EngineResult<()> {
        self.channel
            .call_close("producer.close", Some(&self.id))
            .await
    }
}

struct ChannelConsumer {
    id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer_type: String,
    producer_paused: bool,
    channel: Arc<Channel>,
}

#[async_trait]
impl SfuConsumer for ChannelConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> &str {
        &self.consumer_type
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused
    }

    async fn resume(&self) -> EngineResult<()> {
        self.channel
            .call("consumer.resume", Some(&self.id), Value::Null)
            .await?;
        Ok(())
    }

    async fn set_preferred_layers(&self, spatial: u8, temporal: u8) -> EngineResult<()> {
        self.channel
            .call(
                "consumer.setPreferredLayers",
                Some(&self.id),
                json!({ "spatialLayer": spatial, "temporalLayer": temporal }),
            )
            .await?;
        Ok(())
    }

    async fn stats(&self) -> EngineResult<Value> {
        self.channel
            .call("consumer.getStats", Some(&self.id), Value::Null)
            .await
    }

    async fn close(&self) -> EngineResult<()> {
        self.channel
            .call_close("consumer.close", Some(&self.id))
            .await
    }
}

fn field<'a>(data: &'a Value, key: &str) -> EngineResult<&'a Value> {
    data.get(key)
        .ok_or_else(|| EngineError::Protocol(format!("missing field `{key}`")))
}

fn string_field(data: &Value, key: &str) -> EngineResult<String> {
    field(data, key)?
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| EngineError::Protocol(format!("field `{key}` is not a string")))
}
