//! In-memory SFU engine used by the test suite.
//!
//! Records every engine call and close, and supports failure, latency and
//! behavior injection so lifecycle edge cases (mid-flight disconnects,
//! best-effort teardown, worker death) can be driven deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{
    DiedHandler, EngineError, EngineResult, PlainTransportOptions, RtpCodec, SfuConsumer,
    SfuEngine, SfuProducer, SfuRouter, SfuTransport, SfuWorker, TransportConnect,
    WebRtcTransportOptions, WorkerSettings,
};
use peerscope_protocol::{MediaKind, TransportParams};

pub type ResumeHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct MockEngineState {
    next_id: AtomicU64,
    calls: StdMutex<Vec<String>>,
    fail_methods: StdMutex<HashSet<String>>,
    delays: StdMutex<HashMap<String, Duration>>,
    closed: StdMutex<Vec<String>>,
    consumer_type: StdMutex<Option<String>>,
    deny_consume: AtomicBool,
    on_consumer_resume: StdMutex<Option<ResumeHook>>,
    died_handlers: StdMutex<Vec<DiedHandler>>,
}

impl MockEngineState {
    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn begin(&self, method: &str) -> EngineResult<()> {
        self.calls.lock().unwrap().push(method.to_string());
        let delay = self.delays.lock().unwrap().get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_methods.lock().unwrap().contains(method) {
            return Err(EngineError::Rejected {
                method: method.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn record_closed(&self, id: &str) {
        self.closed.lock().unwrap().push(id.to_string());
    }
}

/// Deterministic in-memory engine; every created worker shares this
/// engine's state so tests can inspect and steer it.
#[derive(Default)]
pub struct MockEngine {
    state: Arc<MockEngineState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `method` (e.g. "transport.produce") fail with a rejection.
    pub fn fail_on(&self, method: &str) {
        self.state
            .fail_methods
            .lock()
            .unwrap()
            .insert(method.to_string());
    }

    /// Delay `method` before it completes.
    pub fn delay(&self, method: &str, delay: Duration) {
        self.state
            .delays
            .lock()
            .unwrap()
            .insert(method.to_string(), delay);
    }

    /// Override the engine-reported type of created consumers.
    pub fn set_consumer_type(&self, consumer_type: &str) {
        *self.state.consumer_type.lock().unwrap() = Some(consumer_type.to_string());
    }

    /// Make `router.canConsume` answer false.
    pub fn deny_consume(&self) {
        self.state.deny_consume.store(true, Ordering::Release);
    }

    /// Run `hook` every time a consumer is resumed.
    pub fn on_consumer_resume(&self, hook: ResumeHook) {
        *self.state.on_consumer_resume.lock().unwrap() = Some(hook);
    }

    /// Fire the worker `died` handlers, as if the process crashed.
    pub fn trigger_died(&self) {
        let handlers: Vec<_> = self.state.died_handlers.lock().unwrap().drain(..).collect();
        for handler in handlers {
            handler();
        }
    }

    /// Methods invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Resource ids closed so far, in close order.
    pub fn closed_ids(&self) -> Vec<String> {
        self.state.closed.lock().unwrap().clone()
    }

    pub fn is_closed(&self, id: &str) -> bool {
        self.state.closed.lock().unwrap().iter().any(|c| c == id)
    }
}

#[async_trait]
impl SfuEngine for MockEngine {
    async fn create_worker(&self, _settings: &WorkerSettings) -> EngineResult<Arc<dyn SfuWorker>> {
        self.state.begin("engine.createWorker").await?;
        Ok(Arc::new(MockWorker {
            state: self.state.clone(),
        }))
    }
}

struct MockWorker {
    state: Arc<MockEngineState>,
}

#[async_trait]
impl SfuWorker for MockWorker {
    async fn create_router(&self, media_codecs: &[RtpCodec]) -> EngineResult<Arc<dyn SfuRouter>> {
        self.state.begin("worker.createRouter").await?;
        Ok(Arc::new(MockRouter {
            id: self.state.next_id("router"),
            rtp_capabilities: json!({ "codecs": media_codecs }),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn on_died(&self, handler: DiedHandler) {
        self.state.died_handlers.lock().unwrap().push(handler);
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.begin("worker.close").await?;
        Ok(())
    }
}

struct MockRouter {
    id: String,
    rtp_capabilities: Value,
    state: Arc<MockEngineState>,
    closed: AtomicBool,
}

impl MockRouter {
    fn new_transport(&self, plain: bool) -> MockTransport {
        let id = self.state.next_id(if plain { "plain-transport" } else { "transport" });
        let params = (!plain).then(|| TransportParams {
            id: id.clone(),
            ice_parameters: json!({ "usernameFragment": "mock", "password": "mock" }),
            ice_candidates: json!([{ "ip": "127.0.0.1", "port": 40000 }]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        });
        MockTransport {
            id,
            params,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            children: StdMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SfuRouter for MockRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        _options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn SfuTransport>> {
        self.state.begin("router.createWebRtcTransport").await?;
        Ok(Arc::new(self.new_transport(false)))
    }

    async fn create_plain_transport(
        &self,
        _options: &PlainTransportOptions,
    ) -> EngineResult<Arc<dyn SfuTransport>> {
        self.state.begin("router.createPlainTransport").await?;
        Ok(Arc::new(self.new_transport(true)))
    }

    async fn can_consume(
        &self,
        _producer_id: &str,
        _rtp_capabilities: &Value,
    ) -> EngineResult<bool> {
        self.state.begin("router.canConsume").await?;
        Ok(!self.state.deny_consume.load(Ordering::Acquire))
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.begin("router.close").await?;
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.record_closed(&self.id);
        }
        Ok(())
    }
}

struct MockTransport {
    id: String,
    params: Option<TransportParams>,
    state: Arc<MockEngineState>,
    closed: AtomicBool,
    children: StdMutex<Vec<Arc<MockConsumer>>>,
}

#[async_trait]
impl SfuTransport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn params(&self) -> Option<TransportParams> {
        self.params.clone()
    }

    async fn connect(&self, _params: TransportConnect) -> EngineResult<()> {
        self.state.begin("transport.connect").await?;
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: Value,
    ) -> EngineResult<Arc<dyn SfuProducer>> {
        self.state.begin("transport.produce").await?;
        Ok(Arc::new(MockProducer {
            id: self.state.next_id("producer"),
            kind,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn SfuConsumer>> {
        self.state.begin("transport.consume").await?;
        let consumer_type = self
            .state
            .consumer_type
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "simple".to_string());
        let consumer = Arc::new(MockConsumer {
            id: self.state.next_id("consumer"),
            producer_id: producer_id.to_string(),
            rtp_parameters: json!({ "codecs": [], "encodings": [] }),
            consumer_type,
            paused: AtomicBool::new(paused),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        });
        self.children.lock().unwrap().push(consumer.clone());
        Ok(consumer)
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.begin("transport.close").await?;
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.record_closed(&self.id);
            // closing a transport closes the consumers riding on it
            for child in self.children.lock().unwrap().iter() {
                child.mark_closed();
            }
        }
        Ok(())
    }
}

struct MockProducer {
    id: String,
    kind: MediaKind,
    state: Arc<MockEngineState>,
    closed: AtomicBool,
}

#[async_trait]
impl SfuProducer for MockProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.begin("producer.close").await?;
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.record_closed(&self.id);
        }
        Ok(())
    }
}

struct MockConsumer {
    id: String,
    #[allow(dead_code)]
    producer_id: String,
    rtp_parameters: Value,
    consumer_type: String,
    paused: AtomicBool,
    state: Arc<MockEngineState>,
    closed: AtomicBool,
}

impl MockConsumer {
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.record_closed(&self.id);
        }
    }
}

#[async_trait]
impl SfuConsumer for MockConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> &str {
        &self.consumer_type
    }

    fn producer_paused(&self) -> bool {
        false
    }

    async fn resume(&self) -> EngineResult<()> {
        self.state.begin("consumer.resume").await?;
        if let Some(hook) = self.state.on_consumer_resume.lock().unwrap().as_ref() {
            hook();
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn set_preferred_layers(&self, _spatial: u8, _temporal: u8) -> EngineResult<()> {
        self.state.begin("consumer.setPreferredLayers").await?;
        Ok(())
    }

    async fn stats(&self) -> EngineResult<Value> {
        self.state.begin("consumer.getStats").await?;
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Rejected {
                method: "consumer.getStats".to_string(),
                message: "consumer is closed".to_string(),
            });
        }
        Ok(json!({ "type": "inbound-rtp", "packetCount": 0 }))
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.begin("consumer.close").await?;
        self.mark_closed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_records_each_resource_once() {
        let engine = MockEngine::new();
        let worker = engine
            .create_worker(&WorkerSettings {
                log_level: "warn".into(),
                log_tags: vec![],
                rtc_min_port: 10_000,
                rtc_max_port: 10_100,
            })
            .await
            .unwrap();
        let router = worker.create_router(&[]).await.unwrap();
        router.close().await.unwrap();
        router.close().await.unwrap();
        assert_eq!(engine.closed_ids(), vec![router.id().to_string()]);
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_rejection() {
        let engine = MockEngine::new();
        engine.fail_on("worker.createRouter");
        let worker = engine
            .create_worker(&WorkerSettings {
                log_level: "warn".into(),
                log_tags: vec![],
                rtc_min_port: 10_000,
                rtc_max_port: 10_100,
            })
            .await
            .unwrap();
        assert!(matches!(
            worker.create_router(&[]).await,
            Err(EngineError::Rejected { .. })
        ));
    }
}
