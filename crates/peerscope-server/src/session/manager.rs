//! Session lifecycle controller.
//!
//! Owns the per-room phase machine and serializes every create/teardown
//! operation for a room behind its gate mutex: no two operations for the
//! same room key ever run concurrently, while rooms proceed independently.
//! The SFU worker is created lazily exactly once and shared across rooms.
//!
//! Teardown drains the registry atomically and closes what it finds in
//! dependency order. Every close is best-effort: a failure is logged and
//! never stops the remaining resources from getting their close attempt.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, RwLock, mpsc};

use crate::analysis::codec::FrameCodec;
use crate::analysis::pipeline::AnalysisPipeline;
use crate::analysis::pool::WorkerPool;
use crate::analysis::{AnalyzerFactory, Transcoder};
use crate::config::Config;
use crate::engine::{
    EngineError, SfuEngine, SfuWorker, TransportConnect, WebRtcTransportOptions, WorkerSettings,
};
use crate::error::{Result, SignalError};
use crate::session::recording;
use crate::session::registry::{Resource, ResourceKind, SessionRegistry};
use peerscope_protocol::{AnalysisEvent, ConsumerParams, MediaKind, TransportParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Gate exists but the router does not yet
    New,
    RouterReady,
    Negotiating,
    Active,
    Analyzing,
    Closing,
    /// Terminal; the room key becomes reusable once the gate is dropped
    Closed,
}

struct RoomGate {
    phase: Mutex<RoomPhase>,
}

/// Outcome of [`SessionManager::start_analysis`].
#[derive(Debug, Clone)]
pub struct AnalysisStart {
    pub consumer_id: String,
    pub already_active: bool,
}

pub struct SessionManager {
    weak: Weak<SessionManager>,
    config: Arc<Config>,
    engine: Arc<dyn SfuEngine>,
    transcoder: Arc<dyn Transcoder>,
    analyzers: Arc<dyn AnalyzerFactory>,
    worker: OnceCell<Arc<dyn SfuWorker>>,
    registry: SessionRegistry,
    rooms: RwLock<HashMap<String, Arc<RoomGate>>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<dyn SfuEngine>,
        transcoder: Arc<dyn Transcoder>,
        analyzers: Arc<dyn AnalyzerFactory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            engine,
            transcoder,
            analyzers,
            worker: OnceCell::new(),
            registry: SessionRegistry::new(),
            rooms: RwLock::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Current phase, mainly for diagnostics; `None` once the room is gone.
    pub async fn phase(&self, room: &str) -> Option<RoomPhase> {
        let gate = self.rooms.read().await.get(room).cloned()?;
        let phase = gate.phase.lock().await;
        Some(*phase)
    }

    /// The shared SFU worker, created on first use. Its death tears down
    /// every live session.
    async fn shared_worker(&self) -> Result<Arc<dyn SfuWorker>> {
        let worker = self
            .worker
            .get_or_try_init(|| async {
                let settings = WorkerSettings {
                    log_level: self.config.engine.log_level.clone(),
                    log_tags: self.config.engine.log_tags.clone(),
                    rtc_min_port: self.config.engine.rtc_min_port,
                    rtc_max_port: self.config.engine.rtc_max_port,
                };
                let worker = self.engine.create_worker(&settings).await?;
                let weak = self.weak.clone();
                worker.on_died(Box::new(move || {
                    if let Some(manager) = weak.upgrade() {
                        tokio::spawn(async move {
                            manager.close_all("SFU worker died").await;
                        });
                    }
                }));
                tracing::info!("shared SFU worker ready");
                Ok::<_, SignalError>(worker)
            })
            .await?;
        Ok(worker.clone())
    }

    async fn gate_or_create(&self, room: &str) -> Arc<RoomGate> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| {
                Arc::new(RoomGate {
                    phase: Mutex::new(RoomPhase::New),
                })
            })
            .clone()
    }

    async fn gate(&self, room: &str) -> Result<Arc<RoomGate>> {
        self.rooms
            .read()
            .await
            .get(room)
            .cloned()
            .ok_or_else(|| SignalError::SessionNotFound(room.to_string()))
    }

    fn ensure_open(phase: RoomPhase, room: &str) -> Result<()> {
        match phase {
            RoomPhase::Closing | RoomPhase::Closed => {
                Err(SignalError::SessionNotFound(room.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// First signaling contact for a room key: create the session and its
    /// router, or join the live session under that key.
    pub async fn connect(&self, room: &str) -> Result<()> {
        loop {
            let gate = self.gate_or_create(room).await;
            let mut phase = gate.phase.lock().await;
            match *phase {
                RoomPhase::New => {
                    let worker = self.shared_worker().await?;
                    let router = worker
                        .create_router(&self.config.engine.media_codecs)
                        .await?;
                    self.registry
                        .put(room, ResourceKind::Router, Resource::Router(router))
                        .await
                        .map_err(|e| SignalError::AlreadyExists {
                            room: room.to_string(),
                            kind: e.kind.label(),
                        })?;
                    *phase = RoomPhase::RouterReady;
                    tracing::info!(room, "session created");
                    return Ok(());
                }
                RoomPhase::Closing | RoomPhase::Closed => {
                    // key is mid-teardown; wait for it to be recycled
                    drop(phase);
                    tokio::task::yield_now().await;
                }
                _ => return Ok(()),
            }
        }
    }

    pub async fn router_rtp_capabilities(&self, room: &str) -> Result<Value> {
        let gate = self.gate(room).await?;
        let phase = gate.phase.lock().await;
        Self::ensure_open(*phase, room)?;
        let router = self
            .registry
            .router(room)
            .await
            .ok_or_else(|| SignalError::ResourceMissing {
                room: room.to_string(),
                kind: "router",
            })?;
        Ok(router.rtp_capabilities())
    }

    pub async fn create_producer_transport(&self, room: &str) -> Result<TransportParams> {
        self.create_webrtc_transport(room, ResourceKind::ProducerTransport)
            .await
    }

    pub async fn create_consumer_transport(&self, room: &str) -> Result<TransportParams> {
        self.create_webrtc_transport(room, ResourceKind::ConsumerTransport)
            .await
    }

    async fn create_webrtc_transport(
        &self,
        room: &str,
        slot: ResourceKind,
    ) -> Result<TransportParams> {
        let gate = self.gate(room).await?;
        let mut phase = gate.phase.lock().await;
        Self::ensure_open(*phase, room)?;

        let router = self
            .registry
            .router(room)
            .await
            .ok_or_else(|| SignalError::ResourceMissing {
                room: room.to_string(),
                kind: "router",
            })?;
        let options = WebRtcTransportOptions {
            listen_ips: self.config.engine.webrtc_transport.listen_ips.clone(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: self
                .config
                .engine
                .webrtc_transport
                .initial_available_outgoing_bitrate,
        };
        let transport = router.create_webrtc_transport(&options).await?;
        let params = transport.params().ok_or_else(|| {
            SignalError::Engine(EngineError::Protocol(
                "webrtc transport carries no client parameters".into(),
            ))
        })?;

        if self
            .registry
            .put(room, slot, Resource::Transport(transport.clone()))
            .await
            .is_err()
        {
            if let Err(e) = transport.close().await {
                tracing::warn!(room, error = %e, "failed to close duplicate transport");
            }
            return Err(SignalError::AlreadyExists {
                room: room.to_string(),
                kind: slot.label(),
            });
        }

        if *phase == RoomPhase::RouterReady {
            *phase = RoomPhase::Negotiating;
        }
        tracing::debug!(room, kind = slot.label(), id = transport.id(), "transport created");
        Ok(params)
    }

    pub async fn connect_transport(
        &self,
        room: &str,
        slot: ResourceKind,
        dtls_parameters: Value,
    ) -> Result<()> {
        let gate = self.gate(room).await?;
        let phase = gate.phase.lock().await;
        Self::ensure_open(*phase, room)?;

        let transport = self
            .registry
            .transport(room, slot)
            .await
            .ok_or_else(|| SignalError::ResourceMissing {
                room: room.to_string(),
                kind: slot.label(),
            })?;
        transport
            .connect(TransportConnect::WebRtc { dtls_parameters })
            .await?;
        tracing::debug!(room, kind = slot.label(), "transport connected");
        Ok(())
    }

    pub async fn produce(
        &self,
        room: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<String> {
        let gate = self.gate(room).await?;
        let mut phase = gate.phase.lock().await;
        Self::ensure_open(*phase, room)?;

        let transport = self
            .registry
            .transport(room, ResourceKind::ProducerTransport)
            .await
            .ok_or_else(|| SignalError::ResourceMissing {
                room: room.to_string(),
                kind: ResourceKind::ProducerTransport.label(),
            })?;
        let producer = transport.produce(kind, rtp_parameters).await?;
        let id = producer.id().to_string();

        if self
            .registry
            .put(room, ResourceKind::Producer, Resource::Producer(producer.clone()))
            .await
            .is_err()
        {
            if let Err(e) = producer.close().await {
                tracing::warn!(room, error = %e, "failed to close duplicate producer");
            }
            return Err(SignalError::AlreadyExists {
                room: room.to_string(),
                kind: ResourceKind::Producer.label(),
            });
        }

        *phase = RoomPhase::Active;
        tracing::info!(room, producer = %id, %kind, "producer created");
        Ok(id)
    }

    pub async fn consume(&self, room: &str, rtp_capabilities: Value) -> Result<ConsumerParams> {
        let gate = self.gate(room).await?;
        let phase = gate.phase.lock().await;
        Self::ensure_open(*phase, room)?;

        let router = self
            .registry
            .router(room)
            .await
            .ok_or_else(|| SignalError::ResourceMissing {
                room: room.to_string(),
                kind: "router",
            })?;
        let producer = self
            .registry
            .producer(room)
            .await
            .ok_or_else(|| SignalError::NoActivePublisher(room.to_string()))?;

        if !router.can_consume(producer.id(), &rtp_capabilities).await? {
            return Err(SignalError::CannotConsume {
                producer_id: producer.id().to_string(),
            });
        }

        let transport = self
            .registry
            .transport(room, ResourceKind::ConsumerTransport)
            .await
            .ok_or_else(|| SignalError::ResourceMissing {
                room: room.to_string(),
                kind: ResourceKind::ConsumerTransport.label(),
            })?;
        let consumer = transport
            .consume(producer.id(), rtp_capabilities, false)
            .await?;
        if consumer.consumer_type() == "simulcast" {
            consumer.set_preferred_layers(2, 2).await?;
        }

        let params = ConsumerParams {
            producer_id: producer.id().to_string(),
            id: consumer.id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type().to_string(),
            producer_paused: consumer.producer_paused(),
        };

        if self
            .registry
            .put(room, ResourceKind::Consumer, Resource::Consumer(consumer.clone()))
            .await
            .is_err()
        {
            if let Err(e) = consumer.close().await {
                tracing::warn!(room, error = %e, "failed to close duplicate consumer");
            }
            return Err(SignalError::AlreadyExists {
                room: room.to_string(),
                kind: ResourceKind::Consumer.label(),
            });
        }

        tracing::info!(room, consumer = %params.id, "consumer created");
        Ok(params)
    }

    /// Fork the room's video into the analysis branch. Idempotent: a second
    /// request while analyzing reports the existing branch instead of
    /// creating duplicate resources.
    pub async fn start_analysis(
        &self,
        room: &str,
        sink: mpsc::UnboundedSender<AnalysisEvent>,
    ) -> Result<AnalysisStart> {
        let gate = self.gate(room).await?;
        let mut phase = gate.phase.lock().await;
        Self::ensure_open(*phase, room)?;

        if let Some(pipeline) = self.registry.pipeline(room).await {
            tracing::debug!(room, "analysis already active");
            return Ok(AnalysisStart {
                consumer_id: pipeline.consumer_id().to_string(),
                already_active: true,
            });
        }

        let branch = match recording::start(&self.registry, room, &self.config).await {
            Ok(branch) => branch,
            Err(e) => {
                self.abort_analysis_setup(room, None).await;
                return Err(e);
            }
        };

        let pool = match WorkerPool::new(self.config.analysis.pool_size, self.analyzers.clone()) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                self.abort_analysis_setup(room, Some(&branch.sdp_path)).await;
                return Err(SignalError::Analysis(e.to_string()));
            }
        };

        let session = match self.transcoder.spawn(&branch.sdp_path).await {
            Ok(session) => session,
            Err(e) => {
                let pool = pool.clone();
                if tokio::task::spawn_blocking(move || pool.close()).await.is_err() {
                    tracing::warn!(room, "worker pool close panicked during rollback");
                }
                self.abort_analysis_setup(room, Some(&branch.sdp_path)).await;
                return Err(SignalError::Analysis(e.to_string()));
            }
        };

        // Relay pipeline events to the signaling channel; a terminal event
        // reaps the analysis branch while the rest of the session stays up.
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<AnalysisEvent>();
        let weak = self.weak.clone();
        let event_room = room.to_string();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let terminal = event.is_terminal();
                let _ = sink.send(event);
                if terminal {
                    if let Some(manager) = weak.upgrade() {
                        manager.stop_analysis(&event_room).await;
                    }
                    break;
                }
            }
        });

        let codec = FrameCodec::new(
            self.config.analysis.frame_format,
            self.config.analysis.max_frame_bytes,
        );
        let consumer_id = branch.consumer.id().to_string();
        let pipeline = AnalysisPipeline::spawn(
            room,
            &consumer_id,
            session,
            codec,
            pool,
            events_tx,
            branch.sdp_path.clone(),
        );

        if self
            .registry
            .put(
                room,
                ResourceKind::AnalysisPipeline,
                Resource::Pipeline(pipeline.clone()),
            )
            .await
            .is_err()
        {
            pipeline.shutdown().await;
            self.abort_analysis_setup(room, None).await;
            return Err(SignalError::AlreadyExists {
                room: room.to_string(),
                kind: ResourceKind::AnalysisPipeline.label(),
            });
        }

        *phase = RoomPhase::Analyzing;
        tracing::info!(
            room,
            consumer = %consumer_id,
            pool_size = self.config.analysis.pool_size,
            "analysis started"
        );
        Ok(AnalysisStart {
            consumer_id,
            already_active: false,
        })
    }

    /// Roll back a partially built analysis branch; the session stays alive.
    async fn abort_analysis_setup(&self, room: &str, sdp_path: Option<&Path>) {
        if let Some(resource) = self
            .registry
            .remove(room, ResourceKind::RecordingTransport)
            .await
        {
            if let Err(e) = resource.close().await {
                tracing::warn!(room, error = %e, "failed to close recording transport during rollback");
            }
        }
        if let Some(path) = sdp_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(room, error = %e, "failed to delete session description during rollback")
                }
            }
        }
    }

    /// Tear down the analysis branch only; producer/consumer stay live.
    pub async fn stop_analysis(&self, room: &str) {
        let Ok(gate) = self.gate(room).await else {
            return;
        };
        let mut phase = gate.phase.lock().await;
        if *phase != RoomPhase::Analyzing {
            return;
        }
        for kind in [ResourceKind::AnalysisPipeline, ResourceKind::RecordingTransport] {
            if let Some(resource) = self.registry.remove(room, kind).await {
                if let Err(e) = resource.close().await {
                    tracing::warn!(room, kind = kind.label(), error = %e, "failed to close resource");
                }
            }
        }
        *phase = RoomPhase::Active;
        tracing::info!(room, "analysis branch stopped");
    }

    /// Tear the whole session down. Triggered by disconnect or explicit
    /// close; safe to call repeatedly and while negotiation is mid-flight,
    /// because in-flight operations finish first and their resources are
    /// drained here rather than leaked.
    pub async fn close(&self, room: &str) {
        let Some(gate) = self.rooms.read().await.get(room).cloned() else {
            return;
        };
        let mut phase = gate.phase.lock().await;
        if matches!(*phase, RoomPhase::Closing | RoomPhase::Closed) {
            return;
        }
        *phase = RoomPhase::Closing;

        let mut resources = self.registry.drain_all(room).await;
        resources.sort_by_key(|(kind, _)| kind.teardown_rank());
        for (kind, resource) in resources {
            match resource.close().await {
                Ok(()) => tracing::debug!(room, kind = kind.label(), "resource closed"),
                Err(e) => {
                    tracing::warn!(room, kind = kind.label(), error = %e, "failed to close resource")
                }
            }
        }

        *phase = RoomPhase::Closed;
        drop(phase);

        let mut rooms = self.rooms.write().await;
        if rooms.get(room).is_some_and(|g| Arc::ptr_eq(g, &gate)) {
            rooms.remove(room);
        }
        tracing::info!(room, "session closed");
    }

    /// Close every live session, e.g. after the SFU worker died.
    pub async fn close_all(&self, reason: &str) {
        let rooms: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        if rooms.is_empty() {
            return;
        }
        tracing::error!(reason, count = rooms.len(), "closing all sessions");
        for room in rooms {
            self.close(&room).await;
        }
    }
}
