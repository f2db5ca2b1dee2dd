//! Per-room resource registry.
//!
//! The single source of truth for what a session holds and therefore what
//! teardown must release. A pure map: it never calls into the SFU engine or
//! the analysis branch itself. Keys are unique per `(room, kind)` and `put`
//! refuses to overwrite a live handle; the caller decides whether that is a
//! conflict or a bug.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::analysis::AnalysisPipeline;
use crate::engine::{SfuConsumer, SfuProducer, SfuRouter, SfuTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Router,
    ProducerTransport,
    ConsumerTransport,
    Producer,
    Consumer,
    RecordingTransport,
    AnalysisPipeline,
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Router => "router",
            ResourceKind::ProducerTransport => "producer transport",
            ResourceKind::ConsumerTransport => "consumer transport",
            ResourceKind::Producer => "producer",
            ResourceKind::Consumer => "consumer",
            ResourceKind::RecordingTransport => "recording transport",
            ResourceKind::AnalysisPipeline => "analysis pipeline",
        }
    }

    /// Dependency order for teardown: the analysis branch first, then media
    /// endpoints, then the transports carrying them, the router last.
    pub fn teardown_rank(&self) -> u8 {
        match self {
            ResourceKind::AnalysisPipeline => 0,
            ResourceKind::RecordingTransport => 1,
            ResourceKind::Consumer => 2,
            ResourceKind::Producer => 3,
            ResourceKind::ConsumerTransport => 4,
            ResourceKind::ProducerTransport => 5,
            ResourceKind::Router => 6,
        }
    }
}

/// A live handle owned by a session.
#[derive(Clone)]
pub enum Resource {
    Router(Arc<dyn SfuRouter>),
    Transport(Arc<dyn SfuTransport>),
    Producer(Arc<dyn SfuProducer>),
    Consumer(Arc<dyn SfuConsumer>),
    Pipeline(Arc<AnalysisPipeline>),
}

impl Resource {
    /// Release the underlying resource. Engine failures are returned for the
    /// caller to log; pipeline shutdown handles its own logging.
    pub async fn close(&self) -> crate::engine::EngineResult<()> {
        match self {
            Resource::Router(r) => r.close().await,
            Resource::Transport(t) => t.close().await,
            Resource::Producer(p) => p.close().await,
            Resource::Consumer(c) => c.close().await,
            Resource::Pipeline(p) => {
                p.shutdown().await;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("{} already registered", kind.label())]
pub struct AlreadyRegistered {
    pub kind: ResourceKind,
}

#[derive(Default)]
pub struct SessionRegistry {
    rooms: RwLock<HashMap<String, HashMap<ResourceKind, Resource>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. Fails if the slot is occupied: a live handle must
    /// never be silently replaced, that is how resources leak.
    pub async fn put(
        &self,
        room: &str,
        kind: ResourceKind,
        resource: Resource,
    ) -> Result<(), AlreadyRegistered> {
        let mut rooms = self.rooms.write().await;
        let entries = rooms.entry(room.to_string()).or_default();
        if entries.contains_key(&kind) {
            return Err(AlreadyRegistered { kind });
        }
        entries.insert(kind, resource);
        Ok(())
    }

    pub async fn get(&self, room: &str, kind: ResourceKind) -> Option<Resource> {
        self.rooms
            .read()
            .await
            .get(room)
            .and_then(|entries| entries.get(&kind))
            .cloned()
    }

    pub async fn remove(&self, room: &str, kind: ResourceKind) -> Option<Resource> {
        let mut rooms = self.rooms.write().await;
        let entries = rooms.get_mut(room)?;
        let resource = entries.remove(&kind);
        if entries.is_empty() {
            rooms.remove(room);
        }
        resource
    }

    /// Atomically remove and return everything the room holds, so teardown
    /// works from a snapshot no other caller can still observe.
    pub async fn drain_all(&self, room: &str) -> Vec<(ResourceKind, Resource)> {
        self.rooms
            .write()
            .await
            .remove(room)
            .map(|entries| entries.into_iter().collect())
            .unwrap_or_default()
    }

    /// Number of live resources registered for a room.
    pub async fn count(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub async fn router(&self, room: &str) -> Option<Arc<dyn SfuRouter>> {
        match self.get(room, ResourceKind::Router).await {
            Some(Resource::Router(r)) => Some(r),
            _ => None,
        }
    }

    pub async fn transport(&self, room: &str, kind: ResourceKind) -> Option<Arc<dyn SfuTransport>> {
        match self.get(room, kind).await {
            Some(Resource::Transport(t)) => Some(t),
            _ => None,
        }
    }

    pub async fn producer(&self, room: &str) -> Option<Arc<dyn SfuProducer>> {
        match self.get(room, ResourceKind::Producer).await {
            Some(Resource::Producer(p)) => Some(p),
            _ => None,
        }
    }

    pub async fn pipeline(&self, room: &str) -> Option<Arc<AnalysisPipeline>> {
        match self.get(room, ResourceKind::AnalysisPipeline).await {
            Some(Resource::Pipeline(p)) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockEngine;
    use crate::engine::{SfuEngine, WorkerSettings};

    async fn router_resource(engine: &MockEngine) -> Resource {
        let worker = engine
            .create_worker(&WorkerSettings {
                log_level: "warn".into(),
                log_tags: vec![],
                rtc_min_port: 10_000,
                rtc_max_port: 10_100,
            })
            .await
            .unwrap();
        Resource::Router(worker.create_router(&[]).await.unwrap())
    }

    #[tokio::test]
    async fn put_then_get_then_remove() {
        let engine = MockEngine::new();
        let registry = SessionRegistry::new();

        registry
            .put("abc", ResourceKind::Router, router_resource(&engine).await)
            .await
            .unwrap();
        assert!(registry.router("abc").await.is_some());
        assert!(registry.remove("abc", ResourceKind::Router).await.is_some());
        assert!(registry.router("abc").await.is_none());
        assert_eq!(registry.count("abc").await, 0);
    }

    #[tokio::test]
    async fn put_refuses_to_overwrite_a_live_handle() {
        let engine = MockEngine::new();
        let registry = SessionRegistry::new();

        registry
            .put("abc", ResourceKind::Router, router_resource(&engine).await)
            .await
            .unwrap();
        let err = registry
            .put("abc", ResourceKind::Router, router_resource(&engine).await)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ResourceKind::Router);
    }

    #[tokio::test]
    async fn drain_all_empties_the_room_in_one_step() {
        let engine = MockEngine::new();
        let registry = SessionRegistry::new();

        registry
            .put("abc", ResourceKind::Router, router_resource(&engine).await)
            .await
            .unwrap();
        registry
            .put(
                "abc",
                ResourceKind::RecordingTransport,
                router_resource(&engine).await,
            )
            .await
            .unwrap();
        registry
            .put("other", ResourceKind::Router, router_resource(&engine).await)
            .await
            .unwrap();

        let drained = registry.drain_all("abc").await;
        assert_eq!(drained.len(), 2);
        assert!(registry.drain_all("abc").await.is_empty());

        // other rooms are untouched
        assert!(registry.router("other").await.is_some());
    }

    #[tokio::test]
    async fn teardown_rank_orders_pipeline_before_router() {
        let mut kinds = vec![
            ResourceKind::Router,
            ResourceKind::Producer,
            ResourceKind::AnalysisPipeline,
            ResourceKind::RecordingTransport,
        ];
        kinds.sort_by_key(ResourceKind::teardown_rank);
        assert_eq!(kinds.first(), Some(&ResourceKind::AnalysisPipeline));
        assert_eq!(kinds.last(), Some(&ResourceKind::Router));
    }
}
