//! Recording branch coordinator.
//!
//! Taps a room's producer into a plain receive-only transport bound to the
//! configured local RTP sink, and persists the session description the
//! transcoder reads to locate and decode the stream.
//!
//! Ordering invariant: the consumer is created paused and resumed only after
//! the session description has been written, so the transcoder can never
//! observe media before the description file exists.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::engine::{PlainTransportOptions, SfuConsumer, SfuTransport, TransportConnect};
use crate::error::{Result, SignalError};
use crate::session::registry::{Resource, ResourceKind, SessionRegistry};

pub struct RecordingBranch {
    pub transport: Arc<dyn SfuTransport>,
    pub consumer: Arc<dyn SfuConsumer>,
    pub sdp_path: PathBuf,
}

impl std::fmt::Debug for RecordingBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingBranch")
            .field("sdp_path", &self.sdp_path)
            .finish_non_exhaustive()
    }
}

/// Create the recording branch for `room`.
///
/// The plain transport is registered as soon as it exists; if any later step
/// fails the caller finds it in the registry and releases it.
pub async fn start(registry: &SessionRegistry, room: &str, config: &Config) -> Result<RecordingBranch> {
    let router = registry
        .router(room)
        .await
        .ok_or_else(|| SignalError::ResourceMissing {
            room: room.to_string(),
            kind: "router",
        })?;
    let producer = registry
        .producer(room)
        .await
        .ok_or_else(|| SignalError::NoActivePublisher(room.to_string()))?;

    let options = PlainTransportOptions {
        listen_ip: config.engine.plain_transport.listen_ip.clone(),
        comedia: false,
        rtcp_mux: false,
    };
    let transport = router.create_plain_transport(&options).await?;
    if registry
        .put(
            room,
            ResourceKind::RecordingTransport,
            Resource::Transport(transport.clone()),
        )
        .await
        .is_err()
    {
        if let Err(e) = transport.close().await {
            tracing::warn!(room, error = %e, "failed to close duplicate recording transport");
        }
        return Err(SignalError::AlreadyExists {
            room: room.to_string(),
            kind: "recording transport",
        });
    }

    transport
        .connect(TransportConnect::Plain {
            ip: config.recording.ip,
            port: config.recording.port,
            rtcp_port: Some(config.recording.rtcp_port),
        })
        .await?;
    tracing::info!(
        room,
        ip = %config.recording.ip,
        port = config.recording.port,
        rtcp_port = config.recording.rtcp_port,
        "recording transport connected"
    );

    let consumer = transport
        .consume(producer.id(), router.rtp_capabilities(), true)
        .await?;

    let sdp_path = write_session_description(config, room).await?;
    tracing::info!(room, path = %sdp_path.display(), "session description persisted");

    // only now may media start flowing toward the sink
    consumer.resume().await?;

    spawn_stats_task(room, consumer.clone());

    Ok(RecordingBranch {
        transport,
        consumer,
        sdp_path,
    })
}

/// Minimal SDP telling the transcoder where the recording RTP arrives and
/// how to interpret it.
async fn write_session_description(config: &Config, room: &str) -> std::io::Result<PathBuf> {
    let codec = config.video_codec();
    let ip = config.recording.ip;
    let pt = codec.preferred_payload_type;
    let contents = format!(
        "v=0\n\
         o=- 0 0 IN IP4 {ip}\n\
         s=Peerscope_Room_{room}\n\
         c=IN IP4 {ip}\n\
         t=0 0\n\
         m={kind} {port} RTP/AVPF {pt}\n\
         a=rtcp:{rtcp_port}\n\
         a=recvonly\n\
         a=rtpmap:{pt} {name}/{clock}\n\
         a=rtcp-fb:{pt} nack pli\n\
         a=mid:{kind}\n",
        kind = codec.kind,
        port = config.recording.port,
        rtcp_port = config.recording.rtcp_port,
        name = codec.name(),
        clock = codec.clock_rate,
    );

    tokio::fs::create_dir_all(&config.analysis.sdp_dir).await?;
    let path = config.analysis.sdp_dir.join(format!("{room}.sdp"));
    tokio::fs::write(&path, contents).await?;
    Ok(path)
}

/// Periodic consumer statistics, as long as the consumer is alive.
fn spawn_stats_task(room: &str, consumer: Arc<dyn SfuConsumer>) {
    let room = room.to_string();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        interval.tick().await;
        loop {
            interval.tick().await;
            match consumer.stats().await {
                Ok(stats) => tracing::debug!(%room, %stats, "recording consumer stats"),
                Err(_) => break,
            }
        }
    });
}
