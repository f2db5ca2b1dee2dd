//! Per-room frame analysis pipeline.
//!
//! Consumes the transcoder's frame stream, dispatches one frame at a time to
//! the worker pool and re-emits `(frame, result)` pairs on the session's
//! event sink. Dispatch is serialized: the next frame is not decoded until
//! the previous dispatch resolved, which bounds the pipeline to one
//! in-flight job and makes per-room result order equal submission order.

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::codec::FrameCodec;
use super::pool::{PoolError, WorkerPool};
use super::transcoder::{TranscodeExit, TranscodeSession};
use peerscope_protocol::AnalysisEvent;

pub struct AnalysisPipeline {
    room: String,
    consumer_id: String,
    cancel: CancellationToken,
    pool: Arc<WorkerPool>,
    task: StdMutex<Option<JoinHandle<()>>>,
    sdp_path: PathBuf,
}

impl AnalysisPipeline {
    pub fn spawn(
        room: &str,
        consumer_id: &str,
        session: TranscodeSession,
        codec: FrameCodec,
        pool: Arc<WorkerPool>,
        sink: tokio::sync::mpsc::UnboundedSender<AnalysisEvent>,
        sdp_path: PathBuf,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            room.to_string(),
            session,
            codec,
            pool.clone(),
            sink,
            cancel.clone(),
        ));
        Arc::new(Self {
            room: room.to_string(),
            consumer_id: consumer_id.to_string(),
            cancel,
            pool,
            task: StdMutex::new(Some(task)),
            sdp_path,
        })
    }

    /// Recording consumer feeding this pipeline.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Stop dispatching, kill the transcoder, terminate the pool and delete
    /// the persisted session description. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(room = %self.room, error = %e, "analysis task failed to join");
            }
        }

        let pool = self.pool.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || pool.close()).await {
            tracing::warn!(room = %self.room, error = %e, "worker pool close panicked");
        }

        match tokio::fs::remove_file(&self.sdp_path).await {
            Ok(()) => {
                tracing::debug!(room = %self.room, path = %self.sdp_path.display(), "session description deleted")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(room = %self.room, error = %e, "failed to delete session description")
            }
        }
    }
}

async fn run(
    room: String,
    session: TranscodeSession,
    codec: FrameCodec,
    pool: Arc<WorkerPool>,
    sink: tokio::sync::mpsc::UnboundedSender<AnalysisEvent>,
    cancel: CancellationToken,
) {
    let TranscodeSession {
        frames,
        mut control,
    } = session;
    let mut frames = FramedRead::new(frames, codec);
    let mut dispatched: u64 = 0;
    let mut dropped: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                control.kill().await;
                tracing::debug!(%room, dispatched, dropped, "analysis pipeline cancelled");
                return;
            }
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => match pool.submit(frame.clone()).await {
                Ok(Some(result)) => {
                    dispatched += 1;
                    let event = AnalysisEvent::Result {
                        frame: BASE64.encode(&frame),
                        result,
                        timestamp: Utc::now(),
                    };
                    if sink.send(event).is_err() {
                        // receiver gone, nobody is listening anymore
                        control.kill().await;
                        return;
                    }
                }
                Ok(None) => {
                    dropped += 1;
                    tracing::debug!(%room, "no idle analysis worker, frame dropped");
                }
                Err(PoolError::Analyzer(e)) => {
                    // one bad frame does not stop the stream
                    let event = AnalysisEvent::Error {
                        frame: Some(BASE64.encode(&frame)),
                        message: e.to_string(),
                    };
                    if sink.send(event).is_err() {
                        control.kill().await;
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(%room, error = %e, "analysis dispatch failed");
                    let _ = sink.send(AnalysisEvent::Error {
                        frame: None,
                        message: e.to_string(),
                    });
                    control.kill().await;
                    return;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(%room, error = %e, "frame stream error");
                let _ = sink.send(AnalysisEvent::Error {
                    frame: None,
                    message: e.to_string(),
                });
                control.kill().await;
                return;
            }
            None => {
                match control.wait().await {
                    TranscodeExit::Clean => {
                        tracing::info!(%room, dispatched, dropped, "transcoding ended");
                        let _ = sink.send(AnalysisEvent::End);
                    }
                    TranscodeExit::Abnormal(detail) => {
                        tracing::warn!(%room, %detail, "transcoder exited abnormally");
                        let _ = sink.send(AnalysisEvent::Error {
                            frame: None,
                            message: detail,
                        });
                    }
                }
                return;
            }
        }
    }
}
