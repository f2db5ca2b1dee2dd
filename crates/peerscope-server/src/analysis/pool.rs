//! Fixed-size analysis worker pool.
//!
//! Each slot is an OS thread running a blocking receive loop with its own
//! analyzer instance, so inference never blocks the async runtime. A slot is
//! leased for the whole request/response exchange: `submit` picks the first
//! idle slot in creation order, or reports no capacity immediately. Frames
//! are never queued; back-pressure is the caller's problem.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::analyzer::{AnalyzerError, AnalyzerFactory};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool must have at least one slot")]
    EmptyPool,

    #[error("worker pool is closed")]
    Closed,

    #[error("failed to spawn analysis worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
}

struct WorkRequest {
    frame: Bytes,
    reply: oneshot::Sender<Result<Value, AnalyzerError>>,
}

struct WorkerSlot {
    busy: Arc<AtomicBool>,
    tx: StdMutex<Option<mpsc::Sender<WorkRequest>>>,
    thread: StdMutex<Option<std::thread::JoinHandle<()>>>,
}

/// Releases the slot exactly once, however the submission ends.
struct SlotLease {
    busy: Arc<AtomicBool>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(size: usize, factory: Arc<dyn AnalyzerFactory>) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::EmptyPool);
        }

        let mut slots = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, mut rx) = mpsc::channel::<WorkRequest>(1);
            let factory = factory.clone();
            let thread = std::thread::Builder::new()
                .name(format!("analysis-worker-{index}"))
                .spawn(move || {
                    let mut analyzer = factory.create();
                    while let Some(request) = rx.blocking_recv() {
                        let result = analyzer.analyze(&request.frame);
                        let _ = request.reply.send(result);
                    }
                })?;
            slots.push(WorkerSlot {
                busy: Arc::new(AtomicBool::new(false)),
                tx: StdMutex::new(Some(tx)),
                thread: StdMutex::new(Some(thread)),
            });
        }

        Ok(Self {
            slots,
            closed: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Dispatch one frame to the first idle worker and wait for its result.
    /// `Ok(None)` means no slot was idle; the frame was not queued.
    pub async fn submit(&self, frame: Bytes) -> Result<Option<Value>, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let Some((_lease, tx)) = self.acquire() else {
            return Ok(None);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(WorkRequest {
            frame,
            reply: reply_tx,
        })
        .await
        .map_err(|_| PoolError::Closed)?;

        match reply_rx.await {
            Ok(Ok(result)) => Ok(Some(result)),
            Ok(Err(e)) => Err(PoolError::Analyzer(e)),
            Err(_) => Err(PoolError::Closed),
        }
    }

    /// First-idle-slot selection in slot-creation order.
    fn acquire(&self) -> Option<(SlotLease, mpsc::Sender<WorkRequest>)> {
        for slot in &self.slots {
            if slot
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let lease = SlotLease {
                    busy: slot.busy.clone(),
                };
                let Some(tx) = slot.tx.lock().unwrap().clone() else {
                    return None;
                };
                return Some((lease, tx));
            }
        }
        None
    }

    /// Terminate every worker. Idempotent; blocks on thread joins, so call
    /// from a blocking context.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.slots {
            slot.tx.lock().unwrap().take();
        }
        for slot in &self.slots {
            if let Some(thread) = slot.thread.lock().unwrap().take() {
                if thread.join().is_err() {
                    tracing::warn!("analysis worker panicked during shutdown");
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // threads exit on their own once the request channels drop
        if !self.closed.swap(true, Ordering::AcqRel) {
            for slot in &self.slots {
                slot.tx.lock().unwrap().take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyzer::FrameAnalyzer;
    use std::sync::mpsc as std_mpsc;

    /// Analyzer that blocks until the test releases it.
    struct GatedAnalyzer {
        gate: Arc<StdMutex<std_mpsc::Receiver<()>>>,
    }

    impl FrameAnalyzer for GatedAnalyzer {
        fn analyze(&mut self, frame: &[u8]) -> Result<Value, AnalyzerError> {
            self.gate.lock().unwrap().recv().ok();
            Ok(serde_json::json!({ "len": frame.len() }))
        }
    }

    struct GatedFactory {
        gate: Arc<StdMutex<std_mpsc::Receiver<()>>>,
    }

    impl AnalyzerFactory for GatedFactory {
        fn create(&self) -> Box<dyn FrameAnalyzer> {
            Box::new(GatedAnalyzer {
                gate: self.gate.clone(),
            })
        }
    }

    struct EchoFactory;

    impl AnalyzerFactory for EchoFactory {
        fn create(&self) -> Box<dyn FrameAnalyzer> {
            struct Echo;
            impl FrameAnalyzer for Echo {
                fn analyze(&mut self, frame: &[u8]) -> Result<Value, AnalyzerError> {
                    Ok(serde_json::json!({ "len": frame.len() }))
                }
            }
            Box::new(Echo)
        }
    }

    struct FailingFactory;

    impl AnalyzerFactory for FailingFactory {
        fn create(&self) -> Box<dyn FrameAnalyzer> {
            struct Failing;
            impl FrameAnalyzer for Failing {
                fn analyze(&mut self, _frame: &[u8]) -> Result<Value, AnalyzerError> {
                    Err(AnalyzerError::Backend("inference exploded".into()))
                }
            }
            Box::new(Failing)
        }
    }

    #[test]
    fn zero_slots_is_rejected() {
        assert!(matches!(
            WorkerPool::new(0, Arc::new(EchoFactory)),
            Err(PoolError::EmptyPool)
        ));
    }

    #[tokio::test]
    async fn submit_returns_the_worker_result() {
        let pool = WorkerPool::new(2, Arc::new(EchoFactory)).unwrap();
        let result = pool.submit(Bytes::from_static(b"abcd")).await.unwrap();
        assert_eq!(result.unwrap()["len"], 4);
    }

    #[tokio::test]
    async fn saturated_pool_declines_immediately() {
        let (release, gate) = std_mpsc::channel::<()>();
        let gate = Arc::new(StdMutex::new(gate));
        let pool = Arc::new(WorkerPool::new(2, Arc::new(GatedFactory { gate })).unwrap());

        // occupy both slots; neither completes until released
        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(Bytes::from_static(b"1")).await }
        });
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(Bytes::from_static(b"2")).await }
        });

        // wait until both slots are leased
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if pool.slots.iter().all(|s| s.busy.load(Ordering::Acquire)) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // third submission is declined without blocking or queueing
        let third = pool.submit(Bytes::from_static(b"3")).await.unwrap();
        assert!(third.is_none());

        release.send(()).unwrap();
        release.send(()).unwrap();
        assert!(first.await.unwrap().unwrap().is_some());
        assert!(second.await.unwrap().unwrap().is_some());
        drop(release);

        // slots are idle again after completion
        let fourth = pool.submit(Bytes::from_static(b"4")).await;
        assert!(!matches!(fourth, Ok(None)));
    }

    #[tokio::test]
    async fn failing_worker_releases_its_slot() {
        let pool = WorkerPool::new(1, Arc::new(FailingFactory)).unwrap();

        let err = pool.submit(Bytes::from_static(b"x")).await;
        assert!(matches!(err, Err(PoolError::Analyzer(_))));

        // the slot must be reusable after the failure
        let err = pool.submit(Bytes::from_static(b"y")).await;
        assert!(matches!(err, Err(PoolError::Analyzer(_))));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_later_submissions() {
        let pool = Arc::new(WorkerPool::new(2, Arc::new(EchoFactory)).unwrap());

        let p = pool.clone();
        tokio::task::spawn_blocking(move || {
            p.close();
            p.close();
        })
        .await
        .unwrap();

        assert!(matches!(
            pool.submit(Bytes::from_static(b"z")).await,
            Err(PoolError::Closed)
        ));
    }
}
