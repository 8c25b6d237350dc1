//! Bounded trigger queue drained by a fixed pool of workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{TriggerHandler, run_trigger};
use super::metrics::Metrics;
use crate::model::Trigger;

/// Producer side, shared by request handlers.
#[derive(Clone)]
pub struct Queue {
    tx: mpsc::Sender<Trigger>,
    capacity: usize,
}

impl Queue {
    /// Hand a trigger to the workers without waiting. Gives it back when full.
    pub fn try_enqueue(&self, trigger: Trigger) -> Result<(), Trigger> {
        self.tx.try_send(trigger).map_err(|e| match e {
            mpsc::error::TrySendError::Full(t) | mpsc::error::TrySendError::Closed(t) => t,
        })
    }

    pub fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn is_saturated(&self) -> bool {
        self.tx.capacity() == 0
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

/// Create the queue and spawn `workers` tasks draining it.
pub fn start(
    queue_size: usize,
    workers: usize,
    handler: Arc<dyn TriggerHandler>,
    metrics: Metrics,
) -> (Queue, WorkerPool) {
    let capacity = queue_size.max(1);
    let (tx, rx) = mpsc::channel::<Trigger>(capacity);
    let rx = Arc::new(Mutex::new(rx));
    let (stop, _) = watch::channel(false);

    let handles = (0..workers.max(1))
        .map(|id| {
            let rx = rx.clone();
            let handler = handler.clone();
            let metrics = metrics.clone();
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        let next = tokio::select! {
                            biased;
                            _ = stop_rx.changed() => None,
                            t = rx.recv() => t,
                        };
                        metrics.set_queue_depth(rx.len());
                        next
                    };
                    let Some(trigger) = next else { break };
                    debug!(worker = id, repo = %trigger.full_repo(), pr = trigger.pr_number, "dequeued trigger");
                    run_trigger(handler.as_ref(), &metrics, trigger).await;
                }
                debug!(worker = id, "worker stopped");
            })
        })
        .collect();

    (Queue { tx, capacity }, WorkerPool { handles, stop })
}

impl WorkerPool {
    /// Stop taking new work and wait up to `grace` for in-flight invocations.
    /// Whatever is still running afterwards is aborted.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.stop.send(true);
        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(grace, futures::future::join_all(self.handles)).await {
            Ok(_) => info!("workers drained"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "grace period elapsed, cancelling in-flight invocations");
                for a in aborts {
                    a.abort();
                }
            }
        }
    }
}
