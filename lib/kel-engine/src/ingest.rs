//! Async ingest front
//!
//! A bounded channel feeding the registry from async callers. The worker applies
//! messages in arrival order on the blocking pool and answers each submitter over a
//! oneshot.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::KelError;
use crate::log::ApplyOutcome;
use crate::registry::{Inbound, Registry};
use crate::store::KelStore;

struct IngestRequest {
    inbound: Inbound,
    reply: oneshot::Sender<Result<ApplyOutcome, KelError>>,
}

#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestRequest>,
}

impl IngestHandle {
    /// Queues a message and waits for its outcome.
    pub async fn submit(&self, inbound: Inbound) -> Result<ApplyOutcome, KelError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(IngestRequest { inbound, reply })
            .await
            .map_err(|_| KelError::IngestClosed)?;
        rx.await.map_err(|_| KelError::IngestClosed)?
    }
}

/// Spawns the ingest worker. It stops once every handle has been dropped.
pub fn spawn_ingest<S>(registry: Arc<Registry<S>>) -> (IngestHandle, JoinHandle<()>)
where
    S: KelStore + ?Sized + 'static,
{
    let (tx, rx) = mpsc::channel(registry.config().ingest_queue_depth);
    let worker = tokio::spawn(run_ingest(registry, rx));
    (IngestHandle { tx }, worker)
}

async fn run_ingest<S>(registry: Arc<Registry<S>>, mut rx: mpsc::Receiver<IngestRequest>)
where
    S: KelStore + ?Sized + 'static,
{
    while let Some(IngestRequest { inbound, reply }) = rx.recv().await {
        let registry = registry.clone();
        let result = tokio::task::spawn_blocking(move || registry.submit(inbound))
            .await
            .unwrap_or_else(|e| {
                error!("Ingest task failed: {}", e);
                Err(KelError::Internal(e.to_string()))
            });
        if reply.send(result).is_err() {
            warn!("Ingest submitter went away before its outcome");
        }
    }
}
