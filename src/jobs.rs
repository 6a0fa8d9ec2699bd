//! Background indexing job queue.
//!
//! Request handlers must not fire-and-forget indexing work: a swallowed
//! failure is invisible. Jobs go through an explicit queue with an ID,
//! an observable status, and an optional completion callback, processed by
//! a single worker task so indexing load on the stores stays serialized
//! per queue.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::IndexingConfig;
use crate::embedding::EmbeddingProvider;
use crate::ingest::index_documents;
use crate::models::{IndexOptions, IndexOutcome};
use crate::sources::SourceDocument;
use crate::store::TenantStores;

/// Observable lifecycle of a submitted job.
#[derive(Debug, Clone)]
pub enum JobStatus {
    Queued,
    Running,
    Completed(IndexOutcome),
    Failed(String),
}

/// Called exactly once when a job finishes, success or failure.
pub type JobCallback = Box<dyn FnOnce(&JobStatus) + Send>;

struct IndexJob {
    id: Uuid,
    documents: Vec<Box<dyn SourceDocument>>,
    opts: IndexOptions,
    callback: Option<JobCallback>,
}

pub struct IndexJobQueue {
    tx: mpsc::Sender<IndexJob>,
    statuses: Arc<RwLock<HashMap<Uuid, JobStatus>>>,
    worker: JoinHandle<()>,
}

impl IndexJobQueue {
    /// Start the queue worker. `capacity` bounds queued-but-unstarted jobs;
    /// `submit` applies backpressure once it fills.
    pub fn start(
        config: IndexingConfig,
        stores: Arc<TenantStores>,
        embedder: Arc<dyn EmbeddingProvider>,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<IndexJob>(capacity.max(1));
        let statuses: Arc<RwLock<HashMap<Uuid, JobStatus>>> = Arc::new(RwLock::new(HashMap::new()));

        let worker_statuses = statuses.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                set_status(&worker_statuses, job.id, JobStatus::Running);

                let documents: Vec<&dyn SourceDocument> =
                    job.documents.iter().map(|d| d.as_ref()).collect();
                let status = match index_documents(
                    &config,
                    &stores,
                    embedder.as_ref(),
                    &documents,
                    &job.opts,
                )
                .await
                {
                    Ok(outcome) => JobStatus::Completed(outcome),
                    Err(e) => {
                        error!(job_id = %job.id, error = %format!("{:#}", e), "index job failed");
                        JobStatus::Failed(format!("{:#}", e))
                    }
                };

                set_status(&worker_statuses, job.id, status.clone());
                if let Some(callback) = job.callback {
                    callback(&status);
                }
            }
        });

        Self {
            tx,
            statuses,
            worker,
        }
    }

    /// Enqueue a batch of documents for indexing.
    pub async fn submit(
        &self,
        documents: Vec<Box<dyn SourceDocument>>,
        opts: IndexOptions,
    ) -> Result<Uuid> {
        self.submit_with_callback(documents, opts, None).await
    }

    /// Enqueue with a completion callback invoked from the worker task.
    pub async fn submit_with_callback(
        &self,
        documents: Vec<Box<dyn SourceDocument>>,
        opts: IndexOptions,
        callback: Option<JobCallback>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        set_status(&self.statuses, id, JobStatus::Queued);
        self.tx
            .send(IndexJob {
                id,
                documents,
                opts,
                callback,
            })
            .await
            .map_err(|_| anyhow::anyhow!("index job queue is shut down"))?;
        info!(job_id = %id, "index job queued");
        Ok(id)
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.statuses.read().ok()?.get(&id).cloned()
    }

    /// Stop accepting jobs, drain the queue, and wait for the worker.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.tx);
        self.worker.await.context("index job worker panicked")
    }
}

fn set_status(statuses: &RwLock<HashMap<Uuid, JobStatus>>, id: Uuid, status: JobStatus) {
    if let Ok(mut map) = statuses.write() {
        map.insert(id, status);
    }
}
