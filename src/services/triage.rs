use serde::Serialize;
use std::sync::Arc;

use crate::db::StoreError;
use crate::models::record::{Fingerprint, RecordState, ResultRecord};
use crate::models::task::{TaskId, TaskPoll};
use crate::services::cache::{FingerprintCache, StoreOutcome};
use crate::services::orchestrator::{OrchestratorError, TaskOrchestrator};
use crate::services::storage::{image_key, ImageStore, StorageError};

/// Result of handing an image to [`TriageService::ingest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Submission {
    /// Same bytes were diagnosed before; no task was created.
    Cached { record: ResultRecord },
    Queued {
        task_id: TaskId,
        fingerprint: Fingerprint,
    },
}

/// Entry point tying the cache, the image store and the orchestrator together.
pub struct TriageService {
    cache: Arc<FingerprintCache>,
    images: Arc<dyn ImageStore>,
    orchestrator: Arc<TaskOrchestrator>,
}

impl TriageService {
    pub fn new(
        cache: Arc<FingerprintCache>,
        images: Arc<dyn ImageStore>,
        orchestrator: Arc<TaskOrchestrator>,
    ) -> Self {
        Self {
            cache,
            images,
            orchestrator,
        }
    }

    pub async fn ingest(&self, bytes: &[u8]) -> Result<Submission, IngestError> {
        let fingerprint = Fingerprint::of(bytes);

        if let Some(existing) = self.cache.lookup(&fingerprint).await? {
            return self.resume(existing).await;
        }

        metrics::counter!("triage_cache_misses_total").increment(1);
        let key = image_key(&fingerprint, bytes);
        self.images.put(&key, bytes).await?;

        let record = ResultRecord::pending(fingerprint.clone(), key);
        match self.cache.store(&record).await? {
            StoreOutcome::Inserted => {
                let task_id = self.orchestrator.submit(fingerprint.clone()).await;
                tracing::info!(
                    fingerprint = %fingerprint.short(),
                    task_id = %task_id,
                    bytes = bytes.len(),
                    "New image queued for inference"
                );
                Ok(Submission::Queued {
                    task_id,
                    fingerprint,
                })
            }
            StoreOutcome::AlreadyPresent => {
                let existing = self
                    .cache
                    .lookup(&fingerprint)
                    .await?
                    .ok_or_else(|| IngestError::Vanished(fingerprint.clone()))?;
                self.resume(existing).await
            }
        }
    }

    /// Handle a fingerprint that already has a record.
    async fn resume(&self, record: ResultRecord) -> Result<Submission, IngestError> {
        let fingerprint = record.fingerprint.clone();
        match record.state {
            RecordState::Completed => {
                metrics::counter!("triage_cache_hits_total").increment(1);
                tracing::info!(fingerprint = %fingerprint.short(), "Served from cache");
                Ok(Submission::Cached {
                    record: record.into_cache_hit(),
                })
            }
            RecordState::Pending => {
                let task_id = self.orchestrator.submit(fingerprint.clone()).await;
                Ok(Submission::Queued {
                    task_id,
                    fingerprint,
                })
            }
            RecordState::Failed => {
                if self.cache.reopen_failed(&fingerprint).await? {
                    tracing::info!(fingerprint = %fingerprint.short(), "Retrying previously failed image");
                }
                let task_id = self.orchestrator.submit(fingerprint.clone()).await;
                Ok(Submission::Queued {
                    task_id,
                    fingerprint,
                })
            }
        }
    }

    pub async fn poll(&self, task_id: TaskId) -> Result<TaskPoll, OrchestratorError> {
        self.orchestrator.poll(task_id).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Record for {0} disappeared during ingest")]
    Vanished(Fingerprint),
}
