use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{CorrectionWrite, ResultStore, StoreError};
use crate::models::label::{DiseaseLabel, UnknownLabel};
use crate::models::record::{Fingerprint, ResultRecord};
use crate::services::storage::ImageStore;

/// Collects user corrections and hands them out as training batches.
///
/// A correction sets `used_for_training = false`; draining flips the flag in
/// the same store operation that reads the batch, so a record is never part
/// of two batches unless it is corrected again or explicitly released.
pub struct FeedbackAccumulator {
    store: Arc<dyn ResultStore>,
    images: Arc<dyn ImageStore>,
    corpus_dir: PathBuf,
}

impl FeedbackAccumulator {
    pub fn new(
        store: Arc<dyn ResultStore>,
        images: Arc<dyn ImageStore>,
        corpus_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            images,
            corpus_dir: corpus_dir.into(),
        }
    }

    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir
    }

    /// Attach a ground-truth label to a completed record.
    ///
    /// The image is also copied into the label-partitioned corpus. That copy
    /// is best-effort: a failure is logged and the correction still stands.
    pub async fn record_correction(
        &self,
        fingerprint: &Fingerprint,
        true_label: DiseaseLabel,
    ) -> Result<ResultRecord, FeedbackError> {
        let record = match self
            .store
            .set_correction(fingerprint, true_label, Utc::now())
            .await?
        {
            CorrectionWrite::Applied(record) => record,
            CorrectionWrite::NotFound => {
                return Err(FeedbackError::NotFound(fingerprint.clone()))
            }
            CorrectionWrite::NotCompleted => {
                return Err(FeedbackError::NotCompleted(fingerprint.clone()))
            }
        };

        metrics::counter!("feedback_corrections_total", "label" => true_label.to_string())
            .increment(1);

        let predicted = record.diagnosis.as_ref().map(|d| d.label);
        tracing::info!(
            fingerprint = %fingerprint.short(),
            true_label = %true_label,
            predicted = ?predicted,
            "Correction recorded"
        );

        match self.persist_to_corpus(&record, true_label).await {
            Ok(path) => tracing::debug!(
                fingerprint = %fingerprint.short(),
                path = %path.display(),
                "Corrected image added to corpus"
            ),
            Err(e) => tracing::warn!(
                fingerprint = %fingerprint.short(),
                error = %e,
                "Failed to add corrected image to corpus"
            ),
        }

        Ok(record)
    }

    /// Same as [`record_correction`](Self::record_correction), with the label given by name.
    pub async fn record_correction_named(
        &self,
        fingerprint: &Fingerprint,
        true_label: &str,
    ) -> Result<ResultRecord, FeedbackError> {
        let label = DiseaseLabel::parse(true_label)?;
        self.record_correction(fingerprint, label).await
    }

    pub async fn count_unused(&self) -> Result<u64, FeedbackError> {
        Ok(self.store.count_unused().await?)
    }

    /// Claim every unused correction. Claimed records are marked used atomically.
    pub async fn drain_unused_batch(&self) -> Result<Vec<ResultRecord>, FeedbackError> {
        let batch = self.store.drain_unused().await?;
        if !batch.is_empty() {
            tracing::info!(samples = batch.len(), "Drained training batch");
        }
        Ok(batch)
    }

    /// Return a drained batch to the unused pool.
    pub async fn release_batch(&self, batch: &[ResultRecord]) -> Result<u64, FeedbackError> {
        let fingerprints: Vec<Fingerprint> =
            batch.iter().map(|r| r.fingerprint.clone()).collect();
        let released = self.store.release(&fingerprints).await?;
        tracing::info!(released, "Training batch released for a later run");
        Ok(released)
    }

    async fn persist_to_corpus(
        &self,
        record: &ResultRecord,
        label: DiseaseLabel,
    ) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
        let bytes = self.images.get(&record.image_key).await?;
        let ext = Path::new(&record.image_key)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");

        let dir = self.corpus_dir.join(label.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("feedback_{}.{ext}", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("No result record for fingerprint {0}")]
    NotFound(Fingerprint),

    #[error("Record {0} has not completed; only completed results can be corrected")]
    NotCompleted(Fingerprint),

    #[error(transparent)]
    UnknownLabel(#[from] UnknownLabel),

    #[error(transparent)]
    Store(#[from] StoreError),
}
