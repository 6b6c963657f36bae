//! Retrain state machine.
//!
//! `idle -> backing_up -> fine_tuning -> validating -> committing -> idle`,
//! with any failure after the backup routed through `rolling_back -> idle`.
//! The active weights are only replaced by [`ArtifactStore::commit`], and a
//! backup of them always exists before that happens.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::models::artifact::{
    ModelArtifact, RetrainOutcome, RetrainPhase, RetrainStatus, RetrainTrigger,
};
use crate::models::record::ResultRecord;
use crate::services::artifacts::{ArtifactError, ArtifactStore};
use crate::services::feedback::{FeedbackAccumulator, FeedbackError};
use crate::services::inference::{
    FineTuneMetrics, FineTuneParams, InferenceAdapter, InferenceEngine, InferenceError,
    TrainingExample,
};
use crate::services::storage::ImageStore;

/// What happens to a drained batch when its run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchFailurePolicy {
    /// The batch stays marked as used. A poison sample cannot fail run after run.
    #[default]
    Consume,
    /// The batch returns to the unused pool for the next run.
    Requeue,
}

#[derive(Debug, Clone)]
pub struct RetrainConfig {
    pub min_samples_manual: usize,
    pub min_samples_scheduled: usize,
    pub fine_tune: FineTuneParams,
    pub on_failure: BatchFailurePolicy,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            min_samples_manual: 2,
            min_samples_scheduled: 5,
            fine_tune: FineTuneParams::default(),
            on_failure: BatchFailurePolicy::Consume,
        }
    }
}

impl RetrainConfig {
    pub fn min_samples(&self, trigger: RetrainTrigger) -> usize {
        match trigger {
            RetrainTrigger::Manual => self.min_samples_manual,
            RetrainTrigger::Scheduled => self.min_samples_scheduled,
        }
    }
}

struct Trained {
    artifact: ModelArtifact,
    metrics: FineTuneMetrics,
    samples: usize,
}

/// A failed run, and the phase it failed in.
struct Failure {
    phase: RetrainPhase,
    samples: usize,
    error: RetrainError,
}

pub struct RetrainPipeline {
    feedback: Arc<FeedbackAccumulator>,
    images: Arc<dyn ImageStore>,
    engine: Arc<dyn InferenceEngine>,
    artifacts: Arc<ArtifactStore>,
    adapter: Arc<InferenceAdapter>,
    config: RetrainConfig,
    running: Mutex<()>,
    phase: watch::Sender<RetrainPhase>,
}

impl RetrainPipeline {
    pub fn new(
        feedback: Arc<FeedbackAccumulator>,
        images: Arc<dyn ImageStore>,
        engine: Arc<dyn InferenceEngine>,
        artifacts: Arc<ArtifactStore>,
        adapter: Arc<InferenceAdapter>,
        config: RetrainConfig,
    ) -> Self {
        let (phase, _) = watch::channel(RetrainPhase::Idle);
        Self {
            feedback,
            images,
            engine,
            artifacts,
            adapter,
            config,
            running: Mutex::new(()),
            phase,
        }
    }

    pub fn phase(&self) -> RetrainPhase {
        *self.phase.borrow()
    }

    /// Follow phase changes, e.g. from a status endpoint or a test.
    pub fn subscribe(&self) -> watch::Receiver<RetrainPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: RetrainPhase) {
        self.phase.send_replace(phase);
        tracing::debug!(phase = %phase, "Retrain phase");
    }

    /// Execute one retrain run. Never fails: problems are reported in the outcome.
    pub async fn run(&self, trigger: RetrainTrigger) -> RetrainOutcome {
        let Ok(_running) = self.running.try_lock() else {
            tracing::info!(trigger = %trigger, "Retrain already running, trigger skipped");
            return finish(RetrainOutcome::skipped(
                trigger,
                "a retrain run is already in progress",
            ));
        };

        let started = Instant::now();
        let mut outcome = self.run_exclusive(trigger).await;
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        self.enter(RetrainPhase::Idle);
        finish(outcome)
    }

    async fn run_exclusive(&self, trigger: RetrainTrigger) -> RetrainOutcome {
        let required = self.config.min_samples(trigger);
        let available = match self.feedback.count_unused().await {
            Ok(n) => n as usize,
            Err(e) => {
                return RetrainOutcome::new(
                    RetrainStatus::Error,
                    trigger,
                    format!("Could not count corrections: {e}"),
                )
            }
        };

        if available < required {
            tracing::info!(
                trigger = %trigger,
                available,
                required,
                "Not enough corrected samples, retrain skipped"
            );
            return RetrainOutcome::skipped(
                trigger,
                format!("{available} unused corrected samples, {required} required"),
            );
        }

        tracing::info!(trigger = %trigger, available, "Retrain started");

        self.enter(RetrainPhase::BackingUp);
        let backup = match self.artifacts.backup_active().await {
            Ok(backup) => backup,
            Err(e) => {
                tracing::error!(error = %e, "Backup failed, retrain aborted");
                return RetrainOutcome::new(
                    RetrainStatus::Error,
                    trigger,
                    format!("Backup failed: {e}"),
                );
            }
        };

        self.enter(RetrainPhase::FineTuning);
        let batch = match self.feedback.drain_unused_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                let mut outcome = RetrainOutcome::new(
                    RetrainStatus::Error,
                    trigger,
                    format!("Could not claim training batch: {e}"),
                );
                outcome.backup_ref = Some(backup.version_id);
                return outcome;
            }
        };

        match self.train_and_commit(&batch).await {
            Ok(trained) => {
                tracing::info!(
                    version = %trained.artifact.version_id,
                    backup = %backup.version_id,
                    samples = trained.samples,
                    accuracy = trained.metrics.accuracy,
                    loss = trained.metrics.loss,
                    "Retrain committed"
                );
                let mut outcome = RetrainOutcome::new(
                    RetrainStatus::Success,
                    trigger,
                    format!("Model retrained on {} samples", trained.samples),
                );
                outcome.samples_used = trained.samples;
                outcome.epochs = Some(self.config.fine_tune.epochs);
                outcome.accuracy = Some(trained.metrics.accuracy);
                outcome.loss = Some(trained.metrics.loss);
                outcome.backup_ref = Some(backup.version_id);
                outcome.new_version_ref = Some(trained.artifact.version_id);
                outcome
            }
            Err(failure) => {
                tracing::error!(
                    phase = %failure.phase,
                    error = %failure.error,
                    backup = %backup.version_id,
                    "Retrain failed, rolling back"
                );
                self.enter(RetrainPhase::RollingBack);
                let restored = self.roll_back(&backup, failure.phase).await;
                self.settle_batch(&batch).await;

                let mut message = format!("Retrain failed during {}: {}", failure.phase, failure.error);
                if let Err(e) = restored {
                    message.push_str(&format!("; rollback failed: {e}"));
                }
                let mut outcome = RetrainOutcome::new(RetrainStatus::Error, trigger, message);
                outcome.samples_used = failure.samples;
                outcome.backup_ref = Some(backup.version_id);
                outcome
            }
        }
    }

    async fn train_and_commit(&self, batch: &[ResultRecord]) -> Result<Trained, Failure> {
        let examples = self.training_examples(batch).await;
        let samples = examples.len();
        let fail = |phase, error: RetrainError| Failure {
            phase,
            samples,
            error,
        };

        if examples.is_empty() {
            return Err(fail(RetrainPhase::FineTuning, RetrainError::NoUsableExamples));
        }

        // Train a separate instance; the serving one keeps answering until reload.
        let model = self
            .engine
            .load(&self.artifacts.active_path())
            .await
            .map_err(|e| fail(RetrainPhase::FineTuning, e.into()))?;
        let metrics = model
            .fine_tune(&examples, &self.config.fine_tune)
            .await
            .map_err(|e| fail(RetrainPhase::FineTuning, e.into()))?;

        self.enter(RetrainPhase::Validating);
        if !metrics.loss.is_finite() || !metrics.accuracy.is_finite() {
            return Err(fail(
                RetrainPhase::Validating,
                RetrainError::Validation(format!(
                    "non-finite metrics (accuracy {}, loss {})",
                    metrics.accuracy, metrics.loss
                )),
            ));
        }

        self.enter(RetrainPhase::Committing);
        let staged = self.artifacts.staging_path();
        if let Err(e) = model.save(&staged).await {
            self.artifacts.discard_staged(&staged).await;
            return Err(fail(RetrainPhase::Committing, e.into()));
        }
        let artifact = match self.artifacts.commit(&staged).await {
            Ok(artifact) => artifact,
            Err(e) => {
                self.artifacts.discard_staged(&staged).await;
                return Err(fail(RetrainPhase::Committing, e.into()));
            }
        };
        self.adapter
            .reload()
            .await
            .map_err(|e| fail(RetrainPhase::Committing, e.into()))?;

        Ok(Trained {
            artifact,
            metrics,
            samples,
        })
    }

    /// Records whose image cannot be materialized are left out.
    async fn training_examples(&self, batch: &[ResultRecord]) -> Vec<TrainingExample> {
        let mut examples = Vec::with_capacity(batch.len());
        for record in batch {
            let Some(correction) = &record.correction else {
                continue;
            };
            match self.images.local_path(&record.image_key).await {
                Ok(image_path) => examples.push(TrainingExample {
                    image_path,
                    label: correction.true_label,
                }),
                Err(e) => tracing::warn!(
                    fingerprint = %record.fingerprint.short(),
                    error = %e,
                    "Skipping corrected record without a usable image"
                ),
            }
        }
        examples
    }

    async fn roll_back(
        &self,
        backup: &ModelArtifact,
        failed_in: RetrainPhase,
    ) -> Result<(), RetrainError> {
        self.artifacts.restore(backup).await?;

        // Only a failure at commit time can have reached the serving instance.
        if failed_in == RetrainPhase::Committing {
            if let Err(e) = self.adapter.reload().await {
                tracing::error!(error = %e, "Reload after rollback failed");
            }
        }
        Ok(())
    }

    async fn settle_batch(&self, batch: &[ResultRecord]) {
        match self.config.on_failure {
            BatchFailurePolicy::Consume => {
                tracing::info!(samples = batch.len(), "Failed batch left consumed");
            }
            BatchFailurePolicy::Requeue => {
                if let Err(e) = self.feedback.release_batch(batch).await {
                    tracing::error!(error = %e, "Failed to requeue training batch");
                }
            }
        }
    }

    /// Run a scheduled retrain every `interval`, first one after one interval.
    pub fn spawn_scheduler(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            tracing::info!(interval_secs = interval.as_secs(), "Retrain scheduler started");
            loop {
                ticker.tick().await;
                let outcome = self.run(RetrainTrigger::Scheduled).await;
                tracing::info!(
                    status = %outcome.status,
                    samples = outcome.samples_used,
                    message = %outcome.message,
                    "Scheduled retrain finished"
                );
            }
        })
    }
}

fn finish(outcome: RetrainOutcome) -> RetrainOutcome {
    metrics::counter!("retrain_runs_total", "status" => outcome.status.to_string()).increment(1);
    outcome
}

#[derive(Debug, thiserror::Error)]
pub enum RetrainError {
    #[error(transparent)]
    Feedback(#[from] FeedbackError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("No corrected record in the batch has a usable image")]
    NoUsableExamples,

    #[error("Validation failed: {0}")]
    Validation(String),
}
