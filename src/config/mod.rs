use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::inference::FineTuneParams;
use crate::services::orchestrator::{OrchestratorConfig, RetryPolicy};
use crate::services::retrain::{BatchFailurePolicy, RetrainConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Operational HTTP listener (health + metrics).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Unset selects the in-memory store.
    pub database_url: Option<String>,

    /// Base URL of the external inference engine.
    #[serde(default = "default_inference_url")]
    pub inference_url: String,

    /// Local image store root, used when no R2 bucket is configured.
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    /// R2 bucket name
    pub r2_bucket: Option<String>,

    /// R2 endpoint URL
    pub r2_endpoint: Option<String>,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: Option<String>,

    /// AES-256-GCM key (base64-encoded, 32 bytes) for images sealed in R2
    pub encryption_key: Option<String>,

    /// Where remote images are downloaded for the engine to read.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Label-partitioned corpus of corrected images.
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: PathBuf,

    /// Model artifact store root.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,

    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// How long finished tasks stay pollable.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,

    #[serde(default = "default_min_samples_manual")]
    pub retrain_min_samples_manual: usize,

    #[serde(default = "default_min_samples_scheduled")]
    pub retrain_min_samples_scheduled: usize,

    #[serde(default = "default_retrain_interval_secs")]
    pub retrain_interval_secs: u64,

    #[serde(default = "default_retrain_epochs")]
    pub retrain_epochs: u32,

    #[serde(default = "default_retrain_learning_rate")]
    pub retrain_learning_rate: f64,

    #[serde(default = "default_retrain_batch_size")]
    pub retrain_batch_size: u32,

    /// Return a failed run's batch to the unused pool instead of consuming it.
    #[serde(default)]
    pub retrain_requeue_failed_batches: bool,
}

/// S3-compatible settings, present only when all four are configured.
#[derive(Debug, Clone)]
pub struct R2Settings {
    pub bucket: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_inference_url() -> String {
    "http://127.0.0.1:8501".to_string()
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("media")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("media/staging")
}

fn default_corpus_dir() -> PathBuf {
    PathBuf::from("dataset/combined")
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("saved_models")
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    2_000
}

fn default_retry_cap_ms() -> u64 {
    60_000
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

fn default_task_retention_secs() -> u64 {
    3_600
}

fn default_min_samples_manual() -> usize {
    2
}

fn default_min_samples_scheduled() -> usize {
    5
}

fn default_retrain_interval_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_retrain_epochs() -> u32 {
    3
}

fn default_retrain_learning_rate() -> f64 {
    1e-5
}

fn default_retrain_batch_size() -> u32 {
    8
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn r2(&self) -> Option<R2Settings> {
        Some(R2Settings {
            bucket: self.r2_bucket.clone()?,
            endpoint: self.r2_endpoint.clone()?,
            access_key: self.r2_access_key.clone()?,
            secret_key: self.r2_secret_key.clone()?,
        })
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            worker_pool_size: self.worker_pool_size.max(1),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                base_delay: Duration::from_millis(self.retry_base_ms),
                max_delay: Duration::from_millis(self.retry_cap_ms),
            },
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            task_retention: Duration::from_secs(self.task_retention_secs),
        }
    }

    pub fn retrain(&self) -> RetrainConfig {
        RetrainConfig {
            min_samples_manual: self.retrain_min_samples_manual,
            min_samples_scheduled: self.retrain_min_samples_scheduled,
            fine_tune: FineTuneParams {
                epochs: self.retrain_epochs,
                learning_rate: self.retrain_learning_rate,
                batch_size: self.retrain_batch_size,
            },
            on_failure: if self.retrain_requeue_failed_batches {
                BatchFailurePolicy::Requeue
            } else {
                BatchFailurePolicy::Consume
            },
        }
    }

    pub fn retrain_interval(&self) -> Duration {
        Duration::from_secs(self.retrain_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_apply() {
        let config: AppConfig = envy::from_iter(vars(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert!(config.database_url.is_none());
        // Image keys already carry the `xray_images/` prefix.
        assert_eq!(config.image_dir, PathBuf::from("media"));

        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.retry.max_attempts, 3);
        assert_eq!(orchestrator.retry.base_delay, Duration::from_secs(2));
        assert_eq!(orchestrator.attempt_timeout, Duration::from_secs(120));

        let retrain = config.retrain();
        assert_eq!(retrain.min_samples_manual, 2);
        assert_eq!(retrain.min_samples_scheduled, 5);
        assert_eq!(retrain.on_failure, BatchFailurePolicy::Consume);
    }

    #[test]
    fn test_r2_requires_all_settings() {
        let partial: AppConfig = envy::from_iter(vars(&[
            ("R2_BUCKET", "xrays"),
            ("R2_ENDPOINT", "https://r2.example.com"),
        ]))
        .unwrap();
        assert!(partial.r2().is_none());

        let full: AppConfig = envy::from_iter(vars(&[
            ("R2_BUCKET", "xrays"),
            ("R2_ENDPOINT", "https://r2.example.com"),
            ("R2_ACCESS_KEY", "key"),
            ("R2_SECRET_KEY", "secret"),
            ("RETRAIN_REQUEUE_FAILED_BATCHES", "true"),
        ]))
        .unwrap();
        assert_eq!(full.r2().unwrap().bucket, "xrays");
        assert_eq!(full.retrain().on_failure, BatchFailurePolicy::Requeue);
    }
}
