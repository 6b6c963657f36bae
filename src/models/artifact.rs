use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::Display;

/// Where a set of weights came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactSource {
    Initial,
    Retrained,
}

/// A versioned, loadable set of model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version_id: String,
    pub created_at: DateTime<Utc>,
    pub source: ArtifactSource,
    /// Set on backups: the version that was active when the copy was taken.
    pub backup_of: Option<String>,
    /// Relative to the artifact store root.
    pub path: PathBuf,
    /// SHA-256 of the weights file, lowercase hex.
    pub checksum: String,
}

impl ModelArtifact {
    pub fn is_backup(&self) -> bool {
        self.backup_of.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RetrainTrigger {
    Manual,
    Scheduled,
}

/// Phase of the retrain state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RetrainPhase {
    Idle,
    BackingUp,
    FineTuning,
    Validating,
    Committing,
    RollingBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RetrainStatus {
    Success,
    Skipped,
    Error,
}

/// Structured result of one retrain run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainOutcome {
    pub status: RetrainStatus,
    pub trigger: RetrainTrigger,
    pub message: String,
    pub samples_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epochs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version_ref: Option<String>,
    pub duration_ms: u64,
}

impl RetrainOutcome {
    pub fn new(status: RetrainStatus, trigger: RetrainTrigger, message: impl Into<String>) -> Self {
        Self {
            status,
            trigger,
            message: message.into(),
            samples_used: 0,
            epochs: None,
            accuracy: None,
            loss: None,
            backup_ref: None,
            new_version_ref: None,
            duration_ms: 0,
        }
    }

    pub fn skipped(trigger: RetrainTrigger, message: impl Into<String>) -> Self {
        Self::new(RetrainStatus::Skipped, trigger, message)
    }
}
