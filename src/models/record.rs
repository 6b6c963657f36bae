use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use strum::{Display, EnumString};

use crate::models::label::{DiseaseLabel, Recommendation, Urgency};

/// SHA-256 of the raw, unmodified image bytes, lowercase hex.
///
/// Exact-match only: two visually identical images that differ in a single
/// byte get different fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Wrap an already-computed hex digest (e.g. a value read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordState {
    Pending,
    Completed,
    Failed,
}

/// Classification fields written once when inference succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub label: DiseaseLabel,
    pub confidence: f64,
    pub urgency: Urgency,
    pub recommendation: Recommendation,
    /// Model time only.
    pub inference_ms: f64,
    /// Whole attempt: image materialization, inference and recommendation lookup.
    pub processing_time_ms: f64,
}

/// User-supplied ground truth for a completed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub true_label: DiseaseLabel,
    pub corrected_at: DateTime<Utc>,
    pub used_for_training: bool,
}

/// One record per distinct image fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub fingerprint: Fingerprint,
    pub image_key: String,
    pub state: RecordState,
    pub diagnosis: Option<Diagnosis>,
    pub error: Option<String>,
    pub correction: Option<Correction>,
    /// Set on the copy handed back for a cache hit; never persisted.
    #[serde(default)]
    pub served_from_cache: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn pending(fingerprint: Fingerprint, image_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            fingerprint,
            image_key: image_key.into(),
            state: RecordState::Pending,
            diagnosis: None,
            error: None,
            correction: None,
            served_from_cache: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Corrected and not yet consumed by a retrain run.
    pub fn is_unused_correction(&self) -> bool {
        self.correction
            .as_ref()
            .is_some_and(|c| !c.used_for_training)
    }

    pub fn into_cache_hit(mut self) -> Self {
        self.served_from_cache = true;
        self
    }
}
