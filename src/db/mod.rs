use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::label::DiseaseLabel;
use crate::models::record::{Diagnosis, Fingerprint, ResultRecord};

pub mod memory;
pub mod queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Result of writing a correction against a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionWrite {
    Applied(ResultRecord),
    NotFound,
    NotCompleted,
}

/// Durable storage for result records.
///
/// `fingerprint` is unique: `insert_if_absent` is the only way a record comes
/// into existence and concurrent inserts of the same fingerprint leave exactly
/// one row behind. State transitions are conditional on the current state, so
/// a `complete` or `fail` against a record that already left `pending` is a
/// no-op reported as `false`.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Returns `true` if this call created the record.
    async fn insert_if_absent(&self, record: &ResultRecord) -> Result<bool, StoreError>;

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ResultRecord>, StoreError>;

    /// `pending -> completed`.
    async fn complete(
        &self,
        fingerprint: &Fingerprint,
        diagnosis: &Diagnosis,
    ) -> Result<bool, StoreError>;

    /// `pending -> failed`.
    async fn fail(&self, fingerprint: &Fingerprint, error: &str) -> Result<bool, StoreError>;

    /// `failed -> pending`, clearing the error.
    async fn reopen_failed(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError>;

    /// Fingerprints still `pending`, oldest first.
    async fn pending(&self) -> Result<Vec<Fingerprint>, StoreError>;

    /// Overwrites any prior correction and resets `used_for_training`.
    async fn set_correction(
        &self,
        fingerprint: &Fingerprint,
        true_label: DiseaseLabel,
        corrected_at: DateTime<Utc>,
    ) -> Result<CorrectionWrite, StoreError>;

    async fn count_unused(&self) -> Result<u64, StoreError>;

    /// Returns every unused correction and marks it used in the same step.
    async fn drain_unused(&self) -> Result<Vec<ResultRecord>, StoreError>;

    /// Marks the given records unused again. Returns how many changed.
    async fn release(&self, fingerprints: &[Fingerprint]) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt record {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },
}
