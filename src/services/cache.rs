use std::sync::Arc;

use crate::db::{ResultStore, StoreError};
use crate::models::record::{Diagnosis, Fingerprint, ResultRecord};

/// Outcome of [`FingerprintCache::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    /// Another writer got there first; read the existing record instead.
    AlreadyPresent,
}

/// Exact-match cache from image fingerprint to result record.
///
/// Thin over the store's uniqueness constraint: losing an insert race is a
/// normal outcome, not an error. Persistence errors pass through unchanged.
pub struct FingerprintCache {
    store: Arc<dyn ResultStore>,
}

impl FingerprintCache {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }

    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<ResultRecord>, StoreError> {
        self.store.get(fingerprint).await
    }

    pub async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self.store.get(fingerprint).await?.is_some())
    }

    pub async fn store(&self, record: &ResultRecord) -> Result<StoreOutcome, StoreError> {
        if self.store.insert_if_absent(record).await? {
            Ok(StoreOutcome::Inserted)
        } else {
            tracing::debug!(
                fingerprint = %record.fingerprint.short(),
                "Fingerprint already cached, insert skipped"
            );
            Ok(StoreOutcome::AlreadyPresent)
        }
    }

    /// Write a successful inference back into the pending record.
    pub async fn record_diagnosis(
        &self,
        fingerprint: &Fingerprint,
        diagnosis: &Diagnosis,
    ) -> Result<bool, StoreError> {
        self.store.complete(fingerprint, diagnosis).await
    }

    pub async fn record_failure(
        &self,
        fingerprint: &Fingerprint,
        error: &str,
    ) -> Result<bool, StoreError> {
        self.store.fail(fingerprint, error).await
    }

    pub async fn reopen_failed(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        self.store.reopen_failed(fingerprint).await
    }

    pub async fn pending(&self) -> Result<Vec<Fingerprint>, StoreError> {
        self.store.pending().await
    }
}
