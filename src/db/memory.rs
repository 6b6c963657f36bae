//! In-memory result store.
//!
//! Same contract as the PostgreSQL store, with every operation serialized
//! behind one mutex. Used when no database is configured and in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{CorrectionWrite, ResultStore, StoreError};
use crate::models::label::DiseaseLabel;
use crate::models::record::{Correction, Diagnosis, Fingerprint, RecordState, ResultRecord};

#[derive(Default)]
pub struct InMemoryResultStore {
    records: Mutex<HashMap<Fingerprint, ResultRecord>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

/// Apply `f` to the record if it is in `from`, stamping `updated_at`.
fn transition(
    records: &mut HashMap<Fingerprint, ResultRecord>,
    fingerprint: &Fingerprint,
    from: RecordState,
    f: impl FnOnce(&mut ResultRecord),
) -> bool {
    match records.get_mut(fingerprint) {
        Some(record) if record.state == from => {
            f(record);
            record.updated_at = Utc::now();
            true
        }
        _ => false,
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn insert_if_absent(&self, record: &ResultRecord) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.fingerprint) {
            return Ok(false);
        }
        let mut stored = record.clone();
        stored.served_from_cache = false;
        records.insert(record.fingerprint.clone(), stored);
        Ok(true)
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ResultRecord>, StoreError> {
        Ok(self.records.lock().await.get(fingerprint).cloned())
    }

    async fn complete(
        &self,
        fingerprint: &Fingerprint,
        diagnosis: &Diagnosis,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        Ok(transition(&mut records, fingerprint, RecordState::Pending, |r| {
            r.state = RecordState::Completed;
            r.diagnosis = Some(diagnosis.clone());
            r.error = None;
        }))
    }

    async fn fail(&self, fingerprint: &Fingerprint, error: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        Ok(transition(&mut records, fingerprint, RecordState::Pending, |r| {
            r.state = RecordState::Failed;
            r.error = Some(error.to_string());
        }))
    }

    async fn reopen_failed(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        Ok(transition(&mut records, fingerprint, RecordState::Failed, |r| {
            r.state = RecordState::Pending;
            r.error = None;
        }))
    }

    async fn pending(&self) -> Result<Vec<Fingerprint>, StoreError> {
        let records = self.records.lock().await;
        let mut pending: Vec<&ResultRecord> = records
            .values()
            .filter(|r| r.state == RecordState::Pending)
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending.into_iter().map(|r| r.fingerprint.clone()).collect())
    }

    async fn set_correction(
        &self,
        fingerprint: &Fingerprint,
        true_label: DiseaseLabel,
        corrected_at: DateTime<Utc>,
    ) -> Result<CorrectionWrite, StoreError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(fingerprint) else {
            return Ok(CorrectionWrite::NotFound);
        };
        if record.state != RecordState::Completed {
            return Ok(CorrectionWrite::NotCompleted);
        }

        record.correction = Some(Correction {
            true_label,
            corrected_at,
            used_for_training: false,
        });
        record.updated_at = Utc::now();
        Ok(CorrectionWrite::Applied(record.clone()))
    }

    async fn count_unused(&self) -> Result<u64, StoreError> {
        let records = self.records.lock().await;
        Ok(records.values().filter(|r| r.is_unused_correction()).count() as u64)
    }

    async fn drain_unused(&self) -> Result<Vec<ResultRecord>, StoreError> {
        let mut records = self.records.lock().await;
        let now = Utc::now();
        let mut batch = Vec::new();
        for record in records.values_mut() {
            if let Some(correction) = record.correction.as_mut() {
                if !correction.used_for_training {
                    correction.used_for_training = true;
                    record.updated_at = now;
                    batch.push(record.clone());
                }
            }
        }
        batch.sort_by_key(|r| r.correction.as_ref().map(|c| c.corrected_at));
        Ok(batch)
    }

    async fn release(&self, fingerprints: &[Fingerprint]) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let mut released = 0;
        for fingerprint in fingerprints {
            if let Some(correction) = records
                .get_mut(fingerprint)
                .and_then(|r| r.correction.as_mut())
            {
                if correction.used_for_training {
                    correction.used_for_training = false;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
