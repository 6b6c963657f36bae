use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use super::{CorrectionWrite, ResultStore, StoreError};
use crate::models::label::{DiseaseLabel, Recommendation, Urgency};
use crate::models::record::{Correction, Diagnosis, Fingerprint, RecordState, ResultRecord};

const RECORD_COLUMNS: &str = r#"
    fingerprint, image_key, state, classification, confidence, urgency, recommendation,
    inference_ms, processing_time_ms, error, true_label, corrected_at, used_for_training,
    created_at, updated_at
"#;

/// PostgreSQL-backed result store.
#[derive(Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn corrupt(fingerprint: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        fingerprint: fingerprint.to_string(),
        reason: reason.into(),
    }
}

/// Map a `result_records` row into the domain record.
fn record_from_row(row: &PgRow) -> Result<ResultRecord, StoreError> {
    let fingerprint: String = row.try_get("fingerprint")?;

    let state_str: String = row.try_get("state")?;
    let state = RecordState::from_str(&state_str)
        .map_err(|_| corrupt(&fingerprint, format!("unknown state {state_str:?}")))?;

    let classification: Option<String> = row.try_get("classification")?;
    let diagnosis = match (state, classification) {
        (RecordState::Completed, Some(label)) => {
            let label = DiseaseLabel::from_str(&label)
                .map_err(|_| corrupt(&fingerprint, format!("unknown label {label:?}")))?;
            let urgency_str: String = row.try_get("urgency")?;
            let urgency = Urgency::from_str(&urgency_str)
                .map_err(|_| corrupt(&fingerprint, format!("unknown urgency {urgency_str:?}")))?;
            let Json(recommendation): Json<Recommendation> = row.try_get("recommendation")?;

            Some(Diagnosis {
                label,
                confidence: row.try_get("confidence")?,
                urgency,
                recommendation,
                inference_ms: row.try_get("inference_ms")?,
                processing_time_ms: row.try_get("processing_time_ms")?,
            })
        }
        (RecordState::Completed, None) => {
            return Err(corrupt(&fingerprint, "completed without classification"));
        }
        _ => None,
    };

    let true_label: Option<String> = row.try_get("true_label")?;
    let correction = match true_label {
        Some(label) => {
            let true_label = DiseaseLabel::from_str(&label)
                .map_err(|_| corrupt(&fingerprint, format!("unknown true label {label:?}")))?;
            let corrected_at: Option<DateTime<Utc>> = row.try_get("corrected_at")?;
            Some(Correction {
                true_label,
                corrected_at: corrected_at
                    .ok_or_else(|| corrupt(&fingerprint, "correction without timestamp"))?,
                used_for_training: row.try_get("used_for_training")?,
            })
        }
        None => None,
    };

    Ok(ResultRecord {
        fingerprint: Fingerprint::from_hex(fingerprint),
        image_key: row.try_get("image_key")?,
        state,
        diagnosis,
        error: row.try_get("error")?,
        correction,
        served_from_cache: false,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn insert_if_absent(&self, record: &ResultRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO result_records (fingerprint, image_key, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(record.fingerprint.as_str())
        .bind(&record.image_key)
        .bind(record.state.to_string())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ResultRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM result_records WHERE fingerprint = $1"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn complete(
        &self,
        fingerprint: &Fingerprint,
        diagnosis: &Diagnosis,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE result_records
            SET state = 'completed',
                classification = $2,
                confidence = $3,
                urgency = $4,
                recommendation = $5,
                inference_ms = $6,
                processing_time_ms = $7,
                error = NULL,
                updated_at = NOW()
            WHERE fingerprint = $1 AND state = 'pending'
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(diagnosis.label.to_string())
        .bind(diagnosis.confidence)
        .bind(diagnosis.urgency.to_string())
        .bind(Json(&diagnosis.recommendation))
        .bind(diagnosis.inference_ms)
        .bind(diagnosis.processing_time_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, fingerprint: &Fingerprint, error: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE result_records
            SET state = 'failed', error = $2, updated_at = NOW()
            WHERE fingerprint = $1 AND state = 'pending'
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reopen_failed(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE result_records
            SET state = 'pending', error = NULL, updated_at = NOW()
            WHERE fingerprint = $1 AND state = 'failed'
            "#,
        )
        .bind(fingerprint.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending(&self) -> Result<Vec<Fingerprint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT fingerprint
            FROM result_records
            WHERE state = 'pending'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<Fingerprint, StoreError> {
                Ok(Fingerprint::from_hex(r.try_get::<String, _>("fingerprint")?))
            })
            .collect()
    }

    async fn set_correction(
        &self,
        fingerprint: &Fingerprint,
        true_label: DiseaseLabel,
        corrected_at: DateTime<Utc>,
    ) -> Result<CorrectionWrite, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE result_records
            SET true_label = $2,
                corrected_at = $3,
                used_for_training = FALSE,
                updated_at = NOW()
            WHERE fingerprint = $1 AND state = 'completed'
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(fingerprint.as_str())
        .bind(true_label.to_string())
        .bind(corrected_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(CorrectionWrite::Applied(record_from_row(&row)?));
        }

        let exists: bool =
            sqlx::query("SELECT EXISTS (SELECT 1 FROM result_records WHERE fingerprint = $1)")
                .bind(fingerprint.as_str())
                .fetch_one(&self.pool)
                .await?
                .try_get(0)?;

        Ok(if exists {
            CorrectionWrite::NotCompleted
        } else {
            CorrectionWrite::NotFound
        })
    }

    async fn count_unused(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query(
            r#"
            SELECT COUNT(*)
            FROM result_records
            WHERE true_label IS NOT NULL AND used_for_training = FALSE
            "#,
        )
        .fetch_one(&self.pool)
        .await?
        .try_get(0)?;

        Ok(count.max(0) as u64)
    }

    async fn drain_unused(&self) -> Result<Vec<ResultRecord>, StoreError> {
        // Single statement: row locks make a concurrent drain skip rows this one claimed.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE result_records
            SET used_for_training = TRUE, updated_at = NOW()
            WHERE true_label IS NOT NULL AND used_for_training = FALSE
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut batch = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        batch.sort_by_key(|r| r.correction.as_ref().map(|c| c.corrected_at));
        Ok(batch)
    }

    async fn release(&self, fingerprints: &[Fingerprint]) -> Result<u64, StoreError> {
        let keys: Vec<String> = fingerprints.iter().map(|f| f.as_str().to_string()).collect();

        let result = sqlx::query(
            r#"
            UPDATE result_records
            SET used_for_training = FALSE, updated_at = NOW()
            WHERE fingerprint = ANY($1) AND used_for_training = TRUE
            "#,
        )
        .bind(&keys)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
