use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::artifact::{RetrainOutcome, RetrainStatus, RetrainTrigger};

/// POST /retrain: run a manual retrain in this process and return its outcome.
///
/// Runs here rather than in a separate process so the serving adapter is the
/// one reloaded on commit, and the single-run guard covers both triggers.
pub async fn trigger_retrain(
    State(state): State<AppState>,
) -> (StatusCode, Json<RetrainOutcome>) {
    let unused = state.feedback.count_unused().await.unwrap_or_default();
    tracing::info!(
        unused = unused,
        "Manual retrain requested"
    );
    let outcome = state.retrain.run(RetrainTrigger::Manual).await;

    let status = match outcome.status {
        RetrainStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
        RetrainStatus::Success | RetrainStatus::Skipped => StatusCode::OK,
    };
    (status, Json(outcome))
}
