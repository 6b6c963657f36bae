use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::services::inference::{
    FineTuneMetrics, FineTuneParams, InferenceEngine, InferenceError, LoadedModel, TrainingExample,
};

/// Client for the model-serving process that hosts the X-ray classifier.
///
/// The engine shares a filesystem with this service: images and weights are
/// passed by path, never uploaded.
pub struct HttpInferenceEngine {
    http: Client,
    base_url: String,
}

/// Handle to a model instance living inside the serving process.
pub struct HttpModel {
    http: Client,
    base_url: String,
    model_id: String,
}

#[derive(Serialize)]
struct LoadRequest<'a> {
    weights_path: &'a Path,
}

#[derive(Deserialize)]
struct LoadResponse {
    model_id: String,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    image_path: &'a Path,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    probabilities: Vec<f64>,
}

#[derive(Serialize)]
struct FineTuneRequest<'a> {
    examples: &'a [TrainingExample],
    epochs: u32,
    learning_rate: f64,
    batch_size: u32,
}

#[derive(Serialize)]
struct SaveRequest<'a> {
    path: &'a Path,
}

#[derive(Deserialize)]
struct EngineErrorBody {
    error: String,
}

impl HttpInferenceEngine {
    pub fn new(base_url: impl Into<String>) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

/// Turn a non-2xx engine reply into an engine error, keeping its message.
async fn check(response: Response) -> Result<Response, InferenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<EngineErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    Err(InferenceError::Engine(format!("{status}: {message}")))
}

#[async_trait]
impl InferenceEngine for HttpInferenceEngine {
    async fn load(&self, weights: &Path) -> Result<Arc<dyn LoadedModel>, InferenceError> {
        let response = self
            .http
            .post(format!("{}/v1/models", self.base_url))
            .json(&LoadRequest {
                weights_path: weights,
            })
            .send()
            .await?;

        let loaded: LoadResponse = check(response).await?.json().await?;
        tracing::debug!(model_id = %loaded.model_id, weights = %weights.display(), "Engine loaded model");

        Ok(Arc::new(HttpModel {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            model_id: loaded.model_id,
        }))
    }
}

impl HttpModel {
    fn url(&self, action: &str) -> String {
        format!("{}/v1/models/{}/{}", self.base_url, self.model_id, action)
    }
}

/// Dropping the handle releases the engine-side instance. Nothing waits for
/// the release, and a failure only leaves an idle instance behind.
impl Drop for HttpModel {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let model_id = std::mem::take(&mut self.model_id);
        let request = self
            .http
            .delete(format!("{}/v1/models/{}", self.base_url, model_id));

        runtime.spawn(async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => tracing::debug!(model_id = %model_id, "Engine released model"),
                Err(e) => tracing::warn!(
                    model_id = %model_id,
                    error = %e,
                    "Failed to release engine model"
                ),
            }
        });
    }
}

#[async_trait]
impl LoadedModel for HttpModel {
    async fn classify(&self, image: &Path) -> Result<Vec<f64>, InferenceError> {
        let response = self
            .http
            .post(self.url("classify"))
            .json(&ClassifyRequest { image_path: image })
            .send()
            .await?;

        let body: ClassifyResponse = check(response).await?.json().await?;
        Ok(body.probabilities)
    }

    async fn fine_tune(
        &self,
        batch: &[TrainingExample],
        params: &FineTuneParams,
    ) -> Result<FineTuneMetrics, InferenceError> {
        let response = self
            .http
            .post(self.url("fine_tune"))
            .json(&FineTuneRequest {
                examples: batch,
                epochs: params.epochs,
                learning_rate: params.learning_rate,
                batch_size: params.batch_size.min(batch.len().max(1) as u32),
            })
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }

    async fn save(&self, dest: &Path) -> Result<(), InferenceError> {
        let response = self
            .http
            .post(self.url("save"))
            .json(&SaveRequest { path: dest })
            .send()
            .await?;

        check(response).await?;
        Ok(())
    }
}
