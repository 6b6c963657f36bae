//! Inference adapter.
//!
//! Owns the single serving instance of the external inference engine. The
//! instance is loaded lazily on first use; concurrent first callers wait for
//! that one load instead of starting their own. `reload` builds the
//! replacement completely before swapping it in, and classify calls that
//! already hold the previous instance finish against it.

use async_trait::async_trait;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::models::label::{Classification, DiseaseLabel};

/// Hyperparameters for a fine-tune pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneParams {
    pub epochs: u32,
    pub learning_rate: f64,
    pub batch_size: u32,
}

impl Default for FineTuneParams {
    fn default() -> Self {
        Self {
            epochs: 3,
            learning_rate: 1e-5,
            batch_size: 8,
        }
    }
}

/// Signal reported by the engine after fine-tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneMetrics {
    pub accuracy: f64,
    pub loss: f64,
}

/// One corrected image handed to the engine for fine-tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub image_path: PathBuf,
    pub label: DiseaseLabel,
}

/// Entry point of the external inference engine.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Build a model instance from a weights file.
    async fn load(&self, weights: &Path) -> Result<Arc<dyn LoadedModel>, InferenceError>;
}

/// A model instance produced by [`InferenceEngine::load`].
#[async_trait]
pub trait LoadedModel: Send + Sync {
    /// Probabilities over [`DiseaseLabel::COUNT`] labels, in label order.
    async fn classify(&self, image: &Path) -> Result<Vec<f64>, InferenceError>;

    async fn fine_tune(
        &self,
        batch: &[TrainingExample],
        params: &FineTuneParams,
    ) -> Result<FineTuneMetrics, InferenceError>;

    /// Write the instance's current weights to `dest`.
    async fn save(&self, dest: &Path) -> Result<(), InferenceError>;
}

/// Pick the most probable label from an engine output vector.
pub fn top_label(probabilities: &[f64]) -> Result<(DiseaseLabel, f64), InferenceError> {
    if probabilities.len() != DiseaseLabel::COUNT {
        return Err(InferenceError::InvalidOutput(format!(
            "expected {} probabilities, got {}",
            DiseaseLabel::COUNT,
            probabilities.len()
        )));
    }

    let (index, confidence) = probabilities
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, p)| p.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .ok_or_else(|| InferenceError::InvalidOutput("no finite probabilities".to_string()))?;

    let label = DiseaseLabel::from_index(index)
        .ok_or_else(|| InferenceError::InvalidOutput(format!("label index {index}")))?;
    Ok((label, confidence))
}

pub struct InferenceAdapter {
    engine: Arc<dyn InferenceEngine>,
    weights: PathBuf,
    model: RwLock<Option<Arc<dyn LoadedModel>>>,
}

impl InferenceAdapter {
    /// `weights` is the active weights file; its content may change between reloads.
    pub fn new(engine: Arc<dyn InferenceEngine>, weights: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            weights: weights.into(),
            model: RwLock::new(None),
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.model.read().await.is_some()
    }

    /// The serving instance, loading it on first use.
    async fn instance(&self) -> Result<Arc<dyn LoadedModel>, InferenceError> {
        if let Some(model) = self.model.read().await.as_ref() {
            return Ok(Arc::clone(model));
        }

        let mut slot = self.model.write().await;
        // Another caller may have finished loading while we waited for the lock.
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }

        let started = Instant::now();
        let model = self.engine.load(&self.weights).await?;
        tracing::info!(
            weights = %self.weights.display(),
            load_ms = started.elapsed().as_millis() as u64,
            "Model loaded"
        );
        *slot = Some(Arc::clone(&model));
        Ok(model)
    }

    pub async fn classify(&self, image: &Path) -> Result<Classification, InferenceError> {
        let model = self.instance().await?;

        let started = Instant::now();
        let probabilities = model.classify(image).await?;
        let latency = started.elapsed();

        let (label, confidence) = top_label(&probabilities)?;
        let classification = Classification {
            label,
            confidence,
            latency,
        };
        classification
            .validate()
            .map_err(|report| InferenceError::InvalidOutput(report.to_string()))?;

        tracing::debug!(
            image = %image.display(),
            label = %label,
            confidence,
            latency_ms = latency.as_millis() as u64,
            "Classified image"
        );
        Ok(classification)
    }

    /// Load the active weights into a fresh instance and make it the serving one.
    pub async fn reload(&self) -> Result<(), InferenceError> {
        let fresh = self.engine.load(&self.weights).await?;
        let previous = self.model.write().await.replace(fresh);
        tracing::info!(
            weights = %self.weights.display(),
            replaced = previous.is_some(),
            "Model reloaded"
        );
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request to inference engine failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference engine error: {0}")]
    Engine(String),

    #[error("Invalid inference output: {0}")]
    InvalidOutput(String),

    #[error("Inference attempt timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Engine whose instances report the generation they were loaded in.
    struct CountingEngine {
        loads: AtomicUsize,
        load_delay: Duration,
        gate: Option<Arc<Notify>>,
    }

    struct GenerationModel {
        generation: usize,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl InferenceEngine for CountingEngine {
        async fn load(&self, _weights: &Path) -> Result<Arc<dyn LoadedModel>, InferenceError> {
            tokio::time::sleep(self.load_delay).await;
            let generation = self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(GenerationModel {
                generation,
                gate: self.gate.clone(),
            }))
        }
    }

    #[async_trait]
    impl LoadedModel for GenerationModel {
        async fn classify(&self, _image: &Path) -> Result<Vec<f64>, InferenceError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let mut probabilities = vec![0.0; DiseaseLabel::COUNT];
            probabilities[self.generation % DiseaseLabel::COUNT] = 0.9;
            Ok(probabilities)
        }

        async fn fine_tune(
            &self,
            _batch: &[TrainingExample],
            _params: &FineTuneParams,
        ) -> Result<FineTuneMetrics, InferenceError> {
            unreachable!("not used by adapter tests")
        }

        async fn save(&self, _dest: &Path) -> Result<(), InferenceError> {
            Ok(())
        }
    }

    fn engine(load_delay: Duration, gate: Option<Arc<Notify>>) -> Arc<CountingEngine> {
        Arc::new(CountingEngine {
            loads: AtomicUsize::new(0),
            load_delay,
            gate,
        })
    }

    #[test]
    fn test_top_label_picks_argmax() {
        let (label, confidence) = top_label(&[0.05, 0.02, 0.03, 0.87, 0.03]).unwrap();
        assert_eq!(label, DiseaseLabel::Tuberculosis);
        assert_eq!(confidence, 0.87);
    }

    #[test]
    fn test_top_label_rejects_wrong_arity() {
        assert!(matches!(
            top_label(&[0.5, 0.5]),
            Err(InferenceError::InvalidOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_first_use_loads_once() {
        let engine = engine(Duration::from_millis(30), None);
        let adapter = Arc::new(InferenceAdapter::new(engine.clone(), "active.weights"));

        let calls = (0..8).map(|_| {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.classify(Path::new("x.png")).await })
        });
        for call in futures::future::join_all(calls).await {
            assert_eq!(call.unwrap().unwrap().label, DiseaseLabel::BacterialPneumonia);
        }

        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
        assert!(adapter.is_loaded().await);
    }

    #[tokio::test]
    async fn test_in_flight_classify_finishes_on_old_instance() {
        let gate = Arc::new(Notify::new());
        let engine = engine(Duration::ZERO, Some(Arc::clone(&gate)));
        let adapter = Arc::new(InferenceAdapter::new(engine.clone(), "active.weights"));

        let in_flight = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.classify(Path::new("x.png")).await })
        };
        // Let the classify call pick up generation 0 and park on the gate.
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), adapter.reload())
            .await
            .expect("reload must not wait for in-flight classify")
            .unwrap();

        gate.notify_one();
        let old = in_flight.await.unwrap().unwrap();
        assert_eq!(old.label, DiseaseLabel::from_index(0).unwrap());

        gate.notify_one();
        let new = adapter.classify(Path::new("x.png")).await.unwrap();
        assert_eq!(new.label, DiseaseLabel::from_index(1).unwrap());
        assert_eq!(engine.loads.load(Ordering::SeqCst), 2);
    }
}
