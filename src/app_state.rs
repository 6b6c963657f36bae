use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::{self, memory::InMemoryResultStore, queries::PgResultStore, ResultStore};
use crate::services::{
    artifacts::{ArtifactError, ArtifactStore},
    cache::FingerprintCache,
    encryption::{CipherError, ImageCipher},
    engine_client::HttpInferenceEngine,
    feedback::FeedbackAccumulator,
    inference::{InferenceAdapter, InferenceEngine, InferenceError},
    orchestrator::{OrchestratorConfig, TaskOrchestrator},
    retrain::{RetrainConfig, RetrainPipeline},
    storage::{ImageStore, LocalImageStore, R2ImageStore, StorageError},
    triage::TriageService,
};

/// Shared application state: every core component, wired once.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ResultStore>,
    pub images: Arc<dyn ImageStore>,
    pub cache: Arc<FingerprintCache>,
    pub adapter: Arc<InferenceAdapter>,
    pub orchestrator: Arc<TaskOrchestrator>,
    pub triage: Arc<TriageService>,
    pub feedback: Arc<FeedbackAccumulator>,
    pub artifacts: Arc<ArtifactStore>,
    pub retrain: Arc<RetrainPipeline>,
}

/// Collaborators behind the core, chosen by configuration or by a test.
pub struct Collaborators {
    pub store: Arc<dyn ResultStore>,
    pub images: Arc<dyn ImageStore>,
    pub engine: Arc<dyn InferenceEngine>,
    pub artifacts: Arc<ArtifactStore>,
    pub corpus_dir: PathBuf,
}

impl AppState {
    /// Wire the core around the given collaborators.
    pub fn assemble(
        parts: Collaborators,
        orchestrator: OrchestratorConfig,
        retrain: RetrainConfig,
    ) -> Self {
        let Collaborators {
            store,
            images,
            engine,
            artifacts,
            corpus_dir,
        } = parts;

        let cache = Arc::new(FingerprintCache::new(Arc::clone(&store)));
        let adapter = Arc::new(InferenceAdapter::new(
            Arc::clone(&engine),
            artifacts.active_path(),
        ));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            Arc::clone(&cache),
            Arc::clone(&images),
            Arc::clone(&adapter),
            orchestrator,
        ));
        let triage = Arc::new(TriageService::new(
            Arc::clone(&cache),
            Arc::clone(&images),
            Arc::clone(&orchestrator),
        ));
        let feedback = Arc::new(FeedbackAccumulator::new(
            Arc::clone(&store),
            Arc::clone(&images),
            corpus_dir,
        ));
        let retrain = Arc::new(RetrainPipeline::new(
            Arc::clone(&feedback),
            Arc::clone(&images),
            engine,
            Arc::clone(&artifacts),
            Arc::clone(&adapter),
            retrain,
        ));

        Self {
            store,
            images,
            cache,
            adapter,
            orchestrator,
            triage,
            feedback,
            artifacts,
            retrain,
        }
    }

    /// Build production collaborators from configuration.
    pub async fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let store: Arc<dyn ResultStore> = match &config.database_url {
            Some(url) => {
                tracing::info!("Connecting to PostgreSQL database");
                let pool = db::init_pool(url).await?;
                tracing::info!("Running database migrations");
                db::run_migrations(&pool).await?;
                Arc::new(PgResultStore::new(pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, results are kept in memory only");
                Arc::new(InMemoryResultStore::new())
            }
        };

        let images: Arc<dyn ImageStore> = match config.r2() {
            Some(r2) => {
                let cipher = config
                    .encryption_key
                    .as_deref()
                    .map(ImageCipher::from_base64_key)
                    .transpose()?;
                tracing::info!(bucket = %r2.bucket, sealed = cipher.is_some(), "Using R2 image store");
                Arc::new(R2ImageStore::new(
                    &r2.bucket,
                    &r2.endpoint,
                    &r2.access_key,
                    &r2.secret_key,
                    cipher,
                    &config.staging_dir,
                )?)
            }
            None => {
                tracing::info!(root = %config.image_dir.display(), "Using local image store");
                Arc::new(LocalImageStore::new(&config.image_dir))
            }
        };

        let engine: Arc<dyn InferenceEngine> =
            Arc::new(HttpInferenceEngine::new(&config.inference_url)?);
        let artifacts = Arc::new(ArtifactStore::open(&config.model_dir).await?);

        Ok(Self::assemble(
            Collaborators {
                store,
                images,
                engine,
                artifacts,
                corpus_dir: config.corpus_dir.clone(),
            },
            config.orchestrator(),
            config.retrain(),
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Database setup failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Image store setup failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid encryption key: {0}")]
    Cipher(#[from] CipherError),

    #[error("Inference engine client setup failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Model artifact store setup failed: {0}")]
    Artifact(#[from] ArtifactError),
}
