//! Test helpers: a scriptable inference engine and a harness wiring the real
//! core over the in-memory store and temporary directories.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use xray_triage::{
    app_state::{AppState, Collaborators},
    db::memory::InMemoryResultStore,
    models::{
        label::DiseaseLabel,
        record::Fingerprint,
        task::{TaskId, TaskPoll},
    },
    services::{
        artifacts::ArtifactStore,
        inference::{
            FineTuneMetrics, FineTuneParams, InferenceEngine, InferenceError, LoadedModel,
            TrainingExample,
        },
        orchestrator::{OrchestratorConfig, RetryPolicy},
        retrain::RetrainConfig,
        storage::LocalImageStore,
        triage::Submission,
    },
};

/// Engine output for "Tuberculosis, 0.87".
pub const TUBERCULOSIS_87: [f64; 5] = [0.05, 0.02, 0.03, 0.87, 0.03];

pub const INITIAL_WEIGHTS: &[u8] = b"initial weights";
pub const RETRAINED_WEIGHTS: &[u8] = b"retrained weights";

/// How the next fine-tune call behaves.
#[derive(Debug, Clone)]
pub enum FineTuneScript {
    Succeed(FineTuneMetrics),
    Fail(String),
}

/// Inference engine whose behaviour tests set up front.
pub struct ScriptedEngine {
    probabilities: Mutex<Vec<f64>>,
    classify_delay: Mutex<Duration>,
    /// Classify calls that fail before answers start coming back.
    failures_left: AtomicUsize,
    /// Classify calls that stall far past any attempt timeout.
    stalls_left: AtomicUsize,
    fine_tune: Mutex<FineTuneScript>,
    fine_tune_delay: Mutex<Duration>,
    saved_weights: Mutex<Vec<u8>>,
    fail_save: AtomicBool,
    /// Weights the engine refuses to load.
    refused_weights: Mutex<Option<Vec<u8>>>,

    pub loads: AtomicUsize,
    pub classify_calls: AtomicUsize,
    pub fine_tune_calls: AtomicUsize,
    pub last_batch: Mutex<Vec<TrainingExample>>,
    pub loaded_weights: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            probabilities: Mutex::new(TUBERCULOSIS_87.to_vec()),
            classify_delay: Mutex::new(Duration::ZERO),
            failures_left: AtomicUsize::new(0),
            stalls_left: AtomicUsize::new(0),
            fine_tune: Mutex::new(FineTuneScript::Succeed(FineTuneMetrics {
                accuracy: 0.92,
                loss: 0.21,
            })),
            fine_tune_delay: Mutex::new(Duration::ZERO),
            saved_weights: Mutex::new(RETRAINED_WEIGHTS.to_vec()),
            fail_save: AtomicBool::new(false),
            refused_weights: Mutex::new(None),
            loads: AtomicUsize::new(0),
            classify_calls: AtomicUsize::new(0),
            fine_tune_calls: AtomicUsize::new(0),
            last_batch: Mutex::new(Vec::new()),
            loaded_weights: Mutex::new(Vec::new()),
        })
    }

    pub fn answer(&self, probabilities: &[f64]) {
        *self.probabilities.lock().unwrap() = probabilities.to_vec();
    }

    pub fn delay_classify(&self, delay: Duration) {
        *self.classify_delay.lock().unwrap() = delay;
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn stall_next(&self, n: usize) {
        self.stalls_left.store(n, Ordering::SeqCst);
    }

    pub fn script_fine_tune(&self, script: FineTuneScript) {
        *self.fine_tune.lock().unwrap() = script;
    }

    pub fn delay_fine_tune(&self, delay: Duration) {
        *self.fine_tune_delay.lock().unwrap() = delay;
    }

    pub fn fail_save(&self) {
        self.fail_save.store(true, Ordering::SeqCst);
    }

    pub fn refuse_to_load(&self, weights: &[u8]) {
        *self.refused_weights.lock().unwrap() = Some(weights.to_vec());
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct ScriptedModel {
    engine: Arc<ScriptedEngine>,
}

/// `InferenceEngine` is implemented on a handle so models can point back at the script.
pub struct EngineHandle(pub Arc<ScriptedEngine>);

#[async_trait]
impl InferenceEngine for EngineHandle {
    async fn load(&self, weights: &Path) -> Result<Arc<dyn LoadedModel>, InferenceError> {
        let bytes = tokio::fs::read(weights)
            .await
            .map_err(|e| InferenceError::Engine(format!("cannot read weights: {e}")))?;
        if self.0.refused_weights.lock().unwrap().as_deref() == Some(bytes.as_slice()) {
            return Err(InferenceError::Engine("incompatible weights".to_string()));
        }
        self.0.loaded_weights.lock().unwrap().push(bytes);
        self.0.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedModel {
            engine: Arc::clone(&self.0),
        }))
    }
}

#[async_trait]
impl LoadedModel for ScriptedModel {
    async fn classify(&self, _image: &Path) -> Result<Vec<f64>, InferenceError> {
        let engine = &self.engine;
        engine.classify_calls.fetch_add(1, Ordering::SeqCst);

        if ScriptedEngine::take(&engine.stalls_left) {
            sleep(Duration::from_secs(3600)).await;
        }
        if ScriptedEngine::take(&engine.failures_left) {
            return Err(InferenceError::Engine("CUDA out of memory".to_string()));
        }

        let delay = *engine.classify_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let probabilities = engine.probabilities.lock().unwrap().clone();
        Ok(probabilities)
    }

    async fn fine_tune(
        &self,
        batch: &[TrainingExample],
        _params: &FineTuneParams,
    ) -> Result<FineTuneMetrics, InferenceError> {
        let engine = &self.engine;
        engine.fine_tune_calls.fetch_add(1, Ordering::SeqCst);
        *engine.last_batch.lock().unwrap() = batch.to_vec();

        let delay = *engine.fine_tune_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let script = engine.fine_tune.lock().unwrap().clone();
        match script {
            FineTuneScript::Succeed(metrics) => Ok(metrics),
            FineTuneScript::Fail(message) => Err(InferenceError::Engine(message)),
        }
    }

    async fn save(&self, dest: &Path) -> Result<(), InferenceError> {
        if self.engine.fail_save.load(Ordering::SeqCst) {
            return Err(InferenceError::Engine("disk full".to_string()));
        }
        let bytes = self.engine.saved_weights.lock().unwrap().clone();
        tokio::fs::write(dest, bytes)
            .await
            .map_err(|e| InferenceError::Engine(format!("cannot save weights: {e}")))
    }
}

/// Short backoff so retry tests finish quickly.
pub fn fast_orchestrator() -> OrchestratorConfig {
    OrchestratorConfig {
        worker_pool_size: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
        attempt_timeout: Duration::from_secs(2),
        task_retention: Duration::from_secs(3600),
    }
}

/// The core wired over an in-memory store, a local image store and a
/// temporary artifact directory.
pub struct Harness {
    pub state: AppState,
    pub engine: Arc<ScriptedEngine>,
    pub store: Arc<InMemoryResultStore>,
    pub media: TempDir,
    pub models: TempDir,
    pub corpus: TempDir,
    runner: Option<JoinHandle<()>>,
}

impl Harness {
    pub async fn new(orchestrator: OrchestratorConfig, retrain: RetrainConfig) -> Self {
        let engine = ScriptedEngine::new();
        let media = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        let corpus = tempfile::tempdir().unwrap();

        std::fs::write(models.path().join("active.weights"), INITIAL_WEIGHTS).unwrap();
        let artifacts = Arc::new(ArtifactStore::open(models.path()).await.unwrap());
        let store = Arc::new(InMemoryResultStore::new());

        let state = AppState::assemble(
            Collaborators {
                store: store.clone(),
                images: Arc::new(LocalImageStore::new(media.path())),
                engine: Arc::new(EngineHandle(Arc::clone(&engine))),
                artifacts,
                corpus_dir: corpus.path().to_path_buf(),
            },
            orchestrator,
            retrain,
        );

        Self {
            state,
            engine,
            store,
            media,
            models,
            corpus,
            runner: None,
        }
    }

    /// Harness with the dispatch loop already running.
    pub async fn started(orchestrator: OrchestratorConfig, retrain: RetrainConfig) -> Self {
        let mut harness = Self::new(orchestrator, retrain).await;
        harness.start();
        harness
    }

    pub fn start(&mut self) {
        let orchestrator = Arc::clone(&self.state.orchestrator);
        self.runner = Some(tokio::spawn(orchestrator.run()));
    }

    pub fn active_weights(&self) -> Vec<u8> {
        std::fs::read(self.state.artifacts.active_path()).unwrap()
    }

    /// Ingest `bytes` and wait for its task to finish.
    pub async fn diagnose(&self, bytes: &[u8]) -> TaskPoll {
        match self.state.triage.ingest(bytes).await.unwrap() {
            Submission::Queued { task_id, .. } => wait_for_terminal(self, task_id).await,
            Submission::Cached { record } => TaskPoll::Completed { record },
        }
    }

    /// A completed record carrying an unused correction.
    pub async fn corrected(&self, bytes: &[u8], label: DiseaseLabel) -> Fingerprint {
        let poll = self.diagnose(bytes).await;
        assert!(matches!(poll, TaskPoll::Completed { .. }), "{poll:?}");
        let fingerprint = Fingerprint::of(bytes);
        self.state
            .feedback
            .record_correction(&fingerprint, label)
            .await
            .unwrap();
        fingerprint
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.state.orchestrator.shutdown();
        if let Some(runner) = self.runner.take() {
            runner.abort();
        }
    }
}

/// Fake X-ray bytes: a PNG signature followed by a distinguishing payload.
pub fn xray(seed: &str) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    bytes.extend_from_slice(seed.as_bytes());
    bytes
}

/// Poll a task until it reaches a terminal state (with timeout)
pub async fn wait_for_terminal(harness: &Harness, task_id: TaskId) -> TaskPoll {
    poll_task(harness, task_id, Duration::from_secs(10)).await
}

pub async fn poll_task(harness: &Harness, task_id: TaskId, timeout: Duration) -> TaskPoll {
    let max_polls = timeout.as_millis() / 10;

    for _ in 0..max_polls {
        let poll = harness.state.triage.poll(task_id).await.unwrap();
        if poll.is_terminal() {
            return poll;
        }
        sleep(Duration::from_millis(10)).await;
    }

    panic!("Task {task_id} did not finish within {timeout:?}");
}
