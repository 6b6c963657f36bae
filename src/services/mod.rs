pub mod artifacts;
pub mod cache;
pub mod encryption;
pub mod engine_client;
pub mod feedback;
pub mod inference;
pub mod orchestrator;
pub mod recommendations;
pub mod retrain;
pub mod storage;
pub mod triage;
