//! Chest X-ray triage core
//!
//! Deduplicates submitted X-ray images by content fingerprint, runs inference
//! on a retrying worker pool backed by an external inference engine, and
//! feeds user corrections back into periodic fine-tuning with versioned,
//! rollback-safe model artifacts.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
