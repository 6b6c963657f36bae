use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use xray_triage::{app_state::AppState, config::AppConfig, routes};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing xray-triage service");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "triage_cache_hits_total",
        "Submissions answered from a previous result"
    );
    metrics::describe_counter!(
        "triage_cache_misses_total",
        "Submissions that required inference"
    );
    metrics::describe_counter!("inference_attempts_total", "Inference attempts started");
    metrics::describe_counter!(
        "inference_tasks_completed",
        "Inference tasks that produced a diagnosis"
    );
    metrics::describe_counter!(
        "inference_tasks_failed",
        "Inference tasks that exhausted their attempts"
    );
    metrics::describe_histogram!(
        "inference_processing_seconds",
        "Wall time of a successful inference attempt"
    );
    metrics::describe_gauge!(
        "inference_queue_depth",
        "Tasks waiting to run, including those backing off"
    );
    metrics::describe_counter!(
        "feedback_corrections_total",
        "Corrections recorded, by true label"
    );
    metrics::describe_counter!("retrain_runs_total", "Retrain runs, by outcome status");

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize application state");

    // Pick up work a previous process left pending
    let recovered = state
        .orchestrator
        .recover()
        .await
        .expect("Failed to resubmit pending records");
    tracing::info!(recovered, "Pending work recovered");

    let orchestrator = tokio::spawn(Arc::clone(&state.orchestrator).run());
    let scheduler = Arc::clone(&state.retrain).spawn_scheduler(config.retrain_interval());

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/retrain", post(routes::retrain::trigger_retrain))
        .with_state(state.clone())
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Shutting down, letting in-flight inference finish");
    scheduler.abort();
    state.orchestrator.shutdown();
    if let Err(e) = orchestrator.await {
        tracing::error!(error = %e, "Orchestrator task ended abnormally");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
