use std::sync::Arc;

use tokio::sync::watch;

use volley_backend::api::{self, AppState};
use volley_backend::config::Config;
use volley_backend::metrics;
use volley_backend::notify::BroadcastSink;
use volley_backend::progression::RoundProgression;
use volley_backend::scoring::spawn_scoring_worker;
use volley_backend::store::Database;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    metrics::register_metrics();

    let config = Config::load();

    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    let sink = Arc::new(BroadcastSink::new(256));
    let progression = Arc::new(RoundProgression::new(db.clone(), sink.clone()));

    // Single consumer worker: serializes all scoring mutations
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (scoring, worker) = spawn_scoring_worker(
        db.clone(),
        sink.clone(),
        config.scoring_queue_capacity,
        shutdown_rx,
    );

    let state = AppState {
        db,
        progression,
        scoring,
        sink,
    };
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("volley backend listening on port {}", config.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .expect("Failed to start server");

    // Let the worker drain queued scoring events before exiting
    let _ = shutdown_tx.send(true);
    let _ = worker.await;
}
