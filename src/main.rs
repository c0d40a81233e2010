use dotenv::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod db;
mod due;
mod engine;
mod error;
mod executor;
mod naming;
mod policy;
mod prune;
mod queue;
mod scheduler;
mod storage;
mod store;

use crate::api::AppState;
use crate::engine::CommandEngineAdapter;
use crate::executor::{Executor, ExecutorConfig};
use crate::queue::SqliteQueue;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::AppConfig::from_env();

    let pool = db::init_db(&config.state_db_url)
        .await
        .expect("failed to initialize state database");
    info!("state database ready at {}", config.state_db_url);

    let storage = storage::create_artifact_store(&config.storage)
        .await
        .expect("failed to initialize artifact storage");

    let queue: Arc<dyn queue::JobQueue> =
        Arc::new(SqliteQueue::new(pool.clone(), config.visibility_timeout));

    let scheduler = Arc::new(Scheduler::new(pool.clone(), queue.clone(), config.enqueue_retries));
    tokio::spawn(scheduler::run(scheduler, config.tick_interval));
    info!("scheduler running every {:?}", config.tick_interval);

    let exec = Arc::new(Executor::new(
        pool.clone(),
        queue.clone(),
        storage,
        Arc::new(CommandEngineAdapter),
        ExecutorConfig {
            max_delivery_attempts: config.max_delivery_attempts,
            job_timeout: config.job_timeout,
            compress: config.compress,
        },
    ));
    executor::spawn_workers(exec, config.worker_count);
    info!("{} backup workers running", config.worker_count);

    tokio::spawn(executor::run_watchdog(
        pool.clone(),
        config.watchdog_interval,
        config.watchdog_stuck_after,
    ));

    let state = Arc::new(AppState { pool, queue });
    let app = api::router(state);

    info!("http surface listening on {}", config.http_bind);
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .expect("failed to bind http listener");
    axum::serve(listener, app).await.expect("http server failed");
}
