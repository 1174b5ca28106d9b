use axum::serve;
use dotenvy::dotenv;
use local_link_shortener::routes::{create_router, shared_registry, SharedRegistry};
use local_link_shortener::utils::{blocking, get_env, get_env_or};
use local_link_shortener::{FileStore, SystemClock};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_TRACING_LEVEL: &str = "local_link_shortener=debug,tower_http=debug";
const DEFAULT_STORAGE_DIR: &str = "data";
const SWEEP_JOB_CRON_EXPRESSION: &str = "1/60 * * * * *";

#[tokio::main]
async fn main() {
    _ = dotenv();
    let server_address = get_env("SERVER_ADDRESS");
    let base_url = get_env("BASE_URL");
    let storage_dir = get_env_or("STORAGE_DIR", DEFAULT_STORAGE_DIR);
    configure_tracing();
    let registry = create_registry(&storage_dir, &base_url);
    sweep_expired(registry.clone()).await;
    configure_scheduler(registry.clone()).await;
    let listener = create_listener(&server_address).await;
    let router = create_router(registry);
    serve(listener, router)
        .await
        .expect("Server failed to start");
}

fn configure_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or(DEFAULT_TRACING_LEVEL.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn create_registry(storage_dir: &str, base_url: &str) -> SharedRegistry {
    let store = FileStore::new(storage_dir).expect("Opening link storage failed");
    tracing::info!("Storing links in {}", storage_dir);
    shared_registry(Arc::new(store), Arc::new(SystemClock), base_url)
}

async fn sweep_expired(registry: SharedRegistry) {
    match blocking(move || registry.sweep_expired()).await {
        Ok(Ok(removed)) => tracing::debug!("Sweep finished, {} links removed", removed),
        Ok(Err(err)) => tracing::error!("Sweeping expired links failed: {}", err),
        Err((_, err)) => tracing::error!("Sweep task failed: {}", err),
    }
}

async fn configure_scheduler(registry: SharedRegistry) {
    let scheduler = JobScheduler::new()
        .await
        .expect("Creating scheduler failed");
    scheduler
        .add(create_sweep_job(SWEEP_JOB_CRON_EXPRESSION, registry))
        .await
        .expect("Adding sweep job to scheduler failed");
    scheduler.start().await.expect("Starting scheduler failed");
}

fn create_sweep_job(cron_expression: &str, registry: SharedRegistry) -> Job {
    Job::new_async(cron_expression, move |_, _| {
        let registry = registry.clone();
        Box::pin(async move { sweep_expired(registry).await })
    })
    .expect("Creating sweep job failed")
}

async fn create_listener(server_address: &str) -> TcpListener {
    let listener = TcpListener::bind(&server_address)
        .await
        .expect("Creating tcp listener failed");
    tracing::info!("Listening on address: {}", server_address);
    listener
}
