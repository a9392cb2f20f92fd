mod db;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use crate::db::{PgRepository, Repository};
use crate::services::checkpoint::CheckpointLimits;
use crate::services::persistence::{CheckpointQueueConfig, spawn_checkpoint_worker};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");
    let repo: Arc<dyn Repository> = Arc::new(PgRepository::new(pool));

    // Background checkpoint worker behind the 202 write path.
    let checkpoint_tx = spawn_checkpoint_worker(Arc::clone(&repo), CheckpointQueueConfig::from_env());
    let state = state::AppState::new(repo, CheckpointLimits::from_env()).with_checkpoint_queue(checkpoint_tx);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "sessionboard relay listening");
    axum::serve(listener, app).await.expect("server failed");
}
