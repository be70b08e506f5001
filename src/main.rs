use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::MissedTickBehavior};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    extractor::extractor_for,
    file_service::{FileService, ServiceOptions},
    metadata_store::SqliteMetadataStore,
    object_store::DiskObjectStore,
};

const SESSION_SWEEP_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-gateway with config: {:?}", cfg);

    // --- Ensure storage and scratch directories exist ---
    for dir in [&cfg.storage_dir, &cfg.scratch_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir))?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let in_memory = db_path.starts_with(":memory:");
    if !in_memory {
        // Create parent directory if needed
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }

        // SQLite will not create the file itself without `mode=rwc`
        match fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(db_path)
        {
            Ok(_) => tracing::debug!("Database file can be created/opened."),
            Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
        }
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );
    let metadata = Arc::new(SqliteMetadataStore::new(db.clone()));

    // --- Handle migration mode ---
    if migrate {
        metadata.migrate().await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let objects = Arc::new(DiskObjectStore::new(&cfg.storage_dir));
    let extractor = extractor_for(cfg.seven_zip, &cfg.seven_zip_bin);
    tracing::info!(seven_zip = extractor.name(), "7z extraction backend selected");
    let service = FileService::new(
        objects,
        metadata,
        extractor,
        ServiceOptions {
            scratch_dir: cfg.scratch_dir.clone().into(),
            public_base_url: cfg.public_base_url.clone(),
            max_path_depth: cfg.max_path_depth,
        },
    );

    // --- Expire abandoned chunked uploads ---
    if cfg.session_idle_secs > 0 {
        let max_idle = Duration::from_secs(cfg.session_idle_secs);
        let sweeper = service.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_idle.min(SESSION_SWEEP_EVERY));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = sweeper.sweep_idle_sessions(max_idle).await;
                if swept > 0 {
                    tracing::info!(swept, "expired idle upload sessions");
                }
            }
        });
    }

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_body_bytes).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
