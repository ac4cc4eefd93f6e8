// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Embedding Cache Service CLI
//!
//! # Usage
//!
//! ```bash
//! # Run with default settings (spawns the DCP and one worker)
//! embedcache --data-dir ./data --model sentence-transformers/distiluse
//!
//! # Four workers, RocksDB-backed index
//! embedcache --model my-model --db-type leveldb --workers 4
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use embedcache::config::{Config, DbType};
use embedcache::supervisor::Role;
use embedcache::{Catalog, DatabaseCommitProcess};
use std::sync::Arc;

const MODELS_CFG_FILENAME: &str = "models.txt";
const WORKER_SET_TIMEOUT_SECS: u64 = 20;

#[derive(Parser, Debug)]
#[command(name = "embedcache")]
#[command(about = "Embedding cache service: caches per-document, per-model embedding vectors")]
struct Args {
    /// Internal: which role this process instance should take on. Not set
    /// by an end user; the supervisor passes it when re-execing itself.
    #[arg(long, value_enum, default_value = "supervisor", hide = true)]
    role: Role,

    /// Path to data files (index & cache) per model.
    #[arg(short, long, default_value = "data")]
    data_dir: std::path::PathBuf,

    /// Bind host for the HTTP server.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port for the HTTP server.
    #[arg(short, long, default_value_t = 8009)]
    port: u16,

    /// Log level for the entire application.
    #[arg(short, long, default_value = "info")]
    #[arg(value_parser = ["debug", "info", "warning", "error", "critical"])]
    log_level: String,

    /// Default model name used when a request omits `model_name`.
    #[arg(short, long, default_value = "sentence-transformers/distiluse-base-multilingual-cased-v2")]
    model: String,

    /// Index backend for all workers and the commit process.
    #[arg(short = 't', long, value_enum, default_value = "sqlite")]
    db_type: DbType,

    /// Number of worker processes. More than 1 implies independent
    /// single-threaded request loops, one per OS process.
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// One or more allowed CORS origins. `*` (default) allows any origin.
    #[arg(short = 'c', long, default_value = "*")]
    cors_origin: Vec<String>,
}

fn init_tracing(log_level: &str) {
    let level = match log_level {
        "debug" => tracing::Level::DEBUG,
        "warning" => tracing::Level::WARN,
        "error" | "critical" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = Config::builder()
        .data_dir(args.data_dir)
        .host(args.host)
        .port(args.port)
        .default_model(args.model)
        .db_type(args.db_type)
        .workers(args.workers)
        .cors_origins(args.cors_origin)
        .build();

    match args.role {
        Role::Supervisor => run_supervisor(config),
        Role::Dcp => run_dcp(config),
        Role::Worker => run_worker(config),
    }
}

fn run_supervisor(config: Config) -> Result<()> {
    embedcache::shm::cleanup_stale_segments();
    let supervisor = embedcache::Supervisor::start(&config).context("failed to start supervisor")?;
    supervisor.wait()
}

fn run_dcp(config: Config) -> Result<()> {
    let pids = embedcache::supervisor::read_worker_pids(
        config.workers,
        std::time::Duration::from_secs(WORKER_SET_TIMEOUT_SECS),
    )
    .context("failed waiting for worker pid publication")?;

    let index_dir = config.model_dir(&config.default_model);
    std::fs::create_dir_all(&index_dir)?;

    let handle = match config.db_type {
        DbType::Sqlite => {
            let store = embedcache::index::SqliteIndexStore::open(index_dir.join("indexDatabase.db"))
                .context("failed to open sqlite index")?;
            DatabaseCommitProcess::start(
                store,
                pids,
                embedcache::shm::DEFAULT_NUM_CELLS,
                embedcache::index::sqlite::COMMIT_AFTER_CNT,
            )?
        }
        DbType::Leveldb => {
            #[cfg(feature = "rocksdb-backend")]
            {
                let store = embedcache::index::RocksIndexStore::open(index_dir.join("indexDatabase"))
                    .context("failed to open rocksdb index")?;
                DatabaseCommitProcess::start(
                    store,
                    pids,
                    embedcache::shm::DEFAULT_NUM_CELLS,
                    embedcache::index::rocks::FLUSH_AFTER_CNT,
                )?
            }
            #[cfg(not(feature = "rocksdb-backend"))]
            anyhow::bail!("leveldb backend requires the rocksdb-backend feature");
        }
    };

    wait_for_shutdown_signal()?;
    handle.shutdown();
    Ok(())
}

fn wait_for_shutdown_signal() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        tokio::signal::ctrl_c().await.ok();
    });
    Ok(())
}

fn run_worker(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_worker_main(config))
}

async fn async_worker_main(config: Config) -> Result<()> {
    let worker_pid = std::process::id();

    let catalog = if std::path::Path::new(MODELS_CFG_FILENAME).exists() {
        Catalog::load(MODELS_CFG_FILENAME).context("failed to load model catalog")?
    } else {
        Catalog::new()
    };

    let direct_read = match config.db_type {
        DbType::Sqlite => {
            let index_path = config.model_dir(&config.default_model).join("indexDatabase.db");
            embedcache::index::SqliteIndexStore::open_read_only(index_path).ok()
        }
        DbType::Leveldb => None,
    };

    let client = embedcache::CacheClient::attach(worker_pid, direct_read)
        .context("failed to attach to shared-memory channel")?;

    let orchestrator = embedcache::Orchestrator::new(config.clone(), catalog, client);
    let state = Arc::new(embedcache::http::AppState { config: config.clone(), orchestrator });

    let app = embedcache::http::build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(%addr, pid = worker_pid, "worker listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
