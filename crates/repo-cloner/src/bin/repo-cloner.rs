// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use repo_cloner::broker::RedisDialer;
use repo_cloner::db::{self, SurrealRecordStore};
use repo_cloner::{
    load_config, metrics, BrokerConnection, ClonerConfig, CloneExecutor, CloneWorker, GitCloner,
    MergeOpts, QueueConsumer, WorkerMetrics,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_CONFIG_FILE: &str = "repo-cloner.toml";
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Consume clone requests from a queue, clone each repository under a base
/// directory and record the outcome.
#[derive(Parser)]
struct Args {
    /// Path to a TOML config file (default: ./repo-cloner.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory clones are placed under (overrides env/config)
    #[arg(long)]
    repo_base_location: Option<PathBuf>,

    /// Queue to consume (overrides env/config)
    #[arg(long)]
    queue_name: Option<String>,

    /// Serve /health and /metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Abort a clone after this many seconds; 0 disables the limit
    #[arg(long)]
    clone_timeout_seconds: Option<u64>,
}

fn init_logging() {
    let env = env_logger::Env::default().filter_or("RUST_LOG", "info");
    let mut builder = env_logger::Builder::from_env(env);
    builder
        .filter_module("hyper_util", LevelFilter::Warn)
        .filter_module("hyper", LevelFilter::Warn)
        .filter_module("h2", LevelFilter::Warn)
        .filter_module("reqwest", LevelFilter::Warn)
        .filter_module("surrealdb", LevelFilter::Warn);
    builder.init();
}

fn consumer_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "cloner".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}

fn warn_on_lease_risk(cfg: &ClonerConfig) {
    match cfg.clone_timeout {
        None => warn!(
            "no clone timeout configured; a clone running past the processing TTL ({}s) may be redelivered to another worker",
            cfg.processing_ttl.as_secs()
        ),
        Some(t) if t >= cfg.processing_ttl => warn!(
            "clone timeout ({}s) is not below the processing TTL ({}s); long clones may be redelivered",
            t.as_secs(),
            cfg.processing_ttl.as_secs()
        ),
        Some(_) => {}
    }
}

async fn serve_metrics(port: u16, metrics: Arc<WorkerMetrics>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics listener on {}", addr))?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, metrics::router(metrics)).await?;
    Ok(())
}

/// Run the consumer until the reconnect budget is spent. Each failed
/// `consume` call counts as one attempt; a run that stayed up longer than
/// the backoff cap resets the count.
async fn run_consumer(
    mut consumer: QueueConsumer<RedisDialer>,
    worker: CloneWorker,
    queue: String,
    max_attempts: u32,
) -> Result<()> {
    let mut attempts: u32 = 0;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let started = Instant::now();
        let err = match consumer.consume(&queue, &worker).await {
            Ok(never) => match never {},
            Err(e) => e,
        };
        if started.elapsed() > MAX_BACKOFF {
            attempts = 0;
            backoff = INITIAL_BACKOFF;
        }
        attempts += 1;
        if max_attempts > 0 && attempts > max_attempts {
            return Err(anyhow::anyhow!(
                "giving up after {} reconnect attempts: {}",
                max_attempts,
                err
            ));
        }
        error!(
            "broker connection failed ({}); retrying in {}s",
            err,
            backoff.as_secs()
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    info!("repo-cloner {} starting up", env!("CARGO_PKG_VERSION"));

    let cfg = load_config(
        ClonerConfig::default(),
        MergeOpts {
            config_path: Some(args.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))),
            cli_repo_base_location: args.repo_base_location,
            cli_queue_name: args.queue_name,
            cli_metrics_port: args.metrics_port,
            cli_clone_timeout_seconds: args.clone_timeout_seconds,
        },
    )?;
    info!(
        "queue='{}' base={} record_policy={:?} on_persist_failure={:?}",
        cfg.queue_name,
        cfg.repo_base_location.display(),
        cfg.record_policy,
        cfg.on_persist_failure
    );
    warn_on_lease_risk(&cfg);

    let conn = db::connect(
        cfg.db_host.as_deref(),
        cfg.db_user.as_deref(),
        cfg.db_pass.as_deref(),
        &cfg.db_namespace,
        &cfg.db_name,
    )
    .await
    .context("connect to SurrealDB")?;
    let store = SurrealRecordStore::new(conn);
    store.init_schema().await.context("initialize SurrealDB schema")?;

    let metrics = Arc::new(WorkerMetrics::new());
    let executor = CloneExecutor::new(cfg.repo_base_location.clone(), Arc::new(GitCloner::from_env()))
        .with_timeout(cfg.clone_timeout);
    let worker = CloneWorker::new(executor, Arc::new(store))
        .with_record_policy(cfg.record_policy)
        .with_persistence_failure_policy(cfg.on_persist_failure)
        .with_metrics(Arc::clone(&metrics));

    let id = consumer_id();
    info!("consumer id {}", id);
    let dialer = RedisDialer::new(&cfg.broker_url()?, id, cfg.processing_ttl)?;
    let consumer = QueueConsumer::new(BrokerConnection::new(dialer), cfg.broker_wait)
        .with_metrics(Arc::clone(&metrics));

    let server = async {
        match cfg.metrics_port {
            Some(port) => serve_metrics(port, Arc::clone(&metrics)).await,
            None => std::future::pending::<Result<()>>().await,
        }
    };

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!("HTTP server failed: {:#}", e);
                std::process::exit(1);
            }
            info!("HTTP server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        res = run_consumer(consumer, worker, cfg.queue_name.clone(), cfg.max_reconnect_attempts) => {
            if let Err(e) = res {
                error!("{:#}", e);
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
