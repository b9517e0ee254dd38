// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use rp_approval::ApprovalService;
use rp_backend::balancer::{BackendEntry, LoadBalancer};
use rp_daemon::{build_app, AppState};
use rp_db::MetadataStore;
use rp_engine::{Engine, FileHistoryStore};
use rp_orchestrator::Services;
use rp_registry::TemplateRegistry;
use rp_store::ArtifactStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rp-daemon", version, about = "Renderplane orchestrator daemon")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Metadata database URL.
    #[arg(long, default_value = "sqlite://renderplane.db")]
    metadata_url: String,

    /// Artifact storage directory.
    #[arg(long, default_value = ".renderplane/artifacts")]
    artifacts_dir: PathBuf,

    /// Workflow templates directory.
    #[arg(long, default_value = "workflows")]
    templates_dir: PathBuf,

    /// Engine state directory (workflow histories).
    #[arg(long, default_value = ".renderplane/state")]
    state_dir: PathBuf,

    /// YAML file listing render backends (`- {name, address, description}`).
    #[arg(long, default_value = "servers.yaml")]
    servers: PathBuf,

    /// Task queue name, accepted for engine-deployment compatibility.
    #[arg(long, default_value = "render-farm")]
    task_queue: String,

    /// Base URL used in approval view links.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    view_url_base: String,

    /// Approval link TTL in hours.
    #[arg(long, default_value_t = 168)]
    link_ttl_hours: i64,

    /// Age in days after which unreferenced artifact files are swept.
    /// Zero disables the sweeper.
    #[arg(long, default_value_t = 7)]
    sweep_after_days: u64,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

fn load_backends(path: &PathBuf) -> Result<Vec<BackendEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read servers file {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse servers file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("rp=debug,rp_daemon=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let backends = load_backends(&args.servers)?;
    info!(count = backends.len(), "backends registered");

    let db = MetadataStore::open(&args.metadata_url)
        .await
        .context("open metadata store")?;
    let store = ArtifactStore::open(&args.artifacts_dir)
        .await
        .context("open artifact store")?;
    let (registry, summary) = TemplateRegistry::discover(&args.templates_dir)
        .await
        .context("discover templates")?;
    if !summary.errors.is_empty() {
        for error in &summary.errors {
            tracing::warn!(%error, "template skipped");
        }
    }
    let registry = Arc::new(registry);
    let balancer = Arc::new(LoadBalancer::new(backends));

    let history = Arc::new(
        FileHistoryStore::open(&args.state_dir)
            .await
            .context("open engine state dir")?,
    );
    let engine = Engine::new(history);
    let approvals = Arc::new(ApprovalService::new(
        db.clone(),
        registry.clone(),
        engine.clone(),
    ));
    rp_orchestrator::register_all(
        &engine,
        Arc::new(Services {
            db: db.clone(),
            store: store.clone(),
            registry: registry.clone(),
            balancer: balancer.clone(),
            approvals: approvals.clone(),
            view_url_base: args.view_url_base.clone(),
            link_ttl_hours: args.link_ttl_hours,
            tracker: rp_backend::TrackerConfig::default(),
        }),
    );

    // Crash recovery: re-drive every unfinished workflow before serving.
    let resumed = engine.resume_all().await?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), "workflows resumed");
    }

    // Daily sweep of orphaned artifact files; rows in the metadata store
    // pin their files.
    if args.sweep_after_days > 0 {
        let sweep_db = db.clone();
        let sweep_store = store.clone();
        let older_than = std::time::Duration::from_secs(args.sweep_after_days * 24 * 3600);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
            loop {
                tick.tick().await;
                match sweep_db.referenced_local_filenames().await {
                    Ok(referenced) => {
                        match sweep_store.sweep(older_than, &referenced).await {
                            Ok(removed) if !removed.is_empty() => {
                                info!(count = removed.len(), "artifact sweep removed files")
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "artifact sweep failed"),
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "artifact sweep skipped"),
                }
            }
        });
    }

    let state = AppState {
        engine,
        db,
        store,
        registry,
        balancer,
        approvals,
    };
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, task_queue = %args.task_queue, "rp-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
