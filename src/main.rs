use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use policyd::audit::LogAuditSink;
use policyd::config::{Config, StoreConfig};
use policyd::enforcement::{
    MockBackend, MockCategoryBlocker, MockDomainBlocker, MockScheduler, StaticHostLookup,
};
use policyd::engine::{EngineParts, PolicyEngine};
use policyd::events::PolicyEventBus;
use policyd::policy::{MemoryPolicyStore, PersistentPolicyStore, SharedPolicyStore};
use policyd::telemetry::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "policyd")]
#[command(author, version, about = "Policy enforcement engine")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&config.telemetry)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting policyd"
    );

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let store: SharedPolicyStore = match &config.store {
        StoreConfig::Memory { capacity } => Arc::new(MemoryPolicyStore::with_capacity(*capacity)),
        StoreConfig::Persistent { path, capacity } => {
            Arc::new(PersistentPolicyStore::open(path, *capacity)?)
        }
    };

    // Recording collaborators stand in until a platform blocking layer is
    // wired; every enforcement decision still flows through the real engine.
    let engine = PolicyEngine::new(EngineParts {
        store,
        backend: Arc::new(MockBackend::new()),
        domains: Arc::new(MockDomainBlocker::new()),
        categories: Arc::new(MockCategoryBlocker::new()),
        hosts: Arc::new(StaticHostLookup::new()),
        scheduler: Arc::new(MockScheduler::new()),
        audit: Arc::new(LogAuditSink),
        bus: PolicyEventBus::new(256),
        identity: config.identity.clone(),
        queue_config: config.enforcement.queue_config(),
        expire_lookahead: config.enforcement.expire_lookahead,
    });

    engine.start()?;
    let enqueued = engine.enforce_all_policies().await?;
    info!(enqueued, "startup enforcement pass submitted");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    Ok(())
}
