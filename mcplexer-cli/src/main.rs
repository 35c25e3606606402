//! The `mcplexer` binary

mod provision;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcplexer_approval::ApprovalGate;
use mcplexer_auth::{AesGcmEncryptor, CredentialInjector, Encryptor, OAuthFlowManager};
use mcplexer_config::{ConfigLoader, GatewayMode, McplexerConfig};
use mcplexer_gateway::{run_bridge, run_socket, run_stdio, GatewayContext};
use mcplexer_mcp::DownstreamManager;
use mcplexer_routing::RoutingEngine;
use mcplexer_storage::{SqliteStore, Store};

/// How often the approval sweeper runs, and how old a pending approval may
/// grow before it is expired.
const APPROVAL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const APPROVAL_MAX_AGE: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "mcplexer", version, about = "Multiplexing gateway for the Model Context Protocol")]
struct Cli {
    /// Config file path (also `MCPLEXER_CONFIG`)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (stdio for a single client, socket for many)
    Serve,

    /// Tunnel a client's stdio to the daemon socket, injecting a workspace
    /// root into the initialize message when the client ships none
    Bridge {
        /// Socket to connect to (defaults to the configured path)
        #[arg(long)]
        socket_path: Option<String>,

        /// Workspace root to inject (also `MCPLEXER_BRIDGE_ROOT`; defaults
        /// to the current directory)
        #[arg(long)]
        root: Option<String>,
    },

    /// Validate the configuration and print a summary
    ConfigCheck,
}

fn load_config(cli: &Cli) -> Result<McplexerConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("MCPLEXER_CONFIG").ok().filter(|v| !v.is_empty()));
    ConfigLoader::new().load(path.as_deref()).context("loading configuration")
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_env("MCPLEXER_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(level));
    // Clients own stdout in stdio mode; logs must go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_encryptor() -> Result<Arc<dyn Encryptor>> {
    match std::env::var("MCPLEXER_AGE_KEY").ok().filter(|v| !v.is_empty()) {
        Some(key) => Ok(Arc::new(
            AesGcmEncryptor::from_base64_key(&key).context("MCPLEXER_AGE_KEY")?,
        )),
        None => {
            warn!("MCPLEXER_AGE_KEY not set; using an ephemeral key, stored secrets will not survive a restart");
            let key = AesGcmEncryptor::generate_key();
            Ok(Arc::new(AesGcmEncryptor::from_base64_key(&key)?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.logging.level);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Bridge { socket_path, root } => {
            let socket_path = socket_path.unwrap_or_else(|| config.gateway.socket_path.clone());
            let root = root.or_else(|| std::env::var("MCPLEXER_BRIDGE_ROOT").ok().filter(|v| !v.is_empty()));
            run_bridge(&socket_path, root).await?;
            Ok(())
        }
        Commands::ConfigCheck => {
            println!(
                "configuration ok: {} servers, {} workspaces, {} scopes, {} rules",
                config.servers.len(),
                config.workspaces.len(),
                config.scopes.len(),
                config.rules.len()
            );
            Ok(())
        }
    }
}

async fn serve(config: McplexerConfig) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.database.dsn)
            .await
            .with_context(|| format!("opening database {:?}", config.database.dsn))?,
    );
    let encryptor = build_encryptor()?;

    // Startup housekeeping: provision yaml rows, sweep stale state.
    provision::provision(&store, &encryptor, &config).await?;
    let stale_before = chrono::Utc::now() - chrono::Duration::hours(config.gateway.stale_session_hours as i64);
    match store.cleanup_stale_sessions(stale_before).await {
        Ok(0) => {}
        Ok(swept) => info!(swept, "closed stale sessions"),
        Err(e) => warn!(error = %e, "stale session sweep failed"),
    }

    let oauth = Arc::new(OAuthFlowManager::new(
        store.clone(),
        encryptor.clone(),
        config.gateway.external_url.clone(),
    ));
    let injector = Arc::new(CredentialInjector::new(store.clone(), encryptor, oauth.clone()));
    let manager = Arc::new(DownstreamManager::new(store.clone(), injector));
    let engine = Arc::new(RoutingEngine::new(store.clone()));
    let gate = Arc::new(ApprovalGate::new(store.clone()));

    gate.sweep_expired(APPROVAL_MAX_AGE).await.ok();
    let sweeper = gate.spawn_sweeper(APPROVAL_SWEEP_INTERVAL, APPROVAL_MAX_AGE);

    let ctx = Arc::new(GatewayContext {
        store,
        engine,
        manager: manager.clone(),
        oauth,
        gate: gate.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    match config.gateway.mode {
        GatewayMode::Stdio => {
            info!("serving one session on stdio");
            run_stdio(ctx).await?;
        }
        GatewayMode::Socket => {
            run_socket(ctx, &config.gateway.socket_path, shutdown_rx).await?;
        }
    }

    sweeper.abort();
    gate.shutdown().await;
    manager.shutdown().await;
    info!("goodbye");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
