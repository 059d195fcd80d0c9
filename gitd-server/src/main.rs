//! The gitd binary: Smart-HTTP server (`gitd http`) and native git
//! daemon (`gitd daemon`) over the orchestration core.

mod api;
mod auth;
mod daemon;
mod lfs;
mod locks;
mod respond;
mod routes;
mod smart;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gitd::{ContentStore, LockStore, MirrorEngine, RepoStore};

use crate::auth::{Authenticator, StaticAuthenticator};
use crate::daemon::Daemon;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "gitd", version, about = "Multi-protocol Git hosting server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve repositories over Smart-HTTP with LFS support
    Http(HttpArgs),
    /// Serve repositories over the native git protocol
    Daemon(DaemonArgs),
}

#[derive(Args)]
struct HttpArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    addr: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8080, env = "GITD_PORT")]
    port: u16,

    /// URL prefix to serve under, e.g. /git
    #[arg(long, default_value = "")]
    prefix: String,

    /// Require HTTP Basic credentials, given as user:pass
    #[arg(long, env = "GITD_AUTH")]
    auth: Option<String>,

    /// Minimum seconds between upstream ref probes per mirror
    #[arg(long, default_value_t = 10)]
    sync_cooldown: u64,

    /// Repository root directory
    directory: PathBuf,
}

#[derive(Args)]
struct DaemonArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    listen: String,

    /// Port to listen on
    #[arg(long, default_value_t = 9418)]
    port: u16,

    /// Export every repository, without requiring git-daemon-export-ok
    #[arg(long)]
    export_all: bool,

    /// Allow pushes over the daemon protocol
    #[arg(long)]
    enable_receive: bool,

    /// Repository root directories, tried in order
    #[arg(required = true)]
    directories: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Http(args) => serve_http(args).await,
        Command::Daemon(args) => serve_daemon(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve_http(args: HttpArgs) -> Result<(), Box<dyn std::error::Error>> {
    let repos = RepoStore::new(&args.directory)?;
    let lfs_store = ContentStore::new(repos.root().join("lfs"))?;
    let locks = LockStore::new(repos.root().join("lfs").join("locks.db"))?;
    let mirrors = Arc::new(MirrorEngine::new(
        repos.clone(),
        lfs_store.clone(),
        Duration::from_secs(args.sync_cooldown),
    ));

    let auth: Option<Arc<dyn Authenticator>> = match &args.auth {
        Some(spec) => {
            let authenticator = StaticAuthenticator::parse(spec)
                .ok_or("invalid --auth value, expected user:pass")?;
            Some(Arc::new(authenticator))
        }
        None => None,
    };

    let state = Arc::new(AppState {
        repos,
        mirrors,
        lfs: lfs_store,
        locks,
        auth,
        prefix: normalize_prefix(&args.prefix),
    });

    let app = routes::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind((args.addr.as_str(), args.port)).await?;
    info!(
        addr = %listener.local_addr()?,
        root = %state.repos.root().display(),
        "gitd http server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn serve_daemon(args: DaemonArgs) -> Result<(), Box<dyn std::error::Error>> {
    let roots = args
        .directories
        .iter()
        .map(RepoStore::new)
        .collect::<gitd::Result<Vec<_>>>()?;

    let daemon = Arc::new(Daemon::new(roots, args.export_all, args.enable_receive));
    let listener = tokio::net::TcpListener::bind((args.listen.as_str(), args.port)).await?;

    tokio::select! {
        result = daemon.serve(listener) => result?,
        _ = shutdown_signal() => info!("shutting down"),
    }
    Ok(())
}

/// Ensure a non-empty prefix starts with `/` and does not end with one.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
