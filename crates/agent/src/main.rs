use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use sign_agent::{
    AppState, CredentialBroker, CredentialPrompt, JsonRpcBackendFactory, ManagerConfig,
    Orchestrator, SubprocessManager, run,
};

#[derive(Parser)]
#[command(name = "sign-agent", version, about = "Local batch signing agent")]
struct Args {
    #[clap(long, default_value = "127.0.0.1")]
    host: String,
    #[clap(long, default_value = "8765")]
    port: u16,

    /// How long an unanswered credential prompt stays open.
    #[clap(long, default_value = "120")]
    credential_expiry_secs: u64,
    #[clap(long, default_value = "500")]
    credential_poll_ms: u64,

    /// Worker executable. Defaults to a sibling of this binary.
    #[clap(long, env = "SIGN_WORKER_PATH")]
    worker_path: Option<PathBuf>,
    #[clap(long, default_value = "300")]
    worker_timeout_secs: u64,
    #[clap(long, default_value = "500")]
    worker_poll_ms: u64,
    #[clap(long, default_value = "10")]
    exit_grace_secs: u64,

    /// Retain per-run working directories for diagnostics.
    #[clap(long)]
    keep_work_dir: bool,

    #[clap(long, env = "SIGNING_COMMAND")]
    signing_command: Option<String>,
    #[clap(long, env = "PKCS11_MODULE")]
    pkcs11_module: Option<String>,
}

/// Prompt sink for headless operation: announces the need for credentials
/// in the log and waits for a POST to /credentials.
struct LogPrompt;

impl CredentialPrompt for LogPrompt {
    fn request(&self, remote_url: &str, database: &str) {
        tracing::warn!(
            url = remote_url,
            database,
            "credentials needed: POST them to /credentials"
        );
    }
}

fn default_worker_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let dir = exe
        .parent()
        .context("executable has no parent directory")?;
    Ok(dir.join("sign-worker"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let args = Args::parse();

    let worker_path = match args.worker_path {
        Some(path) => path,
        None => default_worker_path()?,
    };
    tracing::info!(worker = %worker_path.display(), "using worker executable");

    let broker = Arc::new(CredentialBroker::new(
        Box::new(LogPrompt),
        Duration::from_millis(args.credential_poll_ms),
        Duration::from_secs(args.credential_expiry_secs),
    ));

    let mut manager_config = ManagerConfig::new(worker_path);
    manager_config.poll_interval = Duration::from_millis(args.worker_poll_ms);
    manager_config.timeout = Duration::from_secs(args.worker_timeout_secs);
    manager_config.exit_grace = Duration::from_secs(args.exit_grace_secs);
    manager_config.keep_work_dir = args.keep_work_dir;
    manager_config.signing_command = args.signing_command;
    manager_config.pkcs11_module = args.pkcs11_module;

    let orchestrator = Arc::new(Orchestrator::new(
        broker.clone(),
        Arc::new(SubprocessManager::new(manager_config)),
        Arc::new(JsonRpcBackendFactory),
    ));

    run(args.host, args.port, AppState {
        broker,
        orchestrator,
    })
    .await
}
