use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use clap::Parser;
use fsweep::{
    default_script, init_logging, CollectionRequest, Credential, Dispatcher, EnvSettings,
    HostRegistry, LogConfig, RetryPolicy, RunOutcome, SshTransport, DEFAULT_COMMAND_TIMEOUT_SECS,
    DEFAULT_CONCURRENCY, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RETRIES, DEFAULT_SSH_PORT,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, warn};

/// Collect controller fault logs across a fleet over SSH.
#[derive(Parser, Debug)]
#[command(
    name = "fsweep",
    version,
    about,
    after_help = "Environment (also read from ./.env):\n  \
        FSWEEP_SSH_USERNAME  default SSH username\n  \
        FSWEEP_SSH_PASSWORD  password auth via sshpass (used when --key is absent)\n  \
        FSWEEP_SSH_KEY       default private key path\n  \
        FSWEEP_LOG_LEVEL / FSWEEP_LOG_FORMAT / FSWEEP_LOG_FILE  logging"
)]
struct Cli {
    /// Targets file: optional SINCE=<cutoff> directive, then
    /// 'name, address[, username][, port]' lines
    #[arg(long, short = 't')]
    targets: PathBuf,

    /// Run the remote processor under 'sudo -n'
    #[arg(long)]
    sudo: bool,

    /// Replace the embedded processor script with this file
    #[arg(long)]
    script: Option<PathBuf>,

    /// Also write the report as JSON to this path (atomic)
    #[arg(long)]
    json_out: Option<PathBuf>,

    /// Delay the run until this local time, e.g. '2025-11-06 02:00'
    #[arg(long)]
    at: Option<String>,

    /// Maximum concurrently open sessions
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Extra attempts per host for transient failures
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    retries: u32,

    /// Wall-clock budget per session attempt, seconds
    #[arg(long, default_value_t = DEFAULT_COMMAND_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// SSH connection establishment timeout, seconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout_secs: u64,

    /// Default SSH username for hosts without an override
    #[arg(long, env = "FSWEEP_SSH_USERNAME")]
    username: Option<String>,

    /// Default SSH port for hosts without an override
    #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
    port: u16,

    /// Private key file; selects key auth instead of password auth
    #[arg(long, env = "FSWEEP_SSH_KEY")]
    key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guards = match init_logging(&LogConfig::from_env("info")) {
        Ok(guards) => guards,
        Err(err) => {
            eprintln!("fsweep: failed to initialize logging: {err}");
            return ExitCode::from(2);
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "run failed");
            eprintln!("fsweep: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = EnvSettings::load(Path::new("."));

    let registry = HostRegistry::from_path(&cli.targets)
        .with_context(|| format!("invalid targets file {}", cli.targets.display()))?;

    let credential = resolve_credential(&cli, &settings)?;
    let default_username = cli
        .username
        .clone()
        .or_else(|| settings.get("FSWEEP_SSH_USERNAME"))
        .context("no SSH username (use --username or FSWEEP_SSH_USERNAME)")?;

    let script = match &cli.script {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?,
        None => default_script(),
    };

    let scheduled_start = match &cli.at {
        Some(text) => Some(
            parse_start_time(text)
                .with_context(|| format!("unparseable start time '{text}'"))?,
        ),
        None => None,
    };

    if cli.concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }

    let request = Arc::new(CollectionRequest {
        since: registry.since(),
        sudo: cli.sudo,
        script,
        connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
        command_timeout: Duration::from_secs(cli.timeout_secs),
        max_retries: cli.retries,
        concurrency: cli.concurrency,
        scheduled_start,
        default_username,
        default_port: cli.port,
        credential,
    });

    let (abort_tx, abort_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting run");
            let _ = abort_tx.send(true);
        }
    });

    let dispatcher = Dispatcher::new(
        Arc::new(SshTransport),
        RetryPolicy::with_max_retries(cli.retries),
    );
    let report = match dispatcher.run(&registry, request, abort_rx).await {
        RunOutcome::Completed(report) => report,
        RunOutcome::Aborted => {
            eprintln!("fsweep: run aborted");
            return Ok(ExitCode::from(2));
        }
    };

    print!("{}", report.render());

    if let Some(path) = &cli.json_out {
        // The console report above is already out; a persist failure must
        // not suppress it, only change the exit code.
        if let Err(err) = fsweep::write_json(&report, path) {
            error!(path = %path.display(), error = %err, "JSON export failed");
            eprintln!("fsweep: {err}");
            return Ok(ExitCode::from(2));
        }
    }

    if report.failed_count() == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn resolve_credential(cli: &Cli, settings: &EnvSettings) -> Result<Credential> {
    if let Some(key) = &cli.key {
        if !key.exists() {
            bail!("key file {} does not exist", key.display());
        }
        return Ok(Credential::KeyFile(key.clone()));
    }
    if let Some(password) = settings.get("FSWEEP_SSH_PASSWORD") {
        if password.is_empty() {
            bail!("FSWEEP_SSH_PASSWORD is set but empty");
        }
        return Ok(Credential::Password(password));
    }
    bail!("no credential: pass --key or set FSWEEP_SSH_PASSWORD")
}

/// Accepted local start-time forms for `--at`.
fn parse_start_time(text: &str) -> Option<DateTime<Local>> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    let t = text.trim();
    for format in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(t, format) {
            return naive.and_local_timezone(Local).single();
        }
    }
    None
}
