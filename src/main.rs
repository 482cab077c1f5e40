use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use a3s_acp::{AgentServer, FramingKind, Runtime, RuntimeConfig, ServeOutcome};
use a3s_transport::Transport;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "a3s-acp", version, about = "Serve the agent side of an agent-host protocol")]
struct Cli {
    /// Configuration file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bundle directory with prompts/ and tools.yaml
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Default working directory for new sessions
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Listen on a Unix socket instead of stdio
    #[arg(long)]
    socket: Option<PathBuf>,

    #[arg(long, value_enum)]
    framing: Option<Framing>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Filter directive, e.g. `debug` or `a3s_acp=trace`
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    approval_timeout_ms: Option<u64>,

    #[arg(long)]
    max_concurrent_tools: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Framing {
    Lines,
    Binary,
}

impl From<Framing> for FramingKind {
    fn from(framing: Framing) -> Self {
        match framing {
            Framing::Lines => FramingKind::Lines,
            Framing::Binary => FramingKind::Binary,
        }
    }
}

impl Cli {
    fn load_config(&self) -> a3s_acp::Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(bundle) = &self.bundle {
            config = config.with_bundle_dir(bundle);
        }
        if let Some(workspace) = &self.workspace {
            config = config.with_workspace(workspace);
        }
        if let Some(framing) = self.framing {
            config = config.with_framing(framing.into());
        }
        if let Some(ms) = self.approval_timeout_ms {
            config = config.with_approval_timeout(Duration::from_millis(ms));
        }
        if let Some(max) = self.max_concurrent_tools {
            config = config.with_max_concurrent_tools(max);
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }
}

// stdout carries protocol frames, so logs go to stderr
fn init_tracing(format: LogFormat, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli, config: RuntimeConfig) -> anyhow::Result<ServeOutcome> {
    let framing: a3s_transport::Framing = config.framing.into();
    let runtime = Runtime::builder(config).with_builtins().build()?;
    let server = AgentServer::new(Arc::new(runtime));

    let transport = match &cli.socket {
        #[cfg(unix)]
        Some(path) => {
            let listener = a3s_transport::unix::UnixListener::bind(path, framing)?;
            tracing::info!(socket = %listener.path().display(), "Waiting for host");
            listener.accept().await?
        }
        #[cfg(not(unix))]
        Some(_) => anyhow::bail!("Unix sockets are not supported on this platform"),
        None => Transport::stdio(framing),
    };

    Ok(server.serve(transport).await?)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("a3s-acp: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.log_format, &config.log_level);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cli, config));
    // a blocked stdin reader must not hold the process open
    runtime.shutdown_timeout(Duration::from_millis(100));

    match result {
        Ok(outcome) => {
            tracing::info!(outcome = ?outcome, "Agent stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Agent failed");
            ExitCode::FAILURE
        }
    }
}
