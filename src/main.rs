use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskloom::{config::LoomConfig, world::Loom};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskloom", version, about = "Distributed task orchestration core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration service until interrupted
    Start,
    /// Query a running instance's health
    Status,
    /// Signal a running instance to shut down
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = LoomConfig::load()?;

    match cli.command {
        Command::Start => start(config).await,
        Command::Status => status(config).await,
        Command::Stop => stop(config),
    }
}

async fn start(config: LoomConfig) -> Result<()> {
    info!("starting taskloom");
    let pid_path = std::path::Path::new(&config.data_dir).join("taskloom.pid");
    std::fs::create_dir_all(&config.data_dir).ok();
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("writing pid file {}", pid_path.display()))?;

    let loom = Loom::new(config).await?;
    loom.start().await?;

    wait_for_shutdown().await;
    loom.shutdown();

    // Give transports and sweepers a moment to observe the signal.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let _ = std::fs::remove_file(&pid_path);
    info!("taskloom stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = term.recv() => info!("terminate received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
}

async fn status(config: LoomConfig) -> Result<()> {
    let base = format!(
        "http://{}:{}",
        config.transport.http.host, config.transport.http.port
    );
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .context("is taskloom running?")?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&health)?);

    // Metrics need credentials; skip quietly when none are configured.
    if let Some(key) = &config.security.api_key {
        let metrics: serde_json::Value = client
            .get(format!("{base}/system/metrics"))
            .bearer_auth(key)
            .send()
            .await?
            .json()
            .await?;
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    }
    Ok(())
}

fn stop(config: LoomConfig) -> Result<()> {
    let pid_path = std::path::Path::new(&config.data_dir).join("taskloom.pid");
    let pid = std::fs::read_to_string(&pid_path)
        .with_context(|| format!("no pid file at {}; is taskloom running?", pid_path.display()))?;
    let pid = pid.trim();

    #[cfg(unix)]
    {
        let status = std::process::Command::new("kill").arg(pid).status()?;
        if !status.success() {
            error!("kill {pid} failed");
            anyhow::bail!("could not signal process {pid}");
        }
        info!("sent terminate signal to {pid}");
        Ok(())
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("stop is only supported on unix; terminate process {pid} manually");
    }
}
