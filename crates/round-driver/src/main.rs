use anyhow::{Context, Result};
use clap::Parser;
use round_driver::{Cli, DriverConfig, RoundSession};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => DriverConfig::load(path)?,
        None => DriverConfig::default(),
    };
    let config = config.with_env_overrides().apply_cli(&cli);
    config.validate()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current turn");
            on_signal.cancel();
        }
    });

    let session = RoundSession::new(config);
    let report = session.run(cancel).await?;

    for outcome in &report.outcomes {
        info!(summary = %outcome.summary_line(), "Round");
    }
    info!(
        thread_id = %report.thread_id,
        rounds = report.outcomes.len(),
        failed_participants = report.failed_participants(),
        resumed = ?report.resumed,
        stopped = report.stopped,
        "Session finished"
    );

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to encode report")?;
        println!("{json}");
    }
    Ok(())
}
