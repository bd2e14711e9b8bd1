use anyhow::Result;
use bebop_client::{cli, config, runtime};
use std::time::Duration;
use tokio::sync::watch;

/// Stop flag raised on Ctrl+C
fn stop_on_ctrl_c() -> watch::Receiver<bool> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl+C received");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                // Keep the sender alive so the flag is never raised
                std::future::pending::<()>().await;
            }
        }
    });
    stop_rx
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = <cli::Cli as clap::Parser>::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command.unwrap_or(cli::Command::Run { video_out: None }) {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force } => {
            let cfg = bebop_core::control::DroneConfig::default();
            config::save(&config_path, &cfg, force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        cli::Command::Run { video_out } => {
            let cfg = config::load(&config_path)?;
            runtime::run_client(
                cfg,
                video_out,
                stop_on_ctrl_c(),
                Box::new(|m| tracing::info!("{m}")),
            )
            .await
        }
        cli::Command::Takeoff { hover_secs } => {
            let cfg = config::load(&config_path)?;
            runtime::run_takeoff(
                cfg,
                Duration::from_secs(hover_secs),
                stop_on_ctrl_c(),
                Box::new(|m| tracing::info!("{m}")),
            )
            .await
        }
    }
}
