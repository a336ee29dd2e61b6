use cua_hypervisor::{archival, config::Config, AppState};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cua_hypervisor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    match std::env::args().nth(1).as_deref() {
        Some(archival::supervisor::WORKER_SUBCOMMAND) => {
            archival::process::run_worker_process(config.archival).await?;
            // The stdin reader may still be parked on a blocking read.
            std::process::exit(0);
        }
        Some(other) => anyhow::bail!("unknown subcommand '{other}'"),
        None => {}
    }

    let state = AppState::start(config).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    state.shutdown().await;
    Ok(())
}
