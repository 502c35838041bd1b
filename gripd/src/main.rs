use anyhow::Context;
use clap::Parser;
use tracing::info;

use gripd::{config, runtime};

fn main() -> anyhow::Result<()> {
    let cli = config::CliArgs::parse();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    rt.block_on(async move {
        let config = config::load_config(&cli)?;
        runtime::init_logging(&config, cli.logfile.as_deref())?;

        info!(
            instance = %config.global.instance_id,
            routes = config.routes.len(),
            "starting"
        );

        let app = runtime::App::start(&config).context("failed to start components")?;

        tokio::signal::ctrl_c()
            .await
            .context("failed to install signal handler")?;
        info!("shutdown signal received");

        app.shutdown().await;
        info!("stopped");
        Ok(())
    })
}
