use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use iotlink_agent::telemetry::init_tracing;
use iotlink_agent::{Agent, AgentConfig, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter)?;
    let config = AgentConfig::try_from(cli)?;
    info!(
        model = %config.model,
        broker = %config.connection.broker.host,
        registration = config.registration.is_some(),
        "starting iotlink agent"
    );

    let agent = Agent::from_config(config)?;
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => trigger.cancel(),
            Err(err) => warn!(error = %err, "failed to listen for ctrl-c"),
        }
    });

    agent.run(shutdown).await
}
