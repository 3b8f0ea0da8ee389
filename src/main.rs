use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use struct_log::StructLogBuilder;
use tracing::{error, info};
use vault_agent::cli::Cli;
use vault_agent::{Agent, AgentConfigBuilder, AgentError};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match StructLogBuilder::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        .format(cli.log_format.into())
        .json_from_env()
        .level(cli.log_level.as_str())
        .init()
    {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Failed to set up logging: {err}");
            return ExitCode::from(2);
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<AgentError>()
                .map_or(1, AgentError::exit_code);
            error!(error = %format_args!("{err:#}"), "vault-agent exiting");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut builder = AgentConfigBuilder::from_file(&cli.config).map_err(AgentError::from)?;
    if cli.exit_after_auth {
        builder = builder.exit_after_auth(true);
    }
    let config = builder.build().map_err(AgentError::from)?;
    info!(
        method = config.method_name(),
        sinks = ?config.sink_names(),
        exit_after_auth = config.exit_after_auth(),
        "Configuration loaded"
    );

    let agent = Agent::new(config);
    agent.start().await?;

    tokio::select! {
        result = agent.wait() => result?,
        signal = shutdown_signal() => {
            signal.context("failed to listen for shutdown signals")?;
            info!("Shutdown signal received");
            agent.stop().await?;
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
