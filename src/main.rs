//! Entry point for the elector binary: parse the CLI, wire the configured
//! backend and lifecycle commands into an [`Elector`](elector::Elector), and
//! run it until shutdown.

mod cli;

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{BackendKind, Cli, Commands};
use elector::{
    CommandAction, ConsoleBackend, ElectorBuilder, EtcdBackend, EtcdConfig, TimeoutAction,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "Elector terminated");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let Commands::Run { error_timeout } = cli.command;
    let error_timeout = if error_timeout.is_zero() {
        tracing::warn!("error-timeout not specified (or specified as 0); using default 30s");
        Duration::from_secs(30)
    } else {
        error_timeout
    };

    let start_command = cli
        .leader_start_command
        .as_deref()
        .filter(|command| !command.trim().is_empty())
        .ok_or("leader-start-command is required")?;
    let end_command = cli
        .leader_end_command
        .as_deref()
        .filter(|command| !command.trim().is_empty())
        .ok_or("leader-end-command is required")?;
    let backend = cli.backend.ok_or("must specify a valid backend")?;

    let builder = ElectorBuilder::new()
        .on_become_leader(CommandAction::new(start_command)?)
        .on_lose_leader(CommandAction::new(end_command)?)
        .on_error(TimeoutAction::new(error_timeout));

    let builder = match backend {
        BackendKind::Console => builder.backend(ConsoleBackend),
        BackendKind::Etcd => {
            let keyspace = cli
                .keyspace
                .filter(|keyspace| !keyspace.is_empty())
                .ok_or("keyspace is required")?;
            if cli.etcd_members.is_empty() {
                return Err("at least one etcd member is required".into());
            }

            let config = EtcdConfig {
                members: cli.etcd_members,
                keyspace,
                instance_id: cli.instance_id,
                ca_file: cli.ca_file,
                cert_file: cli.cert_file,
                key_file: cli.key_file,
                ..EtcdConfig::default()
            };
            builder.backend(EtcdBackend::new(config))
        }
    };

    builder.build()?.run().await?;
    Ok(())
}
