//! tabmux CLI and daemon entry point.

mod args;
mod daemon;

use clap::Parser;
use tabmux_core::protocol::{Command, ResponseData};
use tracing::{error, info};

use crate::args::{Cli, Commands};
use crate::daemon::config::{self, DaemonConfig};
use crate::daemon::{DaemonClient, DaemonServer};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(args) => {
            run_daemon(args.into_config());
            return;
        }
        Commands::Examples => {
            println!("{}", crate::args::EXAMPLES_TEXT);
            return;
        }
        _ => {}
    }

    if let Err(e) = run_client_command(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Convert CLI args to a protocol Command.
///
/// Returns None for commands that don't talk to the daemon.
fn cli_to_command(command: &Commands) -> Option<Command> {
    match command {
        Commands::Stop => Some(Command::Shutdown),
        Commands::Sessions => Some(Command::ListSessions),
        Commands::NewSession(args) => Some(Command::CreateSession {
            name: args.name.clone(),
        }),
        Commands::KillSession(args) => Some(Command::DestroySession {
            session_id: args.session_id.clone(),
        }),
        Commands::Layout(args) => Some(Command::GetLayout {
            session_id: args.session_id.clone(),
        }),
        Commands::Daemon(_) | Commands::Examples => None,
    }
}

/// Run a client command by connecting to the daemon.
fn run_client_command(cli: Cli) -> anyhow::Result<()> {
    let Some(command) = cli_to_command(&cli.command) else {
        return Ok(());
    };
    let user = cli.user.unwrap_or_else(config::default_user);

    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        // Stopping must not start a daemon just to shut it down.
        let client = if matches!(command, Command::Shutdown) {
            DaemonClient::connect_existing(&user).await?
        } else {
            Some(DaemonClient::connect(&user).await?)
        };
        let Some(mut client) = client else {
            println!("Daemon is not running");
            return Ok(());
        };

        let response = client.request(command).await?;

        if response.success {
            match response.data {
                Some(ResponseData::Ok { message }) => println!("{}", message),
                Some(ResponseData::SessionCreated { session_id }) => println!("{}", session_id),
                Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
                None => {}
            }
        } else if let Some(err) = response.error {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }

        Ok(())
    })
}

/// Run the daemon server with graceful signal handling.
///
/// Handles SIGINT (Ctrl+C) and SIGTERM for clean shutdown.
/// The DaemonServer's Drop impl cleans up socket and PID files.
fn run_daemon(config: DaemonConfig) {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        info!(
            "Starting daemon (shell: {}, scrollback: {} bytes)",
            config.shell, config.scrollback_bytes
        );
        let server = match DaemonServer::bind(config).await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to start daemon: {:#}", e);
                std::process::exit(1);
            }
        };

        tokio::select! {
            result = server.run() => {
                if let Err(e) = result {
                    error!("Daemon error: {:#}", e);
                    std::process::exit(1);
                }
                return;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down gracefully");
            }
            _ = sigterm() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
        }
        server.teardown().await;
        // Server is dropped here, triggering cleanup of socket and PID files
    });
}

/// Wait for SIGTERM signal (Unix only).
///
/// If signal registration fails, logs a warning and waits indefinitely.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, daemon will only respond to SIGINT",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM is not available on non-Unix platforms; use a never-completing future.
#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
