/* fieldd: the field-control runtime daemon.
 *
 * Without a subcommand this process is the supervisor: it re-execs
 * itself once per worker (`fieldd ... worker <name>`) and runs the
 * restart loops. The hidden `worker` subcommand is that re-exec
 * entry point. */

mod codec;
mod config;
mod error;
mod hotplug;
mod link;
mod message;
mod registry;
mod rpc;
mod schema;
mod serial;
mod store;
mod supervisor;
mod worker;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use config::Options;
use supervisor::Supervisor;

/// fieldd — field-control runtime daemon for smart sensor robots.
#[derive(Parser)]
#[command(name = "fieldd", version, about)]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Internal: run a single worker process (spawned by the
    /// supervisor, not meant to be invoked by hand).
    #[command(hide = true)]
    Worker { name: String },
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    /* One JSON object per line: time, level, target and fields. */
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.options.log_level);

    let options = match cli.options.resolve() {
        Ok(options) => options,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(2);
        }
    };

    let code = match cli.command {
        Some(Command::Worker { name }) => run_worker(&name, options).await,
        None => run_supervisor(options).await,
    };
    std::process::exit(code);
}

async fn run_worker(name: &str, options: Options) -> i32 {
    info!(worker = name, pid = std::process::id(), "worker starting");
    match worker::run(name, options).await {
        Ok(()) => 0,
        Err(err) => {
            error!(worker = name, err = format!("{err:#}"), "worker failed");
            1
        }
    }
}

async fn run_supervisor(options: Options) -> i32 {
    let program = match std::env::current_exe() {
        Ok(program) => program,
        Err(err) => {
            error!(%err, "cannot locate our own binary");
            return 2;
        }
    };

    let mut supervisor = Supervisor::new(options.supervisor_config());
    for name in worker::ALL_WORKERS {
        let mut args = options.to_args();
        args.push("worker".into());
        args.push(name.into());
        supervisor.add(name, program.clone(), args);
    }
    let supervisor = Arc::new(supervisor);

    /* SIGINT/SIGTERM begin the graceful teardown. */
    let signal_supervisor = Arc::clone(&supervisor);
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    warn!(%err, "no SIGTERM handler, relying on ctrl-c");
                    let _ = tokio::signal::ctrl_c().await;
                    signal_supervisor.shutdown();
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown requested");
        signal_supervisor.shutdown();
    });

    match supervisor.run().await {
        Ok(()) => {
            info!("graceful shutdown complete");
            0
        }
        Err(err) => {
            error!(%err, "fatal supervision failure");
            1
        }
    }
}
