//! proxchat - proximity voice chat client

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use proxchat::app::{self, AppOptions};
use proxchat::audio::list_input_devices;
use proxchat::config::config_dir;

#[derive(Parser)]
#[command(name = "proxchat")]
#[command(about = "Proximity voice chat: positional peer-to-peer audio for games")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable the in-app debug panel (debug builds only)
    #[arg(long)]
    debug: bool,

    /// Write logs to <NAME>.log next to the config file
    #[arg(long, value_name = "NAME", num_args = 0..=1, default_missing_value = "debug")]
    log: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available capture devices
    Devices,
}

fn setup_logging(verbose: bool, file_base: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    let registry = tracing_subscriber::registry().with(filter).with(stdout_layer);

    match file_base {
        Some(base) => {
            let appender =
                tracing_appender::rolling::never(config_dir(), format!("{}.log", base));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn list_devices() {
    println!("Input devices:");
    for device in list_input_devices() {
        let default_marker = if device.is_default { " (default)" } else { "" };
        println!("  - {}{}", device.name, default_marker);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = setup_logging(cli.verbose, cli.log.as_deref());

    match cli.command {
        Some(Commands::Devices) => {
            list_devices();
            Ok(())
        }
        None => {
            app::run(AppOptions {
                debug_panel: cli.debug,
            })
            .await
        }
    }
}
