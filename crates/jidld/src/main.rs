//! The `jidld` binary: load a configuration, run the logger, and take
//! single-character commands on stdin until told to quit.

use std::{
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use common::{
    config::JidlConfig,
    shutdown::ShutdownSignal,
};
use logger::App;
use tokio::{
    io::{
        AsyncBufReadExt,
        BufReader,
    },
    signal,
};

mod trace;

#[derive(Parser, Debug)]
#[command(name = "jidld", about = "JIDL industrial data logger")]
struct Args {
    /// Configuration file to load.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Start logging immediately after load.
    #[arg(short = 'a', long = "autostart")]
    autostart: bool,

    /// Permit start/stop over IPC.
    #[arg(short = 'r', long = "remote-control")]
    remote_control: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    trace::config_service();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start the runtime: {e}");
            return ExitCode::FAILURE;
        },
    };
    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = JidlConfig::load(&args.config)?;
    tracing::info!("Loaded configuration from {}", args.config.display());

    // The scheduler reports fatal sink errors here.
    let (fatal_tx, mut fatal_rx) = async_broadcast::broadcast(1);
    let fatal = ShutdownSignal::new(fatal_tx, config.sink.name.clone());

    let app = App::new(config, fatal, args.remote_control).await?;
    app.start_server().await?;
    if args.autostart {
        if let Err(e) = app.start_logging().await {
            tracing::error!("Autostart failed: {e:#}");
        }
    }

    tracing::info!("Commands: s = start, p = pause, q = quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    // stdin closed; keep serving until a signal arrives.
                    wait_for_exit(&mut fatal_rx).await;
                    break;
                };
                match line.trim() {
                    "s" => {
                        if let Err(e) = app.start_logging().await {
                            tracing::error!("Cannot start logging: {e:#}");
                        }
                    },
                    "p" => app.stop_logging().await,
                    "q" => break,
                    "" => {},
                    other => tracing::warn!("Unknown command {other:?}"),
                }
            },
            _ = signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            },
            message = fatal_rx.recv() => {
                if let Ok(message) = message {
                    tracing::error!("Fatal error, shutting down: {}", message.error);
                }
                break;
            },
        }
    }
    app.shutdown().await;
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn wait_for_exit(
    fatal_rx: &mut async_broadcast::Receiver<common::shutdown::ShutdownMessage>,
) {
    tokio::select! {
        _ = signal::ctrl_c() => {},
        _ = fatal_rx.recv() => {},
    }
}
