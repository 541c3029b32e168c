mod cli;
mod error;
mod headers;
mod input;

use std::io::IsTerminal;
use std::process;

use clap::Parser;
use hlsget_engine::download;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::Args;
use crate::error::{AppError, Result};
use crate::input::input_handler;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let config = args.to_config()?;
    debug!(run_id = %config.run_id, "Configuration: {:?}", config);

    let token = CancellationToken::new();

    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight segments...");
            ctrl_c_token.cancel();
        }
    });

    let input_done = CancellationToken::new();
    let input_task = if !args.no_input && std::io::stdin().is_terminal() {
        if config.live {
            info!("Press 'q' to stop the live capture");
        }
        let (cancel, done) = (token.clone(), input_done.clone());
        Some(tokio::task::spawn_blocking(move || input_handler(cancel, done)))
    } else {
        None
    };

    let result = download(config, token).await;

    // Restore the terminal before reporting
    input_done.cancel();
    if let Some(task) = input_task
        && let Err(e) = task.await
    {
        debug!("Input handler ended abnormally: {e}");
    }

    let summary = result.map_err(AppError::from)?;
    if summary.report.cancelled {
        info!("Capture stopped by user");
    }
    if !summary.report.failed.is_empty() {
        let sequences: Vec<u64> = summary
            .report
            .failed
            .iter()
            .map(|f| f.sequence_number)
            .collect();
        warn!("Missing segments: {:?}", sequences);
    }
    info!(
        "Saved {} segment(s) to {}",
        summary.segments,
        summary.output_file.display()
    );
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer())
                .with_target(false)
                .with_level(verbose),
        )
        .with(indicatif_layer)
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
