use anyhow::{Context, Result};
use clap::Parser;
use osprey_common::shutdown::{shutdown_signal, was_interrupted};
use tokio_util::sync::CancellationToken;

use osprey_runner::args::{Cli, Commands, SubmitArgs};
use osprey_runner::aws::sdk_config;
use osprey_runner::queue::{RequestQueue, SqsRequestQueue};
use osprey_runner::runtime::Runtime;
use osprey_runner::worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            osprey_common::metrics::maybe_spawn_metrics_server();
            let runtime = Runtime::from_args(&args).await?;

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                signal_cancel.cancel();
            });

            tracing::info!(
                workers = runtime.config.workers,
                throttling = runtime.config.scheduler_throttling_enabled,
                "worker process starting"
            );

            let scheduler = tokio::spawn(worker::run_image_loop(runtime.clone(), cancel.clone()));
            let regions = tokio::spawn(worker::run_region_loop(runtime.clone(), cancel.clone()));
            let results = tokio::spawn(worker::run_results_loop(runtime.clone(), cancel.clone()));
            let reaper = tokio::spawn(worker::run_reaper(runtime.clone(), cancel.clone()));

            for handle in [scheduler, regions, results, reaper] {
                handle.await.context("worker task panicked")?;
            }
            tracing::info!("worker process stopped");

            if was_interrupted() {
                std::process::exit(osprey_common::EXIT_SIGINT);
            }
            Ok(())
        }
        Commands::Submit(args) => submit(args).await,
    }
}

/// Read an image request document and enqueue it.
async fn submit(args: SubmitArgs) -> Result<()> {
    let body = if args.request == "-" {
        std::io::read_to_string(std::io::stdin()).context("read request from stdin")?
    } else {
        std::fs::read_to_string(&args.request)
            .with_context(|| format!("read request from {}", args.request))?
    };

    // Fail locally before the queue does.
    let request = osprey_runner::api::ImageRequest::from_message(&body)?;

    let sdk = sdk_config(&args.aws.region).await;
    let queue = SqsRequestQueue::new(aws_sdk_sqs::Client::new(&sdk), &args.image_queue);
    queue.send(&body).await?;
    tracing::info!(
        image_id = %request.image_id,
        queue = %args.image_queue,
        "submitted image request"
    );
    Ok(())
}
