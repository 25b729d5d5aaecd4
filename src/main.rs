use anyhow::Context;
use clap::Parser;
use pg_truck::{Config, Replicator};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-truck")]
#[command(about = "PostgreSQL change-data-capture pipelines", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "truck.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Validate the configuration and exit")]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-truck");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).with_context(|| format!("loading {}", args.config.display()));
        }
    };

    info!(
        connections = config.connections.len(),
        pipelines = config.pipelines.len(),
        checkpoint_schema = %config.replication.checkpoint_schema,
        queue_capacity = config.replication.queue_capacity,
        "Configuration summary"
    );
    for pipeline in &config.pipelines {
        info!(
            pipeline = %pipeline.name,
            input = %pipeline.input,
            output = %pipeline.write.output,
            tables = ?pipeline.tables,
            "Pipeline"
        );
    }

    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let replicator = Replicator::new(config);
    let shutdown = replicator.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
            Err(e) => warn!("Unable to listen for shutdown signal: {}", e),
        }
    });

    replicator.run().await.context("replication failed")?;
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_truck=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_truck=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
