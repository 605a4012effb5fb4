use backq_adapter::{BeanstalkAdapter, QueuePublisher};
use backq_core::PublisherRegistry;
use backq_worker::signals::wait_for_shutdown_signal;
use backq_worker::{DispatchForwarder, ProcessSupervisor, WorkerConfig, WorkerRuntime};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "backq-worker")]
#[command(about = "BackQ background job worker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// Queue to lease jobs from
    #[arg(short, long)]
    queue: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run process messages as child processes
    Process,
    /// Republish serialized messages through configured publishers
    Serialized,
}

impl Command {
    fn kind(self) -> &'static str {
        match self {
            Command::Process => "process",
            Command::Serialized => "serialized",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(args.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.log_json).then(|| tracing_subscriber::fmt::layer().with_target(false)))
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(queue) = args.queue {
        config.queue = queue;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }

    let worker_id = config.generate_worker_id();
    let span = tracing::info_span!(
        "worker",
        kind = args.command.kind(),
        queue = %config.queue,
        worker_id = %worker_id
    );

    // Handle shutdown signals
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            tracing::error!("Could not listen for shutdown signals: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        signal_cancel.cancel();
    });

    let adapter = BeanstalkAdapter::new().with_release_policy(config.runtime.release_policy());
    let runtime = WorkerRuntime::new(
        adapter,
        config.broker.clone(),
        config.queue.clone(),
        config.runtime.clone(),
    )
    .with_cancellation(cancel);

    match args.command {
        Command::Process => {
            ProcessSupervisor::new(runtime, config.process.clone(), span)
                .run()
                .await?
        }
        Command::Serialized => {
            let registry = build_registry(&config);
            tracing::info!("Registered publishers: {:?}", registry.names());
            DispatchForwarder::new(runtime, registry, span).run().await?
        }
    }

    Ok(())
}

fn build_registry(config: &WorkerConfig) -> PublisherRegistry {
    let registry = PublisherRegistry::new();
    for (name, publisher) in &config.publishers {
        let endpoint = publisher.broker.clone().unwrap_or_else(|| config.broker.clone());
        registry.register(
            name.clone(),
            QueuePublisher::new(BeanstalkAdapter::new(), endpoint, publisher.queue.clone()),
        );
    }
    registry
}
