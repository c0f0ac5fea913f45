//! kafka-canary - synthetic Kafka canary workload
//!
//! Runs a randomized producer and a fault-injecting consumer group against
//! one topic until SIGTERM or Ctrl-C, with a liveness endpoint for the
//! orchestrator.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use kafka_canary::broker::kafka::{KafkaSender, KafkaSource};
use kafka_canary::broker::memory::MemoryBroker;
use kafka_canary::broker::{MessageSender, MessageSource};
use kafka_canary::consumer::{Consumer, LagMetricObserver};
use kafka_canary::logging::setup_logging;
use kafka_canary::metrics::{EmfPublisher, EmfRecorder, EmfSink, CONSUMER_NAMESPACE};
use kafka_canary::producer::Producer;
use kafka_canary::reporting::{ErrorReporter, TracingReporter};
use kafka_canary::server::{check_liveness, LivenessServer};
use kafka_canary::settings::{Settings, DEFAULT_PORT};
use kafka_canary::workload::Workload;
use kafka_canary::SERVICE_NAME;

mod args;
use args::Args;

/// Partitions per topic of the in-memory broker
const IN_MEMORY_PARTITIONS: i32 = 3;
/// How long to wait for the consumer task after stopping
const CONSUMER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the broker connections for the configured mode
fn broker_clients(args: &Args, settings: &Settings) -> (Arc<dyn MessageSender>, Arc<dyn MessageSource>) {
    if args.in_memory {
        warn!("Running against the in-memory broker");
        let broker = MemoryBroker::new(IN_MEMORY_PARTITIONS);
        let source = broker.source(&settings.consumer.group_id);
        (Arc::new(broker.sender()), Arc::new(source))
    } else {
        info!(brokers = %settings.kafka.host, "Using Kafka brokers");
        (
            Arc::new(KafkaSender::new(&settings.kafka, settings.log_level)),
            Arc::new(KafkaSource::new(
                &settings.kafka,
                &settings.consumer.group_id,
                settings.log_level,
            )),
        )
    }
}

/// Installs the global recorder and starts publishing; `None` when disabled
fn setup_metrics(settings: &Settings) -> Result<Option<Arc<EmfPublisher>>> {
    if !settings.metrics.enabled {
        return Ok(None);
    }
    let handle = EmfRecorder::new().install()?;
    let namespace = settings.metrics.namespace_for(CONSUMER_NAMESPACE);
    info!(
        namespace = %namespace,
        region = %settings.metrics.region,
        "Publishing metrics"
    );
    let publisher = Arc::new(EmfPublisher::new(
        &settings.metrics,
        namespace,
        handle,
        Arc::new(EmfSink::stdout()),
    ));
    publisher.start();
    Ok(Some(publisher))
}

/// Termination signal listeners, installed before the workload starts
struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignal {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        Ok(Self { terminate })
    }

    /// Resolves with the name of the first termination signal received
    async fn recv(&mut self) -> Result<&'static str> {
        tokio::select! {
            _ = self.terminate.recv() => Ok("SIGTERM"),
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("Failed to listen for Ctrl-C")?;
                Ok("SIGINT")
            }
        }
    }
}

#[cfg(not(unix))]
impl ShutdownSignal {
    fn install() -> Result<Self> {
        Ok(Self {})
    }

    async fn recv(&mut self) -> Result<&'static str> {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        Ok("SIGINT")
    }
}

async fn healthcheck(args: &Args) -> Result<()> {
    let port = args
        .port
        .or_else(|| Settings::load(&args.config).ok().map(|s| s.server.port))
        .unwrap_or(DEFAULT_PORT);
    if check_liveness(port).await.unwrap_or(false) {
        Ok(())
    } else {
        Err(anyhow!("Liveness endpoint on port {} is not healthy", port))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.healthcheck {
        return healthcheck(&args).await;
    }

    let mut settings = Settings::load(&args.config)
        .with_context(|| format!("Failed to load settings from {}", args.config.display()))?;
    args.apply_overrides(&mut settings);
    settings.validate().context("Invalid settings")?;
    setup_logging(settings.log_level, settings.log_format)?;
    info!(service = SERVICE_NAME, version = env!("CARGO_PKG_VERSION"), "Starting");

    let mut shutdown = ShutdownSignal::install()?;
    let reporter = Arc::new(TracingReporter::new(&settings.sentry));
    let publisher = setup_metrics(&settings)?;
    let (sender, source) = broker_clients(&args, &settings);

    let producer = Producer::new(sender, settings.producer_config(), reporter.clone())?;
    let consumer = Consumer::new(source, settings.consumer_config(), reporter.clone())?
        .with_observer(Arc::new(LagMetricObserver));
    let workload = Arc::new(Workload::new(
        Arc::new(producer),
        Arc::new(consumer),
        reporter.clone(),
    ));

    let mut running = tokio::spawn({
        let workload = Arc::clone(&workload);
        async move { workload.start().await }
    });

    tokio::select! {
        _ = workload.started() => {}
        outcome = &mut running => {
            // start() already stopped everything it connected
            let startup = outcome.map_err(|e| anyhow!("Workload task failed: {}", e))?;
            return match startup {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!(error = %e, kind = e.kind(), "Encountered error during startup");
                    Err(anyhow!(e).context("Startup failed"))
                }
            };
        }
    }

    let server = match LivenessServer::bind(settings.server.port).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start HTTP server");
            if let Err(stop_error) = workload.stop().await {
                error!(error = %stop_error, "Failed to stop workload");
            }
            return Err(anyhow!(e).context("Failed to bind liveness endpoint"));
        }
    };

    let consumer_outcome = tokio::select! {
        signal = shutdown.recv() => {
            match signal {
                Ok(name) => info!("{} signal received: shutting down", name),
                Err(e) => error!(error = %e, "Lost the termination signal listener: shutting down"),
            }
            None
        }
        outcome = &mut running => Some(outcome),
    };

    let stopped = workload.stop().await;
    if let Err(e) = &stopped {
        error!(error = %e, "Failed to stop workload cleanly");
    }
    if consumer_outcome.is_none()
        && tokio::time::timeout(CONSUMER_DRAIN_TIMEOUT, &mut running)
            .await
            .is_err()
    {
        warn!("Consumer did not finish in time");
        running.abort();
    }

    if let Some(publisher) = &publisher {
        publisher.shutdown().await;
    }
    server.shutdown().await.context("Failed to close HTTP server")?;
    info!("HTTP server closed");
    info!(captured_errors = reporter.captured(), "Shutdown complete");

    match consumer_outcome {
        None | Some(Ok(Ok(()))) => stopped.map_err(Into::into),
        Some(Ok(Err(e))) => {
            error!(error = %e, kind = e.kind(), "Consumer crashed");
            reporter.capture(&e);
            Err(anyhow!(e).context("Consumer crashed"))
        }
        Some(Err(e)) => Err(anyhow!("Workload task failed: {}", e)),
    }
}
