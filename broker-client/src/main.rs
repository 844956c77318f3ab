use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use broker_client::config::{Config, Mode};
use broker_client::kafka::{ConsumeError, ConsumptionLoop, LoopSummary, ProducerClient};
use broker_client::sink::{DeliverySink, LoggingSink};
use envconfig::Envconfig;
use futures::future::join_all;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PRODUCER_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "broker_client=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::init_from_env().context("failed to load configuration")?;
    info!("Configuration loaded: {:?}", config);

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("failed to install prometheus exporter")?;
    info!("Metrics server listening on {}", metrics_addr);

    match config.mode {
        Mode::Consume => consume(&config).await,
        Mode::Produce => produce(&config).await,
    }
}

async fn consume(config: &Config) -> Result<()> {
    let sink: Arc<dyn DeliverySink> = Arc::new(LoggingSink);
    let loop_count = config.partitions.max(1);

    let mut shutdown_senders = Vec::with_capacity(loop_count);
    let mut handles = Vec::with_capacity(loop_count);
    for index in 0..loop_count {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumption_loop = ConsumptionLoop::connect(
            &config.kafka,
            &config.consumer,
            &config.topic,
            sink.clone(),
            shutdown_rx,
        )
        .with_context(|| format!("failed to start consumption loop {index}"))?;

        shutdown_senders.push(shutdown_tx);
        handles.push(tokio::spawn(consumption_loop.run()));
    }
    info!(
        loops = loop_count,
        topic = config.topic.as_str(),
        "Started consumption loops"
    );

    let all_loops = join_all(handles);
    tokio::pin!(all_loops);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl-C, stopping anyway: {e}");
            }
            info!("Stopping consumption loops");
            for shutdown_tx in shutdown_senders {
                if shutdown_tx.send(()).is_err() {
                    debug!("Consumption loop already stopped");
                }
            }
        }
        results = &mut all_loops => {
            report_loops(results);
            return Ok(());
        }
    }

    report_loops(all_loops.await);
    Ok(())
}

fn report_loops(results: Vec<Result<Result<LoopSummary, ConsumeError>, JoinError>>) {
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(Ok(summary)) => info!(
                loop_index = index,
                delivered = summary.records_delivered,
                commits = summary.commits,
                recoveries = summary.commit_conflicts,
                "Consumption loop finished"
            ),
            Ok(Err(e)) => error!(loop_index = index, "Consumption loop failed: {e}"),
            Err(e) => error!(loop_index = index, "Consumption loop task failed: {e}"),
        }
    }
}

async fn produce(config: &Config) -> Result<()> {
    let producer = ProducerClient::connect(&config.kafka, &config.producer, &config.topic)
        .context("failed to start producer")?;
    info!(
        topic = producer.topic(),
        async_calls = producer.is_async(),
        "Sending one message per line of standard input"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read standard input")?
    {
        if line.is_empty() {
            continue;
        }
        match producer.send(&line).await {
            Ok(receipt) => debug!(?receipt, "Message sent"),
            Err(e) => error!("Failed to send message: {e}"),
        }
    }

    producer
        .close(PRODUCER_CLOSE_TIMEOUT)
        .context("failed to flush producer")?;
    Ok(())
}
