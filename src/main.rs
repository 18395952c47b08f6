use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use ems_ingestor::adapters::memory::{InMemoryDeliveryStore, InMemoryDirectory, StaticRegistry};
use ems_ingestor::adapters::postgres::{PgDeliveryStore, PgDeviceRegistry, PgNotificationDirectory};
use ems_ingestor::adapters::{BrokerDlq, EmailSender, MqttAdapter, PushSender};
use ems_ingestor::config::AppConfig;
use ems_ingestor::ports::{DeliveryStore, DeviceRegistry, DlqRepository, MessageBroker, NotificationDirectory, NotificationSender};
use ems_ingestor::service::aggregator::Aggregator;
use ems_ingestor::service::delta::DeltaPublisher;
use ems_ingestor::service::notification::{NotificationEngine, NotificationSettings};
use ems_ingestor::service::processor::{run_mqtt_ingest_loop, ServiceProcessor};
use ems_ingestor::service::scheduler::{run_liveness_loop, run_retry_loop};
use ems_ingestor::service::worker_pool::{RawIngestMessage, WorkerPool};
use ems_ingestor::state::config_manager::ConfigManager;
use ems_ingestor::state::device_cache::DeviceStatusCache;
use ems_ingestor::telemetry::{init_telemetry, shutdown_telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Configuration (also loads .env)
    let config = AppConfig::load().context("Failed to load configuration")?;

    // 2. Structured logging (+ OTLP when built with it)
    init_telemetry("ems-ingestor", config.otlp_endpoint.as_deref())?;
    info!("Starting EMS telemetry ingestor (instance {})...", config.instance_id);

    // 3. Metrics
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .idle_timeout(metrics_util::MetricKindMask::ALL, Some(std::time::Duration::from_secs(60)))
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {:?}", e))?;
    info!("Prometheus Metrics listening on 0.0.0.0:{}", config.metrics_port);

    // 4. Database (optional)
    let pool = match &config.database_url {
        Some(url) => {
            info!("Connecting to Database...");
            let pool = PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .connect(url)
                .await
                .context("Failed to connect to DB")?;
            info!("Database connection established.");
            Some(pool)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory rule, preference and delivery stores");
            None
        }
    };

    // 5. Thresholds: defaults, then database, then file
    let config_manager = Arc::new(ConfigManager::new(pool.clone()));
    config_manager.load_all().await.context("Failed to load device-type thresholds")?;
    if let Some(path) = &config.thresholds_file {
        config_manager.load_file(path)?;
    }

    // 6. Stores
    let (directory, store, registry): (Arc<dyn NotificationDirectory>, Arc<dyn DeliveryStore>, Arc<dyn DeviceRegistry>) =
        match &pool {
            Some(pool) => (
                Arc::new(PgNotificationDirectory::new(pool.clone(), config.rules_cache_ttl)),
                Arc::new(PgDeliveryStore::new(pool.clone())),
                Arc::new(PgDeviceRegistry::new(pool.clone())),
            ),
            None => {
                let directory = match &config.notification_seed_file {
                    Some(path) => InMemoryDirectory::from_file(path)?,
                    None => InMemoryDirectory::new(),
                };
                (Arc::new(directory), Arc::new(InMemoryDeliveryStore::new()), Arc::new(StaticRegistry::new()))
            }
        };

    // 7. Outbound broker (MQTT) and dead-letter queue
    let (mqtt_client, eventloop) = MqttAdapter::build(&config);
    let broker: Arc<dyn MessageBroker> = Arc::new(MqttAdapter::new(mqtt_client.clone()));
    let dlq = build_dlq(&config, broker.clone())?;

    // 8. Notification channels
    let mut senders: Vec<Arc<dyn NotificationSender>> = vec![Arc::new(PushSender::new(broker.clone()))];
    match &config.smtp {
        Some(smtp) => senders.push(Arc::new(EmailSender::new(smtp)?)),
        None => warn!("SMTP_HOST not set; email notifications disabled"),
    }
    let notifications = Arc::new(NotificationEngine::new(
        directory,
        store,
        senders,
        NotificationSettings {
            retry_backoff: config.retry_backoff,
            max_retries: config.max_retries,
            send_timeout: config.send_timeout,
        },
    ));

    // 9. Pipeline
    let cache = Arc::new(DeviceStatusCache::new(config.uptime_window));
    let delta = Arc::new(DeltaPublisher::new(broker.clone(), config.delta_change_threshold));
    let aggregator = Arc::new(Aggregator::new(cache.clone(), broker.clone(), delta, config.aggregation_timeout));
    let processor = Arc::new(ServiceProcessor::new(
        cache.clone(),
        config_manager,
        registry,
        broker,
        aggregator.clone(),
        notifications.clone(),
    ));

    let (raw_tx, raw_rx) = tokio::sync::mpsc::channel(config.ingest_channel_capacity);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // 10. Background tasks
    let worker_pool = WorkerPool::new(processor, dlq, config.worker_lanes, config.lane_capacity);
    let worker_handle = tokio::spawn(worker_pool.run(raw_rx));

    let mut ingest_handles = Vec::new();
    let filters = vec![config.telemetry_topic.clone(), config.status_topic.clone()];
    let mqtt_tx = raw_tx.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    ingest_handles.push(tokio::spawn(async move {
        if let Err(e) = run_mqtt_ingest_loop(eventloop, mqtt_client, filters, mqtt_tx, mqtt_shutdown).await {
            error!("MQTT Ingest Loop Error: {:?}", e);
        }
    }));

    if let Some(handle) = spawn_kafka_ingest(&config, raw_tx.clone(), shutdown_rx.clone())? {
        ingest_handles.push(handle);
    }
    // Workers stop once every ingest loop has dropped its sender.
    drop(raw_tx);

    let liveness_handle = tokio::spawn(run_liveness_loop(
        cache,
        aggregator,
        config.liveness_window,
        config.sweep_interval,
        shutdown_rx.clone(),
    ));
    let retry_handle = tokio::spawn(run_retry_loop(notifications, config.retry_scan_interval, shutdown_rx));

    info!("System Running. Press Ctrl+C to stop.");

    // 11. Shutdown
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown Signal Received..."),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }
    let _ = shutdown_tx.send(true);

    for handle in ingest_handles {
        let _ = handle.await;
    }
    let _ = tokio::join!(liveness_handle, retry_handle);

    info!("Waiting for workers to drain...");
    match tokio::time::timeout(config.shutdown_timeout, worker_handle).await {
        Ok(_) => info!("Workers drained."),
        Err(_) => warn!("Timeout waiting for workers."),
    }

    shutdown_telemetry();
    info!("Shutdown Complete.");
    Ok(())
}

#[cfg(feature = "kafka")]
fn build_dlq(config: &AppConfig, broker: Arc<dyn MessageBroker>) -> anyhow::Result<Arc<dyn DlqRepository>> {
    let dlq: Arc<dyn DlqRepository> = match &config.kafka_brokers {
        Some(brokers) => Arc::new(ems_ingestor::adapters::dlq::KafkaDlqProducer::new(brokers, &config.dlq_topic)?),
        None => Arc::new(BrokerDlq::new(broker, &config.dlq_topic)),
    };
    Ok(dlq)
}

#[cfg(not(feature = "kafka"))]
fn build_dlq(config: &AppConfig, broker: Arc<dyn MessageBroker>) -> anyhow::Result<Arc<dyn DlqRepository>> {
    Ok(Arc::new(BrokerDlq::new(broker, &config.dlq_topic)))
}

#[cfg(feature = "kafka")]
fn spawn_kafka_ingest(
    config: &AppConfig,
    sender: Sender<RawIngestMessage>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Option<JoinHandle<()>>> {
    let Some(brokers) = &config.kafka_brokers else {
        return Ok(None);
    };
    info!("Initializing Kafka Consumer (Brokers: {}, Topic: {})...", brokers, config.kafka_topic);
    let kafka = ems_ingestor::adapters::KafkaAdapter::new(brokers, &config.kafka_group, &config.kafka_topic)?;
    Ok(Some(tokio::spawn(async move {
        if let Err(e) = kafka.run_loop(sender, shutdown).await {
            error!("Kafka Ingest Loop Error: {:?}", e);
        }
    })))
}

#[cfg(not(feature = "kafka"))]
fn spawn_kafka_ingest(
    config: &AppConfig,
    _sender: Sender<RawIngestMessage>,
    _shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Option<JoinHandle<()>>> {
    if config.kafka_brokers.is_some() {
        warn!("KAFKA_BROKERS set but built without the kafka feature; ingesting from MQTT only");
    }
    Ok(None)
}
