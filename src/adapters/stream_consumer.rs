//! Kafka ingest and publish, for deployments that bridge MQTT into Kafka.

use anyhow::Context;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::ports::MessageBroker;
use crate::service::worker_pool::RawIngestMessage;

pub struct KafkaAdapter {
    consumer: StreamConsumer,
    topic: String,
}

/// Wrapper the MQTT-to-Kafka bridge puts around each publish.
#[derive(serde::Deserialize, Debug)]
struct BridgeMessage {
    topic: String,
    payload: serde_json::Value, // string or object
}

/// Original MQTT topic and payload bytes from a bridged record.
fn unwrap_bridge(bytes: &[u8]) -> Option<(String, Vec<u8>)> {
    let bridged: BridgeMessage = serde_json::from_slice(bytes).ok()?;
    let payload = match bridged.payload {
        serde_json::Value::String(s) => s.into_bytes(),
        v => serde_json::to_vec(&v).ok()?,
    };
    Some((bridged.topic, payload))
}

impl KafkaAdapter {
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> anyhow::Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .context("Kafka consumer creation failed")?;

        Ok(Self { consumer, topic: topic.to_string() })
    }

    #[instrument(skip(self, sender, shutdown_signal), fields(topic = %self.topic))]
    pub async fn run_loop(
        &self,
        sender: Sender<RawIngestMessage>,
        mut shutdown_signal: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.consumer
            .subscribe(&[&self.topic])
            .with_context(|| format!("subscribing to {}", self.topic))?;
        info!("Kafka Consumer started. Subscribed to {}", self.topic);

        loop {
            tokio::select! {
                change = shutdown_signal.changed() => {
                    if change.is_err() || *shutdown_signal.borrow() {
                        info!("Shutdown Signal Received in Kafka Loop.");
                        break;
                    }
                }
                res = self.consumer.recv() => match res {
                    Err(e) => error!("Kafka error: {}", e),
                    Ok(m) => {
                        let Some(bytes) = m.payload() else { continue };
                        // Without the original topic there is no site/device to route by.
                        let Some((topic, payload)) = unwrap_bridge(bytes) else {
                            warn!("Received non-bridge format message. Skipping.");
                            continue;
                        };
                        let msg = RawIngestMessage { topic, payload, received_at: OffsetDateTime::now_utc() };
                        if let Err(e) = sender.send(msg).await {
                            error!("Channel closed: {:?}", e);
                            break;
                        }
                    }
                }
            }
        }

        info!("Kafka Loop Exited.");
        Ok(())
    }
}

/// Outbound events on Kafka topics named like the MQTT ones.
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn new(brokers: &str) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("Kafka producer creation failed")?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl MessageBroker for KafkaProducer {
    #[instrument(skip(self, payload), fields(topic = %topic, payload_size = payload.len()))]
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        // Kafka topic names cannot carry '/'.
        let kafka_topic = topic.replace('/', ".");
        let record: FutureRecord<'_, (), Vec<u8>> = FutureRecord::to(&kafka_topic).payload(&payload);
        match self.producer.send(record, Duration::from_secs(0)).await {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(anyhow::anyhow!("Kafka publish to {} failed: {:?}", kafka_topic, e)),
        }
    }
}
