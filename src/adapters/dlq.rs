use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, instrument};

use crate::ports::{DlqRepository, MessageBroker};

/// Envelope written for every rejected message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub original_topic: String,
    pub error: String,
    pub timestamp: String,
    pub payload_base64: String,
}

impl DlqEnvelope {
    pub fn new(original_topic: String, payload: &[u8], error: String) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| OffsetDateTime::now_utc().to_string());
        Self {
            original_topic,
            error,
            timestamp,
            payload_base64: general_purpose::STANDARD.encode(payload),
        }
    }

    pub fn payload(&self) -> anyhow::Result<Vec<u8>> {
        Ok(general_purpose::STANDARD.decode(&self.payload_base64)?)
    }
}

/// Dead-letters onto a topic of the outbound broker.
pub struct BrokerDlq {
    broker: Arc<dyn MessageBroker>,
    topic: String,
}

impl BrokerDlq {
    pub fn new(broker: Arc<dyn MessageBroker>, topic: &str) -> Self {
        info!("DLQ publishing to topic: {}", topic);
        Self { broker, topic: topic.to_string() }
    }
}

#[async_trait]
impl DlqRepository for BrokerDlq {
    #[instrument(skip(self, payload, error_msg), fields(topic = %original_topic))]
    async fn send_to_dlq(&self, original_topic: String, payload: Vec<u8>, error_msg: String) -> anyhow::Result<()> {
        let envelope = DlqEnvelope::new(original_topic, &payload, error_msg);
        self.broker.publish(&self.topic, serde_json::to_vec(&envelope)?).await
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaDlqProducer;

#[cfg(feature = "kafka")]
mod kafka {
    use super::DlqEnvelope;
    use crate::ports::DlqRepository;
    use anyhow::Context;
    use async_trait::async_trait;
    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use std::time::Duration;
    use tracing::{info, instrument};

    pub struct KafkaDlqProducer {
        producer: FutureProducer,
        topic: String,
    }

    impl KafkaDlqProducer {
        pub fn new(brokers: &str, topic: &str) -> anyhow::Result<Self> {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("message.timeout.ms", "5000")
                .create()
                .context("DLQ producer creation failed")?;

            info!("DLQ Producer initialized for topic: {}", topic);
            Ok(Self { producer, topic: topic.to_string() })
        }
    }

    #[async_trait]
    impl DlqRepository for KafkaDlqProducer {
        #[instrument(skip(self, payload, error_msg), fields(topic = %original_topic))]
        async fn send_to_dlq(&self, original_topic: String, payload: Vec<u8>, error_msg: String) -> anyhow::Result<()> {
            let envelope = DlqEnvelope::new(original_topic.clone(), &payload, error_msg);
            let json_bytes = serde_json::to_vec(&envelope)?;

            // Keyed by source topic so one device's rejects stay in one partition.
            let record = FutureRecord::to(&self.topic).payload(&json_bytes).key(&original_topic);

            match self.producer.send(record, Duration::from_secs(0)).await {
                Ok(_) => Ok(()),
                Err((e, _)) => Err(anyhow::anyhow!("Failed to produce to DLQ: {:?}", e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockBroker {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl MessageBroker for MockBroker {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_envelope_keeps_payload_intact() {
        let broker = Arc::new(MockBroker { published: Mutex::new(Vec::new()) });
        let dlq = BrokerDlq::new(broker.clone(), "telemetry-dlq");
        let raw = vec![0xff, 0x00, b'{'];

        dlq.send_to_dlq("ecogrid/sites/1/devices/X/telemetry/wind".into(), raw.clone(), "unsupported".into())
            .await
            .unwrap();

        let published = broker.published.lock().unwrap();
        assert_eq!(published[0].0, "telemetry-dlq");
        let envelope: DlqEnvelope = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(envelope.original_topic, "ecogrid/sites/1/devices/X/telemetry/wind");
        assert_eq!(envelope.error, "unsupported");
        assert_eq!(envelope.payload().unwrap(), raw);
    }
}
