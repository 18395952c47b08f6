use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{AlertEvent, DeviceStatus, DeviceType, TelemetryRecord};
use crate::error::DecodeError;
use crate::ports::{DeviceInfo, DeviceRegistry, MessageBroker};
use crate::service::aggregator::Aggregator;
use crate::service::decoder::{decode, DecodeContext};
use crate::service::evaluator::evaluate;
use crate::service::notification::NotificationEngine;
use crate::service::worker_pool::RawIngestMessage;
use crate::state::config_manager::ConfigManager;
use crate::state::device_cache::DeviceStatusCache;

pub const ALERTS_TOPIC: &str = "device-alerts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Telemetry,
    Status,
}

/// Site/device addressing pulled out of an inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    pub site_id: String,
    pub device_id: String,
    /// Device-type tag carried by the topic, if any.
    pub category: Option<String>,
    pub kind: TopicKind,
}

/// Accepts `…/sites/{site}/devices/{device}/telemetry[/{category}]`,
/// `…/sites/{site}/devices/{device}/status` and the short form
/// `ecogrid/site{N}/{type}/{id}`.
pub fn parse_topic(topic: &str) -> Option<TopicRoute> {
    let parts: Vec<&str> = topic.split('/').collect();

    if let Some(i) = parts.iter().position(|p| *p == "sites") {
        let site_id = parts.get(i + 1).filter(|s| !s.is_empty())?;
        if parts.get(i + 2) != Some(&"devices") {
            return None;
        }
        let device_id = parts.get(i + 3).filter(|s| !s.is_empty())?;
        let (kind, category) = match parts.get(i + 4) {
            Some(&"telemetry") => (
                TopicKind::Telemetry,
                parts.get(i + 5).filter(|c| !c.is_empty()).map(|c| c.to_string()),
            ),
            Some(&"status") => (TopicKind::Status, None),
            _ => return None,
        };
        return Some(TopicRoute {
            site_id: site_id.to_string(),
            device_id: device_id.to_string(),
            category,
            kind,
        });
    }

    // Short form: the device key is built from the type, site number and id.
    if parts.len() == 4 && parts[0] == "ecogrid" {
        let site_number = parts[1].strip_prefix("site").filter(|n| !n.is_empty())?;
        let (tag, id) = (parts[2], parts[3]);
        if tag.is_empty() || id.is_empty() {
            return None;
        }
        return Some(TopicRoute {
            site_id: site_number.to_string(),
            device_id: format!("{}-SITE{}-{}", tag.to_ascii_uppercase(), site_number, id),
            category: Some(tag.to_string()),
            kind: TopicKind::Telemetry,
        });
    }

    None
}

/// Per-message pipeline: decode, cache, evaluate, publish, aggregate.
pub struct ServiceProcessor {
    cache: Arc<DeviceStatusCache>,
    config_manager: Arc<ConfigManager>,
    registry: Arc<dyn DeviceRegistry>,
    broker: Arc<dyn MessageBroker>,
    aggregator: Arc<Aggregator>,
    notifications: Arc<NotificationEngine>,
}

impl ServiceProcessor {
    pub fn new(
        cache: Arc<DeviceStatusCache>,
        config_manager: Arc<ConfigManager>,
        registry: Arc<dyn DeviceRegistry>,
        broker: Arc<dyn MessageBroker>,
        aggregator: Arc<Aggregator>,
        notifications: Arc<NotificationEngine>,
    ) -> Self {
        Self { cache, config_manager, registry, broker, aggregator, notifications }
    }

    /// Process one inbound message.
    ///
    /// Returns the decoded record for telemetry, `None` for status updates.
    /// Decode failures come back as [`DecodeError`] inside the `anyhow`
    /// error so the caller can label and dead-letter them. Everything after
    /// the cache update is best effort: publish and aggregation failures are
    /// logged and do not fail the message.
    #[instrument(
        skip(self, payload, received_at),
        fields(
            topic = %topic,
            payload_len = payload.len(),
            device_id = tracing::field::Empty,
            site_id = tracing::field::Empty
        )
    )]
    pub async fn process_ingest_logic(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: OffsetDateTime,
    ) -> anyhow::Result<Option<TelemetryRecord>> {
        let route = parse_topic(topic).ok_or_else(|| DecodeError::UnroutableTopic(topic.to_string()))?;

        let span = tracing::Span::current();
        span.record("device_id", &route.device_id.as_str());
        span.record("site_id", &route.site_id.as_str());

        if route.kind == TopicKind::Status {
            self.apply_status(&route, payload).await?;
            return Ok(None);
        }

        let (device_type, registry_info) = self.resolve_type(&route).await;
        let ctx = DecodeContext {
            device_id: &route.device_id,
            site_id: &route.site_id,
            device_type: &device_type,
            received_at,
            rated_capacity: registry_info.as_ref().and_then(|d| d.rated_capacity),
        };
        let record = decode(&ctx, payload)?;
        metrics::counter!("telemetry_decoded_total", 1, "device_type" => record.device_type.category().to_string());

        let snapshot = self.cache.upsert(&record);
        let stale = record.timestamp < snapshot.last_seen;

        let thresholds = self.config_manager.thresholds_for(&record.device_type);
        let alerts = evaluate(&record, &thresholds);
        // The count describes the newest reading; an out-of-order one keeps it.
        if !stale {
            self.cache.set_active_alerts(&record.device_id, alerts.len() as u32);
        }
        for alert in alerts {
            self.emit_alert(alert).await;
        }

        if let Err(e) = self.aggregator.run_pass(&record.site_id, &record.device_type).await {
            warn!("Aggregation pass failed: {:?}", e);
        }

        Ok(Some(record))
    }

    /// Type from the topic tag when it names a known schema, else from the
    /// registry, else the raw tag (which the decoder rejects).
    async fn resolve_type(&self, route: &TopicRoute) -> (DeviceType, Option<DeviceInfo>) {
        let from_topic = route.category.as_deref().map(DeviceType::from_tag);
        let needs_registry = match &from_topic {
            Some(DeviceType::Storage) => true, // rated capacity fallback
            Some(t) => !t.is_known(),
            None => true,
        };

        let info = if needs_registry {
            match self.registry.lookup(&route.device_id).await {
                Ok(info) => info,
                Err(e) => {
                    warn!("Device registry lookup failed: {:?}", e);
                    None
                }
            }
        } else {
            None
        };

        if let Some(info) = &info {
            if info.site_id != route.site_id {
                debug!(registry_site = %info.site_id, "Topic site differs from registry; using topic");
            }
        }

        let device_type = match from_topic {
            Some(t) if t.is_known() => t,
            other => match &info {
                Some(i) if i.device_type.is_known() => i.device_type.clone(),
                _ => other.unwrap_or_else(|| DeviceType::Unknown(String::new())),
            },
        };
        (device_type, info)
    }

    async fn emit_alert(&self, alert: AlertEvent) {
        metrics::counter!("alerts_triggered_total", 1, "alert_type" => alert.alert_type.clone());
        info!(alert_type = %alert.alert_type, severity = %alert.severity, "{}", alert.message);

        match serde_json::to_vec(&alert) {
            Ok(payload) => {
                if let Err(e) = self.broker.publish(ALERTS_TOPIC, payload).await {
                    error!("Failed to publish alert: {:?}", e);
                }
            }
            Err(e) => error!("Failed to serialize alert: {:?}", e),
        }

        let engine = self.notifications.clone();
        tokio::spawn(async move {
            engine.process(&alert, OffsetDateTime::now_utc()).await;
        });
    }

    /// Operator status override, payload `{"status": "MAINTENANCE"}` or a
    /// bare status string.
    async fn apply_status(&self, route: &TopicRoute, payload: &[u8]) -> anyhow::Result<()> {
        let raw = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => map.get("status").and_then(Value::as_str).map(str::to_string),
            Ok(Value::String(s)) => Some(s),
            _ => Some(String::from_utf8_lossy(payload).trim().to_string()),
        };
        let status: DeviceStatus = raw
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|e: String| DecodeError::Malformed(e))?;

        match self.cache.set_status(&route.device_id, status) {
            Some(snapshot) => {
                info!(status = %status, "Device status overridden");
                if let Err(e) = self.aggregator.run_pass(&snapshot.site_id, &snapshot.device_type).await {
                    warn!("Aggregation pass failed: {:?}", e);
                }
            }
            None => debug!("Status update for uncached device ignored"),
        }
        Ok(())
    }
}

/// MQTT ingest loop: subscribes to the inbound filters and hands every
/// publish to the worker pool. Subscriptions are renewed on each ConnAck.
pub async fn run_mqtt_ingest_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic_filters: Vec<String>,
    sender: Sender<RawIngestMessage>,
    mut shutdown_signal: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    for filter in &topic_filters {
        client.subscribe(filter.as_str(), QoS::AtLeastOnce).await?;
    }
    info!("MQTT ingest loop started. Subscribed to {:?}", topic_filters);

    loop {
        tokio::select! {
            change = shutdown_signal.changed() => {
                if change.is_err() || *shutdown_signal.borrow() {
                    info!("Shutdown signal received in MQTT loop.");
                    break;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = RawIngestMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        received_at: OffsetDateTime::now_utc(),
                    };
                    if let Err(e) = sender.send(msg).await {
                        error!("Worker channel closed: {:?}", e);
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected; renewing subscriptions");
                    for filter in &topic_filters {
                        client.subscribe(filter.as_str(), QoS::AtLeastOnce).await?;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {:?}. Reconnecting...", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    info!("MQTT ingest loop exited.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryDeliveryStore, InMemoryDirectory, StaticRegistry};
    use crate::domain::{CategoryAggregate, Severity};
    use crate::service::delta::{DeltaPublisher, DEFAULT_CHANGE_THRESHOLD};
    use crate::service::notification::NotificationSettings;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::datetime;

    struct MockBroker {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MockBroker {
        fn new() -> Self {
            Self { published: Mutex::new(Vec::new()) }
        }

        fn on(&self, topic: &str) -> Vec<Vec<u8>> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MessageBroker for MockBroker {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    struct Fixture {
        processor: ServiceProcessor,
        broker: Arc<MockBroker>,
        cache: Arc<DeviceStatusCache>,
        aggregator: Arc<Aggregator>,
        registry: Arc<StaticRegistry>,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(MockBroker::new());
        let cache = Arc::new(DeviceStatusCache::new(10));
        let delta = Arc::new(DeltaPublisher::new(broker.clone(), DEFAULT_CHANGE_THRESHOLD));
        let aggregator = Arc::new(Aggregator::new(cache.clone(), broker.clone(), delta, Duration::from_secs(5)));
        let notifications = Arc::new(NotificationEngine::new(
            Arc::new(InMemoryDirectory::new()),
            Arc::new(InMemoryDeliveryStore::new()),
            Vec::new(),
            NotificationSettings::default(),
        ));
        let registry = Arc::new(StaticRegistry::new());
        let processor = ServiceProcessor::new(
            cache.clone(),
            Arc::new(ConfigManager::new(None)),
            registry.clone(),
            broker.clone(),
            aggregator.clone(),
            notifications,
        );
        Fixture { processor, broker, cache, aggregator, registry }
    }

    #[test]
    fn test_parse_structured_topic() {
        let route = parse_topic("$share/ingest/ecogrid/sites/7/devices/BMS-001/telemetry/bms").unwrap();
        assert_eq!(route.site_id, "7");
        assert_eq!(route.device_id, "BMS-001");
        assert_eq!(route.category.as_deref(), Some("bms"));
        assert_eq!(route.kind, TopicKind::Telemetry);

        let bare = parse_topic("ecogrid/sites/7/devices/BMS-001/telemetry").unwrap();
        assert_eq!(bare.category, None);

        let status = parse_topic("ecogrid/sites/7/devices/BMS-001/status").unwrap();
        assert_eq!(status.kind, TopicKind::Status);
    }

    #[test]
    fn test_parse_short_topic() {
        let route = parse_topic("ecogrid/site2/ev/003").unwrap();
        assert_eq!(route.site_id, "2");
        assert_eq!(route.device_id, "EV-SITE2-003");
        assert_eq!(route.category.as_deref(), Some("ev"));
    }

    #[test]
    fn test_parse_rejects_unroutable() {
        assert!(parse_topic("users/u1/devices/d1/telemetry").is_none());
        assert!(parse_topic("ecogrid/sites/7/telemetry").is_none());
        assert!(parse_topic("ecogrid/site/bms/001").is_none());
    }

    #[tokio::test]
    async fn test_storage_message_end_to_end() {
        let f = fixture();
        let payload = br#"{"timestamp":"2024-03-01T12:00:00Z","soc":45,"nominalCapacity":50,"remainingCapacity":22.5,"temperature":50}"#;

        let record = f
            .processor
            .process_ingest_logic("ecogrid/sites/1/devices/BMS-001/telemetry/bms", payload, datetime!(2024-03-01 12:00:05 UTC))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.device_type, DeviceType::Storage);

        let alerts: Vec<AlertEvent> = f
            .broker
            .on(ALERTS_TOPIC)
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect();
        assert_eq!(alerts.len(), 1, "only HIGH_TEMPERATURE should fire");
        assert_eq!(alerts[0].alert_type, "HIGH_TEMPERATURE");
        assert_eq!(alerts[0].severity, Severity::High);
        assert_eq!(alerts[0].actual_value, Some(50.0));

        let snap = f.cache.get("BMS-001").unwrap();
        assert_eq!(snap.status, DeviceStatus::Online);
        assert_eq!(snap.number("temperature"), Some(50.0));
        assert_eq!(snap.active_alerts, 1);

        assert_eq!(f.broker.on("site-bms-aggregation").len(), 1);
        assert_eq!(f.broker.on("sites/1/dashboard").len(), 1);
        match f.aggregator.aggregate("1", &DeviceType::Storage, OffsetDateTime::now_utc()).unwrap().aggregate {
            CategoryAggregate::Storage(s) => assert!((s.avg_soc - 45.0).abs() < 1e-9),
            other => panic!("unexpected aggregate {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registry_resolves_type_and_capacity() {
        let f = fixture();
        f.registry.register(DeviceInfo {
            device_id: "BMS-9".into(),
            site_id: "3".into(),
            device_type: DeviceType::Storage,
            rated_capacity: Some(100.0),
        });

        let payload = br#"{"soc":60,"remainingCapacity":60}"#;
        let record = f
            .processor
            .process_ingest_logic("ecogrid/sites/3/devices/BMS-9/telemetry", payload, datetime!(2024-03-01 12:00 UTC))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.device_type, DeviceType::Storage);
        assert_eq!(record.get_value("nominalCapacity"), Some(100.0));
        assert_eq!(record.timestamp, datetime!(2024-03-01 12:00 UTC));
    }

    #[tokio::test]
    async fn test_unknown_type_is_a_decode_error() {
        let f = fixture();
        let err = f
            .processor
            .process_ingest_logic("ecogrid/sites/1/devices/X-1/telemetry/windmill", b"{}", OffsetDateTime::now_utc())
            .await
            .unwrap_err();

        match err.downcast_ref::<DecodeError>() {
            Some(DecodeError::UnsupportedDeviceType { tag, .. }) => assert_eq!(tag, "windmill"),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(f.cache.get("X-1").is_none());
    }

    #[tokio::test]
    async fn test_status_topic_overrides_cached_status() {
        let f = fixture();
        let payload = br#"{"currentOutput":120.0}"#;
        f.processor
            .process_ingest_logic("ecogrid/sites/1/devices/PV-1/telemetry/solar", payload, OffsetDateTime::now_utc())
            .await
            .unwrap();

        let out = f
            .processor
            .process_ingest_logic("ecogrid/sites/1/devices/PV-1/status", br#"{"status":"MAINTENANCE"}"#, OffsetDateTime::now_utc())
            .await
            .unwrap();

        assert!(out.is_none());
        assert_eq!(f.cache.get("PV-1").unwrap().status, DeviceStatus::Maintenance);
        assert_eq!(f.broker.on("site-solar-aggregation").len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_record_keeps_newer_alert_count() {
        let f = fixture();
        let topic = "ecogrid/sites/1/devices/BMS-002/telemetry/bms";
        let newer = br#"{"timestamp":"2024-03-01T12:05:00Z","soc":45,"nominalCapacity":50,"remainingCapacity":22.5,"temperature":30}"#;
        let older = br#"{"timestamp":"2024-03-01T12:00:00Z","soc":45,"nominalCapacity":50,"remainingCapacity":22.5,"temperature":50}"#;
        let received = datetime!(2024-03-01 12:05:10 UTC);

        f.processor.process_ingest_logic(topic, newer, received).await.unwrap();
        f.processor.process_ingest_logic(topic, older, received).await.unwrap();

        // The late reading still raises its alert ...
        assert_eq!(f.broker.on(ALERTS_TOPIC).len(), 1);
        // ... but does not overwrite what the newest reading says.
        let snap = f.cache.get("BMS-002").unwrap();
        assert_eq!(snap.active_alerts, 0);
        assert_eq!(snap.last_seen, datetime!(2024-03-01 12:05 UTC));
    }
}
