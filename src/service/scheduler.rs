//! Interval-driven background work: the liveness sweep and the notification
//! retry scanner.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::domain::DeviceType;
use crate::service::aggregator::Aggregator;
use crate::service::notification::NotificationEngine;
use crate::state::device_cache::DeviceStatusCache;

/// Mark silent devices OFFLINE and re-aggregate every site that changed.
/// Returns the number of devices that went offline.
pub async fn sweep_once(
    cache: &DeviceStatusCache,
    aggregator: &Aggregator,
    window: Duration,
    now: OffsetDateTime,
) -> usize {
    let offline = cache.sweep_offline(window, now);

    let stats = cache.stats();
    metrics::gauge!("device_cache_size", stats.cached_devices as f64);
    if offline.is_empty() {
        return 0;
    }
    metrics::counter!("devices_marked_offline_total", offline.len() as u64);

    let mut passes: HashSet<(String, DeviceType)> = HashSet::new();
    for (device_id, site_id) in &offline {
        if let Some(snapshot) = cache.get(device_id) {
            passes.insert((site_id.clone(), snapshot.device_type));
        }
    }
    for (site_id, device_type) in passes {
        if let Err(e) = aggregator.run_pass(&site_id, &device_type).await {
            warn!(site_id, "Aggregation after liveness sweep failed: {:?}", e);
        }
    }
    offline.len()
}

pub async fn run_liveness_loop(
    cache: Arc<DeviceStatusCache>,
    aggregator: Arc<Aggregator>,
    window: Duration,
    interval: Duration,
    mut shutdown_signal: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("Liveness sweep every {:?} (window {:?})", interval, window);

    loop {
        tokio::select! {
            change = shutdown_signal.changed() => {
                if change.is_err() || *shutdown_signal.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let n = sweep_once(&cache, &aggregator, window, OffsetDateTime::now_utc()).await;
                if n > 0 {
                    info!("{} devices marked OFFLINE", n);
                }
            }
        }
    }
    info!("Liveness loop exited.");
}

pub async fn run_retry_loop(
    engine: Arc<NotificationEngine>,
    interval: Duration,
    mut shutdown_signal: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            change = shutdown_signal.changed() => {
                if change.is_err() || *shutdown_signal.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let retried = engine.retry_due(OffsetDateTime::now_utc()).await;
                metrics::gauge!("notification_retry_queue", engine.pending_retries() as f64);
                if !retried.is_empty() {
                    info!("Retried {} notification deliveries", retried.len());
                }
            }
        }
    }
    info!("Retry loop exited.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::SolarReadings;
    use crate::domain::{DeviceStatus, Readings, TelemetryRecord};
    use crate::ports::MessageBroker;
    use crate::service::delta::{DeltaPublisher, DEFAULT_CHANGE_THRESHOLD};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::datetime;

    struct MockBroker {
        topics: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageBroker for MockBroker {
        async fn publish(&self, topic: &str, _payload: Vec<u8>) -> anyhow::Result<()> {
            self.topics.lock().unwrap().push(topic.to_string());
            Ok(())
        }
    }

    fn solar(device_id: &str, at: OffsetDateTime) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.into(),
            site_id: "4".into(),
            device_type: DeviceType::Solar,
            timestamp: at,
            readings: Readings::Solar(SolarReadings {
                current_output: 80.0,
                energy_yield: None,
                energy_yield_total: None,
                panel_temperature: None,
                irradiance: None,
                ambient_temperature: None,
                wind_speed: None,
                inverter_efficiency: None,
                system_efficiency: None,
                performance_ratio: None,
                inverter_status: None,
            }),
            quality: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_marks_offline_and_reaggregates_site() {
        let broker = Arc::new(MockBroker { topics: Mutex::new(Vec::new()) });
        let cache = Arc::new(DeviceStatusCache::new(10));
        let delta = Arc::new(DeltaPublisher::new(broker.clone(), DEFAULT_CHANGE_THRESHOLD));
        let aggregator = Aggregator::new(cache.clone(), broker.clone(), delta, Duration::from_secs(5));

        cache.upsert(&solar("PV-old", datetime!(2024-03-01 11:00 UTC)));
        cache.upsert(&solar("PV-new", datetime!(2024-03-01 11:59 UTC)));

        let n = sweep_once(&cache, &aggregator, Duration::from_secs(300), datetime!(2024-03-01 12:00 UTC)).await;

        assert_eq!(n, 1);
        assert_eq!(cache.get("PV-old").unwrap().status, DeviceStatus::Offline);
        assert_eq!(cache.get("PV-new").unwrap().status, DeviceStatus::Online);
        let topics = broker.topics.lock().unwrap();
        assert!(topics.contains(&"site-solar-aggregation".to_string()));
        assert!(topics.contains(&"site-metrics".to_string()));
    }
}
