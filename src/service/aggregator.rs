use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::domain::aggregation::{ChargerAggregate, SolarAggregate, StatusCounts, StorageAggregate};
use crate::domain::{AggregationSnapshot, CategoryAggregate, DeviceStatus, DeviceType, SiteMetrics};
use crate::error::CacheMissError;
use crate::ports::MessageBroker;
use crate::service::delta::{DashboardDelta, DeltaPublisher, SiteView};
use crate::state::device_cache::{DeviceSnapshot, DeviceStatusCache};

/// Everything one aggregation pass produced.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub snapshot: Option<AggregationSnapshot>,
    pub metrics: SiteMetrics,
    pub delta: Option<DashboardDelta>,
}

#[derive(Default)]
struct Mean {
    sum: f64,
    n: u32,
}

impl Mean {
    fn add(&mut self, v: Option<f64>) {
        if let Some(v) = v {
            self.sum += v;
            self.n += 1;
        }
    }

    fn get(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }
}

fn count(counts: &mut StatusCounts, status: DeviceStatus) {
    match status {
        DeviceStatus::Online => counts.online += 1,
        DeviceStatus::Offline => counts.offline += 1,
        DeviceStatus::Fault => counts.fault += 1,
        DeviceStatus::Maintenance => counts.maintenance += 1,
    }
}

fn require(snap: &DeviceSnapshot, key: &str) -> Result<f64, CacheMissError> {
    snap.number(key).ok_or_else(|| CacheMissError {
        device_id: snap.device_id.clone(),
        reason: format!("snapshot has no numeric '{}'", key),
    })
}

fn storage_aggregate(devices: &[DeviceSnapshot]) -> StorageAggregate {
    let mut agg = StorageAggregate {
        total_capacity: 0.0,
        remaining_capacity: 0.0,
        avg_soc: 0.0,
        total_charge_rate: 0.0,
        avg_temperature: None,
        avg_efficiency: None,
        counts: StatusCounts::default(),
    };
    let mut temperature = Mean::default();
    let mut efficiency = Mean::default();

    for snap in devices {
        let capacities = require(snap, "remainingCapacity").and_then(|r| Ok((r, require(snap, "nominalCapacity")?)));
        let (remaining, nominal) = match capacities {
            Ok(c) => c,
            Err(e) => {
                warn!("Skipping device in storage aggregation: {}", e);
                continue;
            }
        };
        agg.remaining_capacity += remaining;
        agg.total_capacity += nominal;
        agg.total_charge_rate += snap.number("chargeRate").unwrap_or(0.0);
        temperature.add(snap.number("temperature"));
        efficiency.add(snap.number("efficiency"));
        count(&mut agg.counts, snap.status);
    }

    if agg.total_capacity > 0.0 {
        agg.avg_soc = agg.remaining_capacity / agg.total_capacity * 100.0;
    }
    agg.avg_temperature = temperature.get();
    agg.avg_efficiency = efficiency.get();
    agg
}

fn solar_aggregate(devices: &[DeviceSnapshot]) -> SolarAggregate {
    let mut agg = SolarAggregate {
        total_output: 0.0,
        daily_yield: 0.0,
        avg_efficiency: None,
        avg_panel_temp: None,
        irradiance: None,
        performance_ratio: None,
        active_strings: 0,
        faulted_strings: 0,
        counts: StatusCounts::default(),
    };
    let (mut efficiency, mut panel, mut irradiance, mut ratio) =
        (Mean::default(), Mean::default(), Mean::default(), Mean::default());

    for snap in devices {
        let output = match require(snap, "currentOutput") {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping device in solar aggregation: {}", e);
                continue;
            }
        };
        agg.total_output += output;
        agg.daily_yield += snap.number("energyYield").unwrap_or(0.0);
        efficiency.add(snap.number("systemEfficiency"));
        panel.add(snap.number("panelTemperature"));
        irradiance.add(snap.number("irradiance"));
        ratio.add(snap.number("performanceRatio"));

        let inverter_fault = snap.text("inverterStatus").is_some_and(|s| s.eq_ignore_ascii_case("FAULT"));
        if inverter_fault || snap.status == DeviceStatus::Fault {
            agg.faulted_strings += 1;
        } else if snap.status == DeviceStatus::Online {
            agg.active_strings += 1;
        }
        count(&mut agg.counts, snap.status);
    }

    agg.avg_efficiency = efficiency.get();
    agg.avg_panel_temp = panel.get();
    agg.irradiance = irradiance.get();
    agg.performance_ratio = ratio.get();
    agg
}

fn charger_aggregate(devices: &[DeviceSnapshot]) -> ChargerAggregate {
    let mut agg = ChargerAggregate {
        total_chargers: 0,
        active_chargers: 0,
        available_ports: 0,
        active_sessions: 0,
        total_power_delivery: 0.0,
        daily_revenue: 0.0,
        daily_energy: 0.0,
        avg_utilization: None,
        avg_session_duration: None,
        total_faults: 0,
        counts: StatusCounts::default(),
    };
    let (mut utilization, mut duration) = (Mean::default(), Mean::default());

    for snap in devices {
        let sessions = match require(snap, "activeSessions") {
            Ok(v) => v as u32,
            Err(e) => {
                warn!("Skipping device in charger aggregation: {}", e);
                continue;
            }
        };
        agg.total_chargers += 1;
        agg.active_sessions += sessions;
        if snap.status == DeviceStatus::Online {
            if sessions > 0 {
                agg.active_chargers += 1;
            } else {
                agg.available_ports += 1;
            }
        }
        agg.total_power_delivery += snap.number("powerDelivered").unwrap_or(0.0);
        agg.daily_revenue += snap.number("revenue").unwrap_or(0.0);
        agg.daily_energy += snap.number("energyDelivered").unwrap_or(0.0);
        agg.total_faults += snap.number("faults").unwrap_or(0.0) as u32;
        utilization.add(snap.number("utilizationRate"));
        duration.add(snap.number("avgSessionDuration"));
        count(&mut agg.counts, snap.status);
    }

    agg.avg_utilization = utilization.get();
    agg.avg_session_duration = duration.get();
    agg
}

/// Recomputes site aggregates from the device status cache.
///
/// Every pass is a wholesale recomputation, so replaying a record is
/// harmless. Passes for one site serialize on a per-site mutex; different
/// sites run in parallel.
pub struct Aggregator {
    cache: Arc<DeviceStatusCache>,
    broker: Arc<dyn MessageBroker>,
    delta: Arc<DeltaPublisher>,
    site_locks: DashMap<String, Arc<Mutex<()>>>,
    pass_timeout: Duration,
}

impl Aggregator {
    pub fn new(
        cache: Arc<DeviceStatusCache>,
        broker: Arc<dyn MessageBroker>,
        delta: Arc<DeltaPublisher>,
        pass_timeout: Duration,
    ) -> Self {
        Self { cache, broker, delta, site_locks: DashMap::new(), pass_timeout }
    }

    /// Snapshots currently cached for a site. Devices indexed under the site
    /// but gone from the cache are skipped with a warning.
    fn site_devices(&self, site_id: &str) -> Vec<DeviceSnapshot> {
        let members = self.cache.site_members(site_id);
        let mut found = self.cache.get_many(&members);
        members
            .iter()
            .filter_map(|id| {
                let snap = found.remove(id);
                if snap.is_none() {
                    let e = CacheMissError { device_id: id.clone(), reason: "evicted".into() };
                    warn!(site_id, "Skipping device: {}", e);
                }
                snap
            })
            .collect()
    }

    pub fn aggregate(&self, site_id: &str, device_type: &DeviceType, now: OffsetDateTime) -> Option<AggregationSnapshot> {
        let devices: Vec<DeviceSnapshot> = self
            .site_devices(site_id)
            .into_iter()
            .filter(|d| &d.device_type == device_type)
            .collect();
        Self::aggregate_devices(site_id, device_type, &devices, now)
    }

    fn aggregate_devices(
        site_id: &str,
        device_type: &DeviceType,
        devices: &[DeviceSnapshot],
        now: OffsetDateTime,
    ) -> Option<AggregationSnapshot> {
        let aggregate = match device_type {
            DeviceType::Storage => CategoryAggregate::Storage(storage_aggregate(devices)),
            DeviceType::Solar => CategoryAggregate::Solar(solar_aggregate(devices)),
            DeviceType::Charger => CategoryAggregate::Charger(charger_aggregate(devices)),
            DeviceType::Unknown(_) => return None,
        };
        Some(AggregationSnapshot {
            site_id: site_id.to_string(),
            device_type: device_type.clone(),
            aggregate,
            last_updated: now,
        })
    }

    pub fn site_metrics(&self, site_id: &str, now: OffsetDateTime) -> SiteMetrics {
        Self::metrics_for(site_id, &self.site_devices(site_id), now)
    }

    fn metrics_for(site_id: &str, devices: &[DeviceSnapshot], now: OffsetDateTime) -> SiteMetrics {
        let mut counts = StatusCounts::default();
        let mut availability = Mean::default();
        let mut alerts = 0;
        for snap in devices {
            count(&mut counts, snap.status);
            availability.add(Some(snap.uptime_pct));
            alerts += snap.active_alerts;
        }

        let total = counts.total();
        let uptime = if total > 0 { counts.online as f64 / total as f64 * 100.0 } else { 0.0 };
        SiteMetrics {
            site_id: site_id.to_string(),
            total_devices: total,
            online_devices: counts.online,
            offline_devices: counts.offline,
            fault_devices: counts.fault,
            maintenance_devices: counts.maintenance,
            uptime,
            availability: availability.get().unwrap_or(uptime),
            total_active_alerts: alerts,
            last_updated: now,
        }
    }

    /// One full pass for a site, triggered by a record of `trigger` type.
    ///
    /// Publishes the triggering category's snapshot and the site metrics,
    /// then hands the combined view to the delta publisher. Bounded by the
    /// pass timeout; an expired pass is dropped and the next one catches up.
    #[instrument(skip(self), fields(site_id = %site_id, device_type = %trigger))]
    pub async fn run_pass(&self, site_id: &str, trigger: &DeviceType) -> anyhow::Result<Option<PassOutcome>> {
        let lock = self
            .site_locks
            .entry(site_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let start = std::time::Instant::now();
        let result = tokio::time::timeout(self.pass_timeout, async {
            let _guard = lock.lock().await;
            self.pass(site_id, trigger, OffsetDateTime::now_utc()).await
        })
        .await;
        metrics::histogram!("aggregation_pass_duration_seconds", start.elapsed().as_secs_f64());

        match result {
            Ok(Ok(outcome)) => {
                metrics::counter!("aggregation_passes_total", 1, "outcome" => "ok");
                Ok(Some(outcome))
            }
            Ok(Err(e)) => {
                metrics::counter!("aggregation_passes_total", 1, "outcome" => "error");
                Err(e)
            }
            Err(_) => {
                warn!("Aggregation pass exceeded {:?}; aborted", self.pass_timeout);
                metrics::counter!("aggregation_passes_total", 1, "outcome" => "timeout");
                Ok(None)
            }
        }
    }

    async fn pass(&self, site_id: &str, trigger: &DeviceType, now: OffsetDateTime) -> anyhow::Result<PassOutcome> {
        let devices = self.site_devices(site_id);
        let of_type = |t: &DeviceType| -> Vec<DeviceSnapshot> {
            devices.iter().filter(|d| &d.device_type == t).cloned().collect()
        };

        let storage = of_type(&DeviceType::Storage);
        let solar = of_type(&DeviceType::Solar);
        let charger = of_type(&DeviceType::Charger);
        let storage_agg = (!storage.is_empty()).then(|| storage_aggregate(&storage));
        let solar_agg = (!solar.is_empty()).then(|| solar_aggregate(&solar));
        let charger_agg = (!charger.is_empty()).then(|| charger_aggregate(&charger));

        let snapshot = match trigger {
            DeviceType::Storage => storage_agg.clone().map(CategoryAggregate::Storage),
            DeviceType::Solar => solar_agg.clone().map(CategoryAggregate::Solar),
            DeviceType::Charger => charger_agg.clone().map(CategoryAggregate::Charger),
            DeviceType::Unknown(_) => None,
        }
        .map(|aggregate| AggregationSnapshot {
            site_id: site_id.to_string(),
            device_type: trigger.clone(),
            aggregate,
            last_updated: now,
        });

        if let Some(snapshot) = &snapshot {
            let topic = format!("site-{}-aggregation", trigger.category());
            self.broker.publish(&topic, serde_json::to_vec(snapshot)?).await?;
        }

        let metrics = Self::metrics_for(site_id, &devices, now);
        self.broker.publish("site-metrics", serde_json::to_vec(&metrics)?).await?;

        let view = SiteView::from_aggregates(storage_agg.as_ref(), solar_agg.as_ref(), charger_agg.as_ref(), &metrics);
        let delta = self.delta.publish(site_id, &view, now).await?;
        debug!(devices = devices.len(), "Aggregation pass complete");

        Ok(PassOutcome { snapshot, metrics, delta })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::{ChargerReadings, StorageReadings};
    use crate::domain::{Readings, TelemetryRecord};
    use crate::service::delta::{UpdateKind, DEFAULT_CHANGE_THRESHOLD};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use time::macros::datetime;

    struct MockBroker {
        published: StdMutex<Vec<(String, Vec<u8>)>>,
        stall_topic: Option<String>,
    }

    impl MockBroker {
        fn new() -> Self {
            Self { published: StdMutex::new(Vec::new()), stall_topic: None }
        }

        /// Publishes to `topic` never complete.
        fn stalling(topic: &str) -> Self {
            Self { published: StdMutex::new(Vec::new()), stall_topic: Some(topic.to_string()) }
        }

        fn topics(&self) -> Vec<String> {
            self.published.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl MessageBroker for MockBroker {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            if self.stall_topic.as_deref() == Some(topic) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn storage(device_id: &str, remaining: f64, nominal: f64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.into(),
            site_id: "1".into(),
            device_type: DeviceType::Storage,
            timestamp: datetime!(2024-03-01 12:00 UTC),
            readings: Readings::Storage(StorageReadings {
                soc: remaining / nominal * 100.0,
                remaining_capacity: remaining,
                nominal_capacity: nominal,
                charge_rate: Some(2.0),
                voltage: None,
                current: None,
                temperature: Some(30.0),
                health_status: None,
                efficiency: None,
                cycle_count: None,
                module_temperatures: None,
                alarms: None,
                warnings: None,
            }),
            quality: None,
        }
    }

    fn charger(device_id: &str, sessions: u32) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.into(),
            site_id: "1".into(),
            device_type: DeviceType::Charger,
            timestamp: datetime!(2024-03-01 12:00 UTC),
            readings: Readings::Charger(ChargerReadings {
                active_sessions: sessions,
                power_delivered: 7.5 * sessions as f64,
                total_sessions: None,
                energy_delivered: Some(20.0),
                revenue: Some(4.0),
                avg_session_duration: None,
                utilization_rate: Some(50.0),
                network_connectivity: Some(true),
                payment_system_status: None,
                faults: Some(1),
                uptime: None,
            }),
            quality: None,
        }
    }

    fn setup() -> (Arc<DeviceStatusCache>, Arc<MockBroker>, Aggregator) {
        let cache = Arc::new(DeviceStatusCache::new(10));
        let broker = Arc::new(MockBroker::new());
        let delta = Arc::new(DeltaPublisher::new(broker.clone(), DEFAULT_CHANGE_THRESHOLD));
        let aggregator = Aggregator::new(cache.clone(), broker.clone(), delta, Duration::from_secs(5));
        (cache, broker, aggregator)
    }

    #[test]
    fn test_capacity_weighted_soc() {
        let (cache, _, aggregator) = setup();
        cache.upsert(&storage("d1", 40.0, 50.0));
        cache.upsert(&storage("d2", 10.0, 50.0));

        let snapshot = aggregator.aggregate("1", &DeviceType::Storage, datetime!(2024-03-01 12:00 UTC)).unwrap();
        match snapshot.aggregate {
            CategoryAggregate::Storage(s) => {
                assert!((s.avg_soc - 50.0).abs() < 1e-9);
                assert_eq!(s.total_capacity, 100.0);
                assert_eq!(s.total_charge_rate, 4.0);
                assert_eq!(s.counts.online, 2);
            }
            other => panic!("expected storage aggregate, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_snapshot_is_skipped() {
        let (cache, _, aggregator) = setup();
        cache.upsert(&storage("d1", 40.0, 50.0));
        cache.upsert(&charger("c1", 1));
        // A charger snapshot registered as storage lacks capacities.
        let mut odd = charger("d2", 0);
        odd.device_type = DeviceType::Storage;
        cache.upsert(&odd);

        let snapshot = aggregator.aggregate("1", &DeviceType::Storage, datetime!(2024-03-01 12:00 UTC)).unwrap();
        let CategoryAggregate::Storage(s) = snapshot.aggregate else { panic!("expected storage") };
        assert!((s.avg_soc - 80.0).abs() < 1e-9);
        assert_eq!(s.counts.total(), 1);
    }

    #[test]
    fn test_charger_ports_and_site_metrics() {
        let (cache, _, aggregator) = setup();
        cache.upsert(&charger("c1", 2));
        cache.upsert(&charger("c2", 0));
        cache.upsert(&charger("c3", 0));
        cache.set_status("c3", DeviceStatus::Offline);
        cache.set_active_alerts("c1", 2);

        let snapshot = aggregator.aggregate("1", &DeviceType::Charger, datetime!(2024-03-01 12:00 UTC)).unwrap();
        let CategoryAggregate::Charger(c) = snapshot.aggregate else { panic!("expected charger") };
        assert_eq!(c.total_chargers, 3);
        assert_eq!(c.active_chargers, 1);
        assert_eq!(c.available_ports, 1);
        assert_eq!(c.active_sessions, 2);
        assert_eq!(c.total_faults, 3);

        let metrics = aggregator.site_metrics("1", datetime!(2024-03-01 12:00 UTC));
        assert_eq!(metrics.total_devices, 3);
        assert_eq!(metrics.offline_devices, 1);
        assert!((metrics.uptime - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.total_active_alerts, 2);
    }

    #[tokio::test]
    async fn test_pass_publishes_snapshot_metrics_and_dashboard() {
        let (cache, broker, aggregator) = setup();
        cache.upsert(&storage("d1", 40.0, 50.0));

        let outcome = aggregator.run_pass("1", &DeviceType::Storage).await.unwrap().unwrap();
        assert!(outcome.snapshot.is_some());
        assert_eq!(outcome.delta.unwrap().kind, UpdateKind::FullUpdate);
        assert_eq!(
            broker.topics(),
            vec!["site-bms-aggregation".to_string(), "site-metrics".to_string(), "sites/1/dashboard".to_string()]
        );

        // Replaying the same state changes nothing downstream.
        let outcome = aggregator.run_pass("1", &DeviceType::Storage).await.unwrap().unwrap();
        assert!(outcome.delta.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_pass_leaves_other_sites_intact() {
        let cache = Arc::new(DeviceStatusCache::new(10));
        let broker = Arc::new(MockBroker::stalling("sites/2/dashboard"));
        let delta = Arc::new(DeltaPublisher::new(broker.clone(), DEFAULT_CHANGE_THRESHOLD));
        let aggregator = Aggregator::new(cache.clone(), broker.clone(), delta.clone(), Duration::from_secs(1));

        cache.upsert(&storage("d1", 40.0, 50.0));
        let mut other = storage("d2", 10.0, 50.0);
        other.site_id = "2".into();
        cache.upsert(&other);

        let first = aggregator.run_pass("1", &DeviceType::Storage).await.unwrap();
        assert!(first.is_some());
        let site1_view = delta.cached_state("1").unwrap();

        let stalled = aggregator.run_pass("2", &DeviceType::Storage).await.unwrap();
        assert!(stalled.is_none(), "an expired pass reports no outcome");
        assert!(delta.cached_state("2").is_none(), "an unsent view is not cached");

        assert_eq!(delta.cached_state("1").unwrap(), site1_view);
        assert!(!broker.topics().contains(&"sites/2/dashboard".to_string()));

        // The site lock was released, so site 1 keeps flowing.
        cache.upsert(&storage("d3", 50.0, 50.0));
        let next = aggregator.run_pass("1", &DeviceType::Storage).await.unwrap().unwrap();
        assert_eq!(next.delta.unwrap().kind, UpdateKind::DeltaUpdate);
    }
}
