//! Incremental dashboard updates.
//!
//! The publisher keeps the last full [`SiteView`] sent for every site and
//! emits only the sections and fields that moved since then. A site it has
//! never seen (or whose cached view was cleared) gets a full update.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::domain::aggregation::{ChargerAggregate, SolarAggregate, StorageAggregate};
use crate::domain::SiteMetrics;
use crate::ports::MessageBroker;

pub const DEFAULT_CHANGE_THRESHOLD: f64 = 0.01;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatterySystem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_capacity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efficiency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nominal_capacity: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolarArray {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_output: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_yield: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panel_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub irradiance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverter_efficiency: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvCharger {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_sessions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_ports: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_delivered: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faults: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationalData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_devices: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_devices: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_devices: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_devices: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_active_alerts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_uptime: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_status: Option<String>,
}

/// Full dashboard state of one site, as last pushed to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteView {
    pub battery_system: Option<BatterySystem>,
    pub solar_array: Option<SolarArray>,
    pub ev_charger: Option<EvCharger>,
    pub operational_data: Option<OperationalData>,
}

impl SiteView {
    pub fn from_aggregates(
        storage: Option<&StorageAggregate>,
        solar: Option<&SolarAggregate>,
        charger: Option<&ChargerAggregate>,
        metrics: &SiteMetrics,
    ) -> Self {
        let battery_system = storage.map(|s| BatterySystem {
            soc: Some(s.avg_soc),
            charge_rate: Some(s.total_charge_rate),
            temperature: s.avg_temperature,
            remaining_capacity: Some(s.remaining_capacity),
            health_status: Some(
                if s.counts.fault > 0 {
                    "FAULT"
                } else if s.counts.offline > 0 {
                    "DEGRADED"
                } else {
                    "HEALTHY"
                }
                .to_string(),
            ),
            efficiency: s.avg_efficiency,
            nominal_capacity: Some(s.total_capacity),
        });

        let solar_array = solar.map(|s| SolarArray {
            current_output: Some(s.total_output),
            energy_yield: Some(s.daily_yield),
            panel_temperature: s.avg_panel_temp,
            irradiance: s.irradiance,
            inverter_efficiency: s.avg_efficiency,
        });

        let ev_charger = charger.map(|c| EvCharger {
            active_sessions: Some(c.active_sessions),
            available_ports: Some(c.available_ports),
            power_delivered: Some(c.total_power_delivery),
            revenue: Some(c.daily_revenue),
            faults: Some(c.total_faults),
        });

        let network_status = if metrics.total_devices > 0 && metrics.online_devices == metrics.total_devices {
            "CONNECTED"
        } else if metrics.online_devices > 0 {
            "DEGRADED"
        } else {
            "DISCONNECTED"
        };

        Self {
            battery_system,
            solar_array,
            ev_charger,
            operational_data: Some(OperationalData {
                total_devices: Some(metrics.total_devices),
                online_devices: Some(metrics.online_devices),
                offline_devices: Some(metrics.offline_devices),
                fault_devices: Some(metrics.fault_devices),
                total_active_alerts: Some(metrics.total_active_alerts),
                system_uptime: Some(metrics.uptime),
                network_status: Some(network_status.to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateKind {
    FullUpdate,
    DeltaUpdate,
}

/// Push message for a site's dashboard channel. Absent section = unchanged;
/// sections or fields that disappeared are listed in `removed` as
/// `section` or `section.field` paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardDelta {
    pub site_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_system: Option<BatterySystem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solar_array: Option<SolarArray>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ev_charger: Option<EvCharger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operational_data: Option<OperationalData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

/// Relative change test. A zero baseline changes on any non-zero value.
pub fn is_significant(previous: f64, current: f64, threshold: f64) -> bool {
    if previous == 0.0 {
        return current != 0.0;
    }
    ((current - previous) / previous).abs() >= threshold
}

fn changed_num(prev: Option<f64>, cur: Option<f64>, threshold: f64) -> Option<f64> {
    match (prev, cur) {
        (Some(p), Some(c)) => is_significant(p, c, threshold).then_some(c),
        (None, Some(c)) => Some(c),
        (_, None) => None,
    }
}

fn changed_exact<T: PartialEq + Clone>(prev: &Option<T>, cur: &Option<T>) -> Option<T> {
    match cur {
        Some(c) if prev.as_ref() != Some(c) => Some(c.clone()),
        _ => None,
    }
}

fn non_empty<T: Default + PartialEq>(section: T) -> Option<T> {
    (section != T::default()).then_some(section)
}

impl BatterySystem {
    fn diff(&self, prev: &Self, t: f64) -> Option<Self> {
        non_empty(Self {
            soc: changed_num(prev.soc, self.soc, t),
            charge_rate: changed_num(prev.charge_rate, self.charge_rate, t),
            temperature: changed_num(prev.temperature, self.temperature, t),
            remaining_capacity: changed_num(prev.remaining_capacity, self.remaining_capacity, t),
            health_status: changed_exact(&prev.health_status, &self.health_status),
            efficiency: changed_num(prev.efficiency, self.efficiency, t),
            nominal_capacity: changed_num(prev.nominal_capacity, self.nominal_capacity, t),
        })
    }
}

impl SolarArray {
    fn diff(&self, prev: &Self, t: f64) -> Option<Self> {
        non_empty(Self {
            current_output: changed_num(prev.current_output, self.current_output, t),
            energy_yield: changed_num(prev.energy_yield, self.energy_yield, t),
            panel_temperature: changed_num(prev.panel_temperature, self.panel_temperature, t),
            irradiance: changed_num(prev.irradiance, self.irradiance, t),
            inverter_efficiency: changed_num(prev.inverter_efficiency, self.inverter_efficiency, t),
        })
    }
}

impl EvCharger {
    fn diff(&self, prev: &Self, t: f64) -> Option<Self> {
        non_empty(Self {
            active_sessions: changed_exact(&prev.active_sessions, &self.active_sessions),
            available_ports: changed_exact(&prev.available_ports, &self.available_ports),
            power_delivered: changed_num(prev.power_delivered, self.power_delivered, t),
            revenue: changed_num(prev.revenue, self.revenue, t),
            faults: changed_exact(&prev.faults, &self.faults),
        })
    }
}

impl OperationalData {
    fn diff(&self, prev: &Self, t: f64) -> Option<Self> {
        non_empty(Self {
            total_devices: changed_exact(&prev.total_devices, &self.total_devices),
            online_devices: changed_exact(&prev.online_devices, &self.online_devices),
            offline_devices: changed_exact(&prev.offline_devices, &self.offline_devices),
            fault_devices: changed_exact(&prev.fault_devices, &self.fault_devices),
            total_active_alerts: changed_exact(&prev.total_active_alerts, &self.total_active_alerts),
            system_uptime: changed_num(prev.system_uptime, self.system_uptime, t),
            network_status: changed_exact(&prev.network_status, &self.network_status),
        })
    }
}

fn section<T: Clone>(prev: &Option<T>, cur: &Option<T>, diff: impl Fn(&T, &T) -> Option<T>) -> Option<T> {
    match (prev, cur) {
        (Some(p), Some(c)) => diff(c, p),
        (None, Some(c)) => Some(c.clone()),
        (_, None) => None,
    }
}

/// Camel-case paths present in `prev` but gone from `current`: a whole
/// section, or a single field of a section both views carry.
fn removed_paths(prev: &SiteView, current: &SiteView) -> Vec<String> {
    let (Ok(Value::Object(prev)), Ok(Value::Object(current))) = (serde_json::to_value(prev), serde_json::to_value(current))
    else {
        return Vec::new();
    };

    let mut removed = Vec::new();
    for (section, before) in &prev {
        let Value::Object(before) = before else { continue };
        match current.get(section) {
            Some(Value::Object(after)) => {
                removed.extend(
                    before
                        .keys()
                        .filter(|field| !after.contains_key(*field))
                        .map(|field| format!("{}.{}", section, field)),
                );
            }
            _ => removed.push(section.clone()),
        }
    }
    removed
}

pub struct DeltaPublisher {
    states: DashMap<String, SiteView>,
    change_threshold: f64,
    broker: Arc<dyn MessageBroker>,
}

impl DeltaPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, change_threshold: f64) -> Self {
        Self { states: DashMap::new(), change_threshold, broker }
    }

    /// Diff `current` against the last view sent for the site.
    ///
    /// Does not touch the cache: a view only becomes the baseline once
    /// [`DeltaPublisher::publish`] has handed it to the broker.
    pub fn compute_delta(&self, site_id: &str, current: &SiteView, now: OffsetDateTime) -> Option<DashboardDelta> {
        let t = self.change_threshold;
        let Some(prev) = self.states.get(site_id) else {
            return Some(DashboardDelta {
                site_id: site_id.to_string(),
                timestamp: now,
                kind: UpdateKind::FullUpdate,
                battery_system: current.battery_system.clone(),
                solar_array: current.solar_array.clone(),
                ev_charger: current.ev_charger.clone(),
                operational_data: current.operational_data.clone(),
                removed: Vec::new(),
            });
        };

        let delta = DashboardDelta {
            site_id: site_id.to_string(),
            timestamp: now,
            kind: UpdateKind::DeltaUpdate,
            battery_system: section(&prev.battery_system, &current.battery_system, |c, p| c.diff(p, t)),
            solar_array: section(&prev.solar_array, &current.solar_array, |c, p| c.diff(p, t)),
            ev_charger: section(&prev.ev_charger, &current.ev_charger, |c, p| c.diff(p, t)),
            operational_data: section(&prev.operational_data, &current.operational_data, |c, p| c.diff(p, t)),
            removed: removed_paths(&prev, current),
        };

        let changed = delta.battery_system.is_some()
            || delta.solar_array.is_some()
            || delta.ev_charger.is_some()
            || delta.operational_data.is_some()
            || !delta.removed.is_empty();
        changed.then_some(delta)
    }

    /// Compute and push the site's update to `sites/{siteId}/dashboard`.
    ///
    /// Callers serialize passes per site (the aggregator's site lock). The
    /// cached view is replaced only after the broker accepted the update, so
    /// a failed or cancelled send is retried in full by the next pass.
    #[instrument(skip(self, current), fields(site_id = %site_id))]
    pub async fn publish(&self, site_id: &str, current: &SiteView, now: OffsetDateTime) -> anyhow::Result<Option<DashboardDelta>> {
        let Some(delta) = self.compute_delta(site_id, current, now) else {
            debug!("No significant change; dashboard update suppressed");
            metrics::counter!("deltas_suppressed_total", 1);
            return Ok(None);
        };

        let topic = format!("sites/{}/dashboard", site_id);
        self.broker.publish(&topic, serde_json::to_vec(&delta)?).await?;
        self.states.insert(site_id.to_string(), current.clone());

        let kind = match delta.kind {
            UpdateKind::FullUpdate => "full",
            UpdateKind::DeltaUpdate => "delta",
        };
        metrics::counter!("deltas_published_total", 1, "type" => kind);
        Ok(Some(delta))
    }

    /// Forget a site; its next pass produces a full update.
    pub fn clear_site(&self, site_id: &str) {
        self.states.remove(site_id);
    }

    pub fn cached_state(&self, site_id: &str) -> Option<SiteView> {
        self.states.get(site_id).map(|s| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use time::macros::datetime;

    struct MockBroker {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        failures_left: AtomicUsize,
    }

    impl MockBroker {
        fn new() -> Self {
            Self::failing(0)
        }

        fn failing(times: usize) -> Self {
            Self { published: Mutex::new(Vec::new()), failures_left: AtomicUsize::new(times) }
        }
    }

    #[async_trait]
    impl MessageBroker for MockBroker {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                anyhow::bail!("broker down");
            }
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn view(soc: f64, online: u32) -> SiteView {
        SiteView {
            battery_system: Some(BatterySystem {
                soc: Some(soc),
                charge_rate: Some(5.0),
                temperature: Some(30.0),
                remaining_capacity: Some(40.0),
                health_status: Some("HEALTHY".into()),
                efficiency: None,
                nominal_capacity: Some(50.0),
            }),
            solar_array: None,
            ev_charger: None,
            operational_data: Some(OperationalData {
                total_devices: Some(3),
                online_devices: Some(online),
                offline_devices: Some(3 - online),
                fault_devices: Some(0),
                total_active_alerts: Some(0),
                system_uptime: Some(online as f64 / 3.0 * 100.0),
                network_status: Some("CONNECTED".into()),
            }),
        }
    }

    fn publisher() -> DeltaPublisher {
        DeltaPublisher::new(Arc::new(MockBroker::new()), DEFAULT_CHANGE_THRESHOLD)
    }

    #[tokio::test]
    async fn test_first_observation_is_full_update() {
        let p = publisher();
        let now = datetime!(2024-03-01 12:00 UTC);

        let preview = p.compute_delta("1", &view(80.0, 3), now).unwrap();
        assert_eq!(preview.kind, UpdateKind::FullUpdate);
        assert!(p.cached_state("1").is_none(), "computing alone does not move the baseline");

        let delta = p.publish("1", &view(80.0, 3), now).await.unwrap().unwrap();
        assert_eq!(delta.kind, UpdateKind::FullUpdate);
        assert_eq!(delta.battery_system.unwrap().charge_rate, Some(5.0));
        assert!(p.cached_state("1").is_some());
    }

    #[tokio::test]
    async fn test_sub_threshold_change_suppressed() {
        let p = publisher();
        let now = datetime!(2024-03-01 12:00 UTC);
        p.publish("1", &view(80.0, 3), now).await.unwrap();

        assert!(p.publish("1", &view(80.3, 3), now).await.unwrap().is_none());

        let delta = p.publish("1", &view(85.0, 3), now).await.unwrap().unwrap();
        assert_eq!(delta.kind, UpdateKind::DeltaUpdate);
        let battery = delta.battery_system.unwrap();
        assert_eq!(battery.soc, Some(85.0));
        assert_eq!(battery.charge_rate, None, "unchanged fields are omitted");
        assert!(delta.operational_data.is_none(), "unchanged sections are omitted");
        assert!(delta.removed.is_empty());
        assert_eq!(p.cached_state("1").unwrap().battery_system.unwrap().soc, Some(85.0));
    }

    #[tokio::test]
    async fn test_counts_compare_exactly() {
        let p = publisher();
        let now = datetime!(2024-03-01 12:00 UTC);
        p.publish("1", &view(80.0, 3), now).await.unwrap();
        let delta = p.compute_delta("1", &view(80.0, 2), now).unwrap();
        let ops = delta.operational_data.unwrap();
        assert_eq!(ops.online_devices, Some(2));
        assert_eq!(ops.offline_devices, Some(1));
        assert_eq!(ops.total_devices, None);
    }

    #[tokio::test]
    async fn test_zero_baseline_and_new_section() {
        assert!(is_significant(0.0, 0.1, 0.01));
        assert!(!is_significant(0.0, 0.0, 0.01));

        let p = publisher();
        let now = datetime!(2024-03-01 12:00 UTC);
        p.publish("1", &view(80.0, 3), now).await.unwrap();

        let mut with_solar = view(80.0, 3);
        with_solar.solar_array = Some(SolarArray { current_output: Some(12.0), ..Default::default() });
        let delta = p.compute_delta("1", &with_solar, now).unwrap();
        assert_eq!(delta.solar_array.unwrap().current_output, Some(12.0));
        assert!(delta.battery_system.is_none());
    }

    #[tokio::test]
    async fn test_removed_section_and_field_are_announced() {
        let broker = Arc::new(MockBroker::new());
        let p = DeltaPublisher::new(broker.clone(), DEFAULT_CHANGE_THRESHOLD);
        let now = datetime!(2024-03-01 12:00 UTC);
        p.publish("1", &view(80.0, 3), now).await.unwrap();

        let mut shrunk = view(80.0, 3);
        shrunk.operational_data = None;
        if let Some(battery) = shrunk.battery_system.as_mut() {
            battery.temperature = None;
        }
        let delta = p.publish("1", &shrunk, now).await.unwrap().unwrap();

        assert_eq!(delta.kind, UpdateKind::DeltaUpdate);
        assert!(delta.battery_system.is_none());
        assert_eq!(delta.removed, vec!["batterySystem.temperature".to_string(), "operationalData".to_string()]);

        let published = broker.published.lock().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&published[1].1).unwrap();
        assert_eq!(json["removed"][1], "operationalData");

        // A removal is sent once; the same view afterwards is quiet.
        drop(published);
        assert!(p.publish("1", &shrunk, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_send_keeps_previous_baseline() {
        let broker = Arc::new(MockBroker::failing(1));
        let p = DeltaPublisher::new(broker.clone(), DEFAULT_CHANGE_THRESHOLD);
        let now = datetime!(2024-03-01 12:00 UTC);

        assert!(p.publish("1", &view(80.0, 3), now).await.is_err());
        assert!(p.cached_state("1").is_none());

        let retried = p.publish("1", &view(80.0, 3), now).await.unwrap().unwrap();
        assert_eq!(retried.kind, UpdateKind::FullUpdate);
        assert_eq!(broker.published.lock().unwrap().len(), 1);

        // Same for a delta: a lost DELTA_UPDATE is re-sent against the old baseline.
        broker.failures_left.store(1, Ordering::SeqCst);
        assert!(p.publish("1", &view(90.0, 3), now).await.is_err());
        assert_eq!(p.cached_state("1").unwrap().battery_system.unwrap().soc, Some(80.0));
        let resent = p.publish("1", &view(90.0, 3), now).await.unwrap().unwrap();
        assert_eq!(resent.battery_system.unwrap().soc, Some(90.0));
    }

    #[tokio::test]
    async fn test_cleared_site_gets_full_update_on_channel() {
        let broker = Arc::new(MockBroker::new());
        let p = DeltaPublisher::new(broker.clone(), DEFAULT_CHANGE_THRESHOLD);
        let now = datetime!(2024-03-01 12:00 UTC);

        p.publish("7", &view(80.0, 3), now).await.unwrap();
        p.clear_site("7");
        let again = p.publish("7", &view(80.0, 3), now).await.unwrap().unwrap();
        assert_eq!(again.kind, UpdateKind::FullUpdate);

        let published = broker.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "sites/7/dashboard");
        let json: serde_json::Value = serde_json::from_slice(&published[1].1).unwrap();
        assert_eq!(json["type"], "FULL_UPDATE");
        assert_eq!(json["siteId"], "7");
        assert!(json.get("removed").is_none());
    }
}
