use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::DeviceType;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub online: u32,
    pub offline: u32,
    pub fault: u32,
    pub maintenance: u32,
}

impl StatusCounts {
    pub fn total(&self) -> u32 {
        self.online + self.offline + self.fault + self.maintenance
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAggregate {
    pub total_capacity: f64,
    pub remaining_capacity: f64,
    /// `sum(remaining) / sum(nominal) * 100`.
    pub avg_soc: f64,
    pub total_charge_rate: f64,
    pub avg_temperature: Option<f64>,
    pub avg_efficiency: Option<f64>,
    pub counts: StatusCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolarAggregate {
    pub total_output: f64,
    pub daily_yield: f64,
    pub avg_efficiency: Option<f64>,
    pub avg_panel_temp: Option<f64>,
    pub irradiance: Option<f64>,
    pub performance_ratio: Option<f64>,
    pub active_strings: u32,
    pub faulted_strings: u32,
    pub counts: StatusCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargerAggregate {
    pub total_chargers: u32,
    pub active_chargers: u32,
    pub available_ports: u32,
    pub active_sessions: u32,
    pub total_power_delivery: f64,
    pub daily_revenue: f64,
    pub daily_energy: f64,
    pub avg_utilization: Option<f64>,
    pub avg_session_duration: Option<f64>,
    pub total_faults: u32,
    pub counts: StatusCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CategoryAggregate {
    Storage(StorageAggregate),
    Solar(SolarAggregate),
    Charger(ChargerAggregate),
}

/// Result of one aggregation pass for a (site, device type) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationSnapshot {
    pub site_id: String,
    pub device_type: DeviceType,
    #[serde(flatten)]
    pub aggregate: CategoryAggregate,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteMetrics {
    pub site_id: String,
    pub total_devices: u32,
    pub online_devices: u32,
    pub offline_devices: u32,
    pub fault_devices: u32,
    pub maintenance_devices: u32,
    /// Share of devices currently ONLINE, in percent.
    pub uptime: f64,
    /// Mean rolling uptime across devices, in percent.
    pub availability: f64,
    pub total_active_alerts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}
