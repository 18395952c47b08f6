use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::DeviceType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageReadings {
    pub soc: f64,
    pub remaining_capacity: f64,
    pub nominal_capacity: f64,
    pub charge_rate: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub temperature: Option<f64>,
    pub health_status: Option<String>,
    pub efficiency: Option<f64>,
    pub cycle_count: Option<u64>,
    pub module_temperatures: Option<Vec<f64>>,
    pub alarms: Option<Vec<String>>,
    pub warnings: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolarReadings {
    pub current_output: f64,
    pub energy_yield: Option<f64>,
    pub energy_yield_total: Option<f64>,
    pub panel_temperature: Option<f64>,
    pub irradiance: Option<f64>,
    pub ambient_temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub inverter_efficiency: Option<f64>,
    pub system_efficiency: Option<f64>,
    pub performance_ratio: Option<f64>,
    pub inverter_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargerReadings {
    pub active_sessions: u32,
    pub power_delivered: f64,
    pub total_sessions: Option<u64>,
    pub energy_delivered: Option<f64>,
    pub revenue: Option<f64>,
    pub avg_session_duration: Option<f64>,
    pub utilization_rate: Option<f64>,
    pub network_connectivity: Option<bool>,
    pub payment_system_status: Option<String>,
    pub faults: Option<u32>,
    pub uptime: Option<f64>,
}

/// Type-specific field set of a decoded message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum Readings {
    Storage(StorageReadings),
    Solar(SolarReadings),
    Charger(ChargerReadings),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityIndicators {
    pub signal_strength: Option<f64>,
    pub data_quality: Option<String>,
    pub error_count: Option<u32>,
}

/// A validated telemetry message. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub device_id: String,
    pub site_id: String,
    pub device_type: DeviceType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub readings: Readings,
    pub quality: Option<QualityIndicators>,
}

impl TelemetryRecord {
    pub fn get_value(&self, key: &str) -> Option<f64> {
        match &self.readings {
            Readings::Storage(r) => match key {
                "soc" => Some(r.soc),
                "remainingCapacity" => Some(r.remaining_capacity),
                "nominalCapacity" => Some(r.nominal_capacity),
                "chargeRate" => r.charge_rate,
                "voltage" => r.voltage,
                "current" => r.current,
                "temperature" => r.temperature,
                "efficiency" => r.efficiency,
                "cycleCount" => r.cycle_count.map(|v| v as f64),
                _ => None,
            },
            Readings::Solar(r) => match key {
                "currentOutput" => Some(r.current_output),
                "energyYield" => r.energy_yield,
                "energyYieldTotal" => r.energy_yield_total,
                "panelTemperature" => r.panel_temperature,
                "irradiance" => r.irradiance,
                "ambientTemperature" => r.ambient_temperature,
                "windSpeed" => r.wind_speed,
                "inverterEfficiency" => r.inverter_efficiency,
                "systemEfficiency" => r.system_efficiency,
                "performanceRatio" => r.performance_ratio,
                _ => None,
            },
            Readings::Charger(r) => match key {
                "activeSessions" => Some(r.active_sessions as f64),
                "powerDelivered" => Some(r.power_delivered),
                "totalSessions" => r.total_sessions.map(|v| v as f64),
                "energyDelivered" => r.energy_delivered,
                "revenue" => r.revenue,
                "avgSessionDuration" => r.avg_session_duration,
                "utilizationRate" => r.utilization_rate,
                "faults" => r.faults.map(|v| v as f64),
                "uptime" => r.uptime,
                _ => None,
            },
        }
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        match (&self.readings, key) {
            (Readings::Storage(r), "healthStatus") => r.health_status.as_deref(),
            (Readings::Solar(r), "inverterStatus") => r.inverter_status.as_deref(),
            (Readings::Charger(r), "paymentSystemStatus") => r.payment_system_status.as_deref(),
            _ => None,
        }
    }

    /// Flat camelCase view of the readings, nulls dropped. This is what the
    /// device status cache merges into a snapshot.
    pub fn field_map(&self) -> Map<String, Value> {
        let value = match &self.readings {
            Readings::Storage(r) => serde_json::to_value(r),
            Readings::Solar(r) => serde_json::to_value(r),
            Readings::Charger(r) => serde_json::to_value(r),
        };
        match value {
            Ok(Value::Object(map)) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            _ => Map::new(),
        }
    }
}
