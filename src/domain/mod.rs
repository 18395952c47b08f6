use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod aggregation;
pub mod alert;
pub mod notification;
pub mod telemetry;

pub use aggregation::{AggregationSnapshot, CategoryAggregate, SiteMetrics};
pub use alert::AlertEvent;
pub use notification::{
    DeliveryRecord, DeliveryStatus, NotificationChannel, NotificationPreference, NotificationRule,
};
pub use telemetry::{QualityIndicators, Readings, TelemetryRecord};

/// Closed set of device families the pipeline understands.
///
/// Tags arriving from topics or the registry come in several spellings
/// (`BMS`, `BATTERY_STORAGE`, `SOLAR ARRAY`, `ev`, ...). Anything else is
/// carried verbatim in `Unknown` so the decode error can report it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceType {
    Storage,
    Solar,
    Charger,
    Unknown(String),
}

impl DeviceType {
    pub fn from_tag(tag: &str) -> Self {
        let normalized = normalize_tag(tag);
        Self::KNOWN
            .into_iter()
            .find(|known| known.tags().contains(&normalized))
            .unwrap_or_else(|| DeviceType::Unknown(tag.to_string()))
    }

    /// Normalized tags that name this type; `from_tag` accepts exactly these.
    pub fn tags(&self) -> Vec<String> {
        let fixed: &[&str] = match self {
            DeviceType::Storage => &["BMS", "BATTERY_STORAGE", "BATTERY", "STORAGE"],
            DeviceType::Solar => &["SOLAR_ARRAY", "SOLAR_INVERTER", "SOLAR"],
            DeviceType::Charger => &["EV_CHARGER", "EVCHARGER", "EV", "CHARGER"],
            DeviceType::Unknown(tag) => return vec![normalize_tag(tag)],
        };
        fixed.iter().map(|t| t.to_string()).collect()
    }

    /// Short name used in outbound topics, e.g. `site-bms-aggregation`.
    pub fn category(&self) -> &str {
        match self {
            DeviceType::Storage => "bms",
            DeviceType::Solar => "solar",
            DeviceType::Charger => "evcharger",
            DeviceType::Unknown(tag) => tag.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, DeviceType::Unknown(_))
    }

    pub const KNOWN: [DeviceType; 3] = [DeviceType::Storage, DeviceType::Solar, DeviceType::Charger];
}

/// Upper case, with spaces and dashes as underscores.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_ascii_uppercase().replace([' ', '-'], "_")
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Storage => write!(f, "BMS"),
            DeviceType::Solar => write!(f, "SOLAR_ARRAY"),
            DeviceType::Charger => write!(f, "EV_CHARGER"),
            DeviceType::Unknown(tag) => write!(f, "{}", tag),
        }
    }
}

impl From<String> for DeviceType {
    fn from(tag: String) -> Self {
        DeviceType::from_tag(&tag)
    }
}

impl From<DeviceType> for String {
    fn from(device_type: DeviceType) -> Self {
        device_type.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
    Fault,
    Maintenance,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Online => "ONLINE",
            DeviceStatus::Offline => "OFFLINE",
            DeviceStatus::Fault => "FAULT",
            DeviceStatus::Maintenance => "MAINTENANCE",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(DeviceStatus::Online),
            "OFFLINE" => Ok(DeviceStatus::Offline),
            "FAULT" => Ok(DeviceStatus::Fault),
            "MAINTENANCE" => Ok(DeviceStatus::Maintenance),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}

/// Alert severity. Ordering is meaningful: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}
