use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{DeviceType, Severity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub id: Uuid,
    pub device_id: String,
    pub site_id: String,
    pub device_type: DeviceType,
    pub alert_type: String, // e.g. "HIGH_TEMPERATURE", "INVERTER_FAULT"
    pub severity: Severity,
    pub message: String,
    pub threshold_value: Option<f64>,
    pub actual_value: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl AlertEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: String,
        site_id: String,
        device_type: DeviceType,
        alert_type: String,
        severity: Severity,
        message: String,
        threshold_value: Option<f64>,
        actual_value: Option<f64>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            site_id,
            device_type,
            alert_type,
            severity,
            message,
            threshold_value,
            actual_value,
            created_at,
        }
    }
}
