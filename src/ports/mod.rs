use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AlertEvent, DeliveryRecord, DeviceType, NotificationChannel, NotificationPreference, NotificationRule};
use crate::error::ChannelDeliveryError;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish data to a specific topic.
    /// QoS 1 implied.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DlqRepository: Send + Sync {
    /// Park a rejected message together with the reason it was rejected.
    async fn send_to_dlq(&self, original_topic: String, payload: Vec<u8>, error_msg: String) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub site_id: String,
    pub device_type: DeviceType,
    pub rated_capacity: Option<f64>,
}

/// Read-only view of the device/site registry owned by another service.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn lookup(&self, device_id: &str) -> anyhow::Result<Option<DeviceInfo>>;
}

/// Read access to notification rules, plus lazy creation of preferences.
#[async_trait]
pub trait NotificationDirectory: Send + Sync {
    async fn active_rules(&self) -> anyhow::Result<Vec<NotificationRule>>;

    async fn preferences(&self, user_id: &str) -> anyhow::Result<Option<NotificationPreference>>;

    async fn save_preferences(&self, preference: &NotificationPreference) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert or overwrite the record with the same id.
    async fn save(&self, record: &DeliveryRecord) -> anyhow::Result<()>;

    async fn records_for_alert(&self, alert_id: Uuid) -> anyhow::Result<Vec<DeliveryRecord>>;
}

/// One outbound notification channel.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, alert: &AlertEvent, recipient: &str) -> Result<(), ChannelDeliveryError>;

    fn channel(&self) -> NotificationChannel;
}
