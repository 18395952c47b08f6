//! In-process implementations of the store ports, used when no database is
//! configured.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use anyhow::Context;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::domain::{DeliveryRecord, NotificationPreference, NotificationRule};
use crate::ports::{DeliveryStore, DeviceInfo, DeviceRegistry, NotificationDirectory};

#[derive(Default)]
pub struct InMemoryDirectory {
    rules: DashMap<i64, NotificationRule>,
    preferences: DashMap<String, NotificationPreference>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectorySeed {
    #[serde(default)]
    rules: Vec<NotificationRule>,
    #[serde(default)]
    preferences: Vec<NotificationPreference>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rules and preferences from a JSON file shaped
    /// `{"rules": [...], "preferences": [...]}`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading notification seed {}", path.display()))?;
        let seed: DirectorySeed = serde_json::from_str(&raw)
            .with_context(|| format!("parsing notification seed {}", path.display()))?;

        let directory = Self::new();
        for rule in seed.rules {
            directory.add_rule(rule);
        }
        for preference in seed.preferences {
            directory.preferences.insert(preference.user_id.clone(), preference);
        }
        info!(
            "Loaded {} notification rules and {} preferences from {}",
            directory.rules.len(),
            directory.preferences.len(),
            path.display()
        );
        Ok(directory)
    }

    pub fn add_rule(&self, rule: NotificationRule) {
        self.rules.insert(rule.id, rule);
    }
}

#[async_trait]
impl NotificationDirectory for InMemoryDirectory {
    async fn active_rules(&self) -> anyhow::Result<Vec<NotificationRule>> {
        Ok(self.rules.iter().filter(|r| r.active).map(|r| r.clone()).collect())
    }

    async fn preferences(&self, user_id: &str) -> anyhow::Result<Option<NotificationPreference>> {
        Ok(self.preferences.get(user_id).map(|p| p.clone()))
    }

    async fn save_preferences(&self, preference: &NotificationPreference) -> anyhow::Result<()> {
        self.preferences.insert(preference.user_id.clone(), preference.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDeliveryStore {
    records: DashMap<Uuid, DeliveryRecord>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn save(&self, record: &DeliveryRecord) -> anyhow::Result<()> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn records_for_alert(&self, alert_id: Uuid) -> anyhow::Result<Vec<DeliveryRecord>> {
        let mut records: Vec<DeliveryRecord> = self
            .records
            .iter()
            .filter(|r| r.alert_id == alert_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| (r.created_at, r.channel as u8));
        Ok(records)
    }
}

/// Registry backed by a static map, for deployments where topics already
/// carry the device type.
#[derive(Default)]
pub struct StaticRegistry {
    devices: DashMap<String, DeviceInfo>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: DeviceInfo) {
        self.devices.insert(info.device_id.clone(), info);
    }
}

#[async_trait]
impl DeviceRegistry for StaticRegistry {
    async fn lookup(&self, device_id: &str) -> anyhow::Result<Option<DeviceInfo>> {
        Ok(self.devices.get(device_id).map(|d| d.clone()))
    }
}
