use dashmap::DashMap;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use anyhow::Context;

use crate::domain::{DeviceType, Severity};
use crate::service::evaluator::{is_unresolvable, ThresholdSet, ThresholdSpec};

/// Built-in thresholds, used until a file or the database says otherwise.
pub fn default_thresholds(device_type: &DeviceType) -> ThresholdSet {
    let mut set = ThresholdSet::new();
    match device_type {
        DeviceType::Storage => {
            set.insert("HIGH_TEMPERATURE".into(), ThresholdSpec::new(45.0, Severity::High));
            set.insert("LOW_SOC".into(), ThresholdSpec::new(20.0, Severity::Medium));
        }
        DeviceType::Solar => {
            set.insert("HIGH_PANEL_TEMPERATURE".into(), ThresholdSpec::new(75.0, Severity::Medium));
            set.insert("INVERTER_FAULT".into(), ThresholdSpec::sentinel(Severity::Critical));
        }
        DeviceType::Charger => {
            set.insert("LOW_UTILIZATION".into(), ThresholdSpec::new(10.0, Severity::Low));
            set.insert("PAYMENT_SYSTEM_FAULT".into(), ThresholdSpec::sentinel(Severity::High));
        }
        DeviceType::Unknown(_) => {}
    }
    set
}

/// Per-device-type alert thresholds (Cache + optional DB).
pub struct ConfigManager {
    pool: Option<PgPool>,
    cache: Arc<DashMap<DeviceType, ThresholdSet>>,
}

impl ConfigManager {
    pub fn new(pool: Option<PgPool>) -> Self {
        let cache = DashMap::new();
        for device_type in DeviceType::KNOWN {
            let defaults = default_thresholds(&device_type);
            cache.insert(device_type, defaults);
        }
        Self { pool, cache: Arc::new(cache) }
    }

    /// Load thresholds from the `device_types.alert_thresholds` column on startup.
    /// Rows replace the defaults of their device type.
    pub async fn load_all(&self) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        let rows = sqlx::query("SELECT name, alert_thresholds FROM device_types WHERE alert_thresholds IS NOT NULL")
            .fetch_all(pool)
            .await?;

        for row in rows {
            let name: String = row.get("name");
            let thresholds_json: serde_json::Value = row.get("alert_thresholds");
            match serde_json::from_value::<ThresholdSet>(thresholds_json) {
                Ok(set) => self.install(DeviceType::from_tag(&name), set),
                Err(e) => warn!("Ignoring malformed thresholds for device type {}: {}", name, e),
            }
        }

        info!("Loaded thresholds for {} device types", self.cache.len());
        Ok(())
    }

    /// Load thresholds from a JSON file shaped `{"BMS": {"HIGH_TEMPERATURE": {...}}}`.
    pub fn load_file(&self, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading thresholds file {}", path.display()))?;
        let by_type: HashMap<String, ThresholdSet> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing thresholds file {}", path.display()))?;

        for (tag, set) in by_type {
            self.install(DeviceType::from_tag(&tag), set);
        }
        info!("Loaded thresholds file {}", path.display());
        Ok(())
    }

    fn install(&self, device_type: DeviceType, set: ThresholdSet) {
        for (alert_type, spec) in &set {
            if is_unresolvable(alert_type, spec) {
                warn!(
                    "Threshold {} for {} names no usable field/direction and will never fire",
                    alert_type, device_type
                );
            }
        }
        self.cache.insert(device_type, set);
    }

    /// Thresholds for a device type (Cache Hit -> empty set).
    pub fn thresholds_for(&self, device_type: &DeviceType) -> ThresholdSet {
        self.cache
            .get(device_type)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    /// Update thresholds for a device type (Write-Through: DB + Cache)
    pub async fn update_thresholds(&self, device_type: DeviceType, set: ThresholdSet) -> anyhow::Result<()> {
        if let Some(pool) = &self.pool {
            // Rows may use any alias of the type's name.
            let result = sqlx::query(
                "UPDATE device_types SET alert_thresholds = $1 \
                 WHERE REPLACE(REPLACE(UPPER(TRIM(name)), ' ', '_'), '-', '_') = ANY($2)",
            )
            .bind(serde_json::to_value(&set)?)
            .bind(device_type.tags())
            .execute(pool)
            .await?;
            if result.rows_affected() == 0 {
                warn!("No device_types row named {}; thresholds kept in memory only", device_type);
            }
        }

        info!("Updated thresholds for {}: {} rules", device_type, set.len());
        self.install(device_type, set);
        Ok(())
    }

    #[cfg(test)]
    pub fn inject_thresholds(&self, device_type: DeviceType, set: ThresholdSet) {
        self.cache.insert(device_type, set);
    }
}
