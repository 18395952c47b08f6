use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::domain::{DeviceStatus, DeviceType, TelemetryRecord};

/// Latest known state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub site_id: String,
    pub device_type: DeviceType,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub status: DeviceStatus,
    pub fields: Map<String, Value>,
    pub active_alerts: u32,
    pub uptime_pct: f64,
}

impl DeviceSnapshot {
    pub fn number(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub cached_devices: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub oldest_last_seen: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub newest_last_seen: Option<OffsetDateTime>,
}

struct CachedDevice {
    snapshot: DeviceSnapshot,
    uptime_samples: VecDeque<bool>,
}

/// Concurrent device status cache.
///
/// Keyed by device id; DashMap shards give parallel upserts across devices
/// while updates to one device serialize on its entry lock.
pub struct DeviceStatusCache {
    devices: DashMap<String, CachedDevice>,
    sites: DashMap<String, HashSet<String>>,
    uptime_window: usize,
}

impl DeviceStatusCache {
    pub fn new(uptime_window: usize) -> Self {
        Self {
            devices: DashMap::new(),
            sites: DashMap::new(),
            uptime_window: uptime_window.max(1),
        }
    }

    /// Merge a decoded record into the device's snapshot.
    ///
    /// Fields always merge (last write wins per field). `last_seen` and the
    /// ONLINE transition only apply when the record is not older than what
    /// the cache already holds.
    pub fn upsert(&self, record: &TelemetryRecord) -> DeviceSnapshot {
        let mut moved_from: Option<String> = None;

        let snapshot = match self.devices.entry(record.device_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let snap = &mut occupied.get_mut().snapshot;
                snap.fields.extend(record.field_map());
                if record.timestamp >= snap.last_seen {
                    snap.last_seen = record.timestamp;
                    snap.status = DeviceStatus::Online;
                } else {
                    debug!(
                        device_id = %record.device_id,
                        "Out-of-order record; keeping last_seen {}", snap.last_seen
                    );
                }
                if snap.site_id != record.site_id {
                    moved_from = Some(std::mem::replace(&mut snap.site_id, record.site_id.clone()));
                }
                snap.device_type = record.device_type.clone();
                snap.clone()
            }
            Entry::Vacant(vacant) => {
                let snapshot = DeviceSnapshot {
                    device_id: record.device_id.clone(),
                    site_id: record.site_id.clone(),
                    device_type: record.device_type.clone(),
                    last_seen: record.timestamp,
                    status: DeviceStatus::Online,
                    fields: record.field_map(),
                    active_alerts: 0,
                    uptime_pct: 100.0,
                };
                vacant.insert(CachedDevice { snapshot: snapshot.clone(), uptime_samples: VecDeque::new() });
                snapshot
            }
        };

        if let Some(old_site) = moved_from {
            if let Some(mut members) = self.sites.get_mut(&old_site) {
                members.remove(&record.device_id);
            }
        }
        self.sites
            .entry(record.site_id.clone())
            .or_default()
            .insert(record.device_id.clone());

        snapshot
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices.get(device_id).map(|d| d.snapshot.clone())
    }

    pub fn get_many(&self, device_ids: &[String]) -> HashMap<String, DeviceSnapshot> {
        device_ids
            .iter()
            .filter_map(|id| self.get(id).map(|s| (id.clone(), s)))
            .collect()
    }

    /// Device ids registered under a site, including ones that may have been
    /// removed from the cache since.
    pub fn site_members(&self, site_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sites
            .get(site_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn set_status(&self, device_id: &str, status: DeviceStatus) -> Option<DeviceSnapshot> {
        let mut device = self.devices.get_mut(device_id)?;
        device.snapshot.status = status;
        info!(device_id, %status, "Device status set manually");
        Some(device.snapshot.clone())
    }

    pub fn set_active_alerts(&self, device_id: &str, count: u32) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.snapshot.active_alerts = count;
        }
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let (_, device) = self.devices.remove(device_id)?;
        if let Some(mut members) = self.sites.get_mut(&device.snapshot.site_id) {
            members.remove(device_id);
        }
        info!(device_id, "Device evicted from status cache");
        Some(device.snapshot)
    }

    pub fn clear(&self) {
        let n = self.devices.len();
        self.devices.clear();
        self.sites.clear();
        info!("Device status cache cleared ({} devices)", n);
    }

    pub fn stats(&self) -> CacheStats {
        let mut oldest: Option<OffsetDateTime> = None;
        let mut newest: Option<OffsetDateTime> = None;
        for device in self.devices.iter() {
            let seen = device.snapshot.last_seen;
            oldest = Some(oldest.map_or(seen, |o| o.min(seen)));
            newest = Some(newest.map_or(seen, |n| n.max(seen)));
        }
        CacheStats { cached_devices: self.devices.len(), oldest_last_seen: oldest, newest_last_seen: newest }
    }

    /// Liveness sweep: ONLINE devices silent for longer than `window` go
    /// OFFLINE, and every device records one uptime sample.
    /// Returns `(device_id, site_id)` for each device that went offline.
    pub fn sweep_offline(&self, window: Duration, now: OffsetDateTime) -> Vec<(String, String)> {
        let cutoff = now - window;
        let mut went_offline = Vec::new();

        for mut device in self.devices.iter_mut() {
            let device = device.value_mut();
            if device.snapshot.status == DeviceStatus::Online && device.snapshot.last_seen < cutoff {
                device.snapshot.status = DeviceStatus::Offline;
                went_offline.push((device.snapshot.device_id.clone(), device.snapshot.site_id.clone()));
            }

            device.uptime_samples.push_back(device.snapshot.status == DeviceStatus::Online);
            while device.uptime_samples.len() > self.uptime_window {
                device.uptime_samples.pop_front();
            }
            let up = device.uptime_samples.iter().filter(|s| **s).count();
            device.snapshot.uptime_pct = up as f64 / device.uptime_samples.len() as f64 * 100.0;
        }

        if !went_offline.is_empty() {
            info!("Liveness sweep marked {} devices OFFLINE", went_offline.len());
        }
        went_offline
    }
}
