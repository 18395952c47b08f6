//! Postgres-backed collaborators: the platform's notification rules,
//! preferences and device registry (read-mostly), plus this service's own
//! delivery history.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::notification::DigestFrequency;
use crate::domain::{DeliveryRecord, DeviceType, NotificationPreference, NotificationRule, Severity};
use crate::ports::{DeliveryStore, DeviceInfo, DeviceRegistry, NotificationDirectory};

/// Rules are cached and reloaded once older than `rules_ttl`; preferences
/// are read through on every lookup.
pub struct PgNotificationDirectory {
    pool: PgPool,
    rules: RwLock<Option<(Instant, Arc<Vec<NotificationRule>>)>>,
    rules_ttl: Duration,
}

impl PgNotificationDirectory {
    pub fn new(pool: PgPool, rules_ttl: Duration) -> Self {
        Self { pool, rules: RwLock::new(None), rules_ttl }
    }

    async fn load_rules(&self) -> anyhow::Result<Vec<NotificationRule>> {
        // Rules scope devices by primary key; alerts carry the serial number.
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.user_id::text AS user_id, r.site_id::text AS site_id,
                   d.serial_number AS device_id, r.alert_type, r.min_severity,
                   r.email_enabled, r.websocket_enabled, r.active
            FROM notification_rules r
            LEFT JOIN devices d ON d.id = r.device_id
            WHERE r.active = true
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // A broken row skips that rule only; the rest still route alerts.
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let rule = RuleRow::from_row(&row)
                .map_err(|e| e.to_string())
                .and_then(NotificationRule::try_from);
            match rule {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    let rule_id = row.try_get::<i64, _>("id").ok();
                    warn!(rule_id = ?rule_id, "Skipping notification rule: {}", e);
                }
            }
        }
        debug!("Loaded {} active notification rules", rules.len());
        Ok(rules)
    }
}

/// A `notification_rules` row as stored; the platform does not enforce
/// NOT NULL on the scope and flag columns.
#[derive(Debug, Default, FromRow)]
struct RuleRow {
    id: i64,
    user_id: Option<String>,
    site_id: Option<String>,
    device_id: Option<String>,
    alert_type: Option<String>,
    min_severity: Option<String>,
    email_enabled: Option<bool>,
    websocket_enabled: Option<bool>,
    active: Option<bool>,
}

impl TryFrom<RuleRow> for NotificationRule {
    type Error = String;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        fn required<T>(value: Option<T>, column: &str) -> Result<T, String> {
            value.ok_or_else(|| format!("column {} is NULL", column))
        }

        let user_id = required(row.user_id, "user_id")?;
        let alert_type = required(row.alert_type, "alert_type")?;
        if alert_type.trim().is_empty() {
            return Err("column alert_type is empty".to_string());
        }
        Ok(NotificationRule {
            id: row.id,
            user_id,
            site_id: row.site_id,
            device_id: row.device_id,
            alert_type,
            min_severity: required(row.min_severity, "min_severity")?.parse::<Severity>()?,
            email_enabled: required(row.email_enabled, "email_enabled")?,
            websocket_enabled: required(row.websocket_enabled, "websocket_enabled")?,
            active: row.active.unwrap_or(false),
        })
    }
}

fn digest_frequency(raw: Option<String>) -> DigestFrequency {
    match raw.as_deref().map(str::to_ascii_uppercase).as_deref() {
        Some("HOURLY") => DigestFrequency::Hourly,
        Some("WEEKLY") => DigestFrequency::Weekly,
        _ => DigestFrequency::Daily,
    }
}

fn digest_label(frequency: DigestFrequency) -> &'static str {
    match frequency {
        DigestFrequency::Hourly => "HOURLY",
        DigestFrequency::Daily => "DAILY",
        DigestFrequency::Weekly => "WEEKLY",
    }
}

fn hour(raw: Option<i32>) -> Option<u8> {
    raw.and_then(|h| u8::try_from(h).ok()).filter(|h| *h < 24)
}

fn preference_from_row(row: &PgRow) -> Result<NotificationPreference, sqlx::Error> {
    Ok(NotificationPreference {
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        email_enabled: row.try_get::<Option<bool>, _>("email_enabled")?.unwrap_or(true),
        websocket_enabled: row.try_get::<Option<bool>, _>("websocket_enabled")?.unwrap_or(true),
        digest_enabled: row.try_get::<Option<bool>, _>("digest_enabled")?.unwrap_or(false),
        digest_frequency: digest_frequency(row.try_get("digest_frequency")?),
        quiet_hours_start: hour(row.try_get("quiet_hours_start")?),
        quiet_hours_end: hour(row.try_get("quiet_hours_end")?),
        timezone: row
            .try_get::<Option<String>, _>("timezone")?
            .unwrap_or_else(|| "UTC".to_string()),
    })
}

#[async_trait]
impl NotificationDirectory for PgNotificationDirectory {
    async fn active_rules(&self) -> anyhow::Result<Vec<NotificationRule>> {
        if let Some((loaded_at, rules)) = self.rules.read().await.as_ref() {
            if loaded_at.elapsed() < self.rules_ttl {
                return Ok(rules.as_ref().clone());
            }
        }

        let rules = Arc::new(self.load_rules().await?);
        *self.rules.write().await = Some((Instant::now(), rules.clone()));
        Ok(rules.as_ref().clone())
    }

    #[instrument(skip(self))]
    async fn preferences(&self, user_id: &str) -> anyhow::Result<Option<NotificationPreference>> {
        let row = sqlx::query(
            r#"
            SELECT user_id::text AS user_id, email, email_enabled, websocket_enabled,
                   digest_enabled, digest_frequency, quiet_hours_start, quiet_hours_end, timezone
            FROM notification_preferences
            WHERE user_id::text = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(preference_from_row).transpose()?)
    }

    async fn save_preferences(&self, p: &NotificationPreference) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_preferences
                (user_id, email, email_enabled, websocket_enabled, digest_enabled, digest_frequency,
                 quiet_hours_start, quiet_hours_end, timezone, created_at, updated_at)
            VALUES ($1::bigint, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&p.user_id)
        .bind(&p.email)
        .bind(p.email_enabled)
        .bind(p.websocket_enabled)
        .bind(p.digest_enabled)
        .bind(digest_label(p.digest_frequency))
        .bind(p.quiet_hours_start.map(i32::from))
        .bind(p.quiet_hours_end.map(i32::from))
        .bind(&p.timezone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PgDeliveryStore {
    pool: PgPool,
}

impl PgDeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &PgRow) -> anyhow::Result<DeliveryRecord> {
    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("status")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    Ok(DeliveryRecord {
        id: row.try_get("id")?,
        alert_id: row.try_get("alert_id")?,
        user_id: row.try_get("user_id")?,
        channel: channel.parse().map_err(anyhow::Error::msg)?,
        status: status.parse().map_err(anyhow::Error::msg)?,
        recipient: row.try_get("recipient")?,
        error_message: row.try_get("error_message")?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}

#[async_trait]
impl DeliveryStore for PgDeliveryStore {
    #[instrument(skip(self, record), fields(record_id = %record.id, status = %record.status))]
    async fn save(&self, record: &DeliveryRecord) -> anyhow::Result<()> {
        // Identity columns are written once; only the lifecycle columns move.
        sqlx::query(
            r#"
            INSERT INTO notification_deliveries
                (id, alert_id, user_id, channel, status, recipient, error_message,
                 retry_count, created_at, updated_at, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                error_message = EXCLUDED.error_message,
                retry_count = EXCLUDED.retry_count,
                updated_at = EXCLUDED.updated_at,
                delivered_at = EXCLUDED.delivered_at
            "#,
        )
        .bind(record.id)
        .bind(record.alert_id)
        .bind(&record.user_id)
        .bind(record.channel.to_string())
        .bind(record.status.to_string())
        .bind(&record.recipient)
        .bind(&record.error_message)
        .bind(i32::try_from(record.retry_count).unwrap_or(i32::MAX))
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.delivered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn records_for_alert(&self, alert_id: Uuid) -> anyhow::Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, alert_id, user_id, channel, status, recipient, error_message,
                   retry_count, created_at, updated_at, delivered_at
            FROM notification_deliveries
            WHERE alert_id = $1
            ORDER BY created_at, channel
            "#,
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

/// Device lookups against the platform registry, cached per serial number.
pub struct PgDeviceRegistry {
    pool: PgPool,
    cache: DashMap<String, DeviceInfo>,
}

impl PgDeviceRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, cache: DashMap::new() }
    }
}

#[async_trait]
impl DeviceRegistry for PgDeviceRegistry {
    #[instrument(skip(self))]
    async fn lookup(&self, device_id: &str) -> anyhow::Result<Option<DeviceInfo>> {
        if let Some(info) = self.cache.get(device_id) {
            return Ok(Some(info.clone()));
        }

        let row = sqlx::query(
            r#"
            SELECT d.serial_number, d.site_id::text AS site_id, dt.name AS device_type,
                   (dt.specifications->>'capacity_kwh')::float8 AS rated_capacity
            FROM devices d
            JOIN device_types dt ON dt.id = d.device_type_id
            WHERE d.serial_number = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tag: String = row.try_get("device_type")?;
        let info = DeviceInfo {
            device_id: row.try_get("serial_number")?,
            site_id: row.try_get("site_id")?,
            device_type: DeviceType::from_tag(&tag),
            rated_capacity: row.try_get("rated_capacity")?,
        };
        self.cache.insert(device_id.to_string(), info.clone());
        Ok(Some(info))
    }
}
