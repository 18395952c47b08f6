use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{AlertEvent, Severity};
use crate::error::TransitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationChannel {
    Email,
    Websocket,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationChannel::Email => write!(f, "EMAIL"),
            NotificationChannel::Websocket => write!(f, "WEBSOCKET"),
        }
    }
}

impl FromStr for NotificationChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(NotificationChannel::Email),
            "WEBSOCKET" => Ok(NotificationChannel::Websocket),
            other => Err(format!("unknown notification channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRule {
    pub id: i64,
    pub user_id: String,
    pub site_id: Option<String>,
    pub device_id: Option<String>,
    /// Exact alert type, or a prefix pattern such as `BATTERY_*`.
    pub alert_type: String,
    pub min_severity: Severity,
    pub email_enabled: bool,
    pub websocket_enabled: bool,
    pub active: bool,
}

impl NotificationRule {
    pub fn matches(&self, alert: &AlertEvent) -> bool {
        self.active
            && self.site_id.as_deref().map_or(true, |s| s == alert.site_id)
            && self.device_id.as_deref().map_or(true, |d| d == alert.device_id)
            && alert_type_matches(&self.alert_type, &alert.alert_type)
            && alert.severity >= self.min_severity
    }
}

/// `*` matches everything; a pattern ending in `*` or `_` is a prefix.
pub fn alert_type_matches(pattern: &str, alert_type: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        return alert_type.starts_with(prefix);
    }
    if pattern.ends_with('_') {
        return alert_type.starts_with(pattern);
    }
    pattern == alert_type
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DigestFrequency {
    Hourly,
    Daily,
    Weekly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreference {
    pub user_id: String,
    pub email: Option<String>,
    pub email_enabled: bool,
    pub websocket_enabled: bool,
    pub digest_enabled: bool,
    pub digest_frequency: DigestFrequency,
    /// Hour of day, 0-23. Both ends must be set for quiet hours to apply.
    pub quiet_hours_start: Option<u8>,
    pub quiet_hours_end: Option<u8>,
    pub timezone: String,
}

impl NotificationPreference {
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: None,
            email_enabled: true,
            websocket_enabled: true,
            digest_enabled: false,
            digest_frequency: DigestFrequency::Daily,
            quiet_hours_start: None,
            quiet_hours_end: None,
            timezone: "UTC".to_string(),
        }
    }

    pub fn quiet_hours(&self) -> Option<(u8, u8)> {
        match (self.quiet_hours_start, self.quiet_hours_end) {
            (Some(start), Some(end)) if start < 24 && end < 24 => Some((start, end)),
            _ => None,
        }
    }

    pub fn channel_enabled(&self, channel: NotificationChannel) -> bool {
        match channel {
            NotificationChannel::Email => self.email_enabled,
            NotificationChannel::Websocket => self.websocket_enabled,
        }
    }
}

/// `[start, end)` when `start <= end`, otherwise the window wraps midnight.
pub fn in_quiet_hours(start: u8, end: u8, hour: u8) -> bool {
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Retrying,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Retrying => "RETRYING",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "DELIVERED" => Ok(DeliveryStatus::Delivered),
            "FAILED" => Ok(DeliveryStatus::Failed),
            "RETRYING" => Ok(DeliveryStatus::Retrying),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    Sent,
    SendFailed(String),
    RetryStarted,
}

impl fmt::Display for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryEvent::Sent => write!(f, "sent"),
            DeliveryEvent::SendFailed(_) => write!(f, "send_failed"),
            DeliveryEvent::RetryStarted => write!(f, "retry_started"),
        }
    }
}

/// One delivery lineage per (alert, user, channel). Identity fields are
/// fixed at creation; only status, error and retry bookkeeping move, and
/// only through [`DeliveryRecord::transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub user_id: String,
    pub channel: NotificationChannel,
    pub status: DeliveryStatus,
    pub recipient: String,
    pub error_message: Option<String>,
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<OffsetDateTime>,
}

impl DeliveryRecord {
    pub fn pending(
        alert_id: Uuid,
        user_id: &str,
        channel: NotificationChannel,
        recipient: String,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_id,
            user_id: user_id.to_string(),
            channel,
            status: DeliveryStatus::Pending,
            recipient,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            delivered_at: None,
        }
    }

    pub fn transition(&mut self, event: DeliveryEvent, at: OffsetDateTime) -> Result<(), TransitionError> {
        use DeliveryStatus::*;
        let next = match (self.status, &event) {
            (Pending | Retrying, DeliveryEvent::Sent) => Delivered,
            (Pending | Retrying, DeliveryEvent::SendFailed(_)) => Failed,
            (Failed, DeliveryEvent::RetryStarted) => Retrying,
            (from, _) => {
                return Err(TransitionError { from, event: event.to_string() });
            }
        };

        match event {
            DeliveryEvent::Sent => {
                self.delivered_at = Some(at);
                self.error_message = None;
            }
            DeliveryEvent::SendFailed(reason) => self.error_message = Some(reason),
            DeliveryEvent::RetryStarted => self.retry_count += 1,
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    pub fn is_terminal(&self, max_retries: u32) -> bool {
        match self.status {
            DeliveryStatus::Delivered => true,
            DeliveryStatus::Failed => self.retry_count >= max_retries,
            _ => false,
        }
    }
}
