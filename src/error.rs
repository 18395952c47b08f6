use std::time::Duration;

use crate::domain::{DeliveryStatus, NotificationChannel};

/// A required field was missing or out of bounds. Never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Validation: field '{field}' {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &str, reason: impl Into<String>) -> Self {
        Self { field: field.to_string(), reason: reason.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not JSON, not an object, or a field had the wrong type.
    #[error("Decode: malformed payload: {0}")]
    Malformed(String),

    /// The device-type tag does not map to a known schema. The raw payload
    /// travels with the error so it can be dead-lettered intact.
    #[error("Decode: unsupported device type '{tag}'")]
    UnsupportedDeviceType { tag: String, payload: Vec<u8> },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The topic names no site/device pair.
    #[error("Decode: unroutable topic '{0}'")]
    UnroutableTopic(String),
}

impl DecodeError {
    /// Metric label for the rejection reason.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::UnsupportedDeviceType { .. } => "unsupported_device_type",
            DecodeError::Validation(_) => "validation",
            DecodeError::UnroutableTopic(_) => "topic",
        }
    }
}

/// A device listed for a site had no usable cache snapshot.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Cache: no usable snapshot for device '{device_id}': {reason}")]
pub struct CacheMissError {
    pub device_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelDeliveryError {
    #[error("Delivery: {channel} send failed: {reason}")]
    SendFailed { channel: NotificationChannel, reason: String },

    #[error("Delivery: {channel} send timed out after {after:?}")]
    Timeout { channel: NotificationChannel, after: Duration },

    #[error("Delivery: no {channel} recipient for user '{user_id}'")]
    NoRecipient { channel: NotificationChannel, user_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RuleLookupError {
    #[error("Rules: rule store unavailable: {0}")]
    Rules(String),

    #[error("Rules: preferences for user '{user_id}' unavailable: {reason}")]
    Preferences { user_id: String, reason: String },

    #[error("Rules: invalid timezone '{timezone}' for user '{user_id}'")]
    InvalidTimezone { user_id: String, timezone: String },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Delivery: invalid transition from {from} on {event}")]
pub struct TransitionError {
    pub from: DeliveryStatus,
    pub event: String,
}
