//! Type-aware decoding of raw telemetry payloads.
//!
//! Decoding is a pure function of the payload and its [`DecodeContext`]:
//! the same bytes with the same context always yield the same record.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::domain::telemetry::{ChargerReadings, SolarReadings, StorageReadings};
use crate::domain::{DeviceType, QualityIndicators, Readings, TelemetryRecord};
use crate::error::{DecodeError, ValidationError};

/// Everything about a message that does not come from its payload.
#[derive(Debug, Clone)]
pub struct DecodeContext<'a> {
    pub device_id: &'a str,
    pub site_id: &'a str,
    pub device_type: &'a DeviceType,
    /// Fallback timestamp when the payload carries none (or an unparseable one).
    pub received_at: OffsetDateTime,
    /// Registry-rated capacity, used when storage telemetry omits `nominalCapacity`.
    pub rated_capacity: Option<f64>,
}

const STORAGE_PERCENT: &[&str] = &["soc", "efficiency"];
const STORAGE_NON_NEGATIVE: &[&str] = &["remainingCapacity", "nominalCapacity"];

const SOLAR_PERCENT: &[&str] = &["inverterEfficiency", "systemEfficiency", "performanceRatio"];
const SOLAR_NON_NEGATIVE: &[&str] = &["currentOutput", "energyYield", "energyYieldTotal", "irradiance"];

const CHARGER_PERCENT: &[&str] = &["utilizationRate", "uptime"];
const CHARGER_NON_NEGATIVE: &[&str] = &["powerDelivered", "energyDelivered", "revenue", "avgSessionDuration"];

pub fn decode(ctx: &DecodeContext<'_>, payload: &[u8]) -> Result<TelemetryRecord, DecodeError> {
    if let DeviceType::Unknown(tag) = ctx.device_type {
        return Err(DecodeError::UnsupportedDeviceType { tag: tag.clone(), payload: payload.to_vec() });
    }

    let value: Value = serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(DecodeError::Malformed("payload is not a JSON object".into()));
    };

    let timestamp = fields
        .get("timestamp")
        .and_then(parse_timestamp)
        .unwrap_or(ctx.received_at);

    let quality = match fields.remove("quality") {
        Some(Value::Null) | None => None,
        Some(q) => Some(
            serde_json::from_value::<QualityIndicators>(q)
                .map_err(|e| DecodeError::Malformed(format!("quality: {e}")))?,
        ),
    };

    let readings = match ctx.device_type {
        DeviceType::Storage => {
            if !fields.contains_key("nominalCapacity") {
                if let Some(rated) = ctx.rated_capacity {
                    fields.insert("nominalCapacity".into(), Value::from(rated));
                }
            }
            require(&fields, &["soc", "remainingCapacity", "nominalCapacity"])?;
            check_bounds(&fields, STORAGE_PERCENT, STORAGE_NON_NEGATIVE)?;
            Readings::Storage(typed::<StorageReadings>(fields)?)
        }
        DeviceType::Solar => {
            require(&fields, &["currentOutput"])?;
            check_bounds(&fields, SOLAR_PERCENT, SOLAR_NON_NEGATIVE)?;
            Readings::Solar(typed::<SolarReadings>(fields)?)
        }
        DeviceType::Charger => {
            require(&fields, &["activeSessions", "powerDelivered"])?;
            check_bounds(&fields, CHARGER_PERCENT, CHARGER_NON_NEGATIVE)?;
            Readings::Charger(typed::<ChargerReadings>(fields)?)
        }
        DeviceType::Unknown(tag) => {
            return Err(DecodeError::UnsupportedDeviceType { tag: tag.clone(), payload: payload.to_vec() });
        }
    };

    Ok(TelemetryRecord {
        device_id: ctx.device_id.to_string(),
        site_id: ctx.site_id.to_string(),
        device_type: ctx.device_type.clone(),
        timestamp,
        readings,
        quality,
    })
}

fn require(fields: &Map<String, Value>, required: &[&str]) -> Result<(), ValidationError> {
    for field in required {
        match fields.get(*field) {
            None | Some(Value::Null) => return Err(ValidationError::new(field, "is required")),
            Some(v) if !v.is_number() => return Err(ValidationError::new(field, "must be numeric")),
            _ => {}
        }
    }
    Ok(())
}

fn check_bounds(fields: &Map<String, Value>, percent: &[&str], non_negative: &[&str]) -> Result<(), ValidationError> {
    let number = |field: &str| fields.get(field).and_then(Value::as_f64);

    for field in percent {
        if let Some(v) = number(field) {
            if !(0.0..=100.0).contains(&v) {
                return Err(ValidationError::new(field, format!("must be within [0, 100], got {v}")));
            }
        }
    }
    for field in non_negative {
        if let Some(v) = number(field) {
            if v < 0.0 {
                return Err(ValidationError::new(field, format!("must be non-negative, got {v}")));
            }
        }
    }
    Ok(())
}

fn typed<T: DeserializeOwned>(fields: Map<String, Value>) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(fields)).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// RFC 3339, then a zone-less `yyyy-MM-ddTHH:mm:ss[.SSS]` read as UTC, then
/// epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(s) => {
            if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
                return Some(ts);
            }
            let naive = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
            let naive_frac = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
            PrimitiveDateTime::parse(s, naive)
                .or_else(|_| PrimitiveDateTime::parse(s, naive_frac))
                .ok()
                .map(PrimitiveDateTime::assume_utc)
        }
        Value::Number(n) => {
            let millis = n.as_i64()?;
            OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).ok()
        }
        _ => None,
    }
}
