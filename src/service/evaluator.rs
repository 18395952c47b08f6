use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{AlertEvent, Severity, TelemetryRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Exceeds,
    Below,
    Equals,
}

/// One configured threshold, keyed by alert type in a [`ThresholdSet`].
///
/// Well-known alert types (`HIGH_TEMPERATURE`, `LOW_SOC`, ...) imply their
/// field and direction, so the stored form can be as small as
/// `{"threshold": 45, "severity": "HIGH"}`. Anything else must name both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdSpec {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
    pub severity: Severity,
    #[serde(default)]
    pub direction: Option<Direction>,
    /// Sentinel for `Equals` rules, e.g. `"FAULT"`.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ThresholdSpec {
    pub fn new(threshold: f64, severity: Severity) -> Self {
        Self { field: None, threshold: Some(threshold), severity, direction: None, value: None, message: None }
    }

    pub fn sentinel(severity: Severity) -> Self {
        Self { field: None, threshold: None, severity, direction: None, value: None, message: None }
    }
}

/// Alert type -> threshold. Ordered so evaluation output is deterministic.
pub type ThresholdSet = BTreeMap<String, ThresholdSpec>;

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Exceeds(f64),
    Below(f64),
    Equals(String),
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedRule {
    field: String,
    condition: Condition,
}

fn known_defaults(alert_type: &str) -> Option<(&'static str, Direction, Option<&'static str>)> {
    match alert_type {
        "HIGH_TEMPERATURE" => Some(("temperature", Direction::Exceeds, None)),
        "LOW_SOC" => Some(("soc", Direction::Below, None)),
        "HIGH_PANEL_TEMPERATURE" => Some(("panelTemperature", Direction::Exceeds, None)),
        "LOW_POWER_OUTPUT" => Some(("currentOutput", Direction::Below, None)),
        "INVERTER_FAULT" => Some(("inverterStatus", Direction::Equals, Some("FAULT"))),
        "LOW_UTILIZATION" => Some(("utilizationRate", Direction::Below, None)),
        "PAYMENT_SYSTEM_FAULT" => Some(("paymentSystemStatus", Direction::Equals, Some("OFFLINE"))),
        _ => None,
    }
}

fn resolve(alert_type: &str, spec: &ThresholdSpec) -> Option<ResolvedRule> {
    let defaults = known_defaults(alert_type);
    let field = spec.field.clone().or_else(|| defaults.map(|(f, _, _)| f.to_string()))?;
    let direction = spec.direction.or_else(|| defaults.map(|(_, d, _)| d))?;

    let condition = match direction {
        Direction::Exceeds => Condition::Exceeds(spec.threshold?),
        Direction::Below => Condition::Below(spec.threshold?),
        Direction::Equals => {
            let sentinel = spec.value.clone().or_else(|| defaults.and_then(|(_, _, v)| v.map(str::to_string)))?;
            Condition::Equals(sentinel)
        }
    };
    Some(ResolvedRule { field, condition })
}

/// True when a threshold entry can never fire because it names neither a
/// field nor a direction it can infer. Used to warn at configuration load.
pub fn is_unresolvable(alert_type: &str, spec: &ThresholdSpec) -> bool {
    resolve(alert_type, spec).is_none()
}

/// Check a record against every configured threshold.
///
/// Emits one event per triggered rule. Rules whose field is absent from the
/// record are skipped. There is no dedup or hysteresis: a condition that
/// stays true alerts on every message.
pub fn evaluate(record: &TelemetryRecord, thresholds: &ThresholdSet) -> Vec<AlertEvent> {
    let mut alerts = Vec::new();

    for (alert_type, spec) in thresholds {
        let Some(rule) = resolve(alert_type, spec) else {
            continue;
        };

        let hit = match &rule.condition {
            Condition::Exceeds(limit) => record
                .get_value(&rule.field)
                .filter(|v| v > limit)
                .map(|v| (Some(*limit), Some(v), format!("{} {:.2} exceeded threshold {:.2}", rule.field, v, limit))),
            Condition::Below(limit) => record
                .get_value(&rule.field)
                .filter(|v| v < limit)
                .map(|v| (Some(*limit), Some(v), format!("{} {:.2} below threshold {:.2}", rule.field, v, limit))),
            Condition::Equals(sentinel) => record
                .get_text(&rule.field)
                .filter(|t| t.eq_ignore_ascii_case(sentinel))
                .map(|t| (None, None, format!("{} is {}", rule.field, t))),
        };

        if let Some((threshold_value, actual_value, default_message)) = hit {
            alerts.push(AlertEvent::new(
                record.device_id.clone(),
                record.site_id.clone(),
                record.device_type.clone(),
                alert_type.clone(),
                spec.severity,
                spec.message.clone().unwrap_or(default_message),
                threshold_value,
                actual_value,
                record.timestamp,
            ));
        }
    }

    alerts
}
