use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::adapters::email::SmtpSettings;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id_prefix: String,
    pub mqtt_inflight: usize,
    pub instance_id: String,
    pub telemetry_topic: String,
    pub status_topic: String,
    pub dlq_topic: String,

    /// Postgres stores when set, in-memory stores otherwise.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub thresholds_file: Option<PathBuf>,
    pub notification_seed_file: Option<PathBuf>,

    pub worker_lanes: usize,
    pub lane_capacity: usize,
    pub ingest_channel_capacity: usize,

    pub liveness_window: Duration,
    pub sweep_interval: Duration,
    pub uptime_window: usize,
    pub aggregation_timeout: Duration,
    pub delta_change_threshold: f64,

    pub retry_backoff: Duration,
    pub max_retries: u32,
    pub retry_scan_interval: Duration,
    pub send_timeout: Duration,
    pub rules_cache_ttl: Duration,
    pub smtp: Option<SmtpSettings>,

    pub metrics_port: u16,
    pub kafka_brokers: Option<String>,
    pub kafka_group: String,
    pub kafka_topic: String,
    pub otlp_endpoint: Option<String>,
    pub shutdown_timeout: Duration,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

fn seconds(key: &str, default: u64) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(parsed(key, default)?))
}

fn millis(key: &str, default: u64) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(parsed(key, default)?))
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists, ignore if not

        let smtp = match optional("SMTP_HOST") {
            Some(host) => Some(SmtpSettings {
                host,
                port: parsed("SMTP_PORT", 587u16)?,
                username: optional("SMTP_USERNAME"),
                password: optional("SMTP_PASSWORD"),
                from: var_or("SMTP_FROM", "alerts@ems.local"),
            }),
            None => None,
        };

        let delta_change_threshold: f64 = parsed("DELTA_CHANGE_THRESHOLD", 0.01)?;
        if !(delta_change_threshold.is_finite() && delta_change_threshold >= 0.0) {
            anyhow::bail!("DELTA_CHANGE_THRESHOLD must be a non-negative number");
        }

        let config = AppConfig {
            mqtt_host: var_or("MQTT_HOST", "localhost"),
            mqtt_port: parsed("MQTT_PORT", 1883u16).context("MQTT_PORT must be a valid u16")?,
            mqtt_username: optional("MQTT_USERNAME"),
            mqtt_password: optional("MQTT_PASSWORD"),
            mqtt_client_id_prefix: var_or("MQTT_CLIENT_ID_PREFIX", "ems_ingestor"),
            mqtt_inflight: parsed("MQTT_INFLIGHT", 1000usize)?,
            instance_id: var_or("INSTANCE_ID", "1"),
            telemetry_topic: var_or("TELEMETRY_TOPIC", "$share/ems_ingestor/ecogrid/sites/+/devices/+/telemetry/+"),
            status_topic: var_or("STATUS_TOPIC", "$share/ems_ingestor/ecogrid/sites/+/devices/+/status"),
            dlq_topic: var_or("DLQ_TOPIC", "telemetry-dlq"),

            database_url: optional("DATABASE_URL"),
            db_max_connections: parsed("DB_MAX_CONNECTIONS", 10u32)?,
            thresholds_file: optional("THRESHOLDS_FILE").map(PathBuf::from),
            notification_seed_file: optional("NOTIFICATION_SEED_FILE").map(PathBuf::from),

            worker_lanes: parsed("WORKER_LANES", 8usize)?,
            lane_capacity: parsed("LANE_CAPACITY", 1000usize)?,
            ingest_channel_capacity: parsed("INGEST_CHANNEL_CAPACITY", 10000usize)?,

            liveness_window: seconds("LIVENESS_WINDOW_SECS", 300)?,
            sweep_interval: seconds("SWEEP_INTERVAL_SECS", 60)?,
            uptime_window: parsed("UPTIME_WINDOW_SAMPLES", 1440usize)?,
            aggregation_timeout: millis("AGGREGATION_TIMEOUT_MS", 5000)?,
            delta_change_threshold,

            retry_backoff: seconds("NOTIFICATION_RETRY_BACKOFF_SECS", 300)?,
            max_retries: parsed("NOTIFICATION_MAX_RETRIES", 3u32)?,
            retry_scan_interval: seconds("NOTIFICATION_RETRY_SCAN_SECS", 30)?,
            send_timeout: seconds("NOTIFICATION_SEND_TIMEOUT_SECS", 10)?,
            rules_cache_ttl: seconds("NOTIFICATION_RULES_TTL_SECS", 60)?,
            smtp,

            metrics_port: parsed("METRICS_PORT", 9000u16)?,
            kafka_brokers: optional("KAFKA_BROKERS"),
            kafka_group: var_or("KAFKA_GROUP", "ems_ingestor"),
            kafka_topic: var_or("KAFKA_TOPIC", "ems-telemetry"),
            otlp_endpoint: optional("OTEL_EXPORTER_OTLP_ENDPOINT"),
            shutdown_timeout: seconds("SHUTDOWN_TIMEOUT_SECS", 20)?,
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env is process-global; each test uses its own keys.

    #[test]
    fn test_parsed_uses_default_when_unset() {
        env::remove_var("EMS_TEST_UNSET_PORT");
        assert_eq!(parsed("EMS_TEST_UNSET_PORT", 1883u16).unwrap(), 1883);
    }

    #[test]
    fn test_parsed_rejects_garbage() {
        env::set_var("EMS_TEST_BAD_PORT", "not-a-port");
        let err = parsed("EMS_TEST_BAD_PORT", 1883u16).unwrap_err();
        assert!(err.to_string().contains("EMS_TEST_BAD_PORT"));
    }

    #[test]
    fn test_blank_counts_as_unset() {
        env::set_var("EMS_TEST_BLANK", "  ");
        assert_eq!(optional("EMS_TEST_BLANK"), None);
        assert_eq!(seconds("EMS_TEST_BLANK", 30).unwrap(), Duration::from_secs(30));
    }
}
