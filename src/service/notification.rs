//! Rule-based alert notification with per-user preferences, quiet hours and
//! retry.

use chrono::Timelike;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::notification::{in_quiet_hours, DeliveryEvent};
use crate::domain::{AlertEvent, DeliveryRecord, NotificationChannel, NotificationPreference};
use crate::error::{ChannelDeliveryError, RuleLookupError};
use crate::ports::{DeliveryStore, NotificationDirectory, NotificationSender};

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub retry_backoff: Duration,
    pub max_retries: u32,
    pub send_timeout: Duration,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(300),
            max_retries: 3,
            send_timeout: Duration::from_secs(10),
        }
    }
}

struct PendingRetry {
    record: DeliveryRecord,
    alert: AlertEvent,
    eligible_at: OffsetDateTime,
}

/// Hour of day in the named IANA zone.
pub fn local_hour(timezone: &str, now: OffsetDateTime) -> Option<u8> {
    let tz: chrono_tz::Tz = timezone.parse().ok()?;
    let utc = chrono::DateTime::from_timestamp(now.unix_timestamp(), 0)?;
    Some(utc.with_timezone(&tz).hour() as u8)
}

pub fn is_quiet(preference: &NotificationPreference, now: OffsetDateTime) -> Result<bool, RuleLookupError> {
    let Some((start, end)) = preference.quiet_hours() else {
        return Ok(false);
    };
    let hour = local_hour(&preference.timezone, now).ok_or_else(|| RuleLookupError::InvalidTimezone {
        user_id: preference.user_id.clone(),
        timezone: preference.timezone.clone(),
    })?;
    Ok(in_quiet_hours(start, end, hour))
}

pub struct NotificationEngine {
    directory: Arc<dyn NotificationDirectory>,
    store: Arc<dyn DeliveryStore>,
    senders: HashMap<NotificationChannel, Arc<dyn NotificationSender>>,
    retry_queue: DashMap<Uuid, PendingRetry>,
    settings: NotificationSettings,
}

impl NotificationEngine {
    pub fn new(
        directory: Arc<dyn NotificationDirectory>,
        store: Arc<dyn DeliveryStore>,
        senders: Vec<Arc<dyn NotificationSender>>,
        settings: NotificationSettings,
    ) -> Self {
        let senders = senders.into_iter().map(|s| (s.channel(), s)).collect();
        Self { directory, store, senders, retry_queue: DashMap::new(), settings }
    }

    /// Route one alert to every user with a matching rule.
    ///
    /// Matched rules are grouped per user so each (alert, user, channel)
    /// gets exactly one delivery record. Lookup failures skip the affected
    /// user only.
    #[instrument(skip(self, alert, now), fields(alert_id = %alert.id, alert_type = %alert.alert_type, site_id = %alert.site_id))]
    pub async fn process(&self, alert: &AlertEvent, now: OffsetDateTime) -> Vec<DeliveryRecord> {
        let rules = match self.directory.active_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!("{}", RuleLookupError::Rules(e.to_string()));
                return Vec::new();
            }
        };

        let mut by_user: BTreeMap<String, (bool, bool)> = BTreeMap::new();
        for rule in rules.iter().filter(|r| r.matches(alert)) {
            let flags = by_user.entry(rule.user_id.clone()).or_insert((false, false));
            flags.0 |= rule.email_enabled;
            flags.1 |= rule.websocket_enabled;
        }
        if by_user.is_empty() {
            debug!("No notification rules matched");
            return Vec::new();
        }

        let mut jobs = Vec::new();
        for (user_id, (email_rule, websocket_rule)) in by_user {
            let preference = match self.resolve_preferences(&user_id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };

            match is_quiet(&preference, now) {
                Ok(true) => {
                    debug!(user_id = %user_id, "Quiet hours; notification suppressed");
                    metrics::counter!("notifications_suppressed_total", 1, "reason" => "quiet_hours");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            }

            if email_rule && preference.email_enabled && self.senders.contains_key(&NotificationChannel::Email) {
                match &preference.email {
                    Some(address) => jobs.push(self.open_record(alert, &user_id, NotificationChannel::Email, address.clone(), now).await),
                    None => warn!(
                        "{}",
                        ChannelDeliveryError::NoRecipient { channel: NotificationChannel::Email, user_id: user_id.clone() }
                    ),
                }
            }
            if websocket_rule && preference.websocket_enabled && self.senders.contains_key(&NotificationChannel::Websocket) {
                let recipient = format!("user-{}", user_id);
                jobs.push(self.open_record(alert, &user_id, NotificationChannel::Websocket, recipient, now).await);
            }
        }

        let jobs = jobs.into_iter().map(|record| (record, alert.clone())).collect();
        self.dispatch(jobs, now).await
    }

    async fn resolve_preferences(&self, user_id: &str) -> Result<NotificationPreference, RuleLookupError> {
        let lookup = self.directory.preferences(user_id).await.map_err(|e| RuleLookupError::Preferences {
            user_id: user_id.to_string(),
            reason: e.to_string(),
        })?;

        match lookup {
            Some(p) => Ok(p),
            None => {
                let p = NotificationPreference::default_for(user_id);
                if let Err(e) = self.directory.save_preferences(&p).await {
                    warn!(user_id, "Could not persist default preferences: {:?}", e);
                }
                info!(user_id, "Created default notification preferences");
                Ok(p)
            }
        }
    }

    async fn open_record(
        &self,
        alert: &AlertEvent,
        user_id: &str,
        channel: NotificationChannel,
        recipient: String,
        now: OffsetDateTime,
    ) -> DeliveryRecord {
        let record = DeliveryRecord::pending(alert.id, user_id, channel, recipient, now);
        self.persist(&record).await;
        record
    }

    async fn persist(&self, record: &DeliveryRecord) {
        if let Err(e) = self.store.save(record).await {
            error!(record_id = %record.id, "Failed to persist delivery record: {:?}", e);
        }
    }

    /// Send every job concurrently; each send is its own task with its own
    /// timeout, so one slow channel cannot hold up another.
    ///
    /// Outcomes are stamped at the moment they come back, measured from
    /// `now`. A task that dies without reporting counts as a failed send.
    async fn dispatch(&self, jobs: Vec<(DeliveryRecord, AlertEvent)>, now: OffsetDateTime) -> Vec<DeliveryRecord> {
        let started = tokio::time::Instant::now();
        let mut set = JoinSet::new();
        let mut in_flight: HashMap<Uuid, (DeliveryRecord, AlertEvent)> = HashMap::new();

        for (record, alert) in jobs {
            let Some(sender) = self.senders.get(&record.channel).cloned() else {
                continue;
            };
            let timeout = self.settings.send_timeout;
            let (id, recipient, task_alert) = (record.id, record.recipient.clone(), alert.clone());
            set.spawn(async move {
                let channel = sender.channel();
                let result = match tokio::time::timeout(timeout, sender.send(&task_alert, &recipient)).await {
                    Ok(r) => r,
                    Err(_) => Err(ChannelDeliveryError::Timeout { channel, after: timeout }),
                };
                (id, result)
            });
            in_flight.insert(record.id, (record, alert));
        }

        let mut finished = Vec::with_capacity(in_flight.len());
        while let Some(joined) = set.join_next().await {
            let (id, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    error!("Notification send task failed: {:?}", e);
                    continue;
                }
            };
            let Some((record, alert)) = in_flight.remove(&id) else {
                continue;
            };
            let at = now + started.elapsed();
            if let Some(record) = self.settle(record, alert, result, at).await {
                finished.push(record);
            }
        }

        for (_, (record, alert)) in in_flight {
            let result = Err(ChannelDeliveryError::SendFailed {
                channel: record.channel,
                reason: "send task aborted".to_string(),
            });
            let at = now + started.elapsed();
            if let Some(record) = self.settle(record, alert, result, at).await {
                finished.push(record);
            }
        }
        finished
    }

    /// Apply one send outcome: advance the record, queue a retry when one is
    /// left, persist.
    async fn settle(
        &self,
        mut record: DeliveryRecord,
        alert: AlertEvent,
        result: Result<(), ChannelDeliveryError>,
        at: OffsetDateTime,
    ) -> Option<DeliveryRecord> {
        let event = match &result {
            Ok(()) => DeliveryEvent::Sent,
            Err(e) => DeliveryEvent::SendFailed(e.to_string()),
        };
        if let Err(e) = record.transition(event, at) {
            error!("{}", e);
            return None;
        }
        metrics::counter!(
            "notifications_total", 1,
            "channel" => record.channel.to_string(),
            "status" => record.status.to_string()
        );

        match result {
            Ok(()) => info!(record_id = %record.id, channel = %record.channel, "Notification delivered"),
            Err(e) if record.is_terminal(self.settings.max_retries) => {
                error!(record_id = %record.id, "Notification failed permanently after {} retries: {}", record.retry_count, e)
            }
            Err(e) => {
                warn!(record_id = %record.id, "Notification failed, retry scheduled: {}", e);
                self.retry_queue.insert(
                    record.id,
                    PendingRetry { record: record.clone(), alert, eligible_at: at + self.settings.retry_backoff },
                );
            }
        }

        self.persist(&record).await;
        Some(record)
    }

    /// Re-send every failed delivery whose backoff has elapsed.
    pub async fn retry_due(&self, now: OffsetDateTime) -> Vec<DeliveryRecord> {
        let due: Vec<Uuid> = self
            .retry_queue
            .iter()
            .filter(|p| p.eligible_at <= now)
            .map(|p| *p.key())
            .collect();

        let mut jobs = Vec::with_capacity(due.len());
        for id in due {
            // Removal claims the retry; a concurrent scan sees it gone.
            let Some((_, pending)) = self.retry_queue.remove(&id) else {
                continue;
            };
            let mut record = pending.record;
            if let Err(e) = record.transition(DeliveryEvent::RetryStarted, now) {
                error!("{}", e);
                continue;
            }
            self.persist(&record).await;
            jobs.push((record, pending.alert));
        }

        if !jobs.is_empty() {
            info!("Retrying {} notification deliveries", jobs.len());
        }
        self.dispatch(jobs, now).await
    }

    pub fn pending_retries(&self) -> usize {
        self.retry_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryDeliveryStore, InMemoryDirectory};
    use crate::domain::{DeliveryStatus, DeviceType, NotificationRule, Severity};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use time::macros::datetime;

    static NEXT_RULE_ID: AtomicUsize = AtomicUsize::new(1);

    struct MockSender {
        channel: NotificationChannel,
        failures_left: AtomicUsize,
        sent: Mutex<Vec<String>>,
    }

    impl MockSender {
        fn new(channel: NotificationChannel, failures: usize) -> Arc<Self> {
            Arc::new(Self { channel, failures_left: AtomicUsize::new(failures), sent: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl NotificationSender for MockSender {
        async fn send(&self, _alert: &AlertEvent, recipient: &str) -> Result<(), ChannelDeliveryError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ChannelDeliveryError::SendFailed { channel: self.channel, reason: "unavailable".into() });
            }
            self.sent.lock().unwrap().push(recipient.to_string());
            Ok(())
        }

        fn channel(&self) -> NotificationChannel {
            self.channel
        }
    }

    fn alert(alert_type: &str, severity: Severity) -> AlertEvent {
        AlertEvent::new(
            "BMS-SITE1-001".into(),
            "1".into(),
            DeviceType::Storage,
            alert_type.into(),
            severity,
            "temperature 50.00 exceeded threshold 45.00".into(),
            Some(45.0),
            Some(50.0),
            datetime!(2024-03-01 12:00 UTC),
        )
    }

    fn rule(user_id: &str, pattern: &str, min: Severity, email: bool, websocket: bool) -> NotificationRule {
        NotificationRule {
            id: NEXT_RULE_ID.fetch_add(1, Ordering::SeqCst) as i64,
            user_id: user_id.into(),
            site_id: None,
            device_id: None,
            alert_type: pattern.into(),
            min_severity: min,
            email_enabled: email,
            websocket_enabled: websocket,
            active: true,
        }
    }

    fn preference(user_id: &str) -> NotificationPreference {
        let mut p = NotificationPreference::default_for(user_id);
        p.email = Some(format!("{}@example.com", user_id));
        p
    }

    struct Harness {
        directory: Arc<InMemoryDirectory>,
        store: Arc<InMemoryDeliveryStore>,
        email: Arc<MockSender>,
        websocket: Arc<MockSender>,
        engine: NotificationEngine,
    }

    fn harness(email_failures: usize) -> Harness {
        let directory = Arc::new(InMemoryDirectory::new());
        let store = Arc::new(InMemoryDeliveryStore::new());
        let email = MockSender::new(NotificationChannel::Email, email_failures);
        let websocket = MockSender::new(NotificationChannel::Websocket, 0);
        let engine = NotificationEngine::new(
            directory.clone(),
            store.clone(),
            vec![email.clone(), websocket.clone()],
            NotificationSettings { max_retries: 2, ..Default::default() },
        );
        Harness { directory, store, email, websocket, engine }
    }

    #[tokio::test]
    async fn test_one_record_per_user_and_channel() {
        let h = harness(0);
        h.directory.add_rule(rule("u1", "HIGH_TEMPERATURE", Severity::Low, true, false));
        h.directory.add_rule(rule("u1", "HIGH_*", Severity::Medium, false, true));
        h.directory.add_rule(rule("u2", "LOW_SOC", Severity::Low, true, true));
        h.directory.save_preferences(&preference("u1")).await.unwrap();

        let a = alert("HIGH_TEMPERATURE", Severity::High);
        let records = h.engine.process(&a, datetime!(2024-03-01 12:00 UTC)).await;

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == DeliveryStatus::Delivered));
        assert_eq!(*h.email.sent.lock().unwrap(), vec!["u1@example.com".to_string()]);
        assert_eq!(*h.websocket.sent.lock().unwrap(), vec!["user-u1".to_string()]);
        assert_eq!(h.store.records_for_alert(a.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_default_preferences_created_lazily() {
        let h = harness(0);
        h.directory.add_rule(rule("u9", "*", Severity::Low, true, true));

        let records = h.engine.process(&alert("LOW_SOC", Severity::Medium), datetime!(2024-03-01 12:00 UTC)).await;

        // No address on the default preference, so only the push channel goes out.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].channel, NotificationChannel::Websocket);
        let saved = h.directory.preferences("u9").await.unwrap().unwrap();
        assert!(saved.email_enabled && saved.websocket_enabled);
    }

    #[tokio::test]
    async fn test_quiet_hours_suppress_all_channels() {
        let h = harness(0);
        h.directory.add_rule(rule("u1", "*", Severity::Low, true, true));
        let mut p = preference("u1");
        p.quiet_hours_start = Some(22);
        p.quiet_hours_end = Some(6);
        p.timezone = "Europe/Berlin".into();
        h.directory.save_preferences(&p).await.unwrap();

        // 22:30 UTC is 23:30 in Berlin (CET).
        let late = h.engine.process(&alert("LOW_SOC", Severity::High), datetime!(2024-03-01 22:30 UTC)).await;
        assert!(late.is_empty());

        // 09:00 UTC is 10:00 local.
        let morning = h.engine.process(&alert("LOW_SOC", Severity::High), datetime!(2024-03-01 09:00 UTC)).await;
        assert_eq!(morning.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_timezone_skips_only_that_user() {
        let h = harness(0);
        h.directory.add_rule(rule("u1", "*", Severity::Low, false, true));
        h.directory.add_rule(rule("u2", "*", Severity::Low, false, true));
        let mut bad = preference("u1");
        bad.quiet_hours_start = Some(1);
        bad.quiet_hours_end = Some(2);
        bad.timezone = "Mars/Olympus".into();
        h.directory.save_preferences(&bad).await.unwrap();

        let records = h.engine.process(&alert("LOW_SOC", Severity::High), datetime!(2024-03-01 12:00 UTC)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id, "u2");
    }

    #[tokio::test]
    async fn test_failed_channel_is_isolated_and_retried() {
        let h = harness(1);
        h.directory.add_rule(rule("u1", "*", Severity::Low, true, true));
        h.directory.save_preferences(&preference("u1")).await.unwrap();
        let t0 = datetime!(2024-03-01 12:00 UTC);

        let records = h.engine.process(&alert("LOW_SOC", Severity::High), t0).await;
        let email = records.iter().find(|r| r.channel == NotificationChannel::Email).unwrap();
        let push = records.iter().find(|r| r.channel == NotificationChannel::Websocket).unwrap();
        assert_eq!(email.status, DeliveryStatus::Failed);
        assert_eq!(push.status, DeliveryStatus::Delivered);
        assert_eq!(h.engine.pending_retries(), 1);

        assert!(h.engine.retry_due(t0 + Duration::from_secs(60)).await.is_empty(), "backoff not elapsed");

        let retried = h.engine.retry_due(t0 + Duration::from_secs(301)).await;
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].id, email.id, "retry advances the same record");
        assert_eq!(retried[0].status, DeliveryStatus::Delivered);
        assert_eq!(retried[0].retry_count, 1);
        assert_eq!(h.engine.pending_retries(), 0);
    }

    #[tokio::test]
    async fn test_retries_stop_at_max() {
        let h = harness(10);
        h.directory.add_rule(rule("u1", "*", Severity::Low, true, false));
        h.directory.save_preferences(&preference("u1")).await.unwrap();
        let mut now = datetime!(2024-03-01 12:00 UTC);

        h.engine.process(&alert("LOW_SOC", Severity::High), now).await;
        for _ in 0..2 {
            now += Duration::from_secs(301);
            let retried = h.engine.retry_due(now).await;
            assert_eq!(retried[0].status, DeliveryStatus::Failed);
        }
        assert_eq!(h.engine.pending_retries(), 0, "terminal after max retries");
    }

    struct StuckSender {
        channel: NotificationChannel,
    }

    #[async_trait]
    impl NotificationSender for StuckSender {
        async fn send(&self, _alert: &AlertEvent, _recipient: &str) -> Result<(), ChannelDeliveryError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        fn channel(&self) -> NotificationChannel {
            self.channel
        }
    }

    struct PanickingSender;

    #[async_trait]
    impl NotificationSender for PanickingSender {
        async fn send(&self, _alert: &AlertEvent, _recipient: &str) -> Result<(), ChannelDeliveryError> {
            panic!("smtp client bug");
        }

        fn channel(&self) -> NotificationChannel {
            NotificationChannel::Email
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_fails_record_and_queues_retry() {
        let directory = Arc::new(InMemoryDirectory::new());
        let store = Arc::new(InMemoryDeliveryStore::new());
        let websocket = MockSender::new(NotificationChannel::Websocket, 0);
        let engine = NotificationEngine::new(
            directory.clone(),
            store.clone(),
            vec![Arc::new(StuckSender { channel: NotificationChannel::Email }), websocket.clone()],
            NotificationSettings { send_timeout: Duration::from_secs(2), ..Default::default() },
        );
        directory.add_rule(rule("u1", "*", Severity::Low, true, true));
        directory.save_preferences(&preference("u1")).await.unwrap();
        let t0 = datetime!(2024-03-01 12:00 UTC);

        let a = alert("LOW_SOC", Severity::High);
        let records = engine.process(&a, t0).await;

        let email = records.iter().find(|r| r.channel == NotificationChannel::Email).unwrap();
        assert_eq!(email.status, DeliveryStatus::Failed);
        assert!(email.error_message.as_deref().unwrap().contains("timed out"));
        assert!(email.updated_at >= t0 + Duration::from_secs(2), "stamped when the timeout fired");
        let push = records.iter().find(|r| r.channel == NotificationChannel::Websocket).unwrap();
        assert_eq!(push.status, DeliveryStatus::Delivered);
        assert_eq!(engine.pending_retries(), 1);

        let stored = store.records_for_alert(a.id).await.unwrap();
        assert!(stored.iter().any(|r| r.id == email.id && r.status == DeliveryStatus::Failed));

        let retried = engine.retry_due(email.updated_at + Duration::from_secs(300)).await;
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].id, email.id);
        assert_eq!(retried[0].retry_count, 1);
        assert_eq!(retried[0].status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_panicking_sender_counts_as_failed_send() {
        let directory = Arc::new(InMemoryDirectory::new());
        let store = Arc::new(InMemoryDeliveryStore::new());
        let engine = NotificationEngine::new(
            directory.clone(),
            store.clone(),
            vec![Arc::new(PanickingSender)],
            NotificationSettings::default(),
        );
        directory.add_rule(rule("u1", "*", Severity::Low, true, false));
        directory.save_preferences(&preference("u1")).await.unwrap();

        let a = alert("LOW_SOC", Severity::High);
        let records = engine.process(&a, datetime!(2024-03-01 12:00 UTC)).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeliveryStatus::Failed);
        assert_eq!(engine.pending_retries(), 1);
        let stored = store.records_for_alert(a.id).await.unwrap();
        assert_eq!(stored[0].status, DeliveryStatus::Failed, "not left PENDING");
    }

    #[test]
    fn test_local_hour() {
        assert_eq!(local_hour("UTC", datetime!(2024-03-01 23:15 UTC)), Some(23));
        assert_eq!(local_hour("Asia/Tokyo", datetime!(2024-03-01 20:00 UTC)), Some(5));
        assert_eq!(local_hour("Nowhere/Special", datetime!(2024-03-01 20:00 UTC)), None);
    }
}
