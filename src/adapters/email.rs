use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, instrument};

use crate::domain::{AlertEvent, NotificationChannel};
use crate::error::ChannelDeliveryError;
use crate::ports::NotificationSender;

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

/// Plain-text alert mail over SMTP. One attempt per call; the notification
/// engine owns retries.
pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    pub fn new(settings: &SmtpSettings) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)?.port(settings.port);
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid SMTP from address '{}': {}", settings.from, e))?;

        Ok(Self { transport: builder.build(), from })
    }

    pub fn subject(alert: &AlertEvent) -> String {
        format!("[EMS][{}] {} - {}", alert.severity, alert.alert_type, alert.device_id)
    }

    pub fn body(alert: &AlertEvent) -> String {
        let mut body = format!(
            "Alert: {}\nSeverity: {}\nSite: {}\nDevice: {} ({})\nMessage: {}",
            alert.alert_type, alert.severity, alert.site_id, alert.device_id, alert.device_type, alert.message
        );
        if let Some(actual) = alert.actual_value {
            body.push_str(&format!("\nValue: {:.2}", actual));
        }
        if let Some(threshold) = alert.threshold_value {
            body.push_str(&format!("\nThreshold: {:.2}", threshold));
        }
        body.push_str(&format!("\nTime: {}", alert.created_at));
        body
    }

    fn failed(reason: impl ToString) -> ChannelDeliveryError {
        ChannelDeliveryError::SendFailed { channel: NotificationChannel::Email, reason: reason.to_string() }
    }
}

#[async_trait]
impl NotificationSender for EmailSender {
    #[instrument(skip(self, alert), fields(alert_id = %alert.id))]
    async fn send(&self, alert: &AlertEvent, recipient: &str) -> Result<(), ChannelDeliveryError> {
        let to: Mailbox = recipient.parse().map_err(Self::failed)?;
        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(Self::subject(alert))
            .header(ContentType::TEXT_PLAIN)
            .body(Self::body(alert))
            .map_err(Self::failed)?;

        self.transport.send(email).await.map_err(Self::failed)?;
        debug!(recipient, "Alert email sent");
        Ok(())
    }

    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Email
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceType, Severity};
    use time::macros::datetime;

    fn alert() -> AlertEvent {
        AlertEvent::new(
            "BMS-SITE1-001".into(),
            "1".into(),
            DeviceType::Storage,
            "HIGH_TEMPERATURE".into(),
            Severity::High,
            "Battery temperature 50.0 exceeds 45.0".into(),
            Some(45.0),
            Some(50.0),
            datetime!(2024-03-01 12:00 UTC),
        )
    }

    #[test]
    fn test_subject_carries_severity_type_and_device() {
        assert_eq!(EmailSender::subject(&alert()), "[EMS][HIGH] HIGH_TEMPERATURE - BMS-SITE1-001");
    }

    #[test]
    fn test_body_lists_value_and_threshold() {
        let body = EmailSender::body(&alert());
        assert!(body.contains("Value: 50.00"));
        assert!(body.contains("Threshold: 45.00"));
        assert!(body.contains("Site: 1"));
    }

    #[test]
    fn test_rejects_bad_from_address() {
        let settings = SmtpSettings {
            host: "localhost".into(),
            port: 25,
            username: None,
            password: None,
            from: "not an address".into(),
        };
        assert!(EmailSender::new(&settings).is_err());
    }
}
