use async_trait::async_trait;
use std::sync::Arc;
use tracing::instrument;

use crate::domain::{AlertEvent, NotificationChannel};
use crate::error::ChannelDeliveryError;
use crate::ports::{MessageBroker, NotificationSender};

/// Websocket channel: the alert is published on the user's push topic and the
/// socket gateway fans it out to connected sessions.
pub struct PushSender {
    broker: Arc<dyn MessageBroker>,
}

impl PushSender {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    /// Recipients look like `user-{id}`.
    pub fn topic_for(recipient: &str) -> String {
        let user_id = recipient.strip_prefix("user-").unwrap_or(recipient);
        format!("users/{}/alerts", user_id)
    }
}

#[async_trait]
impl NotificationSender for PushSender {
    #[instrument(skip(self, alert), fields(alert_id = %alert.id))]
    async fn send(&self, alert: &AlertEvent, recipient: &str) -> Result<(), ChannelDeliveryError> {
        let failed = |reason: String| ChannelDeliveryError::SendFailed { channel: NotificationChannel::Websocket, reason };
        let payload = serde_json::to_vec(alert).map_err(|e| failed(e.to_string()))?;
        self.broker
            .publish(&Self::topic_for(recipient), payload)
            .await
            .map_err(|e| failed(e.to_string()))
    }

    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Websocket
    }
}
