use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use std::time::Duration;
use tracing::instrument;

use crate::config::AppConfig;
use crate::ports::MessageBroker;

pub struct MqttAdapter {
    client: AsyncClient,
}

impl MqttAdapter {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    pub fn options(config: &AppConfig) -> MqttOptions {
        // Stable client id so the broker keeps our session across restarts.
        let client_id = format!("{}_{}", config.mqtt_client_id_prefix, config.instance_id);

        let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        if let (Some(user), Some(pass)) = (&config.mqtt_username, &config.mqtt_password) {
            options.set_credentials(user, pass);
        }
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(false);
        options
    }

    /// Client plus the event loop that must be polled for it to make progress.
    pub fn build(config: &AppConfig) -> (AsyncClient, EventLoop) {
        AsyncClient::new(Self::options(config), config.mqtt_inflight)
    }
}

#[async_trait]
impl MessageBroker for MqttAdapter {
    #[instrument(skip(self, payload), fields(topic = %topic, payload_size = payload.len()))]
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| anyhow::anyhow!("MQTT Publish Failed: {:?}", e))?;
        Ok(())
    }
}
