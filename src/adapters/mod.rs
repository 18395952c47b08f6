pub mod dlq;
pub mod email;
pub mod memory;
pub mod mqtt;
pub mod postgres;
pub mod push;
#[cfg(feature = "kafka")]
pub mod stream_consumer;

pub use dlq::BrokerDlq;
pub use email::EmailSender;
pub use mqtt::MqttAdapter;
pub use push::PushSender;
#[cfg(feature = "kafka")]
pub use stream_consumer::{KafkaAdapter, KafkaProducer};
