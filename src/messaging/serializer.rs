use crate::messaging::rabbitmq::error::RabbitMQError;
use serde::{de::DeserializeOwned, Serialize};

/// 消息序列化器
///
/// 決定消息本體的線上格式，以及發佈時設定的 content type。
pub trait MessageSerializer: Send + Sync + 'static {
    /// 發佈時使用的 content type
    fn content_type(&self) -> &'static str;

    fn serialize<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, RabbitMQError>;

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, RabbitMQError>;
}

/// UTF-8 JSON 序列化器
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, RabbitMQError> {
        Ok(serde_json::to_vec(message)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, RabbitMQError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
