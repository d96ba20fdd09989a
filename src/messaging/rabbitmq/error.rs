use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

/// RabbitMQ 系統通用錯誤類型
#[derive(Error, Debug)]
pub enum RabbitMQError {
    #[error("Broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("Lapin error: {0}")]
    Lapin(#[from] LapinError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Delivery stream closed")]
    StreamClosed,

    #[error("Client certificate not found for subject: {0}")]
    CertificateNotFound(String),

    #[error("Invalid broker uri: {0}")]
    InvalidUri(String),

    #[error("No consumer configured with name: {0}")]
    ConsumerNotFound(String),

    #[error("No publisher configured with name: {0}")]
    PublisherNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Other error: {0}")]
    Other(String),
}

impl RabbitMQError {
    /// 是否為連線層級的暫時性錯誤
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RabbitMQError::BrokerUnreachable(_)
                | RabbitMQError::ChannelClosed
                | RabbitMQError::StreamClosed
                | RabbitMQError::Lapin(_)
        )
    }
}

/// 將字符串錯誤轉換為 RabbitMQ 錯誤
impl From<String> for RabbitMQError {
    fn from(error: String) -> Self {
        RabbitMQError::Other(error)
    }
}

/// 將 &str 錯誤轉換為 RabbitMQ 錯誤
impl From<&str> for RabbitMQError {
    fn from(error: &str) -> Self {
        RabbitMQError::Other(error.to_string())
    }
}
