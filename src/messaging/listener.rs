// 監聽器模組
// 從消息來源持續拉取消息，依確認策略分派給應用程式的處理器

pub mod acknowledger;
pub mod aggregate;
pub mod event_listener;
pub mod sequential;

use crate::messaging::protocol::{DeliveryTag, QueueMessage};
use crate::messaging::rabbitmq::consumer::QueueConsumer;
use crate::messaging::rabbitmq::error::RabbitMQError;
use crate::messaging::serializer::MessageSerializer;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use acknowledger::Acknowledger;
pub use aggregate::{AggregateEventListener, MessageAggregator};
pub use event_listener::{EventListener, MessageProcessor};
pub use sequential::{
    default_lane_key, SequentialMessageProcessor, SequentialProcessingEventListener,
};

/// 消息確認策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcknowledgeBehaviour {
    /// 處理成功後確認，失敗則拒絕
    #[default]
    AfterProcess,
    /// 收到後立即確認，處理錯誤只記錄
    BeforeProcess,
    /// 從不自動確認
    Never,
    /// 由外部透過 `Acknowledger` 非同步確認
    Async,
}

/// 應用程式處理器回傳的錯誤
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// 無法恢復的錯誤，監聽器會停止並向上傳遞
    #[error("fatal processing error: {0}")]
    Fatal(#[source] anyhow::Error),

    /// 一般處理失敗，消息被拒絕後繼續運行
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ProcessingError {
    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Fatal(error.into())
    }

    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Failed(error.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessingError::Fatal(_))
    }
}

/// 監聽器 `run` 的終止原因
#[derive(Debug, Clone, Error)]
pub enum ListenerError {
    #[error("listener stopped after fatal error: {0}")]
    Fatal(#[source] Arc<ProcessingError>),

    #[error("processing task panicked: {0}")]
    TaskPanicked(String),
}

/// 監聽器使用的消息來源
///
/// `QueueConsumer` 是正式實作；測試可以替換成記憶體內的來源。
#[async_trait]
pub trait MessageSource<T>: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// 每次拉取消息的等待上限
    fn message_wait_timeout(&self) -> Duration;

    async fn try_get_next_message(&self, timeout: Duration) -> Option<QueueMessage<T>>;

    async fn acknowledge(&self, delivery_tag: DeliveryTag) -> Result<(), RabbitMQError>;

    async fn negatively_acknowledge(&self, delivery_tag: DeliveryTag);

    async fn negatively_acknowledge_and_requeue(&self, delivery_tag: DeliveryTag);
}

#[async_trait]
impl<T, S> MessageSource<T> for QueueConsumer<T, S>
where
    T: DeserializeOwned + Send + Sync + 'static,
    S: MessageSerializer,
{
    fn name(&self) -> &str {
        QueueConsumer::name(self)
    }

    fn message_wait_timeout(&self) -> Duration {
        self.configuration().message_wait_timeout()
    }

    async fn try_get_next_message(&self, timeout: Duration) -> Option<QueueMessage<T>> {
        QueueConsumer::try_get_next_message(self, timeout).await
    }

    async fn acknowledge(&self, delivery_tag: DeliveryTag) -> Result<(), RabbitMQError> {
        QueueConsumer::acknowledge(self, delivery_tag).await
    }

    async fn negatively_acknowledge(&self, delivery_tag: DeliveryTag) {
        QueueConsumer::negatively_acknowledge(self, delivery_tag).await
    }

    async fn negatively_acknowledge_and_requeue(&self, delivery_tag: DeliveryTag) {
        QueueConsumer::negatively_acknowledge_and_requeue(self, delivery_tag).await
    }
}
