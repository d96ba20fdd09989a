// 消息系統模組
// 提供可自我修復的 RabbitMQ 連線、消費、發佈，以及建構在消費者之上的監聽器

// 導出子模組
pub mod listener;
pub mod protocol;
pub mod rabbitmq;
pub mod serializer;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;

// 重新導出常用類型
pub use listener::{
    AcknowledgeBehaviour, Acknowledger, AggregateEventListener, EventListener, ListenerError,
    MessageAggregator, MessageProcessor, MessageSource, ProcessingError, SequentialMessageProcessor,
    SequentialProcessingEventListener,
};
pub use protocol::{DeliveryTag, MessageHeaders, QueueMessage};
pub use rabbitmq::{ConnectionHandler, QueueConsumer, QueuePublisher, RabbitMQError};
pub use serializer::{JsonSerializer, MessageSerializer};
pub use validation::{AcceptAll, MessageValidator};
