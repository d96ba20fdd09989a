// RabbitMQ 模組
// 連線管理、消費者與發佈者，以及底層驅動的抽象

// 導出子模組
pub mod amqp;
pub mod certificate;
pub mod connection;
pub mod consumer;
pub mod driver;
pub mod error;
pub mod publisher;

// 重新導出常用結構
pub use amqp::LapinConnector;
pub use certificate::{CertificateResolver, ClientIdentity, FileCertificateResolver};
pub use connection::{ConnectionEvent, ConnectionHandler, ConnectionObserver, ConnectionState};
pub use consumer::QueueConsumer;
pub use driver::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConfirmEvent, Delivery, DeliveryStream,
    PublishProperties, ShutdownInitiator,
};
pub use error::RabbitMQError;
pub use publisher::{QueuePublisher, UnackedMessage};
