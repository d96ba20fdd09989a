//! Broker 驅動抽象層
//!
//! ConnectionHandler、QueueConsumer 與 QueuePublisher 只透過這裡的特徵操作 broker，
//! 正式環境由 `amqp` 模組以 lapin 實現，測試則使用記憶體內的假 broker。

use crate::messaging::protocol::MessageHeaders;
use crate::messaging::rabbitmq::error::RabbitMQError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 投遞消息流
pub type DeliveryStream = BoxStream<'static, Result<Delivery, RabbitMQError>>;

/// broker 投遞的原始消息
#[derive(Clone, Debug)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub headers: MessageHeaders,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

/// 發佈時附帶的屬性
#[derive(Clone, Debug, Default)]
pub struct PublishProperties {
    pub app_id: String,
    pub content_type: String,
    pub headers: MessageHeaders,
    pub persistent: bool,
    /// UNIX 秒數
    pub timestamp: u64,
}

/// 發佈確認事件
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmEvent {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool },
    /// mandatory 消息無法路由而被退回
    Returned {
        exchange: String,
        routing_key: String,
        reply_code: u16,
        reply_text: String,
    },
}

/// 連線關閉的發起者
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownInitiator {
    /// 應用程式主動關閉
    Application,
    /// 用戶端函式庫偵測到錯誤
    Library,
    /// broker 端關閉或網路中斷
    Peer,
}

/// 建立 broker 連線
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, RabbitMQError>;
}

/// 一條 broker 連線
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, RabbitMQError>;

    /// 連線結束時完成，回傳關閉的發起者
    async fn closed(&self) -> ShutdownInitiator;

    async fn close(&self) -> Result<(), RabbitMQError>;
}

/// 在連線上多工的通道
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), RabbitMQError>;

    /// 宣告 durable、exclusive、auto-delete 的臨時佇列，回傳佇列名稱
    async fn declare_temporary_queue(&self, name: &str) -> Result<String, RabbitMQError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), RabbitMQError>;

    /// 開始消費，回傳 consumer tag 與投遞流
    async fn basic_consume(&self, queue: &str) -> Result<(String, DeliveryStream), RabbitMQError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError>;

    /// 啟用 publisher confirm，回傳確認事件接收端
    async fn confirm_select(&self) -> Result<mpsc::UnboundedReceiver<ConfirmEvent>, RabbitMQError>;

    /// 下一次發佈將使用的序號
    fn next_publish_seq_no(&self) -> u64;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<(), RabbitMQError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), RabbitMQError>;
}
