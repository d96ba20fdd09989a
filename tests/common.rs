#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rabbitmq_wrapper::messaging::{
    DeliveryTag, MessageHeaders, MessageSource, QueueMessage, RabbitMQError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// 記憶體內的消息來源，記錄所有確認操作
pub struct FakeSource<T> {
    sender: mpsc::UnboundedSender<QueueMessage<T>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueMessage<T>>>,
    next_tag: AtomicU64,
    acks: Mutex<Vec<u64>>,
    nacks: Mutex<Vec<(u64, bool)>>,
}

impl<T: Send + Sync + 'static> FakeSource<T> {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            next_tag: AtomicU64::new(1),
            acks: Mutex::new(Vec::new()),
            nacks: Mutex::new(Vec::new()),
        })
    }

    /// 投遞一則消息，回傳其 delivery tag 數值
    pub fn push(&self, routing_key: &str, message: T) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let message = QueueMessage::new(
            message,
            DeliveryTag::new(1, tag),
            routing_key,
            MessageHeaders::new(),
        );
        self.sender.send(message).expect("receiver alive");
        tag
    }

    /// 以 trait object 形式交給監聽器
    pub fn handle(self: &Arc<Self>) -> Arc<dyn MessageSource<T>> {
        self.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.acks.lock().clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.nacks.lock().clone()
    }

    pub fn settled(&self) -> usize {
        self.acks.lock().len() + self.nacks.lock().len()
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> MessageSource<T> for FakeSource<T> {
    fn name(&self) -> &str {
        "fake"
    }

    fn message_wait_timeout(&self) -> Duration {
        Duration::from_millis(20)
    }

    async fn try_get_next_message(&self, timeout: Duration) -> Option<QueueMessage<T>> {
        let mut receiver = self.receiver.lock().await;
        tokio::time::timeout(timeout, receiver.recv()).await.ok().flatten()
    }

    async fn acknowledge(&self, delivery_tag: DeliveryTag) -> Result<(), RabbitMQError> {
        self.acks.lock().push(delivery_tag.value());
        Ok(())
    }

    async fn negatively_acknowledge(&self, delivery_tag: DeliveryTag) {
        self.nacks.lock().push((delivery_tag.value(), false));
    }

    async fn negatively_acknowledge_and_requeue(&self, delivery_tag: DeliveryTag) {
        self.nacks.lock().push((delivery_tag.value(), true));
    }
}

/// 等待條件成立，最多兩秒
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
