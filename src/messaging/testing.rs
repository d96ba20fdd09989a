//! 記憶體內的假 broker，記錄所有通道呼叫供單元測試檢查

use crate::messaging::protocol::MessageHeaders;
use crate::messaging::rabbitmq::driver::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConfirmEvent, Delivery, DeliveryStream,
    PublishProperties, ShutdownInitiator,
};
use crate::messaging::rabbitmq::error::RabbitMQError;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// 假 broker 的共享狀態
#[derive(Default)]
pub(crate) struct FakeBroker {
    connect_failures: AtomicUsize,
    connect_attempts: AtomicUsize,
    auto_confirm: AtomicBool,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn BrokerConnector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    /// 接下來 `count` 次連線嘗試會失敗
    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// 之後建立的通道會對每次發佈自動回覆正向確認
    pub fn set_auto_confirm(&self, enabled: bool) {
        self.auto_confirm.store(enabled, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connection(&self, index: usize) -> Arc<FakeConnection> {
        self.connections.lock()[index].clone()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn channel(&self, index: usize) -> Arc<FakeChannel> {
        self.channels.lock()[index].clone()
    }

    /// 模擬網路中斷：最新的連線與其通道都會關閉
    pub fn drop_connection(&self) {
        let connection = self.connections.lock().last().cloned();
        if let Some(connection) = connection {
            connection.shutdown(ShutdownInitiator::Peer);
        }
    }

    /// 等待通道數量達到 `count`
    pub async fn wait_for_channels(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.channel_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("channel was not created in time");
    }
}

struct FakeConnector {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, RabbitMQError> {
        self.broker.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .broker
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RabbitMQError::BrokerUnreachable("connection refused".into()));
        }

        let (state, _) = watch::channel(None);
        let connection = Arc::new(FakeConnection {
            broker: Arc::downgrade(&self.broker),
            state,
            channels: Mutex::new(Vec::new()),
        });
        self.broker.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

pub(crate) struct FakeConnection {
    broker: std::sync::Weak<FakeBroker>,
    state: watch::Sender<Option<ShutdownInitiator>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    fn shutdown(&self, initiator: ShutdownInitiator) {
        let channels = self.channels.lock().clone();
        for channel in channels {
            channel.shutdown();
        }
        self.state.send_replace(Some(initiator));
    }

    pub fn is_closed_by_application(&self) -> bool {
        *self.state.borrow() == Some(ShutdownInitiator::Application)
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        if self.state.borrow().is_some() {
            return Err(RabbitMQError::ChannelClosed);
        }
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| RabbitMQError::Other("broker dropped".into()))?;

        let channel = Arc::new(FakeChannel::new(broker.auto_confirm.load(Ordering::SeqCst)));
        self.channels.lock().push(channel.clone());
        broker.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn closed(&self) -> ShutdownInitiator {
        let mut state = self.state.subscribe();
        loop {
            if let Some(initiator) = *state.borrow_and_update() {
                return initiator;
            }
            if state.changed().await.is_err() {
                return ShutdownInitiator::Library;
            }
        }
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        self.shutdown(ShutdownInitiator::Application);
        Ok(())
    }
}

/// 記錄下來的發佈內容
#[derive(Clone, Debug)]
pub(crate) struct PublishedMessage {
    pub sequence_number: u64,
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub body: Vec<u8>,
    pub properties: PublishProperties,
}

pub(crate) struct FakeChannel {
    open: AtomicBool,
    auto_confirm: bool,
    publish_seq: AtomicU64,
    deliveries: Mutex<Option<mpsc::UnboundedSender<Result<Delivery, RabbitMQError>>>>,
    confirms: Mutex<Option<mpsc::UnboundedSender<ConfirmEvent>>>,
    pub qos: Mutex<Option<u16>>,
    pub declared_queues: Mutex<Vec<String>>,
    pub bindings: Mutex<Vec<(String, String, String)>>,
    pub consumed_queues: Mutex<Vec<String>>,
    pub acks: Mutex<Vec<u64>>,
    pub nacks: Mutex<Vec<(u64, bool)>>,
    pub published: Mutex<Vec<PublishedMessage>>,
}

impl FakeChannel {
    fn new(auto_confirm: bool) -> Self {
        Self {
            open: AtomicBool::new(true),
            auto_confirm,
            publish_seq: AtomicU64::new(1),
            deliveries: Mutex::new(None),
            confirms: Mutex::new(None),
            qos: Mutex::new(None),
            declared_queues: Mutex::new(Vec::new()),
            bindings: Mutex::new(Vec::new()),
            consumed_queues: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            nacks: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.deliveries.lock().take();
    }

    fn ensure_open(&self) -> Result<(), RabbitMQError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelClosed)
        }
    }

    /// 投遞原始內容到消費者
    pub fn deliver_raw(
        &self,
        delivery_tag: u64,
        routing_key: &str,
        data: Vec<u8>,
        headers: MessageHeaders,
    ) {
        let sender = self.deliveries.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(Ok(Delivery {
                delivery_tag,
                routing_key: routing_key.to_string(),
                headers,
                data,
                redelivered: false,
            }));
        }
    }

    /// 以 JSON 投遞消息到消費者
    pub fn deliver<T: Serialize>(&self, delivery_tag: u64, routing_key: &str, message: &T) {
        let data = serde_json::to_vec(message).expect("serializable test message");
        self.deliver_raw(delivery_tag, routing_key, data, MessageHeaders::new());
    }

    /// 模擬 broker 端結束消費流
    pub fn close_stream(&self) {
        self.deliveries.lock().take();
    }

    /// 送出確認事件
    pub fn confirm(&self, event: ConfirmEvent) {
        let sender = self.confirms.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    pub fn is_consuming(&self) -> bool {
        self.deliveries.lock().is_some()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.acks.lock().clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.nacks.lock().clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), RabbitMQError> {
        self.ensure_open()?;
        *self.qos.lock() = Some(prefetch_count);
        Ok(())
    }

    async fn declare_temporary_queue(&self, name: &str) -> Result<String, RabbitMQError> {
        self.ensure_open()?;
        self.declared_queues.lock().push(name.to_string());
        Ok(name.to_string())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), RabbitMQError> {
        self.ensure_open()?;
        self.bindings
            .lock()
            .push((queue.to_string(), exchange.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn basic_consume(&self, queue: &str) -> Result<(String, DeliveryStream), RabbitMQError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.deliveries.lock() = Some(tx);
        self.consumed_queues.lock().push(queue.to_string());

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok((format!("ctag-{}", queue), stream))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError> {
        self.ensure_open()?;
        self.acks.lock().push(delivery_tag);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError> {
        self.ensure_open()?;
        self.nacks.lock().push((delivery_tag, requeue));
        Ok(())
    }

    async fn confirm_select(&self) -> Result<mpsc::UnboundedReceiver<ConfirmEvent>, RabbitMQError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.confirms.lock() = Some(tx);
        Ok(rx)
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.publish_seq.load(Ordering::SeqCst)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<(), RabbitMQError> {
        self.ensure_open()?;
        let sequence_number = self.publish_seq.fetch_add(1, Ordering::SeqCst);
        self.published.lock().push(PublishedMessage {
            sequence_number,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory,
            body,
            properties,
        });
        if self.auto_confirm {
            self.confirm(ConfirmEvent::Ack {
                delivery_tag: sequence_number,
                multiple: false,
            });
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        self.shutdown();
        Ok(())
    }
}
