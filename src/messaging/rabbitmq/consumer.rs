use crate::config::{ConsumerConfig, QueueWrapperConfig};
use crate::messaging::protocol::{DeliveryTag, QueueMessage};
use crate::messaging::rabbitmq::connection::{ConnectionHandler, ConnectionObserver};
use crate::messaging::rabbitmq::driver::{BrokerChannel, Delivery, DeliveryStream};
use crate::messaging::rabbitmq::error::RabbitMQError;
use crate::messaging::serializer::{JsonSerializer, MessageSerializer};
use crate::messaging::validation::MessageValidator;
use crate::monitor::{BrokerMetrics, MetricType};
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 佇列消費者
///
/// 從單一佇列拉取消息，反序列化並驗證後交給呼叫者；無效消息直接拒絕且不重新排隊。
/// 斷線期間的確認操作都是 no-op，連線恢復後自動重新訂閱。
pub struct QueueConsumer<T, S = JsonSerializer> {
    inner: Arc<ConsumerInner<T, S>>,
}

impl<T, S> Clone for QueueConsumer<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ConsumerInner<T, S> {
    name: String,
    config: ConsumerConfig,
    prefetch_count: u16,
    temporary_queue_name_prefix: String,
    connection: ConnectionHandler,
    validator: Box<dyn MessageValidator<T>>,
    serializer: S,
    channel: Mutex<Option<ConsumerChannel>>,
    deliveries: Mutex<Option<(u64, DeliveryStream)>>,
    available: watch::Sender<bool>,
    session: AtomicU64,
    resubscribing: AtomicBool,
    _message: PhantomData<fn() -> T>,
}

struct ConsumerChannel {
    channel: Arc<dyn BrokerChannel>,
    queue_name: String,
    session: u64,
}

impl<T> QueueConsumer<T, JsonSerializer>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// 依名稱創建 JSON 消費者
    pub async fn new(
        name: &str,
        config: &QueueWrapperConfig,
        connection: ConnectionHandler,
        validator: impl MessageValidator<T>,
    ) -> Result<Self, RabbitMQError> {
        Self::with_serializer(name, config, connection, validator, JsonSerializer).await
    }
}

impl<T, S> QueueConsumer<T, S>
where
    T: DeserializeOwned + Send + Sync + 'static,
    S: MessageSerializer,
{
    /// 使用指定的序列化器創建消費者
    ///
    /// 找不到名稱對應的配置時回傳 `ConsumerNotFound`。
    pub async fn with_serializer(
        name: &str,
        config: &QueueWrapperConfig,
        connection: ConnectionHandler,
        validator: impl MessageValidator<T>,
        serializer: S,
    ) -> Result<Self, RabbitMQError> {
        let consumer_config = config
            .consumer(name)
            .cloned()
            .ok_or_else(|| RabbitMQError::ConsumerNotFound(name.to_string()))?;

        let (available, _) = watch::channel(false);
        let inner = Arc::new(ConsumerInner {
            name: name.to_string(),
            config: consumer_config,
            prefetch_count: config.message_prefetch_count,
            temporary_queue_name_prefix: config.temporary_queue_name_prefix.clone(),
            connection,
            validator: Box::new(validator),
            serializer,
            channel: Mutex::new(None),
            deliveries: Mutex::new(None),
            available,
            session: AtomicU64::new(0),
            resubscribing: AtomicBool::new(false),
            _message: PhantomData,
        });

        {
            let mut channel = inner.channel.lock().await;
            inner.subscribe_until_ready(&mut channel).await?;
        }

        let observer = Arc::downgrade(&inner) as Weak<dyn ConnectionObserver>;
        inner.connection.register_observer(observer);

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 此消費者使用的配置
    pub fn configuration(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// 目前消費的佇列名稱 (臨時佇列每次重新訂閱都會改變)
    pub async fn queue_name(&self) -> Option<String> {
        self.inner
            .channel
            .lock()
            .await
            .as_ref()
            .map(|channel| channel.queue_name.clone())
    }

    /// 通道是否可用
    pub fn is_available(&self) -> bool {
        *self.inner.available.borrow()
    }

    /// 最多等待 `timeout` 取得下一則有效消息
    ///
    /// 逾時、取消或消息無效時回傳 `None`。
    pub async fn try_get_next_message(&self, timeout: Duration) -> Option<QueueMessage<T>> {
        let deadline = Instant::now() + timeout;
        let cancellation = self.inner.connection.cancellation_token();

        loop {
            if !self.inner.wait_until_available(deadline).await {
                return None;
            }

            let mut deliveries = tokio::select! {
                _ = cancellation.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => return None,
                guard = self.inner.deliveries.lock() => guard,
            };

            let next = match deliveries.as_mut() {
                Some((session, stream)) => {
                    let session = *session;
                    tokio::select! {
                        _ = cancellation.cancelled() => return None,
                        next = tokio::time::timeout_at(deadline, stream.next()) => match next {
                            Err(_) => return None,
                            Ok(next) => next.map(|delivery| (session, delivery)),
                        },
                    }
                }
                None => None,
            };

            match next {
                Some((session, Ok(delivery))) => {
                    drop(deliveries);
                    if !self.is_available() {
                        // 斷線期間收到的消息會由 broker 重新投遞
                        debug!(
                            consumer = %self.inner.name,
                            delivery_tag = delivery.delivery_tag,
                            "Discarding delivery received while connection is lost"
                        );
                        continue;
                    }
                    BrokerMetrics::record(&self.inner.name, MetricType::DeliveryReceived, None);
                    return self.decode(session, delivery).await;
                }
                Some((_, Err(e))) => {
                    deliveries.take();
                    drop(deliveries);
                    self.handle_stream_closed(Some(e)).await;
                }
                None => {
                    deliveries.take();
                    drop(deliveries);
                    self.handle_stream_closed(None).await;
                }
            }
        }
    }

    async fn handle_stream_closed(&self, error: Option<RabbitMQError>) {
        if self.inner.connection.connection_shutting_down() {
            return;
        }

        match error {
            Some(e) => warn!(consumer = %self.inner.name, "Delivery stream failed: {}", e),
            None => warn!(consumer = %self.inner.name, "Delivery stream closed by broker"),
        }

        // 視為一次隱含的斷線，稍後重新訂閱
        self.inner.mark_lost();
        if self.inner.resubscribing.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let cancellation = inner.connection.cancellation_token();
            tokio::select! {
                _ = cancellation.cancelled() => {}
                _ = tokio::time::sleep(inner.connection.retry_interval()) => {
                    inner.resubscribe().await;
                }
            }
            inner.resubscribing.store(false, Ordering::SeqCst);
        });
    }

    async fn decode(&self, session: u64, delivery: Delivery) -> Option<QueueMessage<T>> {
        let delivery_tag = DeliveryTag::new(session, delivery.delivery_tag);

        let message: T = match self.inner.serializer.deserialize(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    consumer = %self.inner.name,
                    %delivery_tag,
                    "Unable to deserialize message, rejecting: {}", e
                );
                self.reject(delivery_tag, "deserialization").await;
                return None;
            }
        };

        if let Err(reason) = self.inner.validator.try_validate(&message) {
            error!(
                consumer = %self.inner.name,
                %delivery_tag,
                "Message failed validation, rejecting: {}", reason
            );
            self.reject(delivery_tag, "validation").await;
            return None;
        }

        Some(QueueMessage::new(
            message,
            delivery_tag,
            delivery.routing_key,
            delivery.headers,
        ))
    }

    async fn reject(&self, delivery_tag: DeliveryTag, reason: &'static str) {
        BrokerMetrics::record(&self.inner.name, MetricType::DeliveryRejected { reason }, None);
        self.negatively_acknowledge(delivery_tag).await;
    }

    /// 確認消息
    pub async fn acknowledge(&self, delivery_tag: DeliveryTag) -> Result<(), RabbitMQError> {
        let Some(channel) = self.inner.channel_for(delivery_tag).await else {
            return Ok(());
        };
        channel.basic_ack(delivery_tag.value()).await?;
        BrokerMetrics::record(&self.inner.name, MetricType::Acknowledged { kind: "ack" }, None);
        Ok(())
    }

    /// 拒絕消息且不重新排隊，失敗只記錄日誌
    pub async fn negatively_acknowledge(&self, delivery_tag: DeliveryTag) {
        self.inner.nack(delivery_tag, false).await;
    }

    /// 拒絕消息並重新排隊，失敗只記錄日誌
    pub async fn negatively_acknowledge_and_requeue(&self, delivery_tag: DeliveryTag) {
        self.inner.nack(delivery_tag, true).await;
    }

    /// 關閉通道並停止消費
    pub async fn close(&self) {
        self.inner.available.send_replace(false);
        let mut channel = self.inner.channel.lock().await;
        self.inner.deliveries.lock().await.take();
        if let Some(current) = channel.take() {
            if let Err(e) = current.channel.close().await {
                debug!(consumer = %self.inner.name, "Failed to close channel: {}", e);
            }
        }
        info!(consumer = %self.inner.name, "Consumer closed");
    }
}

impl<T, S> ConsumerInner<T, S>
where
    T: DeserializeOwned + Send + Sync + 'static,
    S: MessageSerializer,
{
    /// 取得與標籤同一 session 的通道；斷線中或過期的標籤回傳 `None`
    async fn channel_for(&self, delivery_tag: DeliveryTag) -> Option<Arc<dyn BrokerChannel>> {
        if !*self.available.borrow() {
            debug!(
                consumer = %self.name,
                %delivery_tag,
                "Connection lost, ignoring acknowledgement"
            );
            return None;
        }

        let guard = self.channel.lock().await;
        match guard.as_ref() {
            Some(current)
                if current.session == delivery_tag.session() && *self.available.borrow() =>
            {
                Some(current.channel.clone())
            }
            _ => {
                debug!(
                    consumer = %self.name,
                    %delivery_tag,
                    "Ignoring acknowledgement for stale delivery tag"
                );
                None
            }
        }
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) {
        let Some(channel) = self.channel_for(delivery_tag).await else {
            return;
        };
        match channel.basic_nack(delivery_tag.value(), requeue).await {
            Ok(()) => {
                let kind = if requeue { "nack_requeue" } else { "nack" };
                BrokerMetrics::record(&self.name, MetricType::Acknowledged { kind }, None);
            }
            // 通道失效時 broker 會自行重新投遞
            Err(e) => warn!(
                consumer = %self.name,
                %delivery_tag,
                requeue,
                "Negative acknowledgement failed: {}",
                e
            ),
        }
    }

    async fn wait_until_available(&self, deadline: Instant) -> bool {
        let cancellation = self.connection.cancellation_token();
        let mut available = self.available.subscribe();
        loop {
            if *available.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancellation.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return false,
                changed = available.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn mark_lost(&self) {
        if self.available.send_replace(false) {
            BrokerMetrics::record(&self.name, MetricType::ConnectionLost, None);
            warn!(consumer = %self.name, "Consumer unavailable until connection is restored");
        }
    }

    async fn resubscribe(&self) {
        let mut channel = self.channel.lock().await;
        if *self.available.borrow() {
            return;
        }
        match self.subscribe_until_ready(&mut channel).await {
            Ok(()) => BrokerMetrics::record(&self.name, MetricType::ConnectionRestored, None),
            Err(e) => debug!(consumer = %self.name, "Resubscribe abandoned: {}", e),
        }
    }

    /// 重試訂閱直到成功；只有取消會回傳錯誤
    async fn subscribe_until_ready(
        &self,
        channel: &mut Option<ConsumerChannel>,
    ) -> Result<(), RabbitMQError> {
        let cancellation = self.connection.cancellation_token();
        loop {
            match self.subscribe(channel).await {
                Ok(()) => return Ok(()),
                Err(RabbitMQError::Cancelled) => return Err(RabbitMQError::Cancelled),
                Err(e) => {
                    warn!(consumer = %self.name, "Failed to subscribe, retrying: {}", e);
                    tokio::select! {
                        _ = cancellation.cancelled() => return Err(RabbitMQError::Cancelled),
                        _ = tokio::time::sleep(self.connection.retry_interval()) => {}
                    }
                }
            }
        }
    }

    async fn subscribe(&self, slot: &mut Option<ConsumerChannel>) -> Result<(), RabbitMQError> {
        self.available.send_replace(false);
        if let Some(stale) = slot.take() {
            if let Err(e) = stale.channel.close().await {
                debug!(consumer = %self.name, "Stale channel close failed: {}", e);
            }
        }

        let channel = self.connection.create_model().await?;
        channel.basic_qos(self.prefetch_count).await?;

        let queue_name = if self.config.uses_temporary_queue() {
            let requested = format!("{}{}", self.temporary_queue_name_prefix, Uuid::new_v4());
            let queue_name = channel.declare_temporary_queue(&requested).await?;
            channel
                .queue_bind(&queue_name, &self.config.exchange_name, &self.config.routing_key)
                .await?;
            debug!(
                consumer = %self.name,
                queue = %queue_name,
                exchange = %self.config.exchange_name,
                routing_key = %self.config.routing_key,
                "Bound temporary queue"
            );
            queue_name
        } else {
            self.config.queue_name.clone()
        };

        let (consumer_tag, stream) = channel.basic_consume(&queue_name).await?;
        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        *self.deliveries.lock().await = Some((session, stream));
        *slot = Some(ConsumerChannel {
            channel,
            queue_name: queue_name.clone(),
            session,
        });
        self.available.send_replace(true);

        info!(
            consumer = %self.name,
            queue = %queue_name,
            consumer_tag = %consumer_tag,
            "Started consuming"
        );
        Ok(())
    }
}

#[async_trait]
impl<T, S> ConnectionObserver for ConsumerInner<T, S>
where
    T: DeserializeOwned + Send + Sync + 'static,
    S: MessageSerializer,
{
    async fn on_connection_lost(&self) {
        self.mark_lost();
    }

    async fn on_connection_restored(&self) {
        self.resubscribe().await;
    }
}
