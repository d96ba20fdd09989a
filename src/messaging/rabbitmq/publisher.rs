use crate::config::{PublisherConfig, QueueWrapperConfig};
use crate::messaging::protocol::MessageHeaders;
use crate::messaging::rabbitmq::connection::{ConnectionHandler, ConnectionObserver};
use crate::messaging::rabbitmq::driver::{BrokerChannel, ConfirmEvent, PublishProperties};
use crate::messaging::rabbitmq::error::RabbitMQError;
use crate::messaging::serializer::{JsonSerializer, MessageSerializer};
use crate::messaging::validation::MessageValidator;
use crate::monitor::{BrokerMetrics, MetricType};
use crate::utils::{current_timestamp_ms, current_unix_timestamp_secs, timestamp_ms_to_datetime};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// (通道世代, 發佈序號)
///
/// 通道重建後序號會重新從 1 開始，加上世代避免新舊確認互相混淆。
type PendingKey = (u64, u64);

/// 等待 broker 確認的發佈紀錄
#[derive(Debug)]
pub struct UnackedMessage<T> {
    pub sequence_number: u64,
    pub message: Arc<T>,
    pub headers: MessageHeaders,
    pub routing_key: String,
    /// 首次送出的毫秒時間戳
    pub published_at: i64,
}

/// 佇列發佈者
///
/// 每則消息在送出前就登記為待確認；負向確認或逾時未確認的消息會自動以相同內容、
/// 標頭與路由鍵重新發佈。斷線時所有待確認紀錄直接丟棄。
pub struct QueuePublisher<T, S = JsonSerializer> {
    inner: Arc<PublisherInner<T, S>>,
}

impl<T, S> Clone for QueuePublisher<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PublisherInner<T, S> {
    this: Weak<Self>,
    name: String,
    config: PublisherConfig,
    app_id: String,
    confirmation_timeout: Duration,
    connection: ConnectionHandler,
    validator: Box<dyn MessageValidator<T>>,
    serializer: S,
    channel: tokio::sync::Mutex<Option<PublisherChannel>>,
    generation: AtomicU64,
    unacked: parking_lot::Mutex<BTreeMap<PendingKey, UnackedMessage<T>>>,
    pending: parking_lot::Mutex<BTreeMap<Instant, Vec<PendingKey>>>,
    available: watch::Sender<bool>,
}

struct PublisherChannel {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

impl<T> QueuePublisher<T, JsonSerializer>
where
    T: Serialize + Send + Sync + 'static,
{
    /// 依名稱創建 JSON 發佈者
    pub async fn new(
        name: &str,
        config: &QueueWrapperConfig,
        connection: ConnectionHandler,
        validator: impl MessageValidator<T>,
    ) -> Result<Self, RabbitMQError> {
        Self::with_serializer(name, config, connection, validator, JsonSerializer).await
    }
}

impl<T, S> QueuePublisher<T, S>
where
    T: Serialize + Send + Sync + 'static,
    S: MessageSerializer,
{
    /// 使用指定的序列化器創建發佈者
    ///
    /// 找不到名稱對應的配置時回傳 `PublisherNotFound`。
    pub async fn with_serializer(
        name: &str,
        config: &QueueWrapperConfig,
        connection: ConnectionHandler,
        validator: impl MessageValidator<T>,
        serializer: S,
    ) -> Result<Self, RabbitMQError> {
        let publisher_config = config
            .publisher(name)
            .cloned()
            .ok_or_else(|| RabbitMQError::PublisherNotFound(name.to_string()))?;

        let (available, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|this| PublisherInner {
            this: this.clone(),
            name: name.to_string(),
            config: publisher_config,
            app_id: config.app_id(),
            confirmation_timeout: config.publish_confirmation_timeout(),
            connection,
            validator: Box::new(validator),
            serializer,
            channel: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            unacked: parking_lot::Mutex::new(BTreeMap::new()),
            pending: parking_lot::Mutex::new(BTreeMap::new()),
            available,
        });

        {
            let mut channel = inner.channel.lock().await;
            inner.open_channel_until_ready(&mut channel).await?;
        }
        PublisherInner::spawn_timeout_scan(&inner, config.confirm_scan_interval());

        let observer = Arc::downgrade(&inner) as Weak<dyn ConnectionObserver>;
        inner.connection.register_observer(observer);

        info!(
            publisher = %inner.name,
            exchange = %inner.config.exchange_name,
            routing_key = %inner.config.routing_key,
            "Publisher ready"
        );
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 此發佈者使用的配置
    pub fn configuration(&self) -> &PublisherConfig {
        &self.inner.config
    }

    pub fn is_available(&self) -> bool {
        *self.inner.available.borrow()
    }

    /// 尚未確認的發佈數量
    pub fn unconfirmed_count(&self) -> usize {
        self.inner.unacked.lock().len()
    }

    /// 以預設路由鍵發佈消息
    pub async fn publish(&self, message: T) -> Result<(), RabbitMQError> {
        self.publish_with(message, None, None).await
    }

    /// 發佈消息，可附加標頭並覆寫路由鍵
    ///
    /// 驗證失敗時回傳 `Validation` 錯誤且不重試。
    pub async fn publish_with(
        &self,
        message: T,
        headers: Option<MessageHeaders>,
        routing_key: Option<&str>,
    ) -> Result<(), RabbitMQError> {
        self.inner
            .validator
            .try_validate(&message)
            .map_err(RabbitMQError::Validation)?;

        let routing_key = routing_key
            .unwrap_or(&self.inner.config.routing_key)
            .to_string();
        self.inner
            .send(Arc::new(message), headers.unwrap_or_default(), routing_key)
            .await
    }

    /// 關閉通道
    pub async fn close(&self) {
        self.inner.available.send_replace(false);
        let current = self.inner.channel.lock().await.take();
        if let Some(current) = current {
            if let Err(e) = current.channel.close().await {
                debug!(publisher = %self.inner.name, "Failed to close channel: {}", e);
            }
        }
    }
}

impl<T, S> PublisherInner<T, S>
where
    T: Serialize + Send + Sync + 'static,
    S: MessageSerializer,
{
    async fn send(
        self: &Arc<Self>,
        message: Arc<T>,
        headers: MessageHeaders,
        routing_key: String,
    ) -> Result<(), RabbitMQError> {
        let body = self.serializer.serialize(message.as_ref())?;

        loop {
            self.wait_until_available().await?;

            let guard = self.channel.lock().await;
            let current = guard
                .as_ref()
                .map(|current| (current.channel.clone(), current.generation));
            let Some((channel, generation)) = current else {
                drop(guard);
                self.available.send_replace(false);
                self.spawn_reopen();
                continue;
            };
            let key = (generation, channel.next_publish_seq_no());

            // 必須先登記再送出，確認可能比 basic_publish 更早回來
            self.track(
                key,
                UnackedMessage {
                    sequence_number: key.1,
                    message: message.clone(),
                    headers: headers.clone(),
                    routing_key: routing_key.clone(),
                    published_at: current_timestamp_ms(),
                },
            );

            let properties = PublishProperties {
                app_id: self.app_id.clone(),
                content_type: self.serializer.content_type().to_string(),
                headers: headers.clone(),
                persistent: self.config.publishes_persistent_messages,
                timestamp: current_unix_timestamp_secs(),
            };

            let result = channel
                .basic_publish(
                    &self.config.exchange_name,
                    &routing_key,
                    true,
                    body.clone(),
                    properties,
                )
                .await;
            drop(guard);

            return match result {
                Ok(()) => {
                    BrokerMetrics::record(&self.name, MetricType::Published, None);
                    debug!(
                        publisher = %self.name,
                        sequence_number = key.1,
                        routing_key = %routing_key,
                        "Message published"
                    );
                    Ok(())
                }
                Err(RabbitMQError::ChannelClosed) => {
                    // 紀錄保留給逾時掃描，在新通道上重新發佈
                    error!(
                        publisher = %self.name,
                        sequence_number = key.1,
                        "Channel already closed while publishing, recreating channel"
                    );
                    self.available.send_replace(false);
                    self.spawn_reopen();
                    Ok(())
                }
                Err(e) => {
                    self.untrack(key);
                    error!(publisher = %self.name, "Failed to publish message: {}", e);
                    Err(e)
                }
            };
        }
    }

    fn track(&self, key: PendingKey, record: UnackedMessage<T>) {
        self.unacked.lock().insert(key, record);
        self.pending.lock().entry(Instant::now()).or_default().push(key);
    }

    fn untrack(&self, key: PendingKey) {
        self.unacked.lock().remove(&key);
    }

    /// 移除被確認的紀錄；`multiple` 時移除同世代序號不大於 `sequence_number` 的全部紀錄
    fn resolve(
        &self,
        generation: u64,
        sequence_number: u64,
        multiple: bool,
    ) -> Vec<UnackedMessage<T>> {
        let mut unacked = self.unacked.lock();
        if multiple {
            let keys: Vec<PendingKey> = unacked
                .range((generation, 0)..=(generation, sequence_number))
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| unacked.remove(key)).collect()
        } else {
            unacked
                .remove(&(generation, sequence_number))
                .into_iter()
                .collect()
        }
    }

    async fn handle_confirm(self: &Arc<Self>, generation: u64, event: ConfirmEvent) {
        match event {
            ConfirmEvent::Ack { delivery_tag, multiple } => {
                let resolved = self.resolve(generation, delivery_tag, multiple);
                for _ in &resolved {
                    BrokerMetrics::record(
                        &self.name,
                        MetricType::Confirmed { positive: true },
                        None,
                    );
                }
                debug!(
                    publisher = %self.name,
                    delivery_tag,
                    multiple,
                    resolved = resolved.len(),
                    "Publish confirmed"
                );
            }
            ConfirmEvent::Nack { delivery_tag, multiple } => {
                let rejected = self.resolve(generation, delivery_tag, multiple);
                for record in rejected {
                    BrokerMetrics::record(
                        &self.name,
                        MetricType::Confirmed { positive: false },
                        None,
                    );
                    warn!(
                        publisher = %self.name,
                        sequence_number = record.sequence_number,
                        "Broker rejected message, republishing"
                    );
                    self.republish(record, "nack").await;
                }
            }
            ConfirmEvent::Returned {
                exchange,
                routing_key,
                reply_code,
                reply_text,
            } => {
                BrokerMetrics::record(&self.name, MetricType::Returned, None);
                error!(
                    publisher = %self.name,
                    exchange = %exchange,
                    routing_key = %routing_key,
                    reply_code,
                    "Message returned by broker: {}", reply_text
                );
            }
        }
    }

    /// 把超過確認逾時的紀錄視為負向確認
    async fn republish_timed_out(self: &Arc<Self>) {
        let Some(cutoff) = Instant::now().checked_sub(self.confirmation_timeout) else {
            return;
        };

        let expired_keys: Vec<PendingKey> = {
            let mut pending = self.pending.lock();
            let recent = pending.split_off(&cutoff);
            std::mem::replace(&mut *pending, recent)
                .into_values()
                .flatten()
                .collect()
        };
        if expired_keys.is_empty() {
            return;
        }

        let expired: Vec<UnackedMessage<T>> = {
            let mut unacked = self.unacked.lock();
            expired_keys.iter().filter_map(|key| unacked.remove(key)).collect()
        };

        for record in expired {
            warn!(
                publisher = %self.name,
                sequence_number = record.sequence_number,
                published_at = %timestamp_ms_to_datetime(record.published_at),
                "No confirmation within {:?}, republishing", self.confirmation_timeout
            );
            self.republish(record, "timeout").await;
        }
    }

    async fn republish(self: &Arc<Self>, record: UnackedMessage<T>, reason: &'static str) {
        BrokerMetrics::record(&self.name, MetricType::Republished { reason }, None);
        if let Err(e) = self.send(record.message, record.headers, record.routing_key).await {
            error!(publisher = %self.name, reason, "Republish failed: {}", e);
        }
    }

    async fn wait_until_available(&self) -> Result<(), RabbitMQError> {
        let cancellation = self.connection.cancellation_token();
        let mut available = self.available.subscribe();
        loop {
            if *available.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = cancellation.cancelled() => return Err(RabbitMQError::Cancelled),
                changed = available.changed() => {
                    if changed.is_err() {
                        return Err(RabbitMQError::Cancelled);
                    }
                }
            }
        }
    }

    fn spawn_reopen(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move { inner.reopen().await });
    }

    async fn reopen(self: &Arc<Self>) {
        let mut channel = self.channel.lock().await;
        if *self.available.borrow() {
            return;
        }
        if let Err(e) = self.open_channel_until_ready(&mut channel).await {
            debug!(publisher = %self.name, "Channel recreation abandoned: {}", e);
        }
    }

    async fn open_channel_until_ready(
        self: &Arc<Self>,
        slot: &mut Option<PublisherChannel>,
    ) -> Result<(), RabbitMQError> {
        let cancellation = self.connection.cancellation_token();
        loop {
            match self.open_channel(slot).await {
                Ok(()) => return Ok(()),
                Err(RabbitMQError::Cancelled) => return Err(RabbitMQError::Cancelled),
                Err(e) => {
                    warn!(publisher = %self.name, "Failed to open channel, retrying: {}", e);
                    tokio::select! {
                        _ = cancellation.cancelled() => return Err(RabbitMQError::Cancelled),
                        _ = tokio::time::sleep(self.connection.retry_interval()) => {}
                    }
                }
            }
        }
    }

    async fn open_channel(
        self: &Arc<Self>,
        slot: &mut Option<PublisherChannel>,
    ) -> Result<(), RabbitMQError> {
        if let Some(stale) = slot.take() {
            if let Err(e) = stale.channel.close().await {
                debug!(publisher = %self.name, "Stale channel close failed: {}", e);
            }
        }

        let channel = self.connection.create_model().await?;
        let confirms = channel.confirm_select().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn_confirm_listener(generation, confirms);

        *slot = Some(PublisherChannel { channel, generation });
        self.available.send_replace(true);
        debug!(publisher = %self.name, generation, "Publisher channel opened in confirm mode");
        Ok(())
    }

    fn spawn_confirm_listener(
        self: &Arc<Self>,
        generation: u64,
        mut confirms: mpsc::UnboundedReceiver<ConfirmEvent>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = confirms.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_confirm(generation, event).await;
            }
        });
    }

    fn spawn_timeout_scan(inner: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(inner);
        let cancellation = inner.connection.cancellation_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.republish_timed_out().await;
            }
        });
    }

    fn discard_pending(&self) {
        self.available.send_replace(false);
        let discarded = {
            let mut unacked = self.unacked.lock();
            let count = unacked.len();
            unacked.clear();
            count
        };
        self.pending.lock().clear();
        if discarded > 0 {
            warn!(
                publisher = %self.name,
                discarded,
                "Connection lost, discarding unconfirmed messages"
            );
        }
    }
}

#[async_trait]
impl<T, S> ConnectionObserver for PublisherInner<T, S>
where
    T: Serialize + Send + Sync + 'static,
    S: MessageSerializer,
{
    async fn on_connection_lost(&self) {
        BrokerMetrics::record(&self.name, MetricType::ConnectionLost, None);
        self.discard_pending();
    }

    async fn on_connection_restored(&self) {
        if let Some(inner) = self.this.upgrade() {
            inner.reopen().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::testing::FakeBroker;
    use crate::messaging::validation::AcceptAll;
    use lapin::types::AMQPValue;
    use serde::Deserialize;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        quantity: i32,
    }

    fn order(id: u32) -> Order {
        Order { id, quantity: 1 }
    }

    fn config() -> QueueWrapperConfig {
        let mut config = QueueWrapperConfig::new("amqps://localhost:5671", "component-machine");
        config.publish_message_confirmation_timeout_secs = 1;
        config.channel_confirm_timeout_interval_secs = 1;
        config.millis_between_connection_retries = 20;
        config.publishers.insert("orders".into(), PublisherConfig::new("", "orders"));
        config
    }

    async fn setup(broker: &Arc<FakeBroker>) -> (ConnectionHandler, QueuePublisher<Order>) {
        let config = config();
        let handler = ConnectionHandler::start(
            broker.connector(),
            config.connection_retry_interval(),
            CancellationToken::new(),
        );
        let validator = |order: &Order| {
            if order.quantity > 0 {
                Ok(())
            } else {
                Err("quantity must be positive".to_string())
            }
        };
        let publisher = QueuePublisher::new("orders", &config, handler.clone(), validator)
            .await
            .unwrap();
        (handler, publisher)
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn trace_headers() -> MessageHeaders {
        let mut headers = MessageHeaders::new();
        headers.insert("trace_id".into(), AMQPValue::LongString("abc-123".into()));
        headers
    }

    #[tokio::test]
    async fn test_unknown_publisher_name_is_fatal() {
        let broker = FakeBroker::new();
        let handler = ConnectionHandler::start(
            broker.connector(),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        let result = QueuePublisher::<Order>::new("missing", &config(), handler, AcceptAll).await;
        assert!(matches!(result, Err(RabbitMQError::PublisherNotFound(_))));
    }

    #[tokio::test]
    async fn test_publish_sets_envelope_properties() {
        let broker = FakeBroker::new();
        let (_handler, publisher) = setup(&broker).await;

        publisher.publish(order(1)).await.unwrap();

        let published = broker.channel(0).published();
        assert_eq!(published.len(), 1);
        let sent = &published[0];
        assert_eq!(sent.sequence_number, 1);
        assert_eq!(sent.exchange, "");
        assert_eq!(sent.routing_key, "orders");
        assert!(sent.mandatory);
        assert!(sent.properties.persistent);
        assert!(sent.properties.app_id.starts_with("component_machine_"));
        assert_eq!(sent.properties.content_type, "application/json");
        assert!(sent.properties.timestamp > 0);
        assert_eq!(serde_json::from_slice::<Order>(&sent.body).unwrap(), order(1));
        assert_eq!(publisher.unconfirmed_count(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_is_returned_to_caller() {
        let broker = FakeBroker::new();
        let (_handler, publisher) = setup(&broker).await;

        let result = publisher.publish(Order { id: 1, quantity: 0 }).await;

        assert!(matches!(
            result,
            Err(RabbitMQError::Validation(reason)) if reason.contains("positive")
        ));
        assert!(broker.channel(0).published().is_empty());
        assert_eq!(publisher.unconfirmed_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_ack_resolves_prefix() {
        let broker = FakeBroker::new();
        let (_handler, publisher) = setup(&broker).await;
        for id in 1..=3 {
            publisher.publish(order(id)).await.unwrap();
        }
        assert_eq!(publisher.unconfirmed_count(), 3);

        let channel = broker.channel(0);
        channel.confirm(ConfirmEvent::Ack { delivery_tag: 2, multiple: true });
        eventually(|| publisher.unconfirmed_count() == 1).await;

        channel.confirm(ConfirmEvent::Ack { delivery_tag: 3, multiple: false });
        eventually(|| publisher.unconfirmed_count() == 0).await;
    }

    #[tokio::test]
    async fn test_single_ack_resolves_only_its_sequence() {
        let broker = FakeBroker::new();
        let (_handler, publisher) = setup(&broker).await;
        for id in 1..=3 {
            publisher.publish(order(id)).await.unwrap();
        }

        let channel = broker.channel(0);
        channel.confirm(ConfirmEvent::Ack { delivery_tag: 2, multiple: false });
        eventually(|| publisher.unconfirmed_count() == 2).await;

        // 重複的確認不影響其他紀錄
        channel.confirm(ConfirmEvent::Ack { delivery_tag: 2, multiple: false });
        channel.confirm(ConfirmEvent::Ack { delivery_tag: 1, multiple: false });
        eventually(|| publisher.unconfirmed_count() == 1).await;
    }

    #[tokio::test]
    async fn test_nack_republishes_identical_message() {
        let broker = FakeBroker::new();
        let (_handler, publisher) = setup(&broker).await;
        publisher
            .publish_with(order(9), Some(trace_headers()), Some("orders.priority"))
            .await
            .unwrap();

        let channel = broker.channel(0);
        channel.confirm(ConfirmEvent::Nack { delivery_tag: 1, multiple: false });
        eventually(|| channel.published().len() == 2).await;

        let published = channel.published();
        assert_eq!(published[1].sequence_number, 2);
        assert_eq!(published[1].body, published[0].body);
        assert_eq!(published[1].routing_key, "orders.priority");
        assert_eq!(published[1].properties.headers, trace_headers());
        assert_eq!(publisher.unconfirmed_count(), 1);
    }

    #[tokio::test]
    async fn test_returned_message_is_only_logged() {
        let broker = FakeBroker::new();
        let (_handler, publisher) = setup(&broker).await;
        publisher.publish(order(1)).await.unwrap();

        let channel = broker.channel(0);
        channel.confirm(ConfirmEvent::Returned {
            exchange: String::new(),
            routing_key: "orders".into(),
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
        });
        channel.confirm(ConfirmEvent::Ack { delivery_tag: 1, multiple: false });

        eventually(|| publisher.unconfirmed_count() == 0).await;
        assert_eq!(channel.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_message_is_republished_after_timeout() {
        let broker = FakeBroker::new();
        let (_handler, publisher) = setup(&broker).await;
        publisher
            .publish_with(order(4), Some(trace_headers()), Some("orders.late"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;

        let published = broker.channel(0).published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].body, published[0].body);
        assert_eq!(published[1].routing_key, "orders.late");
        assert_eq!(published[1].properties.headers, trace_headers());
        assert_eq!(publisher.unconfirmed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_publish_is_never_republished() {
        let broker = FakeBroker::new();
        broker.set_auto_confirm(true);
        let (_handler, publisher) = setup(&broker).await;

        publisher.publish(order(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(publisher.unconfirmed_count(), 0);
        let published = broker.channel(0).published();
        assert_eq!(published.len(), 1);
        assert!(published[0].properties.persistent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_discards_unconfirmed() {
        let broker = FakeBroker::new();
        let (_handler, publisher) = setup(&broker).await;
        publisher.publish(order(1)).await.unwrap();
        publisher.publish(order(2)).await.unwrap();

        broker.drop_connection();
        broker.wait_for_channels(2).await;
        eventually(|| publisher.is_available()).await;
        assert_eq!(publisher.unconfirmed_count(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(broker.channel(0).published().len(), 2);
        assert!(broker.channel(1).published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_is_recreated_and_message_recovered_by_timeout() {
        let broker = FakeBroker::new();
        let (_handler, publisher) = setup(&broker).await;
        broker.channel(0).close().await.unwrap();

        publisher.publish(order(5)).await.unwrap();
        broker.wait_for_channels(2).await;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(broker.channel(0).published().is_empty());
        let republished = broker.channel(1).published();
        assert_eq!(republished.len(), 1);
        assert_eq!(serde_json::from_slice::<Order>(&republished[0].body).unwrap(), order(5));
    }
}
