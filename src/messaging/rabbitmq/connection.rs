use crate::config::QueueWrapperConfig;
use crate::messaging::rabbitmq::amqp::LapinConnector;
use crate::messaging::rabbitmq::certificate::CertificateResolver;
use crate::messaging::rabbitmq::driver::{
    BrokerChannel, BrokerConnection, BrokerConnector, ShutdownInitiator,
};
use crate::messaging::rabbitmq::error::RabbitMQError;
use crate::monitor::{BrokerMetrics, MetricType};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// 連線狀態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 終止狀態，不會再重新連線
    ShuttingDown,
}

/// 連線變化通知
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Lost,
    Restored,
}

/// 連線變化觀察者
///
/// 斷線通知會依序等待每個觀察者完成；恢復通知則在背景執行，
/// 觀察者可以在其中呼叫 `create_model`。
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    async fn on_connection_lost(&self);

    async fn on_connection_restored(&self);
}

/// 自我修復的 broker 連線管理器
///
/// 持有唯一的一條連線，非應用程式造成的斷線會以固定間隔無限重試，
/// 只有取消訊號能讓它進入 `ShuttingDown`。
#[derive(Clone)]
pub struct ConnectionHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    connector: Arc<dyn BrokerConnector>,
    retry_interval: Duration,
    cancellation: CancellationToken,
    state: watch::Sender<ConnectionState>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    observers: Mutex<Vec<Weak<dyn ConnectionObserver>>>,
    events: broadcast::Sender<ConnectionEvent>,
    tasks: TaskTracker,
}

impl ConnectionHandler {
    /// 以 TLS 用戶端憑證連線到配置中的 broker
    ///
    /// 憑證找不到時立即失敗；其餘連線錯誤都在背景重試。
    pub fn connect(
        config: &QueueWrapperConfig,
        resolver: &dyn CertificateResolver,
        cancellation: CancellationToken,
    ) -> Result<Self, RabbitMQError> {
        let connector = LapinConnector::new(config, resolver)?;
        Ok(Self::start(
            Arc::new(connector),
            config.connection_retry_interval(),
            cancellation,
        ))
    }

    /// 使用指定的連線器啟動連線管理
    pub fn start(
        connector: Arc<dyn BrokerConnector>,
        retry_interval: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(16);

        let inner = Arc::new(HandlerInner {
            connector,
            retry_interval,
            cancellation: cancellation.child_token(),
            state,
            connection: RwLock::new(None),
            observers: Mutex::new(Vec::new()),
            events,
            tasks: TaskTracker::new(),
        });

        let supervisor = inner.clone();
        inner.tasks.spawn(async move { supervisor.supervise().await });
        inner.tasks.close();

        Self { inner }
    }

    /// 等待連線可用後建立新通道
    ///
    /// 只有在等待期間收到取消訊號時回傳 `Cancelled`。
    pub async fn create_model(&self) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        loop {
            let connection = self.wait_for_connection().await?;
            match connection.create_channel().await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    warn!("Failed to create channel, retrying: {}", e);
                    tokio::select! {
                        _ = self.inner.cancellation.cancelled() => {
                            return Err(RabbitMQError::Cancelled);
                        }
                        _ = tokio::time::sleep(self.inner.retry_interval) => {}
                    }
                }
            }
        }
    }

    async fn wait_for_connection(&self) -> Result<Arc<dyn BrokerConnection>, RabbitMQError> {
        let mut state = self.inner.state.subscribe();
        loop {
            if self.inner.cancellation.is_cancelled() {
                return Err(RabbitMQError::Cancelled);
            }

            let current = *state.borrow_and_update();
            match current {
                ConnectionState::ShuttingDown => return Err(RabbitMQError::Cancelled),
                ConnectionState::Connected => {
                    let connection = self.inner.connection.read().clone();
                    if let Some(connection) = connection {
                        return Ok(connection);
                    }
                }
                _ => {}
            }

            tokio::select! {
                _ = self.inner.cancellation.cancelled() => return Err(RabbitMQError::Cancelled),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(RabbitMQError::Cancelled);
                    }
                }
            }
        }
    }

    /// 目前的連線狀態
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 是否正在 (或已經) 關閉
    pub fn connection_shutting_down(&self) -> bool {
        self.inner.cancellation.is_cancelled() || self.state() == ConnectionState::ShuttingDown
    }

    /// 訂閱連線變化通知
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// 註冊觀察者，觀察者被釋放後自動移除
    pub fn register_observer(&self, observer: Weak<dyn ConnectionObserver>) {
        self.inner.observers.lock().push(observer);
    }

    /// 此連線使用的取消訊號
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    pub fn retry_interval(&self) -> Duration {
        self.inner.retry_interval
    }

    /// 主動關閉連線，不影響外部的取消訊號
    pub fn shutdown(&self) {
        self.inner.cancellation.cancel();
    }

    /// 等待連線管理完全停止
    pub async fn closed(&self) {
        self.inner.tasks.wait().await;
    }
}

impl HandlerInner {
    async fn supervise(self: Arc<Self>) {
        loop {
            let Some(connection) = self.establish().await else {
                break;
            };

            *self.connection.write() = Some(connection.clone());
            self.state.send_replace(ConnectionState::Connected);
            info!("RabbitMQ connection established");
            BrokerMetrics::record("connection", MetricType::ConnectionRestored, None);
            let _ = self.events.send(ConnectionEvent::Restored);
            self.notify_restored();

            let initiator = tokio::select! {
                _ = self.cancellation.cancelled() => None,
                initiator = connection.closed() => Some(initiator),
            };

            match initiator {
                None | Some(ShutdownInitiator::Application) => break,
                Some(initiator) => {
                    warn!(?initiator, "RabbitMQ connection lost, reconnecting");
                    self.connection.write().take();
                    self.state.send_replace(ConnectionState::Disconnected);
                    BrokerMetrics::record("connection", MetricType::ConnectionLost, None);
                    let _ = self.events.send(ConnectionEvent::Lost);
                    self.notify_lost().await;
                }
            }
        }

        self.state.send_replace(ConnectionState::ShuttingDown);
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                error!("Failed to close RabbitMQ connection: {}", e);
            }
        }
        info!("RabbitMQ connection handler stopped");
    }

    /// 重複嘗試連線直到成功或取消
    async fn establish(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut attempt: u64 = 0;
        loop {
            if self.cancellation.is_cancelled() {
                return None;
            }

            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting);
            debug!(attempt, "Connecting to RabbitMQ");

            let result = tokio::select! {
                _ = self.cancellation.cancelled() => return None,
                result = self.connector.connect() => result,
            };

            match result {
                Ok(connection) => {
                    BrokerMetrics::record(
                        "connection",
                        MetricType::ConnectionAttempt { succeeded: true },
                        None,
                    );
                    return Some(connection);
                }
                Err(e) => {
                    BrokerMetrics::record(
                        "connection",
                        MetricType::ConnectionAttempt { succeeded: false },
                        None,
                    );
                    warn!(
                        attempt,
                        "Unable to connect to RabbitMQ, retrying in {:?}: {}",
                        self.retry_interval,
                        e
                    );
                    self.state.send_replace(ConnectionState::Disconnected);
                    tokio::select! {
                        _ = self.cancellation.cancelled() => return None,
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
            }
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        let mut observers = self.observers.lock();
        observers.retain(|observer| observer.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    async fn notify_lost(&self) {
        for observer in self.live_observers() {
            observer.on_connection_lost().await;
        }
    }

    fn notify_restored(&self) {
        for observer in self.live_observers() {
            self.tasks.spawn(async move {
                observer.on_connection_restored().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::testing::FakeBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    const RETRY: Duration = Duration::from_millis(20);

    #[derive(Default)]
    struct CountingObserver {
        lost: AtomicUsize,
        restored: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionObserver for CountingObserver {
        async fn on_connection_lost(&self) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_connection_restored(&self) {
            self.restored.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_unreachable_first_attempt_restores_once() {
        let broker = FakeBroker::new();
        broker.fail_next_connects(1);
        let handler = ConnectionHandler::start(broker.connector(), RETRY, CancellationToken::new());
        let mut events = handler.subscribe();

        let (first, second) = tokio::join!(handler.create_model(), handler.create_model());
        assert!(first.is_ok());
        assert!(second.is_ok());

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Restored);
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.connection_count(), 1);
        assert!(events.try_recv().is_err());

        handler.shutdown();
        timeout(Duration::from_secs(1), handler.closed()).await.unwrap();
        assert_eq!(handler.state(), ConnectionState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_peer_shutdown_triggers_reconnect() {
        let broker = FakeBroker::new();
        let handler = ConnectionHandler::start(broker.connector(), RETRY, CancellationToken::new());
        let observer = Arc::new(CountingObserver::default());
        let weak = Arc::downgrade(&observer) as Weak<dyn ConnectionObserver>;
        handler.register_observer(weak);
        handler.create_model().await.unwrap();

        let mut events = handler.subscribe();
        broker.drop_connection();

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Lost);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Restored);
        handler.create_model().await.unwrap();

        assert_eq!(broker.connection_count(), 2);
        assert_eq!(observer.lost.load(Ordering::SeqCst), 1);
        timeout(Duration::from_secs(1), async {
            while observer.restored.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_create_model() {
        let broker = FakeBroker::new();
        broker.fail_next_connects(usize::MAX);
        let cancellation = CancellationToken::new();
        let handler = ConnectionHandler::start(broker.connector(), RETRY, cancellation.clone());

        let pending = tokio::spawn({
            let handler = handler.clone();
            async move { handler.create_model().await }
        });
        tokio::time::sleep(RETRY * 3).await;
        cancellation.cancel();

        let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(RabbitMQError::Cancelled)));
        assert!(handler.connection_shutting_down());
        timeout(Duration::from_secs(1), handler.closed()).await.unwrap();
        assert_eq!(handler.state(), ConnectionState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection_without_lost_event() {
        let broker = FakeBroker::new();
        let handler = ConnectionHandler::start(broker.connector(), RETRY, CancellationToken::new());
        handler.create_model().await.unwrap();
        let mut events = handler.subscribe();

        handler.shutdown();
        timeout(Duration::from_secs(1), handler.closed()).await.unwrap();

        assert!(broker.connection(0).is_closed_by_application());
        assert!(events.try_recv().is_err());
    }
}
