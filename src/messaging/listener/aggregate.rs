use crate::messaging::listener::acknowledger::Acknowledger;
use crate::messaging::listener::event_listener::{EventListener, MessageProcessor};
use crate::messaging::listener::{
    AcknowledgeBehaviour, ListenerError, MessageSource, ProcessingError,
};
use crate::messaging::protocol::{DeliveryTag, QueueMessage};
use crate::monitor::{BrokerMetrics, MetricType};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// 聚合處理器
///
/// 相同群組的消息在閒置 `timeout` 後一起處理；`max_timeout` 限制批次最長的延長時間，
/// `Duration::ZERO` 表示不限制。
#[async_trait]
pub trait MessageAggregator<T>: Send + Sync + 'static {
    type Group: Clone + Debug + Eq + Hash + Send + Sync + 'static;

    /// 最後一則消息到達後的等待時間
    fn timeout(&self) -> Duration;

    /// 群組建立後仍可延長等待的時間
    fn max_timeout(&self) -> Duration;

    /// 取得消息的聚合群組，`None` 表示無法聚合
    async fn get_aggregation_group(&self, message: &T) -> Option<Self::Group>;

    /// 處理整個群組；失敗時群組內所有消息都會被拒絕
    async fn try_process_aggregation_group(
        &self,
        messages: Vec<T>,
        group: &Self::Group,
        cancellation: &CancellationToken,
    ) -> anyhow::Result<()>;
}

struct MessageAggregate<T> {
    id: u64,
    // 投遞標籤依到達順序遞增，依標籤排序即為到達順序
    messages: BTreeMap<DeliveryTag, T>,
    idle_deadline: Instant,
    max_deadline: Option<Instant>,
    timer: CancellationToken,
}

struct AggregateState<T, A: MessageAggregator<T>> {
    name: Arc<str>,
    aggregator: Arc<A>,
    source: Arc<dyn MessageSource<T>>,
    groups: Mutex<HashMap<A::Group, MessageAggregate<T>>>,
    timers: TaskTracker,
    next_id: AtomicU64,
}

impl<T, A> AggregateState<T, A>
where
    T: Send + Sync + 'static,
    A: MessageAggregator<T>,
{
    async fn aggregate(
        self: &Arc<Self>,
        message: QueueMessage<T>,
        cancellation: CancellationToken,
    ) {
        if cancellation.is_cancelled() {
            self.dispose_groups();
            return;
        }

        let delivery_tag = message.delivery_tag();
        let Some(group) = self.aggregator.get_aggregation_group(message.message()).await else {
            if let Err(e) = self.source.acknowledge(delivery_tag).await {
                warn!(
                    listener = %self.name,
                    delivery_tag = %delivery_tag,
                    "Failed to acknowledge message: {}",
                    e
                );
            }
            warn!(
                listener = %self.name,
                delivery_tag = %delivery_tag,
                "No aggregation group for message, it will not be aggregated"
            );
            return;
        };

        let timeout = self.aggregator.timeout();
        let now = Instant::now();
        let mut groups = self.groups.lock();

        if let Some(aggregate) = groups.get_mut(&group) {
            aggregate.messages.insert(delivery_tag, message.into_message());
            match aggregate.max_deadline {
                Some(max_deadline) if now >= max_deadline => {
                    debug!(
                        listener = %self.name,
                        group = ?group,
                        "Max timeout reached, timer left unchanged"
                    );
                }
                _ => {
                    aggregate.idle_deadline = now + timeout;
                    debug!(
                        listener = %self.name,
                        group = ?group,
                        size = aggregate.messages.len(),
                        "Added to aggregation group, timer reset"
                    );
                }
            }
            return;
        }

        let max_timeout = self.aggregator.max_timeout();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timer = CancellationToken::new();
        groups.insert(
            group.clone(),
            MessageAggregate {
                id,
                messages: BTreeMap::from([(delivery_tag, message.into_message())]),
                idle_deadline: now + timeout,
                max_deadline: (!max_timeout.is_zero()).then(|| now + max_timeout),
                timer: timer.clone(),
            },
        );
        drop(groups);

        debug!(
            listener = %self.name,
            group = ?group,
            timeout = ?timeout,
            "Created aggregation group"
        );
        self.timers.spawn(self.clone().run_timer(group, id, timer, cancellation));
    }

    /// 等待群組閒置逾時，之後取出並處理整批消息
    async fn run_timer(
        self: Arc<Self>,
        group: A::Group,
        id: u64,
        timer: CancellationToken,
        cancellation: CancellationToken,
    ) {
        loop {
            let deadline = match self.groups.lock().get(&group) {
                Some(aggregate) if aggregate.id == id => aggregate.idle_deadline,
                _ => return,
            };

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = timer.cancelled() => return,
            }

            if cancellation.is_cancelled() {
                self.dispose_groups();
                return;
            }

            let batch = {
                let mut groups = self.groups.lock();
                match groups.get(&group) {
                    Some(aggregate) if aggregate.id == id => {
                        if Instant::now() < aggregate.idle_deadline {
                            None
                        } else {
                            groups.remove(&group)
                        }
                    }
                    _ => return,
                }
            };

            if let Some(aggregate) = batch {
                self.process_aggregate(group, aggregate, cancellation).await;
                return;
            }
        }
    }

    async fn process_aggregate(
        &self,
        group: A::Group,
        aggregate: MessageAggregate<T>,
        cancellation: CancellationToken,
    ) {
        let (delivery_tags, messages): (Vec<DeliveryTag>, Vec<T>) =
            aggregate.messages.into_iter().unzip();
        if messages.is_empty() {
            warn!(listener = %self.name, group = ?group, "Aggregation group has no messages");
            return;
        }

        let size = messages.len();
        info!(listener = %self.name, group = ?group, size, "Processing aggregation group");

        let outcome = AssertUnwindSafe(
            self.aggregator
                .try_process_aggregation_group(messages, &group, &cancellation),
        )
        .catch_unwind()
        .await;

        let succeeded = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(
                    listener = %self.name,
                    group = ?group,
                    "Failed to process aggregation group: {:#}",
                    e
                );
                false
            }
            Err(_) => {
                error!(
                    listener = %self.name,
                    group = ?group,
                    "Aggregation group processing panicked"
                );
                false
            }
        };

        for delivery_tag in delivery_tags {
            if succeeded {
                if let Err(e) = self.source.acknowledge(delivery_tag).await {
                    warn!(
                        listener = %self.name,
                        delivery_tag = %delivery_tag,
                        "Failed to acknowledge message: {}",
                        e
                    );
                }
            } else {
                self.source.negatively_acknowledge(delivery_tag).await;
            }
        }

        BrokerMetrics::record(&self.name, MetricType::BatchProcessed { size, succeeded }, None);
    }

    /// 停止所有計時器並丟棄尚未處理的群組，消息留給 broker 重新投遞
    fn dispose_groups(&self) {
        let disposed: Vec<MessageAggregate<T>> =
            self.groups.lock().drain().map(|(_, aggregate)| aggregate).collect();
        if disposed.is_empty() {
            return;
        }
        for aggregate in &disposed {
            aggregate.timer.cancel();
        }
        info!(
            listener = %self.name,
            groups = disposed.len(),
            "Disposed of pending aggregation groups"
        );
    }
}

/// 把收到的消息放入聚合群組，本身從不確認消息
struct AggregatingProcessor<T, A: MessageAggregator<T>> {
    state: Arc<AggregateState<T, A>>,
}

#[async_trait]
impl<T, A> MessageProcessor<T> for AggregatingProcessor<T, A>
where
    T: Send + Sync + 'static,
    A: MessageAggregator<T>,
{
    fn behaviour(&self) -> AcknowledgeBehaviour {
        AcknowledgeBehaviour::Never
    }

    async fn process_message(
        &self,
        message: QueueMessage<T>,
        cancellation: CancellationToken,
    ) -> Result<(), ProcessingError> {
        self.state.aggregate(message, cancellation).await;
        Ok(())
    }
}

/// 時間窗聚合監聽器
///
/// 群組內的消息作為一個整體處理：成功全部確認，失敗全部拒絕。
/// 取消時尚未處理的群組直接丟棄，不確認也不拒絕。
pub struct AggregateEventListener<T, A: MessageAggregator<T>> {
    state: Arc<AggregateState<T, A>>,
    listener: EventListener<T, AggregatingProcessor<T, A>>,
}

impl<T, A> AggregateEventListener<T, A>
where
    T: Send + Sync + 'static,
    A: MessageAggregator<T>,
{
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn MessageSource<T>>,
        aggregator: Arc<A>,
    ) -> Self {
        let name: String = name.into();
        let state = Arc::new(AggregateState {
            name: Arc::from(name.as_str()),
            aggregator,
            source: source.clone(),
            groups: Mutex::new(HashMap::new()),
            timers: TaskTracker::new(),
            next_id: AtomicU64::new(0),
        });
        let processor = Arc::new(AggregatingProcessor { state: state.clone() });
        Self {
            state,
            listener: EventListener::new(name, source, processor),
        }
    }

    pub fn name(&self) -> &str {
        self.listener.name()
    }

    pub fn acknowledger(&self) -> Acknowledger<T> {
        self.listener.acknowledger()
    }

    /// 尚未處理的群組數量
    pub fn pending_groups(&self) -> usize {
        self.state.groups.lock().len()
    }

    /// 執行監聽器；返回前丟棄未處理的群組並等待處理中的批次完成
    pub async fn run(&self, cancellation: CancellationToken) -> Result<(), ListenerError> {
        let result = self.listener.run(cancellation).await;

        self.state.dispose_groups();
        self.state.timers.close();
        self.state.timers.wait().await;
        self.state.timers.reopen();

        result
    }
}

impl<T, A: MessageAggregator<T>> Drop for AggregateEventListener<T, A> {
    fn drop(&mut self) {
        for (_, aggregate) in self.state.groups.lock().drain() {
            aggregate.timer.cancel();
        }
    }
}
