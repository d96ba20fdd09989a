use crate::messaging::listener::acknowledger::{Acknowledger, FaultState};
use crate::messaging::listener::{
    AcknowledgeBehaviour, ListenerError, MessageSource, ProcessingError,
};
use crate::messaging::protocol::{DeliveryTag, QueueMessage};
use crate::monitor::{BrokerMetrics, MetricType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 路由鍵第一個 `.` 之前的片段
pub fn default_lane_key(routing_key: &str) -> &str {
    routing_key.split('.').next().unwrap_or_default()
}

/// 依序處理同一通道消息的處理器
#[async_trait]
pub trait SequentialMessageProcessor<T>: Send + Sync + 'static {
    fn behaviour(&self) -> AcknowledgeBehaviour {
        AcknowledgeBehaviour::AfterProcess
    }

    /// 由路由鍵決定消息所屬的通道
    fn lane_key(&self, routing_key: &str) -> String {
        default_lane_key(routing_key).to_string()
    }

    async fn process_message(
        &self,
        message: &T,
        delivery_tag: DeliveryTag,
        routing_key: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), ProcessingError>;
}

/// 單一通道的待處理佇列
struct ProcessingQueue<T> {
    messages: Mutex<VecDeque<Arc<QueueMessage<T>>>>,
    wake: Notify,
    retired: AtomicBool,
}

impl<T> ProcessingQueue<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            retired: AtomicBool::new(false),
        })
    }

    fn push(&self, message: QueueMessage<T>) {
        self.messages.lock().push_back(Arc::new(message));
        self.wake.notify_one();
    }

    fn is_idle(&self) -> bool {
        self.messages.lock().is_empty()
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// 依通道順序處理的事件監聽器
///
/// 相同通道鍵的消息嚴格依到達順序逐一處理；不同通道之間並行。
/// 閒置的通道在下次掃描時移除，其任務隨之結束。
pub struct SequentialProcessingEventListener<T, P> {
    name: Arc<str>,
    source: Arc<dyn MessageSource<T>>,
    processor: Arc<P>,
    acknowledger: Acknowledger<T>,
    fault: Arc<FaultState>,
}

impl<T, P> SequentialProcessingEventListener<T, P>
where
    T: Send + Sync + 'static,
    P: SequentialMessageProcessor<T>,
{
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn MessageSource<T>>,
        processor: Arc<P>,
    ) -> Self {
        let name: String = name.into();
        let fault = FaultState::new();
        let acknowledger =
            Acknowledger::new(&name, source.clone(), processor.behaviour(), fault.clone());
        Self {
            name: Arc::from(name),
            source,
            processor,
            acknowledger,
            fault,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn behaviour(&self) -> AcknowledgeBehaviour {
        self.acknowledger.behaviour()
    }

    pub fn acknowledger(&self) -> Acknowledger<T> {
        self.acknowledger.clone()
    }

    /// 持續拉取消息並分派到各通道，直到取消或發生致命錯誤
    pub async fn run(&self, cancellation: CancellationToken) -> Result<(), ListenerError> {
        let wait_timeout = self.source.message_wait_timeout();
        let stop = CancellationToken::new();
        let mut lanes: HashMap<String, Arc<ProcessingQueue<T>>> = HashMap::new();
        let mut tasks = JoinSet::new();

        info!(listener = %self.name, behaviour = ?self.behaviour(), "Sequential listener started");

        while !cancellation.is_cancelled() && !self.fault.is_tripped() {
            let next = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                _ = self.fault.tripped() => break,
                next = self.source.try_get_next_message(wait_timeout) => next,
            };

            if let Some(message) = next {
                if cancellation.is_cancelled() {
                    break;
                }

                let key = self.processor.lane_key(message.routing_key());
                match lanes.get(&key) {
                    Some(lane) => lane.push(message),
                    None => {
                        debug!(listener = %self.name, lane = %key, "Creating processing lane");
                        let lane = ProcessingQueue::new();
                        lane.push(message);
                        lanes.insert(key.clone(), lane.clone());
                        tasks.spawn(run_lane(
                            self.name.clone(),
                            key,
                            lane,
                            self.processor.clone(),
                            self.acknowledger.clone(),
                            cancellation.clone(),
                            stop.clone(),
                        ));
                    }
                }
            }

            lanes.retain(|key, lane| {
                if lane.is_idle() {
                    debug!(listener = %self.name, lane = %key, "Retiring idle lane");
                    lane.retire();
                    false
                } else {
                    true
                }
            });

            while let Some(result) = tasks.try_join_next() {
                self.inspect(result);
            }
        }

        stop.cancel();
        for lane in lanes.values() {
            lane.retire();
        }

        debug!(listener = %self.name, lanes = tasks.len(), "Draining processing lanes");
        while let Some(result) = tasks.join_next().await {
            self.inspect(result);
        }

        info!(listener = %self.name, "Sequential listener stopped");
        match self.fault.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn inspect(&self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            if e.is_panic() {
                self.acknowledger.panicked(e.to_string());
            }
        }
    }
}

async fn run_lane<T, P>(
    listener: Arc<str>,
    key: String,
    lane: Arc<ProcessingQueue<T>>,
    processor: Arc<P>,
    acknowledger: Acknowledger<T>,
    cancellation: CancellationToken,
    stop: CancellationToken,
) where
    T: Send + Sync + 'static,
    P: SequentialMessageProcessor<T>,
{
    loop {
        if stop.is_cancelled() || cancellation.is_cancelled() {
            break;
        }

        let head = lane.messages.lock().front().cloned();
        let Some(message) = head else {
            if lane.retired.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = lane.wake.notified() => {}
                _ = stop.cancelled() => break,
            }
            continue;
        };

        let fatal =
            process(&listener, &key, &*processor, &acknowledger, &message, &cancellation).await;
        lane.messages.lock().pop_front();
        if fatal {
            break;
        }
    }

    debug!(listener = %listener, lane = %key, "Processing lane finished");
}

/// 處理通道頭部的消息，回傳是否發生致命錯誤
async fn process<T, P>(
    listener: &str,
    lane: &str,
    processor: &P,
    acknowledger: &Acknowledger<T>,
    message: &QueueMessage<T>,
    cancellation: &CancellationToken,
) -> bool
where
    T: Send + Sync + 'static,
    P: SequentialMessageProcessor<T>,
{
    let delivery_tag = message.delivery_tag();
    let started = Instant::now();
    debug!(listener = %listener, lane = %lane, delivery_tag = %delivery_tag, "Message received");

    let result = processor
        .process_message(message.message(), delivery_tag, message.routing_key(), cancellation)
        .await;

    let (outcome, fatal) = match result {
        Ok(()) => {
            if acknowledger.behaviour() != AcknowledgeBehaviour::Async {
                acknowledger.acknowledge(delivery_tag).await;
            }
            info!(
                listener = %listener,
                lane = %lane,
                delivery_tag = %delivery_tag,
                "Message processed"
            );
            ("success", false)
        }
        Err(e) if e.is_fatal() => {
            acknowledger.requeue(delivery_tag).await;
            acknowledger.fail(e);
            ("fatal", true)
        }
        Err(e) => {
            error!(
                listener = %listener,
                lane = %lane,
                delivery_tag = %delivery_tag,
                "Error processing message: {:#}",
                e
            );
            acknowledger.reject(delivery_tag).await;
            ("failed", false)
        }
    };

    BrokerMetrics::record(listener, MetricType::Processed { outcome }, Some(started.elapsed()));
    fatal
}
