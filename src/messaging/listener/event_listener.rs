use crate::messaging::listener::acknowledger::{Acknowledger, FaultState};
use crate::messaging::listener::{
    AcknowledgeBehaviour, ListenerError, MessageSource, ProcessingError,
};
use crate::messaging::protocol::QueueMessage;
use crate::monitor::{BrokerMetrics, MetricType};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 事件處理器
#[async_trait]
pub trait MessageProcessor<T>: Send + Sync + 'static {
    fn behaviour(&self) -> AcknowledgeBehaviour {
        AcknowledgeBehaviour::AfterProcess
    }

    async fn process_message(
        &self,
        message: QueueMessage<T>,
        cancellation: CancellationToken,
    ) -> Result<(), ProcessingError>;
}

/// 並行事件監聽器
///
/// 每則消息在獨立的任務中處理，並行度由消費者的 prefetch 數量限制。
pub struct EventListener<T, P> {
    name: Arc<str>,
    source: Arc<dyn MessageSource<T>>,
    processor: Arc<P>,
    acknowledger: Acknowledger<T>,
    fault: Arc<FaultState>,
}

impl<T, P> EventListener<T, P>
where
    T: Send + Sync + 'static,
    P: MessageProcessor<T>,
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

    /// 非同步確認用的代理
    pub fn acknowledger(&self) -> Acknowledger<T> {
        self.acknowledger.clone()
    }

    /// 持續拉取並處理消息，直到取消或發生致命錯誤
    ///
    /// 返回前會等待所有處理中的任務結束。
    pub async fn run(&self, cancellation: CancellationToken) -> Result<(), ListenerError> {
        let wait_timeout = self.source.message_wait_timeout();
        let mut tasks = JoinSet::new();

        info!(listener = %self.name, behaviour = ?self.behaviour(), "Event listener started");

        while !cancellation.is_cancelled() && !self.fault.is_tripped() {
            let next = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                _ = self.fault.tripped() => break,
                next = self.source.try_get_next_message(wait_timeout) => next,
            };

            while let Some(result) = tasks.try_join_next() {
                self.inspect(result);
            }

            let Some(message) = next else {
                continue;
            };
            if cancellation.is_cancelled() {
                break;
            }

            tasks.spawn(process(
                self.name.clone(),
                self.processor.clone(),
                self.acknowledger.clone(),
                message,
                cancellation.clone(),
            ));
        }

        debug!(listener = %self.name, in_flight = tasks.len(), "Draining processing tasks");
        while let Some(result) = tasks.join_next().await {
            self.inspect(result);
        }

        info!(listener = %self.name, "Event listener stopped");
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

async fn process<T, P>(
    listener: Arc<str>,
    processor: Arc<P>,
    acknowledger: Acknowledger<T>,
    message: QueueMessage<T>,
    cancellation: CancellationToken,
) where
    T: Send + Sync + 'static,
    P: MessageProcessor<T>,
{
    let behaviour = acknowledger.behaviour();
    let delivery_tag = message.delivery_tag();
    let started = Instant::now();
    debug!(listener = %listener, delivery_tag = %delivery_tag, "Message received");

    if behaviour == AcknowledgeBehaviour::BeforeProcess {
        acknowledger.acknowledge(delivery_tag).await;
    }

    let settles_on_error = matches!(
        behaviour,
        AcknowledgeBehaviour::AfterProcess | AcknowledgeBehaviour::Async
    );

    let outcome = match processor.process_message(message, cancellation).await {
        Ok(()) => {
            if behaviour == AcknowledgeBehaviour::AfterProcess {
                acknowledger.acknowledge(delivery_tag).await;
            }
            if behaviour != AcknowledgeBehaviour::Never {
                info!(listener = %listener, delivery_tag = %delivery_tag, "Message processed");
            }
            "success"
        }
        Err(e) if e.is_fatal() => {
            if settles_on_error {
                acknowledger.requeue(delivery_tag).await;
            }
            acknowledger.fail(e);
            "fatal"
        }
        Err(e) => {
            error!(
                listener = %listener,
                delivery_tag = %delivery_tag,
                "Error processing message: {:#}",
                e
            );
            if settles_on_error {
                acknowledger.reject(delivery_tag).await;
            }
            "failed"
        }
    };

    BrokerMetrics::record(&listener, MetricType::Processed { outcome }, Some(started.elapsed()));
}
