use crate::messaging::listener::{
    AcknowledgeBehaviour, ListenerError, MessageSource, ProcessingError,
};
use crate::messaging::protocol::DeliveryTag;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{error, info, warn};

/// 監聽器的故障狀態，只保留第一個致命錯誤
#[derive(Debug, Default)]
pub(crate) struct FaultState {
    token: CancellationToken,
    error: Mutex<Option<ListenerError>>,
}

impl FaultState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn trip(&self, error: ListenerError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.token.cancel();
    }

    pub(crate) fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn tripped(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub(crate) fn error(&self) -> Option<ListenerError> {
        self.error.lock().clone()
    }
}

/// 消息確認代理
///
/// 監聽器內部用它完成自動確認；`AcknowledgeBehaviour::Async` 的處理器則把它交給
/// 下游系統，在工作真正完成時呼叫 [`Acknowledger::on_acknowledge_message`]。
pub struct Acknowledger<T> {
    listener: Arc<str>,
    source: Arc<dyn MessageSource<T>>,
    behaviour: AcknowledgeBehaviour,
    fault: Arc<FaultState>,
}

impl<T> Clone for Acknowledger<T> {
    fn clone(&self) -> Self {
        Self {
            listener: self.listener.clone(),
            source: self.source.clone(),
            behaviour: self.behaviour,
            fault: self.fault.clone(),
        }
    }
}

impl<T> Acknowledger<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        listener: &str,
        source: Arc<dyn MessageSource<T>>,
        behaviour: AcknowledgeBehaviour,
        fault: Arc<FaultState>,
    ) -> Self {
        Self {
            listener: Arc::from(listener),
            source,
            behaviour,
            fault,
        }
    }

    pub fn behaviour(&self) -> AcknowledgeBehaviour {
        self.behaviour
    }

    /// 批次確認外部完成的消息
    ///
    /// - 致命錯誤：全部拒絕並重新排隊，讓監聽器停止並回傳錯誤
    /// - 一般錯誤：全部拒絕，不重新排隊
    /// - 沒有錯誤：全部確認 (`Never` 策略除外)
    pub async fn on_acknowledge_message(
        &self,
        delivery_tags: &[DeliveryTag],
        error: Option<ProcessingError>,
    ) -> Result<(), ListenerError> {
        match error {
            Some(error) if error.is_fatal() => {
                for tag in delivery_tags {
                    self.requeue(*tag).await;
                }
                Err(self.fail(error))
            }
            Some(error) => {
                error!(
                    listener = %self.listener,
                    count = delivery_tags.len(),
                    "Asynchronous processing failed: {:#}",
                    error
                );
                for tag in delivery_tags {
                    self.reject(*tag).await;
                }
                Ok(())
            }
            None if self.behaviour == AcknowledgeBehaviour::Never => Ok(()),
            None => {
                for tag in delivery_tags {
                    self.acknowledge(*tag).await;
                    info!(listener = %self.listener, delivery_tag = %tag, "Message processed");
                }
                Ok(())
            }
        }
    }

    /// 確認單則消息，失敗只記錄日誌
    pub(crate) async fn acknowledge(&self, delivery_tag: DeliveryTag) {
        if let Err(e) = self.source.acknowledge(delivery_tag).await {
            warn!(
                listener = %self.listener,
                delivery_tag = %delivery_tag,
                "Failed to acknowledge message: {}",
                e
            );
        }
    }

    pub(crate) async fn reject(&self, delivery_tag: DeliveryTag) {
        self.source.negatively_acknowledge(delivery_tag).await;
    }

    pub(crate) async fn requeue(&self, delivery_tag: DeliveryTag) {
        self.source.negatively_acknowledge_and_requeue(delivery_tag).await;
    }

    /// 記錄致命錯誤並觸發監聽器停止
    pub(crate) fn fail(&self, error: ProcessingError) -> ListenerError {
        error!(listener = %self.listener, "Fatal error, stopping listener: {:#}", error);
        let error = ListenerError::Fatal(Arc::new(error));
        self.fault.trip(error.clone());
        error
    }

    pub(crate) fn panicked(&self, message: String) -> ListenerError {
        error!(listener = %self.listener, "Processing task panicked: {}", message);
        let error = ListenerError::TaskPanicked(message);
        self.fault.trip(error.clone());
        error
    }
}
