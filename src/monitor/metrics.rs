use metrics::{counter, histogram};
use std::time::Duration;

/// 監控指標命名空間
pub const METRIC_NAMESPACE: &str = "queue_wrapper";

/// 監控指標類型
#[derive(Debug, Clone, Copy)]
pub enum MetricType {
    ConnectionAttempt { succeeded: bool },
    ConnectionLost,
    ConnectionRestored,
    DeliveryReceived,
    DeliveryRejected { reason: &'static str },
    Acknowledged { kind: &'static str },
    Published,
    Confirmed { positive: bool },
    Republished { reason: &'static str },
    Returned,
    Processed { outcome: &'static str },
    BatchProcessed { size: usize, succeeded: bool },
}

/// broker 監控指標記錄器
///
/// 未安裝 recorder 時所有記錄都是 no-op。
pub struct BrokerMetrics;

impl BrokerMetrics {
    /// 記錄指標
    ///
    /// # Arguments
    /// * `source` - 消費者、發佈者或監聽器名稱
    /// * `metric_type` - 指標類型
    /// * `duration` - 可選的持續時間，用於處理延遲
    pub fn record(source: &str, metric_type: MetricType, duration: Option<Duration>) {
        let source = source.to_string();
        match metric_type {
            MetricType::ConnectionAttempt { succeeded } => {
                counter!(
                    format!("{}.connection_attempt", METRIC_NAMESPACE),
                    "succeeded" => if succeeded { "true" } else { "false" }
                )
                .increment(1);
            }
            MetricType::ConnectionLost => {
                counter!(format!("{}.connection_lost", METRIC_NAMESPACE), "source" => source)
                    .increment(1);
            }
            MetricType::ConnectionRestored => {
                counter!(format!("{}.connection_restored", METRIC_NAMESPACE), "source" => source)
                    .increment(1);
            }
            MetricType::DeliveryReceived => {
                counter!(format!("{}.delivery_received", METRIC_NAMESPACE), "source" => source)
                    .increment(1);
            }
            MetricType::DeliveryRejected { reason } => {
                counter!(
                    format!("{}.delivery_rejected", METRIC_NAMESPACE),
                    "source" => source,
                    "reason" => reason
                )
                .increment(1);
            }
            MetricType::Acknowledged { kind } => {
                counter!(
                    format!("{}.acknowledged", METRIC_NAMESPACE),
                    "source" => source,
                    "kind" => kind
                )
                .increment(1);
            }
            MetricType::Published => {
                counter!(format!("{}.published", METRIC_NAMESPACE), "source" => source)
                    .increment(1);
            }
            MetricType::Confirmed { positive } => {
                counter!(
                    format!("{}.confirmed", METRIC_NAMESPACE),
                    "source" => source,
                    "positive" => if positive { "true" } else { "false" }
                )
                .increment(1);
            }
            MetricType::Republished { reason } => {
                counter!(
                    format!("{}.republished", METRIC_NAMESPACE),
                    "source" => source,
                    "reason" => reason
                )
                .increment(1);
            }
            MetricType::Returned => {
                counter!(format!("{}.returned", METRIC_NAMESPACE), "source" => source).increment(1);
            }
            MetricType::Processed { outcome } => {
                counter!(
                    format!("{}.processed", METRIC_NAMESPACE),
                    "source" => source.clone(),
                    "outcome" => outcome
                )
                .increment(1);

                if let Some(dur) = duration {
                    histogram!(
                        format!("{}.processing_latency_ms", METRIC_NAMESPACE),
                        "source" => source
                    )
                    .record(dur.as_secs_f64() * 1000.0);
                }
            }
            MetricType::BatchProcessed { size, succeeded } => {
                counter!(
                    format!("{}.batch_processed", METRIC_NAMESPACE),
                    "source" => source.clone(),
                    "succeeded" => if succeeded { "true" } else { "false" }
                )
                .increment(1);
                histogram!(format!("{}.batch_size", METRIC_NAMESPACE), "source" => source)
                    .record(size as f64);
            }
        }
    }
}
