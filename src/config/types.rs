use crate::config::validation::{ValidationError, ValidationUtils, Validator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// 應用程序配置結構
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default)]
    pub log: LogConfig,
    pub queue_wrapper: QueueWrapperConfig,
}

impl Validator for ApplicationConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        self.log.validate()?;
        self.queue_wrapper.validate()?;

        Ok(())
    }
}

/// 日誌配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
    /// 設定後同時輸出到此目錄下每日輪替的檔案
    pub directory: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

impl Validator for LogConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        ValidationUtils::one_of(
            &self.level.to_lowercase().as_str(),
            &["trace", "debug", "info", "warn", "error"],
            "log.level",
        )?;

        ValidationUtils::one_of(
            &self.format.to_lowercase().as_str(),
            &["pretty", "compact"],
            "log.format",
        )?;

        Ok(())
    }
}

/// 佇列包裝器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueWrapperConfig {
    /// broker 位址，例如 `amqps://broker.local:5671/vhost`
    pub uri: String,
    pub client_certificate_subject_name: String,
    #[serde(default = "default_certificate_directory")]
    pub certificate_directory: String,
    #[serde(default)]
    pub certificate_password: String,
    /// PEM 格式的 CA 憑證鏈
    #[serde(default)]
    pub ca_certificate_path: Option<String>,
    #[serde(default = "default_temporary_queue_name_prefix")]
    pub temporary_queue_name_prefix: String,
    #[serde(default = "default_message_prefetch_count")]
    pub message_prefetch_count: u16,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u16,
    #[serde(default = "default_publish_message_confirmation_timeout_secs")]
    pub publish_message_confirmation_timeout_secs: u64,
    #[serde(default = "default_channel_confirm_timeout_interval_secs")]
    pub channel_confirm_timeout_interval_secs: u64,
    #[serde(default = "default_millis_between_connection_retries")]
    pub millis_between_connection_retries: u64,
    #[serde(default = "default_application_id")]
    pub application_id: String,
    #[serde(default)]
    pub consumers: HashMap<String, ConsumerConfig>,
    #[serde(default)]
    pub publishers: HashMap<String, PublisherConfig>,
}

fn default_certificate_directory() -> String {
    "certs".to_string()
}

fn default_temporary_queue_name_prefix() -> String {
    "TMP_".to_string()
}

fn default_message_prefetch_count() -> u16 {
    1
}

fn default_heartbeat_secs() -> u16 {
    120
}

fn default_publish_message_confirmation_timeout_secs() -> u64 {
    5
}

fn default_channel_confirm_timeout_interval_secs() -> u64 {
    1
}

fn default_millis_between_connection_retries() -> u64 {
    1000
}

fn default_application_id() -> String {
    "component_machine".to_string()
}

impl QueueWrapperConfig {
    /// 以預設值建立配置
    pub fn new(uri: impl Into<String>, client_certificate_subject_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            client_certificate_subject_name: client_certificate_subject_name.into(),
            certificate_directory: default_certificate_directory(),
            certificate_password: String::new(),
            ca_certificate_path: None,
            temporary_queue_name_prefix: default_temporary_queue_name_prefix(),
            message_prefetch_count: default_message_prefetch_count(),
            heartbeat_secs: default_heartbeat_secs(),
            publish_message_confirmation_timeout_secs:
                default_publish_message_confirmation_timeout_secs(),
            channel_confirm_timeout_interval_secs: default_channel_confirm_timeout_interval_secs(),
            millis_between_connection_retries: default_millis_between_connection_retries(),
            application_id: default_application_id(),
            consumers: HashMap::new(),
            publishers: HashMap::new(),
        }
    }

    /// 重新連線的間隔
    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_millis(self.millis_between_connection_retries)
    }

    /// 發佈確認逾時
    pub fn publish_confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_message_confirmation_timeout_secs)
    }

    /// 確認逾時掃描間隔
    pub fn confirm_scan_interval(&self) -> Duration {
        Duration::from_secs(self.channel_confirm_timeout_interval_secs)
    }

    /// 發佈消息與連線名稱使用的應用程式識別，格式為 `<application_id>_<host>`
    pub fn app_id(&self) -> String {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        format!("{}_{}", self.application_id, host)
    }

    /// 依名稱取得消費者配置
    pub fn consumer(&self, name: &str) -> Option<&ConsumerConfig> {
        self.consumers.get(name)
    }

    /// 依名稱取得發佈者配置
    pub fn publisher(&self, name: &str) -> Option<&PublisherConfig> {
        self.publishers.get(name)
    }
}

impl Validator for QueueWrapperConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        ValidationUtils::amqp_uri(&self.uri, "queue_wrapper.uri")?;
        ValidationUtils::not_empty(
            &self.client_certificate_subject_name,
            "queue_wrapper.client_certificate_subject_name",
        )?;
        ValidationUtils::in_range(
            self.message_prefetch_count,
            1,
            u16::MAX,
            "queue_wrapper.message_prefetch_count",
        )?;
        ValidationUtils::in_range(
            self.publish_message_confirmation_timeout_secs,
            1,
            3600,
            "queue_wrapper.publish_message_confirmation_timeout_secs",
        )?;
        ValidationUtils::in_range(
            self.channel_confirm_timeout_interval_secs,
            1,
            3600,
            "queue_wrapper.channel_confirm_timeout_interval_secs",
        )?;
        ValidationUtils::in_range(
            self.millis_between_connection_retries,
            1,
            3_600_000,
            "queue_wrapper.millis_between_connection_retries",
        )?;

        for (name, consumer) in &self.consumers {
            consumer.validate().map_err(|e| {
                ValidationError::InvalidValue(format!("consumers.{}: {}", name, e))
            })?;
        }
        for (name, publisher) in &self.publishers {
            publisher.validate().map_err(|e| {
                ValidationError::InvalidValue(format!("publishers.{}: {}", name, e))
            })?;
        }

        Ok(())
    }
}

/// 消費者配置
///
/// `queue_name` 為空時會宣告臨時佇列並綁定到 `exchange_name`/`routing_key`。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub queue_name: String,
    #[serde(default)]
    pub exchange_name: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default = "default_message_wait_timeout_ms")]
    pub message_wait_timeout_ms: u64,
}

fn default_message_wait_timeout_ms() -> u64 {
    1000
}

impl ConsumerConfig {
    /// 消費固定佇列
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            message_wait_timeout_ms: default_message_wait_timeout_ms(),
            ..Self::default()
        }
    }

    /// 以臨時佇列訂閱交換機
    pub fn for_subscription(
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            message_wait_timeout_ms: default_message_wait_timeout_ms(),
            ..Self::default()
        }
    }

    pub fn message_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.message_wait_timeout_ms)
    }

    pub fn uses_temporary_queue(&self) -> bool {
        self.queue_name.trim().is_empty()
    }
}

impl Validator for ConsumerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        ValidationUtils::check_dependency(
            self.uses_temporary_queue(),
            !self.exchange_name.trim().is_empty(),
            "temporary queue",
            "exchange_name",
        )?;
        ValidationUtils::in_range(
            self.message_wait_timeout_ms,
            1,
            3_600_000,
            "message_wait_timeout_ms",
        )?;

        Ok(())
    }
}

/// 發佈者配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default)]
    pub exchange_name: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default = "default_publishes_persistent_messages")]
    pub publishes_persistent_messages: bool,
}

fn default_publishes_persistent_messages() -> bool {
    true
}

impl PublisherConfig {
    pub fn new(exchange_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            publishes_persistent_messages: true,
        }
    }
}

impl Validator for PublisherConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        // 預設交換機需要路由鍵作為佇列名稱
        ValidationUtils::check_dependency(
            self.exchange_name.trim().is_empty(),
            !self.routing_key.trim().is_empty(),
            "default exchange",
            "routing_key",
        )
    }
}
