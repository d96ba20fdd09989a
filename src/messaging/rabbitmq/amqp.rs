//! 以 lapin 實現的 broker 驅動

use crate::config::QueueWrapperConfig;
use crate::messaging::protocol::MessageHeaders;
use crate::messaging::rabbitmq::certificate::{CertificateResolver, ClientIdentity};
use crate::messaging::rabbitmq::driver::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConfirmEvent, Delivery, DeliveryStream,
    PublishProperties, ShutdownInitiator,
};
use crate::messaging::rabbitmq::error::RabbitMQError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    auth::SASLMechanism,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    tcp::{OwnedIdentity, OwnedTLSConfig},
    types::{FieldTable, LongString, ShortString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REPLY_SUCCESS: u16 = 200;
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 以雙向 TLS 與 EXTERNAL 認證連線的 lapin 連線器
pub struct LapinConnector {
    uri: AMQPUri,
    identity: ClientIdentity,
    cert_chain: Option<String>,
    connection_name: String,
}

impl std::fmt::Debug for LapinConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LapinConnector")
            .field("connection_name", &self.connection_name)
            .finish_non_exhaustive()
    }
}

impl LapinConnector {
    /// 創建連線器
    ///
    /// 找不到用戶端憑證時回傳 `CertificateNotFound`，這是唯一不會重試的連線錯誤。
    pub fn new(
        config: &QueueWrapperConfig,
        resolver: &dyn CertificateResolver,
    ) -> Result<Self, RabbitMQError> {
        let subject = &config.client_certificate_subject_name;
        let identity = resolver
            .try_find_certificate(subject)
            .ok_or_else(|| RabbitMQError::CertificateNotFound(subject.clone()))?;

        let mut uri: AMQPUri = config
            .uri
            .parse()
            .map_err(|e: String| RabbitMQError::InvalidUri(e))?;
        uri.query.heartbeat = Some(config.heartbeat_secs);
        uri.query.auth_mechanism = Some(SASLMechanism::External);

        let cert_chain = match &config.ca_certificate_path {
            Some(path) => Some(fs::read_to_string(path).map_err(|e| {
                RabbitMQError::Other(format!("Unable to read CA certificate {}: {}", path, e))
            })?),
            None => None,
        };

        Ok(Self {
            uri,
            identity,
            cert_chain,
            connection_name: config.app_id(),
        })
    }

    fn tls_config(&self) -> OwnedTLSConfig {
        OwnedTLSConfig {
            identity: Some(OwnedIdentity {
                der: self.identity.der.clone(),
                password: self.identity.password.clone(),
            }),
            cert_chain: self.cert_chain.clone(),
        }
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, RabbitMQError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let connection =
            Connection::connect_uri_with_config(self.uri.clone(), properties, self.tls_config())
                .await
                .map_err(|e| RabbitMQError::BrokerUnreachable(e.to_string()))?;

        info!(
            "Connected to RabbitMQ at {}:{}",
            self.uri.authority.host, self.uri.authority.port
        );
        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

/// lapin 連線
struct LapinConnection {
    connection: Connection,
    failed: Arc<Notify>,
    closing: AtomicBool,
}

impl LapinConnection {
    fn new(connection: Connection) -> Self {
        let failed = Arc::new(Notify::new());
        let signal = failed.clone();
        connection.on_error(move |err| {
            warn!("RabbitMQ connection error: {}", err);
            signal.notify_one();
        });

        Self {
            connection,
            failed,
            closing: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, RabbitMQError> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    async fn closed(&self) -> ShutdownInitiator {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return ShutdownInitiator::Application;
            }
            if !self.connection.status().connected() {
                return ShutdownInitiator::Peer;
            }
            tokio::select! {
                _ = self.failed.notified() => {}
                _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
            }
        }
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        self.closing.store(true, Ordering::SeqCst);
        self.failed.notify_one();
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "Closed by application")
                .await?;
        }
        Ok(())
    }
}

/// lapin 通道
///
/// 每次發佈都會得到一個 `PublisherConfirm`，這裡以自身的序號計數器
/// 把它們轉成 `ConfirmEvent`。
struct LapinChannel {
    channel: Channel,
    publish_seq: AtomicU64,
    confirms: parking_lot::Mutex<Option<mpsc::UnboundedSender<ConfirmEvent>>>,
}

impl LapinChannel {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            publish_seq: AtomicU64::new(1),
            confirms: parking_lot::Mutex::new(None),
        }
    }

    fn map_error(&self, err: lapin::Error) -> RabbitMQError {
        if self.channel.status().connected() {
            RabbitMQError::Lapin(err)
        } else {
            RabbitMQError::ChannelClosed
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), RabbitMQError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn declare_temporary_queue(&self, name: &str) -> Result<String, RabbitMQError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(queue.name().to_string())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), RabbitMQError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn basic_consume(&self, queue: &str) -> Result<(String, DeliveryStream), RabbitMQError> {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_error(e))?;

        let stream = consumer
            .map(|delivery| {
                delivery.map_err(RabbitMQError::from).map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.to_string(),
                    headers: delivery
                        .properties
                        .headers()
                        .as_ref()
                        .map(headers_from_table)
                        .unwrap_or_default(),
                    data: delivery.data,
                    redelivered: delivery.redelivered,
                })
            })
            .boxed();

        Ok((consumer_tag, stream))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn confirm_select(&self) -> Result<mpsc::UnboundedReceiver<ConfirmEvent>, RabbitMQError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| self.map_error(e))?;

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
        let sequence_number = self.publish_seq.fetch_add(1, Ordering::SeqCst);

        let mut basic_properties = BasicProperties::default()
            .with_app_id(ShortString::from(properties.app_id))
            .with_content_type(ShortString::from(properties.content_type))
            .with_delivery_mode(if properties.persistent { 2 } else { 1 })
            .with_timestamp(properties.timestamp);
        if !properties.headers.is_empty() {
            basic_properties = basic_properties.with_headers(headers_to_table(&properties.headers));
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..BasicPublishOptions::default()
                },
                &body,
                basic_properties,
            )
            .await
            .map_err(|e| self.map_error(e))?;

        let Some(sender) = self.confirms.lock().clone() else {
            return Ok(());
        };

        tokio::spawn(async move {
            match confirm.await {
                Ok(Confirmation::Ack(returned)) => {
                    if let Some(returned) = returned {
                        let _ = sender.send(ConfirmEvent::Returned {
                            exchange: returned.delivery.exchange.to_string(),
                            routing_key: returned.delivery.routing_key.to_string(),
                            reply_code: returned.reply_code,
                            reply_text: returned.reply_text.to_string(),
                        });
                    }
                    let _ = sender.send(ConfirmEvent::Ack {
                        delivery_tag: sequence_number,
                        multiple: false,
                    });
                }
                Ok(Confirmation::Nack(_)) => {
                    let _ = sender.send(ConfirmEvent::Nack {
                        delivery_tag: sequence_number,
                        multiple: false,
                    });
                }
                Ok(Confirmation::NotRequested) => {}
                Err(e) => {
                    // 通道已失效，交給逾時掃描或斷線處理
                    debug!("Publisher confirm {} abandoned: {}", sequence_number, e);
                }
            }
        });

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "Closed by application").await {
            error!("Failed to close channel {}: {}", self.channel.id(), e);
            return Err(self.map_error(e));
        }
        Ok(())
    }
}

fn headers_from_table(table: &FieldTable) -> MessageHeaders {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn headers_to_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.clone()), value.clone());
    }
    table
}
