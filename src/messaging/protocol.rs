use lapin::types::AMQPValue;
use std::collections::BTreeMap;
use std::fmt;

/// 消息標頭，鍵為字串、值為 AMQP 原生型別
pub type MessageHeaders = BTreeMap<String, AMQPValue>;

/// 投遞標籤
///
/// 除了 broker 指派的序號外，還帶有消費通道的 session 編號。
/// 通道重建後 session 會遞增，舊 session 的標籤不再被接受，
/// 即使新通道重新從 1 開始編號也不會誤確認到別的消息。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag {
    session: u64,
    value: u64,
}

impl DeliveryTag {
    pub fn new(session: u64, value: u64) -> Self {
        Self { session, value }
    }

    /// 通道 session 編號
    pub fn session(&self) -> u64 {
        self.session
    }

    /// broker 指派的投遞序號
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// 從佇列取得的消息，建立後不可變
#[derive(Clone, Debug)]
pub struct QueueMessage<T> {
    message: T,
    delivery_tag: DeliveryTag,
    routing_key: String,
    headers: MessageHeaders,
}

impl<T> QueueMessage<T> {
    pub fn new(
        message: T,
        delivery_tag: DeliveryTag,
        routing_key: impl Into<String>,
        headers: MessageHeaders,
    ) -> Self {
        Self {
            message,
            delivery_tag,
            routing_key: routing_key.into(),
            headers,
        }
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// 取出消息內容
    pub fn into_message(self) -> T {
        self.message
    }

    /// 拆解為 (內容, 標籤, 路由鍵, 標頭)
    pub fn into_parts(self) -> (T, DeliveryTag, String, MessageHeaders) {
        (self.message, self.delivery_tag, self.routing_key, self.headers)
    }
}
