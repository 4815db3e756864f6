//! 协议层
//! 会话、订阅、路由等 broker 核心逻辑，不关心底层的网络读写

use bytes::Bytes;

use crate::error::Error;

pub(crate) use queue::Push;
pub use registry::ConnectionRegistry;
pub use retain::RetainedStore;
pub use router::{Routed, Router};
pub use session::{Session, SessionHandle, SessionState};
pub use subscription::{Matched, SubscribeOutcome, Subscription, SubscriptionIndex};

pub(crate) mod lifecycle;
mod queue;
mod registry;
mod retain;
mod router;
mod session;
mod subscription;

/// 消息的服务质量等级，可比较大小
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl Default for QoS {
    fn default() -> Self {
        QoS::AtMostOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            n => Err(Error::InvalidQoS(n)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// 一条发布的消息，路由完成后即丢弃
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// 保留消息，broker 为每个 topic 保存最后一条
    pub retain: bool,
    /// 发布者的 client_id，broker 内部发布的消息为 None
    pub publisher: Option<String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            publisher: None,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn from_client(mut self, client_id: impl Into<String>) -> Self {
        self.publisher = Some(client_id.into());
        self
    }

    /// 投递给某个订阅的副本，qos 取发布和订阅两者中较小的
    pub(crate) fn to_delivery(&self, granted: QoS, retain: bool) -> Delivery {
        Delivery {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos.min(granted),
            retain,
            publisher: self.publisher.clone(),
        }
    }
}

/// 放入会话发送队列，等待传输层取走的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub publisher: Option<String>,
}

/// 会话状态变化时发送给 observer 的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected {
        client_id: String,
    },
    Disconnected {
        client_id: String,
    },
    Subscribed {
        client_id: String,
        filter: String,
        qos: QoS,
    },
    Unsubscribed {
        client_id: String,
        filter: String,
    },
    MessagePublished {
        client_id: Option<String>,
        topic: String,
        payload: Bytes,
    },
    /// 发送队列已满，最旧的一条消息被丢弃
    Backpressure {
        client_id: String,
        dropped: Delivery,
    },
}

impl Event {
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Event::Connected { client_id }
            | Event::Disconnected { client_id }
            | Event::Subscribed { client_id, .. }
            | Event::Unsubscribed { client_id, .. }
            | Event::Backpressure { client_id, .. } => Some(client_id),
            Event::MessagePublished { client_id, .. } => client_id.as_deref(),
        }
    }
}
