//! 一个进程内的 mqtt broker 核心库：会话管理、主题匹配和消息分发
//!
//! 网络传输由使用者实现，通过 [`BrokerCore`] 的 `on_*` 方法接入，
//! 再从 [`SessionHandle`] 取出需要发送给客户端的消息

use async_trait::async_trait;
use log::info;

pub mod broker;
pub mod config;
pub mod error;
pub mod protocol;
pub mod topic;

pub use broker::BrokerCore;
pub use error::{Error, ObserverError};
pub use protocol::{Delivery, Event, Message, QoS, SessionHandle, SessionState};

/// broker 事件发生时的回调，由用户实现
///
/// 事件在触发它的操作返回之前被处理完，返回的错误不会影响 broker
#[async_trait]
pub trait Observer: Send + Sync + 'static {
    async fn on_event(&self, event: &Event) -> Result<(), ObserverError>;

    /// 出错时打印日志用
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// 把事件打印到日志
pub struct LogObserver;

#[async_trait]
impl Observer for LogObserver {
    async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
        match event {
            Event::Connected { client_id } => info!("Client connected: {}", client_id),
            Event::Disconnected { client_id } => info!("Client disconnected: {}", client_id),
            Event::Subscribed {
                client_id, filter, ..
            } => info!("Client {} subscribed to topic: {}", client_id, filter),
            Event::Unsubscribed { client_id, filter } => {
                info!("Client {} unsubscribed from topic: {}", client_id, filter)
            }
            Event::MessagePublished {
                client_id,
                topic,
                payload,
            } => info!(
                "Client {} published message: Topic: {} Payload: {}",
                client_id.as_deref().unwrap_or("<broker>"),
                topic,
                String::from_utf8_lossy(payload)
            ),
            Event::Backpressure { client_id, dropped } => info!(
                "Client {} dropped message on topic {}",
                client_id, dropped.topic
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
