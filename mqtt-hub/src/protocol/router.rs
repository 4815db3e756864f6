use std::sync::Arc;

use log::{trace, warn};

use super::{ConnectionRegistry, Delivery, Message, Push, Session, SubscriptionIndex};

/// 一次路由的结果
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Routed {
    /// 放入发送队列的消息数
    pub deliveries: usize,
    /// 因为队列已满被挤掉的消息 (client_id, 被丢弃的消息)
    pub dropped: Vec<(String, Delivery)>,
}

/// 给所有订阅了 topic 的会话分发消息
///
/// 只负责放入会话的发送队列，不会等待慢速的订阅者
#[derive(Debug)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    index: Arc<SubscriptionIndex>,
}

impl Router {
    pub fn new(registry: Arc<ConnectionRegistry>, index: Arc<SubscriptionIndex>) -> Self {
        Self { registry, index }
    }

    pub fn route(&self, message: &Message) -> Routed {
        let mut routed = Routed::default();
        // 先拿到匹配结果，释放订阅树的锁之后再访问会话
        let matched = self.index.matches(&message.topic);

        for m in matched {
            let session = match self.registry.lookup(&m.client_id) {
                Some(session) => session,
                None => continue,
            };
            // 匹配之后 client_id 被新会话接管了，订阅属于旧会话
            if session.id() != m.session_id {
                trace!(
                    "client {} session #{} replaced, skip {}",
                    m.client_id,
                    m.session_id,
                    message.topic
                );
                continue;
            }
            Self::deliver(&session, message.to_delivery(m.qos, false), &mut routed);
        }

        trace!(
            "route {} to {} subscribers, {} dropped",
            message.topic,
            routed.deliveries,
            routed.dropped.len()
        );
        routed
    }

    /// 直接发送给某个会话，用于新订阅时补发保留消息
    pub fn route_to(&self, session: &Session, delivery: Delivery) -> Routed {
        let mut routed = Routed::default();
        Self::deliver(session, delivery, &mut routed);
        routed
    }

    fn deliver(session: &Session, delivery: Delivery, routed: &mut Routed) {
        match session.enqueue(delivery) {
            Push::Queued => routed.deliveries += 1,
            Push::Dropped(old) => {
                warn!(
                    "client {} outbound queue full (capacity {}), drop oldest message on {}",
                    session.client_id(),
                    session.queue_capacity(),
                    old.topic
                );
                routed.deliveries += 1;
                routed.dropped.push((session.client_id().into(), old));
            }
            // 会话正在断开
            Push::Closed => {}
        }
    }
}
