use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use super::{
    queue::{OutboundQueue, Push},
    Delivery,
};

/// 会话状态，只能单向前进
///
/// Connecting -> Connected -> Disconnecting -> Disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// 代表服务端的一次会话
///
/// 会话保存订阅的反向引用（filter -> token），断开时不需要扫描整个订阅树。
/// 同一个 client_id 被新连接接管后，旧会话的 id 和新会话不同
#[derive(Debug)]
pub struct Session {
    id: u64,
    /// 客户端 id
    client_id: String,
    state: Mutex<SessionState>,
    /// 订阅的主题，key = topic-filter, value = token
    subscriptions: Mutex<HashMap<String, u64>>,
    /// 发送给客户端的消息
    queue: OutboundQueue,
}

impl Session {
    pub(crate) fn new(id: u64, client_id: &str, queue_capacity: usize) -> Self {
        Self {
            id,
            client_id: client_id.into(),
            state: Mutex::new(SessionState::Connecting),
            subscriptions: Mutex::new(HashMap::new()),
            queue: OutboundQueue::new(queue_capacity),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// 状态只能往后走，回退的请求直接忽略
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if next <= *state {
            return false;
        }
        log::debug!(
            "session {}#{} {:?} -> {:?}",
            self.client_id,
            self.id,
            *state,
            next
        );
        *state = next;
        true
    }

    /// 当前订阅的 filter，按字典序
    pub fn subscriptions(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        filters.sort();
        filters
    }

    pub(crate) fn subscription_token(&self, filter: &str) -> Option<u64> {
        self.subscriptions.lock().get(filter).copied()
    }

    pub(crate) fn insert_subscription(&self, filter: &str, token: u64) {
        self.subscriptions.lock().insert(filter.into(), token);
    }

    pub(crate) fn remove_subscription(&self, filter: &str) -> Option<u64> {
        self.subscriptions.lock().remove(filter)
    }

    pub(crate) fn take_subscriptions(&self) -> HashMap<String, u64> {
        std::mem::take(&mut *self.subscriptions.lock())
    }

    pub(crate) fn enqueue(&self, delivery: Delivery) -> Push {
        self.queue.push(delivery)
    }

    /// 关闭发送队列，已经交给传输层的消息不会撤回
    pub(crate) fn close(&self) -> usize {
        self.queue.close()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// 交给传输层的会话句柄，用来取出需要发送给客户端的消息
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn id(&self) -> u64 {
        self.session.id()
    }

    pub fn client_id(&self) -> &str {
        self.session.client_id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.session.subscriptions()
    }

    /// 还没取走的消息数
    pub fn pending(&self) -> usize {
        self.session.pending()
    }

    /// 等待下一条需要投递的消息，会话断开后返回 None
    pub async fn recv(&self) -> Option<Delivery> {
        self.session.queue.pop().await
    }

    pub fn try_recv(&self) -> Option<Delivery> {
        self.session.queue.try_pop()
    }

    /// 取出当前所有积压的消息
    pub fn drain(&self) -> Vec<Delivery> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
