use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, info};
use parking_lot::RwLock;

use crate::{config, error::Error};

use super::{Session, SessionHandle, SessionState, SubscriptionIndex};

/// 管理在线的客户端会话，key = client_id
///
/// 同一个 client_id 同时只能有一个会话，新连接会把旧会话踢下线
#[derive(Debug)]
pub struct ConnectionRegistry {
    max_sessions: usize,
    queue_capacity: usize,
    next_id: AtomicU64,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl ConnectionRegistry {
    pub fn new(max_sessions: usize, queue_capacity: usize) -> Self {
        Self {
            max_sessions,
            queue_capacity,
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &config::Config) -> Self {
        Self::new(cfg.broker.max_sessions, cfg.session.queue_capacity)
    }

    /// 客户端上线
    ///
    /// 如果已有相同 client_id 的会话，先将其断开（清理订阅，关闭发送队列），
    /// 再创建新会话。被踢下线的旧会话一并返回
    pub fn connect(
        &self,
        client_id: &str,
        index: &SubscriptionIndex,
    ) -> Result<(SessionHandle, Option<Arc<Session>>), Error> {
        let mut sessions = self.sessions.write();

        let evicted = match sessions.remove(client_id) {
            Some(old) => {
                info!("client {} taken over, evict session #{}", client_id, old.id());
                Self::teardown(&old, index);
                Some(old)
            }
            None => {
                if sessions.len() >= self.max_sessions {
                    return Err(Error::ResourceExhausted {
                        resource: "sessions",
                        limit: self.max_sessions,
                    });
                }
                None
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, client_id, self.queue_capacity));
        session.transition(SessionState::Connected);
        sessions.insert(client_id.into(), session.clone());

        Ok((SessionHandle::new(session), evicted))
    }

    /// 客户端下线，未知的 client_id 什么都不做
    pub fn disconnect(&self, client_id: &str, index: &SubscriptionIndex) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let session = sessions.remove(client_id)?;
        Self::teardown(&session, index);
        Some(session)
    }

    /// 只有登记的仍是这个会话时才断开，连接异常退出时使用，不会误伤接管后的新会话
    pub fn disconnect_session(
        &self,
        client_id: &str,
        session_id: u64,
        index: &SubscriptionIndex,
    ) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        if sessions.get(client_id)?.id() != session_id {
            return None;
        }
        let session = sessions.remove(client_id)?;
        Self::teardown(&session, index);
        Some(session)
    }

    /// 断开所有会话
    pub fn disconnect_all(&self, index: &SubscriptionIndex) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let mut drained = sessions.drain().map(|(_, s)| s).collect::<Vec<_>>();
        drained.sort_by(|a, b| a.client_id().cmp(b.client_id()));
        for session in drained.iter() {
            Self::teardown(session, index);
        }
        drained
    }

    pub fn lookup(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(client_id).cloned()
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids = self.sessions.read().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn teardown(session: &Session, index: &SubscriptionIndex) {
        session.transition(SessionState::Disconnecting);
        let subscriptions = index.remove_session(session);
        let discarded = session.close();
        session.transition(SessionState::Disconnected);
        debug!(
            "session {}#{} closed, {} subscriptions removed, {} pending messages discarded",
            session.client_id(),
            session.id(),
            subscriptions,
            discarded
        );
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::from_config(&config::Config::default())
    }
}
