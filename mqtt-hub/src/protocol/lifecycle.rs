use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use log::warn;
use parking_lot::RwLock;

use crate::Observer;

use super::Event;

/// 管理 observer，把会话状态变化的事件发送出去
///
/// 事件在触发它的调用返回之前，依次交给所有 observer 处理。
/// observer 出错只记录日志和计数，不影响 broker 本身的操作
pub(crate) struct SessionLifecycleManager {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    errors: AtomicU64,
}

impl SessionLifecycleManager {
    pub(crate) fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            errors: AtomicU64::new(0),
        }
    }

    pub(crate) fn register(&self, observer: Arc<dyn Observer>) {
        self.observers.write().push(observer);
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// observer 处理失败的总次数
    pub(crate) fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub(crate) async fn emit(&self, event: Event) {
        // 拷贝一份，不持有锁去 await
        let observers = self.observers.read().clone();
        for observer in observers.iter() {
            if let Err(e) = observer.on_event(&event).await {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "observer {} failed to handle {:?}: {}",
                    observer.name(),
                    event,
                    e
                );
            }
        }
    }
}

impl std::fmt::Debug for SessionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycleManager")
            .field("observers", &self.observer_count())
            .field("errors", &self.errors())
            .finish()
    }
}
