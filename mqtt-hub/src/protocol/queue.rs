use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::Delivery;

/// 入队的结果
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Push {
    Queued,
    /// 队列已满，返回被挤掉的最旧的一条
    Dropped(Delivery),
    /// 队列已关闭，消息没有入队
    Closed,
}

/// 会话的发送队列
///
/// 有界，满了之后丢弃最旧的消息，入队永远不会阻塞。
/// 生产者是 router，消费者是传输层的写协程，各只有一个
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Debug)]
struct Inner {
    buf: VecDeque<Delivery>,
    closed: bool,
}

impl OutboundQueue {
    /// 容量至少为 1，配置文件里的 0 在加载时就会被拒绝
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn push(&self, delivery: Delivery) -> Push {
        let result = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Push::Closed;
            }
            let dropped = if inner.buf.len() >= self.capacity {
                inner.buf.pop_front()
            } else {
                None
            };
            inner.buf.push_back(delivery);
            match dropped {
                Some(old) => Push::Dropped(old),
                None => Push::Queued,
            }
        };
        self.notify.notify_one();
        result
    }

    pub(crate) fn try_pop(&self) -> Option<Delivery> {
        self.inner.lock().buf.pop_front()
    }

    /// 等待下一条消息，队列关闭后返回 None
    pub(crate) async fn pop(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(delivery) = inner.buf.pop_front() {
                    return Some(delivery);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// 关闭队列，丢弃还没取走的消息，返回丢弃的数量
    pub(crate) fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            let n = inner.buf.len();
            inner.buf.clear();
            n
        };
        self.notify.notify_one();
        discarded
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
