use std::collections::HashMap;

use parking_lot::RwLock;

use crate::topic;

use super::Message;

/// 保留消息，每个 topic 只保存最后一条
///
/// 新订阅时需要找出和 filter 匹配的保留消息，这里是线性扫描，
/// 开销为 O(保留消息数)
#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: RwLock<HashMap<String, Message>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存一条保留消息，payload 为空时删除该 topic 的保留消息
    pub fn store(&self, message: &Message) {
        let mut messages = self.messages.write();
        if message.payload.is_empty() {
            messages.remove(&message.topic);
        } else {
            messages.insert(message.topic.clone(), message.clone());
        }
    }

    /// 和 filter 匹配的保留消息，按 topic 排序
    pub fn matching(&self, filter: &str) -> Vec<Message> {
        let mut matched = self
            .messages
            .read()
            .values()
            .filter(|m| topic::matches(&m.topic, filter))
            .cloned()
            .collect::<Vec<_>>();
        matched.sort_by(|a, b| a.topic.cmp(&b.topic));
        matched
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
