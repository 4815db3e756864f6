use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::{error::Error, topic::TopicFilter};

use super::{QoS, Session};

const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";

/// 订阅信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: String,
    /// 订阅所属的会话，被接管后的新会话不会继承旧会话的订阅
    pub session_id: u64,
    pub filter: String,
    pub maximum_qos: QoS,
}

/// 订阅匹配的结果，同一个会话相同的 qos 只出现一次
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Matched {
    pub client_id: String,
    pub session_id: u64,
    pub qos: QoS,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    New,
    /// 重复订阅，只更新了 qos
    Replaced,
}

/// 全局的订阅索引
///
/// 读（匹配）可以并发，写（订阅/取消订阅）互斥
#[derive(Debug)]
pub struct SubscriptionIndex {
    max_subscriptions: usize,
    tree: RwLock<SubscriptionTree<Subscription>>,
}

impl SubscriptionIndex {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            max_subscriptions,
            tree: RwLock::new(SubscriptionTree::new()),
        }
    }

    /// 添加订阅，同一个会话重复订阅同一个 filter 只替换 qos
    pub fn subscribe(
        &self,
        session: &Session,
        filter: &str,
        qos: QoS,
    ) -> Result<SubscribeOutcome, Error> {
        let filter = TopicFilter::parse(filter)?;
        let mut tree = self.tree.write();

        // 会话在断开的过程中，订阅不再生效
        if !session.is_connected() {
            return Err(Error::NotConnected(session.client_id().into()));
        }

        if let Some(token) = session.subscription_token(filter.as_str()) {
            if let Some(subscription) = tree.get_mut(filter.as_str(), token) {
                subscription.maximum_qos = qos;
                return Ok(SubscribeOutcome::Replaced);
            }
        }

        if tree.len() >= self.max_subscriptions {
            return Err(Error::ResourceExhausted {
                resource: "subscriptions",
                limit: self.max_subscriptions,
            });
        }

        let token = tree.insert(
            &filter,
            Subscription {
                client_id: session.client_id().into(),
                session_id: session.id(),
                filter: filter.as_str().into(),
                maximum_qos: qos,
            },
        );
        session.insert_subscription(filter.as_str(), token);

        Ok(SubscribeOutcome::New)
    }

    /// 取消订阅，没有订阅过时什么都不做
    pub fn unsubscribe(&self, session: &Session, filter: &str) -> bool {
        let mut tree = self.tree.write();
        match session.remove_subscription(filter) {
            Some(token) => tree.remove(filter, token).is_some(),
            None => false,
        }
    }

    /// 删除会话的所有订阅，返回删除的数量
    pub fn remove_session(&self, session: &Session) -> usize {
        let mut tree = self.tree.write();
        session
            .take_subscriptions()
            .into_iter()
            .filter(|(filter, token)| tree.remove(filter, *token).is_some())
            .count()
    }

    /// 查找和 topic 匹配的所有订阅
    ///
    /// 结果按 client_id、会话、qos 排序；同一个会话多个 filter 匹配且 qos 相同时只返回一次
    pub fn matches(&self, topic: &str) -> Vec<Matched> {
        let tree = self.tree.read();
        tree.matches(topic)
            .into_iter()
            .map(|s| Matched {
                client_id: s.client_id.clone(),
                session_id: s.session_id,
                qos: s.maximum_qos,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

/// 按 topic 层级组织的订阅树
#[derive(Debug)]
pub(crate) struct SubscriptionTree<T> {
    /// 订阅树的根节点，是个空节点
    root: SubscriptionNode<T>,
    /// 插入的每一个数据，分配一个唯一的 token 号，方便查询和删除
    token: u64,
    len: usize,
}

impl<T> SubscriptionTree<T> {
    pub(crate) fn new() -> Self {
        Self {
            root: SubscriptionNode::new(),
            token: 0,
            len: 0,
        }
    }

    /// 插入一个订阅记录
    pub(crate) fn insert(&mut self, filter: &TopicFilter, data: T) -> u64 {
        let token = self.token;
        self.root.insert(filter.as_str(), token, data);
        self.token += 1;
        self.len += 1;

        token
    }

    pub(crate) fn get_mut(&mut self, filter: &str, token: u64) -> Option<&mut T> {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = node.children.get_mut(level)?;
        }
        node.data.get_mut(&token)
    }

    /// 查找发布消息的主题匹配的记录
    pub(crate) fn matches(&self, topic: &str) -> Vec<&T> {
        let levels = topic.split('/').collect::<Vec<_>>();
        let mut matches = Vec::new();
        self.root.matches(&levels, true, &mut matches);
        matches
    }

    /// 删除订阅记录
    pub(crate) fn remove(&mut self, filter: &str, token: u64) -> Option<T> {
        let removed = self.root.remove(filter.split('/'), token);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

/// 订阅树的节点
/// 每个客户端订阅的 filter 不固定，可能会挂在任何一个节点上
#[derive(Debug)]
struct SubscriptionNode<T> {
    /// 当前节点包含的数据（客户端信息）
    /// key = token, value = data
    data: HashMap<u64, T>,
    /// 子节点 key = level
    children: HashMap<String, SubscriptionNode<T>>,
}

impl<T> SubscriptionNode<T> {
    fn new() -> Self {
        Self {
            data: HashMap::new(),
            children: HashMap::new(),
        }
    }

    /// 将订阅加到当前节点的子树中
    fn insert(&mut self, filter: &str, token: u64, data: T) {
        let mut current_node = self;

        for level in filter.split('/') {
            current_node = current_node
                .children
                .entry(level.into())
                .or_insert_with(SubscriptionNode::new);
        }

        current_node.data.insert(token, data);
    }

    /// 查找子树中和 topic 匹配的 filter
    fn matches<'a>(&'a self, levels: &[&str], first: bool, matches: &mut Vec<&'a T>) {
        let (level, rest) = match levels.split_first() {
            Some(split) => split,
            None => {
                // topic 到头了，当前节点的数据，以及 `xxx/#` 也匹配 `xxx`
                matches.extend(self.data.values());
                if let Some(node) = self.children.get(MULTI_LEVEL_WILDCARD) {
                    matches.extend(node.data.values());
                }
                return;
            }
        };

        if let Some(node) = self.children.get(*level) {
            node.matches(rest, false, matches);
        }

        // 以 $ 开头的 topic，第一层不匹配通配符
        if first && level.starts_with('$') {
            return;
        }
        if let Some(node) = self.children.get(SINGLE_LEVEL_WILDCARD) {
            node.matches(rest, false, matches);
        }
        if let Some(node) = self.children.get(MULTI_LEVEL_WILDCARD) {
            matches.extend(node.data.values());
        }
    }

    /// 删除子树中对应的订阅
    fn remove<'a, I>(&mut self, mut filter_iter: I, token: u64) -> Option<T>
    where
        I: Iterator<Item = &'a str>,
    {
        match filter_iter.next() {
            // 有下一个，去子树里找
            Some(level) => {
                let node = self.children.get_mut(level)?;
                let removed = node.remove(filter_iter, token);
                // 子节点成为了叶子节点且数据为空，则删除这个子节点
                if node.children.is_empty() && node.data.is_empty() {
                    self.children.remove(level);
                }
                removed
            }
            // 没有下一个，截止到当前节点
            None => self.data.remove(&token),
        }
    }
}
