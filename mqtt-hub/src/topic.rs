//! 主题与订阅过滤器
//!
//! 发布使用的 topic 必须是具体的（不含通配符），订阅使用的 filter 可以含有
//! `+`（单层）和 `#`（多层，只能在最后一层）通配符

use std::{fmt, str::FromStr};

/// topic 和 filter 允许的最大字节数
pub const MAX_TOPIC_LEN: usize = 65535;

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Invalid topic filter {filter:?}: {reason}")]
    InvalidFilter {
        filter: String,
        reason: &'static str,
    },
    #[error("Invalid publish topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: &'static str },
}

/// 订阅的filter的每一层
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LevelKey {
    Concrete(String),
    SingleLevelWildcard,
    MultiLevelWildcard,
}

impl LevelKey {
    /// 只比较一层，`#` 对剩余层级的处理由调用方负责
    pub fn matches(&self, level: &str) -> bool {
        match self {
            LevelKey::Concrete(s) => level == s,
            LevelKey::SingleLevelWildcard | LevelKey::MultiLevelWildcard => true,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        !matches!(self, LevelKey::Concrete(_))
    }

    fn parse(level: &str) -> Self {
        match level {
            SINGLE_LEVEL_WILDCARD => LevelKey::SingleLevelWildcard,
            MULTI_LEVEL_WILDCARD => LevelKey::MultiLevelWildcard,
            s => LevelKey::Concrete(s.into()),
        }
    }
}

/// 校验过的订阅 filter，创建后不可修改
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: String,
    levels: Vec<LevelKey>,
}

impl TopicFilter {
    pub fn parse(filter: &str) -> Result<Self, Error> {
        validate_filter(filter)?;
        Ok(Self {
            raw: filter.into(),
            levels: filter.split(LEVEL_SEPARATOR).map(LevelKey::parse).collect(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn levels(&self) -> &[LevelKey] {
        &self.levels
    }

    pub fn has_wildcards(&self) -> bool {
        self.levels.iter().any(LevelKey::is_wildcard)
    }

    pub fn matches(&self, topic: &str) -> bool {
        matches(topic, &self.raw)
    }
}

impl FromStr for TopicFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// filter 是否含有通配符
pub fn filter_has_wildcards(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// 发布用的 topic 必须是具体的
pub fn validate_topic(topic: &str) -> Result<(), Error> {
    let invalid = |reason| {
        Err(Error::InvalidTopic {
            topic: topic.into(),
            reason,
        })
    };

    if topic.is_empty() {
        return invalid("topic must not be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return invalid("topic is too long");
    }
    if topic.contains('\0') {
        return invalid("topic must not contain NUL");
    }
    if filter_has_wildcards(topic) {
        return invalid("topic must not contain wildcards");
    }

    Ok(())
}

pub fn validate_filter(filter: &str) -> Result<(), Error> {
    let invalid = |reason| {
        Err(Error::InvalidFilter {
            filter: filter.into(),
            reason,
        })
    };

    // 不可以订阅空 filter
    if filter.is_empty() {
        return invalid("filter must not be empty");
    }
    if filter.len() > MAX_TOPIC_LEN {
        return invalid("filter is too long");
    }
    if filter.contains('\0') {
        return invalid("filter must not contain NUL");
    }

    let levels = filter.split(LEVEL_SEPARATOR).collect::<Vec<&str>>();
    if let Some((last, remaining)) = levels.split_last() {
        for level in remaining.iter() {
            // # 字符只能在最后一层
            if level.contains('#') {
                return invalid("multi-level wildcard must be the last level");
            }
            if level.contains('+') && *level != SINGLE_LEVEL_WILDCARD {
                return invalid("single-level wildcard must occupy a whole level");
            }
        }

        // 最后一层的通配符必须独占这一层
        if last.contains('#') && *last != MULTI_LEVEL_WILDCARD {
            return invalid("multi-level wildcard must occupy a whole level");
        }
        if last.contains('+') && *last != SINGLE_LEVEL_WILDCARD {
            return invalid("single-level wildcard must occupy a whole level");
        }
    }

    Ok(())
}

/// 匹配发布消息使用的 topic 和 订阅的 filter
///
/// 这是逐层比较的参考实现，订阅树的匹配结果必须与它一致
pub fn matches(topic: &str, filter: &str) -> bool {
    // 以 $ 开头的 topic 不能被以通配符开头的 filter 匹配
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut topics = topic.split(LEVEL_SEPARATOR);

    for f in filter.split(LEVEL_SEPARATOR) {
        // # 字符匹配当前层和所有子级
        if f == MULTI_LEVEL_WILDCARD {
            return true;
        }

        match topics.next() {
            // + 字符直接匹配这一层
            Some(_) if f == SINGLE_LEVEL_WILDCARD => continue,
            // 没有通配符，必须完全匹配
            Some(t) if f != t => return false,
            Some(_) => continue,
            // topic 层级不够了
            None => return false,
        }
    }

    // filter 层级不够了
    topics.next().is_none()
}
