use std::{path::Path, str::FromStr};

use tokio::fs;

const DEFAULT_MAX_SESSIONS: usize = 10_000;
const DEFAULT_MAX_SUBSCRIPTIONS: usize = 100_000;
const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Read config file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse config error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: Broker,
    #[serde(default)]
    pub session: Session,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Broker {
    /// 同时在线的会话上限
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// 全局订阅数上限
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Session {
    /// 每个会话发送队列的长度，满了之后丢弃最旧的消息
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

fn default_max_subscriptions() -> usize {
    DEFAULT_MAX_SUBSCRIPTIONS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Config {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let s = fs::read_to_string(path).await?;
        s.parse()
    }

    /// 检查取值范围，解析配置文件时会自动调用
    pub fn validate(&self) -> Result<(), Error> {
        if self.session.queue_capacity == 0 {
            return Err(Error::Invalid {
                field: "session.queue_capacity",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg = toml::from_str::<Config>(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}
