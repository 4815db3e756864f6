use crate::{config, topic};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Topic error: {0}")]
    Topic(#[from] topic::Error),
    #[error("Resource exhausted: {resource} limit {limit} reached")]
    ResourceExhausted { resource: &'static str, limit: usize },
    #[error("Session not connected: {0:?}")]
    NotConnected(String),
    #[error("Invalid client id: {0:?}")]
    InvalidClientId(String),
    #[error("Invalid qos level: {0}")]
    InvalidQoS(u8),
    #[error("Config error: {0}")]
    Config(#[from] config::Error),
}

impl Error {
    pub fn is_invalid_filter(&self) -> bool {
        matches!(self, Error::Topic(topic::Error::InvalidFilter { .. }))
    }

    pub fn is_invalid_topic(&self) -> bool {
        matches!(self, Error::Topic(topic::Error::InvalidTopic { .. }))
    }
}

/// observer 处理事件失败，只会被记录，不会影响 broker
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("Observer io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}
