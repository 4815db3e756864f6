use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mqtt_hub::{Event, Observer, ObserverError};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

pub const LOG_FILE: &str = "mqtt_logs.txt";

const SEPARATOR: &str =
    "-------------------------------------------------------------------";

/// 把客户端事件逐行追加到日志文件，目录和文件不存在时自动创建
pub struct FileLogObserver {
    path: PathBuf,
    /// 多个会话同时写文件时保证每个事件的行不交错
    lock: Mutex<()>,
}

impl FileLogObserver {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(LOG_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, lines: &[String]) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut buf = String::new();
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await?;
        file.flush().await
    }
}

/// 事件对应的日志行
pub fn render(event: &Event, now: &str) -> Vec<String> {
    match event {
        Event::Connected { client_id } => {
            vec![format!("Client connected: {} at {}", client_id, now)]
        }
        Event::Disconnected { client_id } => vec![
            format!("Client disconnected: {} at {}", client_id, now),
            SEPARATOR.into(),
        ],
        Event::Subscribed {
            client_id, filter, ..
        } => vec![format!(
            "Client {} subscribed to topic: {} at {}",
            client_id, filter, now
        )],
        Event::Unsubscribed { client_id, filter } => vec![format!(
            "Client {} unsubscribed from topic: {} at {}",
            client_id, filter, now
        )],
        Event::MessagePublished {
            client_id,
            topic,
            payload,
        } => vec![format!(
            "Client {} published message: Topic: {} Payload: {} at {}",
            client_id.as_deref().unwrap_or("<broker>"),
            topic,
            String::from_utf8_lossy(payload),
            now
        )],
        Event::Backpressure { client_id, dropped } => vec![format!(
            "Client {} dropped message on topic: {} at {}",
            client_id, dropped.topic, now
        )],
    }
}

#[async_trait]
impl Observer for FileLogObserver {
    async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        Ok(self.append(&render(event, &now)).await?)
    }

    fn name(&self) -> &str {
        "file-log"
    }
}
