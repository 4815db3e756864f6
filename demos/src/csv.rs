use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use mqtt_hub::{Event, Observer, ObserverError};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

const TOPIC_COLUMN: &str = "Topic";

/// 把发布的消息记录到 CSV
///
/// payload 按逗号拆分，依次填入配置的列，缺少的列留空，多出的部分丢弃，
/// 最后一列是 topic。文件第一次创建时写入表头。
/// 含有逗号、引号或换行的字段按 RFC 4180 加引号
pub struct CsvObserver {
    path: PathBuf,
    columns: Vec<String>,
    lock: Mutex<()>,
}

impl CsvObserver {
    pub fn new(path: impl AsRef<Path>, columns: Vec<String>) -> Self {
        Self {
            path: path.as_ref().into(),
            columns,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> String {
        join(
            self.columns
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(TOPIC_COLUMN)),
        )
    }

    pub fn row(&self, topic: &str, payload: &str) -> String {
        let mut parts = payload.split(',');
        join(
            self.columns
                .iter()
                .map(|_| parts.next().unwrap_or(""))
                .chain(std::iter::once(topic)),
        )
    }

    async fn append(&self, row: String) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut buf = String::new();
        if fs::metadata(&self.path).await.is_err() {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir).await?;
            }
            buf.push_str(&self.header());
            buf.push('\n');
        }
        buf.push_str(&row);
        buf.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await
    }
}

fn join<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    fields.map(quote).collect::<Vec<_>>().join(",")
}

fn quote(field: &str) -> Cow<'_, str> {
    if field.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

#[async_trait]
impl Observer for CsvObserver {
    async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
        if let Event::MessagePublished { topic, payload, .. } = event {
            let row = self.row(topic, &String::from_utf8_lossy(payload));
            self.append(row).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "csv"
    }
}
