//! standalone broker 服务
//!
//! 读取配置，把 broker 事件写入日志文件和 CSV，并提供一个按行收发文本命令的 TCP 传输层

use std::path::{Path, PathBuf};

use tokio::fs;

pub mod csv;
pub mod file_log;
pub mod transport;

const DEFAULT_LISTEN: &str = "0.0.0.0:1883";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_LOG_DIR: &str = "Logs";
const DEFAULT_CSV_FILE: &str = "mqtt_messages.csv";

/// 默认的 CSV 列，payload 按逗号拆分后依次对应
pub const DEFAULT_CSV_COLUMNS: [&str; 22] = [
    "BMCODE",
    "Temperature",
    "Pressure",
    "Volume",
    "Level",
    "Generator",
    "Grid",
    "Aggregate",
    "Compressor1",
    "Compressor2",
    "CIP",
    "VoltageU",
    "VoltageV",
    "VoltageW",
    "CurrentU",
    "CurrentV",
    "CurrentW",
    "Frequency",
    "PwrF",
    "TPwr",
    "Time",
    "Date",
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("Logger error: {0}")]
    Logger(#[from] flexi_logger::FlexiLoggerError),
    #[error("Broker error: {0}")]
    Broker(#[from] mqtt_hub::Error),
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub csv: Csv,
    /// broker 本身的配置：[broker] 和 [session]
    #[serde(flatten)]
    pub hub: mqtt_hub::config::Config,
}

#[derive(Debug, serde::Deserialize)]
pub struct Server {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct Log {
    /// 日志级别，环境变量 RUST_LOG 优先
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 日志文件和 CSV 文件所在目录
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    /// 是否把客户端事件写入 mqtt_logs.txt
    #[serde(default = "default_true")]
    pub events: bool,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            events: true,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct Csv {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_csv_file")]
    pub file: String,
    #[serde(default = "default_csv_columns")]
    pub columns: Vec<String>,
}

impl Default for Csv {
    fn default() -> Self {
        Self {
            enabled: true,
            file: default_csv_file(),
            columns: default_csv_columns(),
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.into()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.into()
}

fn default_log_dir() -> PathBuf {
    DEFAULT_LOG_DIR.into()
}

fn default_csv_file() -> String {
    DEFAULT_CSV_FILE.into()
}

fn default_csv_columns() -> Vec<String> {
    DEFAULT_CSV_COLUMNS.iter().map(|c| c.to_string()).collect()
}

fn default_true() -> bool {
    true
}

impl Config {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let s = fs::read_to_string(path).await?;
        let cfg = toml::from_str::<Config>(&s)?;
        cfg.hub.validate().map_err(mqtt_hub::Error::from)?;
        Ok(cfg)
    }

    pub fn csv_path(&self) -> PathBuf {
        self.log.dir.join(&self.csv.file)
    }
}
