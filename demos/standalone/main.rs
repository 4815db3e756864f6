use std::sync::Arc;

use clap::Parser;
use demos::{csv::CsvObserver, file_log::FileLogObserver, transport, Config};
use log::info;
use mqtt_hub::{BrokerCore, LogObserver};
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[clap(author, version, about = "standalone mqtt hub")]
struct Args {
    /// 配置文件路径
    #[clap(short, long, default_value = "./standalone.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), demos::Error> {
    let args = Args::parse();

    // 获取配置
    let cfg = Config::from_path(&args.config).await?;

    // 日志
    let _logger = flexi_logger::Logger::try_with_env_or_str(&cfg.log.level)?
        .format(flexi_logger::detailed_format)
        .start()?;

    let broker = BrokerCore::new(&cfg.hub).with_observer(LogObserver);
    if cfg.log.events {
        broker.register_observer(Arc::new(FileLogObserver::new(&cfg.log.dir)));
    }
    if cfg.csv.enabled {
        broker.register_observer(Arc::new(CsvObserver::new(
            cfg.csv_path(),
            cfg.csv.columns.clone(),
        )));
    }
    let broker = Arc::new(broker);

    // 启动 broker
    let listener = TcpListener::bind(&cfg.server.listen).await?;
    info!("MQTT Broker started on {}", listener.local_addr()?);

    tokio::select! {
        _ = transport::serve(listener, broker.clone()) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutting down");
        }
    }
    broker.shutdown().await;
    Ok(())
}
