//! 按行收发文本命令的传输层
//!
//! 不是 mqtt 报文格式，只用来演示如何把网络连接接到 broker 上：
//!
//! ```text
//! CONNECT <client-id>
//! SUB <filter> [qos]
//! UNSUB <filter>
//! PUB <topic> <qos> <payload...>
//! RETAIN <topic> <qos> <payload...>
//! PING
//! DISCONNECT
//! ```
//!
//! 服务端回复 `OK ...`、`ERR <reason>`、`PONG`，投递的消息为 `MSG <topic> <qos> <payload>`

use std::{str::FromStr, sync::Arc};

use log::{debug, error, info};
use mqtt_hub::{BrokerCore, Delivery, Message, QoS, SessionHandle};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::TcpListener,
    sync::Mutex,
};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid qos {0:?}")]
    InvalidQoS(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Connect {
        client_id: String,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
    Publish {
        topic: String,
        qos: QoS,
        retain: bool,
        payload: String,
    },
    Ping,
    Disconnect,
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));

        match cmd.to_ascii_uppercase().as_str() {
            "" => Err(ParseError::Empty),
            "CONNECT" => {
                let client_id = rest.trim();
                if client_id.is_empty() {
                    return Err(ParseError::Missing("client id"));
                }
                Ok(Command::Connect {
                    client_id: client_id.into(),
                })
            }
            "SUB" => {
                let mut args = rest.split_whitespace();
                let filter = args.next().ok_or(ParseError::Missing("filter"))?;
                let qos = args.next().map(parse_qos).transpose()?.unwrap_or_default();
                Ok(Command::Subscribe {
                    filter: filter.into(),
                    qos,
                })
            }
            "UNSUB" => {
                let filter = rest.trim();
                if filter.is_empty() {
                    return Err(ParseError::Missing("filter"));
                }
                Ok(Command::Unsubscribe {
                    filter: filter.into(),
                })
            }
            verb @ ("PUB" | "RETAIN") => {
                let mut args = rest.splitn(3, ' ');
                let topic = args
                    .next()
                    .filter(|t| !t.is_empty())
                    .ok_or(ParseError::Missing("topic"))?;
                let qos = parse_qos(args.next().ok_or(ParseError::Missing("qos"))?)?;
                Ok(Command::Publish {
                    topic: topic.into(),
                    qos,
                    retain: verb == "RETAIN",
                    payload: args.next().unwrap_or("").into(),
                })
            }
            "PING" => Ok(Command::Ping),
            "DISCONNECT" => Ok(Command::Disconnect),
            _ => Err(ParseError::Unknown(cmd.into())),
        }
    }
}

fn parse_qos(s: &str) -> Result<QoS, ParseError> {
    s.parse::<u8>()
        .ok()
        .and_then(|n| QoS::try_from(n).ok())
        .ok_or_else(|| ParseError::InvalidQoS(s.into()))
}

pub fn format_delivery(delivery: &Delivery) -> String {
    format!(
        "MSG {} {} {}\n",
        delivery.topic,
        u8::from(delivery.qos),
        String::from_utf8_lossy(&delivery.payload).replace('\n', "\\n")
    )
}

/// 接收 tcp 连接，每个连接一个协程
pub async fn serve(listener: TcpListener, broker: Arc<BrokerCore>) {
    loop {
        // 获取到连接
        let (stream, addr) = match listener.accept().await {
            Ok((s, a)) => (s, a),
            Err(e) => {
                error!("accept tcp stream err: {}", e);
                continue;
            }
        };
        info!("new stream comming in: {}", addr);

        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, broker).await {
                error!("connection {} exit error: {}", addr, e)
            }
        });
    }
}

type SharedWriter<S> = Arc<Mutex<io::WriteHalf<S>>>;

/// 处理一个连接：读取命令交给 broker，同时把会话的消息写回连接
pub async fn handle_connection<S>(stream: S, broker: Arc<BrokerCore>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let writer = Arc::new(Mutex::new(writer));

    // 第一条命令必须是 CONNECT
    let first = match lines.next_line().await? {
        Some(line) => line,
        None => return Ok(()),
    };
    let handle = match first.parse::<Command>() {
        Ok(Command::Connect { client_id }) => match broker.on_connect(&client_id).await {
            Ok(handle) => handle,
            Err(e) => return reply(&writer, &format!("ERR {}", e)).await,
        },
        Ok(_) => return reply(&writer, "ERR first command must be CONNECT").await,
        Err(e) => return reply(&writer, &format!("ERR {}", e)).await,
    };
    reply(&writer, &format!("OK CONNECT {}", handle.client_id())).await?;

    let outbound = tokio::spawn(write_deliveries(handle.clone(), writer.clone()));
    let result = read_commands(&mut lines, &handle, &broker, &writer).await;

    broker.on_connection_lost(&handle).await;
    match outbound.await {
        Ok(Err(e)) => debug!("client {} writer exit error: {}", handle.client_id(), e),
        Err(e) => error!("client {} writer task failed: {}", handle.client_id(), e),
        Ok(Ok(())) => {}
    }
    result
}

async fn read_commands<R, S>(
    lines: &mut Lines<R>,
    handle: &SessionHandle,
    broker: &BrokerCore,
    writer: &SharedWriter<S>,
) -> io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    S: AsyncWrite,
{
    let client_id = handle.client_id();

    while let Some(line) = lines.next_line().await? {
        // 被同名的新连接接管了
        if !handle.is_connected() {
            return reply(writer, "ERR session closed").await;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                reply(writer, &format!("ERR {}", e)).await?;
                continue;
            }
        };

        let response = match command {
            Command::Connect { .. } => Ok("ERR already connected".to_string()),
            Command::Subscribe { filter, qos } => broker
                .on_subscribe(client_id, &filter, qos)
                .await
                .map(|_| format!("OK SUB {}", filter)),
            Command::Unsubscribe { filter } => broker
                .on_unsubscribe(client_id, &filter)
                .await
                .map(|removed| format!("OK UNSUB {} {}", filter, removed)),
            Command::Publish {
                topic,
                qos,
                retain,
                payload,
            } => broker
                .publish(
                    Message::new(topic, payload)
                        .with_qos(qos)
                        .with_retain(retain)
                        .from_client(client_id),
                )
                .await
                .map(|n| format!("OK PUB {}", n)),
            Command::Ping => Ok("PONG".to_string()),
            Command::Disconnect => {
                broker.on_connection_lost(handle).await;
                return reply(writer, "OK DISCONNECT").await;
            }
        };

        let response = response.unwrap_or_else(|e| format!("ERR {}", e));
        reply(writer, &response).await?;
    }

    Ok(())
}

/// 把会话发送队列里的消息写到连接，会话关闭后结束
async fn write_deliveries<S>(handle: SessionHandle, writer: SharedWriter<S>) -> io::Result<()>
where
    S: AsyncWrite,
{
    while let Some(delivery) = handle.recv().await {
        let mut w = writer.lock().await;
        w.write_all(format_delivery(&delivery).as_bytes()).await?;
        w.flush().await?;
    }
    debug!("client {} outbound closed", handle.client_id());
    Ok(())
}

async fn reply<S: AsyncWrite>(writer: &SharedWriter<S>, line: &str) -> io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, DuplexStream};

    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!(
            "CONNECT A".parse::<Command>(),
            Ok(Command::Connect {
                client_id: "A".into()
            })
        );
        assert_eq!(
            "sub sensors/+/temp 1".parse::<Command>(),
            Ok(Command::Subscribe {
                filter: "sensors/+/temp".into(),
                qos: QoS::AtLeastOnce
            })
        );
        assert_eq!(
            "SUB a/#".parse::<Command>(),
            Ok(Command::Subscribe {
                filter: "a/#".into(),
                qos: QoS::AtMostOnce
            })
        );
        assert_eq!(
            "PUB sensors/room1/temp 0 21.5, 40 %\r".parse::<Command>(),
            Ok(Command::Publish {
                topic: "sensors/room1/temp".into(),
                qos: QoS::AtMostOnce,
                retain: false,
                payload: "21.5, 40 %".into()
            })
        );
        assert_eq!(
            "RETAIN status 1".parse::<Command>(),
            Ok(Command::Publish {
                topic: "status".into(),
                qos: QoS::AtLeastOnce,
                retain: true,
                payload: "".into()
            })
        );
        assert_eq!("".parse::<Command>(), Err(ParseError::Empty));
        assert_eq!("CONNECT".parse::<Command>(), Err(ParseError::Missing("client id")));
        assert_eq!(
            "PUB t 5 x".parse::<Command>(),
            Err(ParseError::InvalidQoS("5".into()))
        );
        assert_eq!(
            "HELLO".parse::<Command>(),
            Err(ParseError::Unknown("HELLO".into()))
        );
    }

    struct Client {
        lines: Lines<BufReader<io::ReadHalf<DuplexStream>>>,
        writer: io::WriteHalf<DuplexStream>,
    }

    impl Client {
        fn connect(broker: &Arc<BrokerCore>) -> Self {
            let (client, server) = duplex(4096);
            tokio::spawn(handle_connection(server, broker.clone()));
            let (reader, writer) = io::split(client);
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send(&mut self, line: &str) -> String {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.recv().await
        }

        async fn recv(&mut self) -> String {
            self.lines.next_line().await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn publish_over_line_protocol() {
        let broker = Arc::new(BrokerCore::default());
        let mut a = Client::connect(&broker);
        let mut p = Client::connect(&broker);

        assert_eq!(a.send("CONNECT A").await, "OK CONNECT A");
        assert_eq!(p.send("CONNECT P").await, "OK CONNECT P");
        assert_eq!(a.send("SUB sensors/+/temp 1").await, "OK SUB sensors/+/temp");

        assert_eq!(p.send("PUB sensors/room1/temp 1 21.5").await, "OK PUB 1");
        assert_eq!(a.recv().await, "MSG sensors/room1/temp 1 21.5");

        assert_eq!(p.send("PUB sensors/room1/humidity 0 40").await, "OK PUB 0");
        assert!(p
            .send("PUB sensors/+/temp 0 21.5")
            .await
            .starts_with("ERR "));

        assert_eq!(a.send("PING").await, "PONG");
        assert_eq!(a.send("DISCONNECT").await, "OK DISCONNECT");
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test]
    async fn first_command_must_be_connect() {
        let broker = Arc::new(BrokerCore::default());
        let mut c = Client::connect(&broker);
        assert_eq!(c.send("SUB a").await, "ERR first command must be CONNECT");
        assert_eq!(broker.session_count(), 0);
    }
}
