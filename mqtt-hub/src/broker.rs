use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use tokio::sync::Mutex;

use crate::{
    config::Config,
    error::Error,
    protocol::{
        lifecycle::SessionLifecycleManager, ConnectionRegistry, Event, Message, QoS,
        RetainedStore, Routed, Router, Session, SessionHandle, SubscribeOutcome,
        SubscriptionIndex,
    },
    topic, Observer,
};

/// 代表一个 broker 实例
///
/// 传输层把客户端的连接、订阅、发布等请求交给它，它负责更新会话和订阅，
/// 把消息分发到各个会话的发送队列，并通知所有 observer。
/// 会话和订阅的存储由外部注入，一个进程里可以同时存在多个互不影响的实例
#[derive(Debug)]
pub struct BrokerCore {
    registry: Arc<ConnectionRegistry>,
    index: Arc<SubscriptionIndex>,
    router: Router,
    retains: RetainedStore,
    lifecycle: SessionLifecycleManager,
    /// 上线/下线和对应的事件一起串行执行，observer 看到的顺序和会话的变化顺序一致
    membership: Mutex<()>,
}

impl BrokerCore {
    pub fn new(cfg: &Config) -> Self {
        Self::with_parts(
            Arc::new(ConnectionRegistry::from_config(cfg)),
            Arc::new(SubscriptionIndex::new(cfg.broker.max_subscriptions)),
        )
    }

    pub fn with_parts(registry: Arc<ConnectionRegistry>, index: Arc<SubscriptionIndex>) -> Self {
        Self {
            router: Router::new(registry.clone(), index.clone()),
            registry,
            index,
            retains: RetainedStore::new(),
            lifecycle: SessionLifecycleManager::new(),
            membership: Mutex::new(()),
        }
    }

    pub fn with_observer<O: Observer>(self, observer: O) -> Self {
        self.register_observer(Arc::new(observer));
        self
    }

    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.lifecycle.register(observer);
    }

    /// 客户端上线
    ///
    /// 相同 client_id 的旧会话会被踢下线，observer 先收到旧会话的
    /// Disconnected，再收到新会话的 Connected。并发的上线请求依次处理，
    /// 两次接管的事件不会交错
    pub async fn on_connect(&self, client_id: &str) -> Result<SessionHandle, Error> {
        if client_id.is_empty() {
            return Err(Error::InvalidClientId(client_id.into()));
        }

        let _membership = self.membership.lock().await;
        let (handle, evicted) = self.registry.connect(client_id, &self.index)?;
        if evicted.is_some() {
            self.lifecycle
                .emit(Event::Disconnected {
                    client_id: client_id.into(),
                })
                .await;
        }

        info!("client {} connected, session #{}", client_id, handle.id());
        self.lifecycle
            .emit(Event::Connected {
                client_id: client_id.into(),
            })
            .await;

        Ok(handle)
    }

    /// 客户端下线，可以重复调用
    pub async fn on_disconnect(&self, client_id: &str) {
        let _membership = self.membership.lock().await;
        if let Some(session) = self.registry.disconnect(client_id, &self.index) {
            info!("client {} disconnected, session #{}", client_id, session.id());
            self.lifecycle
                .emit(Event::Disconnected {
                    client_id: client_id.into(),
                })
                .await;
        }
    }

    /// 连接异常断开
    ///
    /// 和 on_disconnect 不同，只断开 handle 对应的会话。如果这个 client_id
    /// 已经被新连接接管，什么都不做
    pub async fn on_connection_lost(&self, handle: &SessionHandle) {
        let client_id = handle.client_id();
        let _membership = self.membership.lock().await;
        if let Some(session) = self
            .registry
            .disconnect_session(client_id, handle.id(), &self.index)
        {
            info!("client {} connection lost, session #{}", client_id, session.id());
            self.lifecycle
                .emit(Event::Disconnected {
                    client_id: client_id.into(),
                })
                .await;
        }
    }

    /// 处理订阅请求，订阅成功后补发匹配的保留消息
    pub async fn on_subscribe(
        &self,
        client_id: &str,
        filter: &str,
        qos: QoS,
    ) -> Result<SubscribeOutcome, Error> {
        let session = self.connected(client_id)?;
        let outcome = self.index.subscribe(&session, filter, qos)?;
        debug!(
            "client {} subscribed {} with {:?} ({:?})",
            client_id, filter, qos, outcome
        );

        self.lifecycle
            .emit(Event::Subscribed {
                client_id: client_id.into(),
                filter: filter.into(),
                qos,
            })
            .await;

        for retained in self.retains.matching(filter) {
            let routed = self
                .router
                .route_to(&session, retained.to_delivery(qos, true));
            self.emit_backpressure(routed).await;
        }

        Ok(outcome)
    }

    /// 取消订阅，返回是否真的删除了订阅
    pub async fn on_unsubscribe(&self, client_id: &str, filter: &str) -> Result<bool, Error> {
        let session = self.connected(client_id)?;
        let removed = self.index.unsubscribe(&session, filter);
        if removed {
            debug!("client {} unsubscribed {}", client_id, filter);
            self.lifecycle
                .emit(Event::Unsubscribed {
                    client_id: client_id.into(),
                    filter: filter.into(),
                })
                .await;
        }
        Ok(removed)
    }

    /// 客户端发布消息，返回投递的会话数
    pub async fn on_publish(
        &self,
        client_id: &str,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<usize, Error> {
        self.publish(
            Message::new(topic, payload)
                .with_qos(qos)
                .from_client(client_id),
        )
        .await
    }

    /// 发布消息，publisher 为空时视为 broker 内部消息
    ///
    /// 没有订阅者时返回 0，不是错误
    pub async fn publish(&self, message: Message) -> Result<usize, Error> {
        topic::validate_topic(&message.topic)?;
        if let Some(client_id) = &message.publisher {
            self.connected(client_id)?;
        }

        if message.retain {
            self.retains.store(&message);
        }

        self.lifecycle
            .emit(Event::MessagePublished {
                client_id: message.publisher.clone(),
                topic: message.topic.clone(),
                payload: message.payload.clone(),
            })
            .await;

        let routed = self.router.route(&message);
        let deliveries = routed.deliveries;
        self.emit_backpressure(routed).await;

        Ok(deliveries)
    }

    /// 断开所有会话
    pub async fn shutdown(&self) {
        let _membership = self.membership.lock().await;
        let sessions = self.registry.disconnect_all(&self.index);
        info!("broker shutdown, {} sessions disconnected", sessions.len());
        for session in sessions {
            self.lifecycle
                .emit(Event::Disconnected {
                    client_id: session.client_id().into(),
                })
                .await;
        }
    }

    pub fn session(&self, client_id: &str) -> Option<SessionHandle> {
        self.registry.lookup(client_id).map(SessionHandle::new)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.index.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retains.len()
    }

    /// observer 处理事件失败的次数
    pub fn observer_errors(&self) -> u64 {
        self.lifecycle.errors()
    }

    fn connected(&self, client_id: &str) -> Result<Arc<Session>, Error> {
        match self.registry.lookup(client_id) {
            Some(session) if session.is_connected() => Ok(session),
            _ => Err(Error::NotConnected(client_id.into())),
        }
    }

    async fn emit_backpressure(&self, routed: Routed) {
        for (client_id, dropped) in routed.dropped {
            self.lifecycle
                .emit(Event::Backpressure { client_id, dropped })
                .await;
        }
    }
}

impl Default for BrokerCore {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{error::ObserverError, Delivery, SessionState};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.0.lock().clone()
        }
    }

    #[async_trait]
    impl Observer for Recorder {
        async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
            self.0.lock().push(event.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Observer for Broken {
        async fn on_event(&self, _event: &Event) -> Result<(), ObserverError> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "log file gone").into())
        }
    }

    fn broker_with_recorder(cfg: &Config) -> (BrokerCore, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let broker = BrokerCore::new(cfg);
        broker.register_observer(recorder.clone());
        (broker, recorder)
    }

    fn connected(client_id: &str) -> Event {
        Event::Connected {
            client_id: client_id.into(),
        }
    }

    fn disconnected(client_id: &str) -> Event {
        Event::Disconnected {
            client_id: client_id.into(),
        }
    }

    #[tokio::test]
    async fn sensors_scenario() {
        let broker = BrokerCore::default();
        let a = broker.on_connect("A").await.unwrap();
        broker.on_connect("P").await.unwrap();

        broker
            .on_subscribe("A", "sensors/+/temp", QoS::AtLeastOnce)
            .await
            .unwrap();

        let n = broker
            .on_publish("P", "sensors/room1/temp", "21.5", QoS::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let delivery = a.try_recv().unwrap();
        assert_eq!(delivery.topic, "sensors/room1/temp");
        assert_eq!(delivery.payload, "21.5");
        assert_eq!(delivery.publisher.as_deref(), Some("P"));
        assert!(a.try_recv().is_none());

        let n = broker
            .on_publish("P", "sensors/room1/humidity", "40", QoS::AtMostOnce)
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(a.try_recv().is_none());

        let err = broker
            .on_publish("P", "sensors/+/temp", "21.5", QoS::AtMostOnce)
            .await
            .unwrap_err();
        assert!(err.is_invalid_topic());
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn idempotent_subscribe() {
        let (broker, recorder) = broker_with_recorder(&Config::default());
        let a = broker.on_connect("a").await.unwrap();

        let first = broker.on_subscribe("a", "t/#", QoS::AtMostOnce).await;
        let second = broker.on_subscribe("a", "t/#", QoS::AtLeastOnce).await;
        assert_eq!(first.unwrap(), SubscribeOutcome::New);
        assert_eq!(second.unwrap(), SubscribeOutcome::Replaced);
        assert_eq!(broker.subscription_count(), 1);

        let n = broker
            .publish(Message::new("t/x", "v").with_qos(QoS::ExactlyOnce))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(a.drain().len(), 1);

        let subscribed = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Subscribed { .. }))
            .count();
        assert_eq!(subscribed, 2);
    }

    #[tokio::test]
    async fn disconnect_removes_subscriptions() {
        let broker = BrokerCore::default();
        broker.on_connect("a").await.unwrap();
        broker.on_connect("b").await.unwrap();
        broker.on_subscribe("a", "t", QoS::AtMostOnce).await.unwrap();
        broker.on_subscribe("b", "t", QoS::AtMostOnce).await.unwrap();
        broker.on_subscribe("b", "+", QoS::AtLeastOnce).await.unwrap();

        assert_eq!(broker.publish(Message::new("t", "1")).await.unwrap(), 3);

        broker.on_disconnect("b").await;
        assert_eq!(broker.subscription_count(), 1);
        assert_eq!(broker.publish(Message::new("t", "2")).await.unwrap(), 1);

        // 重复断开不会出错
        broker.on_disconnect("b").await;
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test]
    async fn takeover_emits_disconnect_before_connect() {
        let (broker, recorder) = broker_with_recorder(&Config::default());
        let old = broker.on_connect("a").await.unwrap();
        broker.on_subscribe("a", "t", QoS::AtMostOnce).await.unwrap();

        let new = broker.on_connect("a").await.unwrap();
        assert_eq!(old.state(), SessionState::Disconnected);
        assert!(new.is_connected());
        assert_eq!(broker.session_count(), 1);
        assert_eq!(broker.subscription_count(), 0);

        let lifecycle = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Connected { .. } | Event::Disconnected { .. }))
            .collect::<Vec<_>>();
        assert_eq!(
            lifecycle,
            vec![connected("a"), disconnected("a"), connected("a")]
        );

        // 旧会话的发送队列已经关闭
        assert_eq!(old.recv().await, None);
    }

    #[tokio::test]
    async fn slow_subscriber_keeps_queue_capacity() {
        let mut cfg = Config::default();
        cfg.session.queue_capacity = 4;
        let (broker, recorder) = broker_with_recorder(&cfg);
        let slow = broker.on_connect("slow").await.unwrap();
        broker
            .on_subscribe("slow", "metrics/#", QoS::AtMostOnce)
            .await
            .unwrap();

        for i in 0..10 {
            broker
                .publish(Message::new("metrics/cpu", i.to_string()))
                .await
                .unwrap();
        }

        assert_eq!(slow.pending(), 4);
        let backpressure = recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Backpressure { client_id, dropped } => Some((client_id, dropped.payload)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(backpressure.len(), 6);
        assert_eq!(backpressure[0].0, "slow");
        assert_eq!(backpressure[0].1, "0");

        // 保留的是最新的 4 条
        let kept = slow
            .drain()
            .into_iter()
            .map(|d| d.payload)
            .collect::<Vec<_>>();
        assert_eq!(kept, vec!["6", "7", "8", "9"]);
    }

    #[tokio::test]
    async fn connection_lost_after_takeover_keeps_new_session() {
        let (broker, recorder) = broker_with_recorder(&Config::default());
        let old = broker.on_connect("a").await.unwrap();
        let new = broker.on_connect("a").await.unwrap();

        broker.on_connection_lost(&old).await;
        assert!(new.is_connected());
        assert_eq!(recorder.events().len(), 3);

        broker.on_connection_lost(&new).await;
        assert_eq!(new.state(), SessionState::Disconnected);
        assert_eq!(recorder.events().last(), Some(&disconnected("a")));
    }

    #[tokio::test]
    async fn subscribe_requires_connected_session() {
        let broker = BrokerCore::default();
        assert!(matches!(
            broker.on_subscribe("ghost", "t", QoS::AtMostOnce).await,
            Err(Error::NotConnected(_))
        ));
        assert!(matches!(
            broker.on_publish("ghost", "t", "x", QoS::AtMostOnce).await,
            Err(Error::NotConnected(_))
        ));
        assert!(matches!(
            broker.on_connect("").await,
            Err(Error::InvalidClientId(_))
        ));
    }

    #[tokio::test]
    async fn invalid_filter_is_rejected_without_events() {
        let (broker, recorder) = broker_with_recorder(&Config::default());
        broker.on_connect("a").await.unwrap();

        let err = broker
            .on_subscribe("a", "a/#/b", QoS::AtMostOnce)
            .await
            .unwrap_err();
        assert!(err.is_invalid_filter());
        assert_eq!(broker.subscription_count(), 0);
        assert_eq!(recorder.events(), vec![connected("a")]);
    }

    #[tokio::test]
    async fn unsubscribe_emits_only_when_removed() {
        let (broker, recorder) = broker_with_recorder(&Config::default());
        broker.on_connect("a").await.unwrap();
        broker.on_subscribe("a", "t", QoS::AtMostOnce).await.unwrap();

        assert!(broker.on_unsubscribe("a", "t").await.unwrap());
        assert!(!broker.on_unsubscribe("a", "t").await.unwrap());

        let unsubscribed = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Unsubscribed { .. }))
            .count();
        assert_eq!(unsubscribed, 1);
    }

    #[tokio::test]
    async fn observer_failure_is_not_fatal() {
        let broker = BrokerCore::default().with_observer(Broken);
        let a = broker.on_connect("a").await.unwrap();
        broker.on_subscribe("a", "t", QoS::AtMostOnce).await.unwrap();
        assert_eq!(broker.publish(Message::new("t", "x")).await.unwrap(), 1);
        assert_eq!(a.pending(), 1);
        assert_eq!(broker.observer_errors(), 3);
    }

    #[tokio::test]
    async fn retained_message_replayed_on_subscribe() {
        let broker = BrokerCore::default();
        broker
            .publish(
                Message::new("status/door", "open")
                    .with_qos(QoS::AtLeastOnce)
                    .with_retain(true),
            )
            .await
            .unwrap();
        assert_eq!(broker.retained_count(), 1);

        let a = broker.on_connect("a").await.unwrap();
        broker
            .on_subscribe("a", "status/+", QoS::AtMostOnce)
            .await
            .unwrap();

        let delivery = a.try_recv().unwrap();
        assert!(delivery.retain);
        assert_eq!(delivery.qos, QoS::AtMostOnce);
        assert_eq!(delivery.payload, "open");

        // 空 payload 清除保留消息
        broker
            .publish(Message::new("status/door", Bytes::new()).with_retain(true))
            .await
            .unwrap();
        assert_eq!(broker.retained_count(), 0);
    }

    #[tokio::test]
    async fn delivery_to_waiting_consumer() {
        let broker = Arc::new(BrokerCore::default());
        let a = broker.on_connect("a").await.unwrap();
        broker.on_subscribe("a", "t", QoS::AtMostOnce).await.unwrap();

        let consumer = tokio::spawn(async move { a.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish(Message::new("t", "hello")).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap();
        assert_eq!(delivery.payload, "hello");
    }

    #[tokio::test]
    async fn independent_instances() {
        let first = BrokerCore::default();
        let second = BrokerCore::default();
        first.on_connect("a").await.unwrap();
        assert_eq!(first.session_count(), 1);
        assert_eq!(second.session_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_disconnects_everyone() {
        let (broker, recorder) = broker_with_recorder(&Config::default());
        let a = broker.on_connect("a").await.unwrap();
        broker.on_connect("b").await.unwrap();

        broker.shutdown().await;
        assert_eq!(broker.session_count(), 0);
        assert_eq!(a.state(), SessionState::Disconnected);
        let events = recorder.events();
        assert_eq!(&events[2..], &[disconnected("a"), disconnected("b")]);
    }

    fn sequence(delivery: &Delivery) -> usize {
        String::from_utf8_lossy(&delivery.payload).parse().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_takeovers_emit_paired_events() {
        let (broker, recorder) = broker_with_recorder(&Config::default());
        let broker = Arc::new(broker);

        let tasks = (0..8)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        broker.on_connect("a").await.unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }

        let events = recorder.events();
        assert_eq!(events.len(), 1 + 79 * 2);
        assert_eq!(events[0], connected("a"));
        for pair in events[1..].chunks(2) {
            assert_eq!(pair, &[disconnected("a"), connected("a")]);
        }
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publish_during_takeover() {
        const MESSAGES: usize = 500;
        const ROUNDS: usize = 100;

        let mut cfg = Config::default();
        cfg.session.queue_capacity = 10_000;
        let broker = Arc::new(BrokerCore::new(&cfg));

        let watcher = broker.on_connect("watcher").await.unwrap();
        broker
            .on_subscribe("watcher", "load/#", QoS::AtMostOnce)
            .await
            .unwrap();

        let publishers = (0..2)
            .map(|p| {
                let broker = broker.clone();
                tokio::spawn(async move {
                    for seq in 0..MESSAGES {
                        broker
                            .publish(Message::new(format!("load/p{}", p), seq.to_string()))
                            .await
                            .unwrap();
                        if seq % 20 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        // 同一个 client_id 反复被接管，每个新会话订阅和上一个会话不同的 topic
        let churn = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let mut closed = Vec::new();
                let mut current: Option<(SessionHandle, String)> = None;
                for round in 0..=ROUNDS {
                    if let Some((handle, filter)) = current.take() {
                        let mut last = None;
                        for delivery in handle.drain() {
                            assert_eq!(delivery.topic, filter);
                            let seq = sequence(&delivery);
                            assert!(last.map_or(true, |l| l < seq));
                            last = Some(seq);
                        }
                        closed.push(handle);
                    }
                    if round == ROUNDS {
                        break;
                    }

                    let filter = format!("load/p{}", round % 2);
                    let handle = broker.on_connect("a").await.unwrap();
                    broker
                        .on_subscribe("a", &filter, QoS::AtMostOnce)
                        .await
                        .unwrap();
                    current = Some((handle, filter));
                    tokio::task::yield_now().await;
                }
                closed
            })
        };

        for publisher in publishers {
            publisher.await.unwrap();
        }
        let sessions = churn.await.unwrap();

        // 被接管的会话队列已经关闭，不会再收到消息
        let (last, replaced) = sessions.split_last().unwrap();
        assert!(last.is_connected());
        for handle in replaced {
            assert!(!handle.is_connected());
            assert_eq!(handle.pending(), 0);
        }

        // 稳定的订阅者按每个发布者的顺序收到全部消息
        let mut received = HashMap::<String, Vec<usize>>::new();
        for delivery in watcher.drain() {
            received
                .entry(delivery.topic.clone())
                .or_default()
                .push(sequence(&delivery));
        }
        let expected = (0..MESSAGES).collect::<Vec<_>>();
        assert_eq!(received.len(), 2);
        for seqs in received.values() {
            assert_eq!(seqs, &expected);
        }
    }
}
