//! Messaging substrate: point-to-point request/response plus topic pub/sub.
//!
//! `LocalCluster` is the in-process implementation used by tests, the DST
//! harness and the demo binary. Brokers join the cluster and get a
//! `LocalMessaging` handle; a broker can be isolated (no traffic in or out)
//! and healed again. Message loss and delay come from `buggify` sites, so
//! they only fire on threads whose `FaultConfig` is enabled.

use super::TransportError;
use crate::buggify::faults::network as net_faults;
use crate::io::simulation::SimulatedRng;
use crate::io::Rng;
use crate::topology::BrokerId;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Handles one inbound request and produces the response bytes.
pub type RequestHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Bytes> + Send + Sync>;

/// Messages broadcast on one topic, in arrival order.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Blocking receive for non-async consumers.
    pub fn blocking_recv(&mut self) -> Option<Bytes> {
        self.rx.blocking_recv()
    }
}

pub trait Messaging: Send + Sync + 'static {
    fn local_broker(&self) -> BrokerId;

    fn send_and_receive(
        &self,
        target: BrokerId,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Bytes, TransportError>>;

    /// Replaces any handler already registered for `subject`.
    fn register_handler(&self, subject: &str, handler: RequestHandler);

    fn unregister_handler(&self, subject: &str);

    /// Fire-and-forget delivery to every broker subscribed to `topic`.
    fn broadcast(&self, topic: &str, payload: Bytes);

    /// One subscription per topic per broker; subscribing again replaces
    /// the previous one.
    fn subscribe(&self, topic: &str) -> Subscription;

    fn unsubscribe(&self, topic: &str);
}

#[derive(Debug, Clone)]
pub struct NetworkFaultConfig {
    pub packet_drop_prob: f64,
    pub response_drop_prob: f64,
    pub delay_prob: f64,
    pub max_delay: Duration,
    pub broadcast_drop_prob: f64,
}

impl Default for NetworkFaultConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl NetworkFaultConfig {
    pub fn none() -> Self {
        NetworkFaultConfig {
            packet_drop_prob: 0.0,
            response_drop_prob: 0.0,
            delay_prob: 0.0,
            max_delay: Duration::ZERO,
            broadcast_drop_prob: 0.0,
        }
    }

    pub fn lossy() -> Self {
        NetworkFaultConfig {
            packet_drop_prob: 0.1,
            response_drop_prob: 0.1,
            delay_prob: 0.2,
            max_delay: Duration::from_millis(20),
            broadcast_drop_prob: 0.1,
        }
    }
}

#[derive(Default)]
struct BrokerSlot {
    handlers: HashMap<String, RequestHandler>,
    subscriptions: HashMap<String, mpsc::UnboundedSender<Bytes>>,
}

struct ClusterInner {
    brokers: HashMap<BrokerId, BrokerSlot>,
    isolated: HashSet<BrokerId>,
}

/// In-process cluster of brokers.
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<Mutex<ClusterInner>>,
    faults: Arc<NetworkFaultConfig>,
    rng: Arc<Mutex<SimulatedRng>>,
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::with_faults(0, NetworkFaultConfig::none())
    }

    pub fn with_faults(seed: u64, faults: NetworkFaultConfig) -> Self {
        LocalCluster {
            inner: Arc::new(Mutex::new(ClusterInner {
                brokers: HashMap::new(),
                isolated: HashSet::new(),
            })),
            faults: Arc::new(faults),
            rng: Arc::new(Mutex::new(SimulatedRng::new(seed))),
        }
    }

    pub fn join(&self, broker: BrokerId) -> LocalMessaging {
        self.inner.lock().brokers.entry(broker).or_default();
        LocalMessaging {
            broker,
            cluster: self.clone(),
        }
    }

    /// Cut `broker` off from every other broker.
    pub fn isolate(&self, broker: BrokerId) {
        self.inner.lock().isolated.insert(broker);
    }

    pub fn heal(&self, broker: BrokerId) {
        self.inner.lock().isolated.remove(&broker);
    }

    /// Live subscriptions on `topic` across all brokers.
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .brokers
            .values()
            .filter(|slot| slot.subscriptions.contains_key(topic))
            .count()
    }

    fn connected(inner: &ClusterInner, from: BrokerId, to: BrokerId) -> bool {
        from == to || !(inner.isolated.contains(&from) || inner.isolated.contains(&to))
    }

    fn fault(&self, fault_id: &str, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        crate::buggify!(&mut *self.rng.lock(), fault_id, probability)
    }

    fn delay(&self) -> Option<Duration> {
        if !self.fault(net_faults::DELAY, self.faults.delay_prob) {
            return None;
        }
        let max = self.faults.max_delay.as_micros() as u64;
        Some(Duration::from_micros(self.rng.lock().gen_range(0, max.saturating_add(1))))
    }

    fn route(&self, from: BrokerId, to: BrokerId, subject: &str) -> Result<RequestHandler, TransportError> {
        let inner = self.inner.lock();
        if !Self::connected(&inner, from, to) {
            return Err(TransportError::Unreachable(to));
        }
        let slot = inner
            .brokers
            .get(&to)
            .ok_or(TransportError::Unreachable(to))?;
        slot.handlers
            .get(subject)
            .cloned()
            .ok_or_else(|| TransportError::NoHandler {
                broker: to,
                subject: subject.to_string(),
            })
    }

    async fn request(
        self,
        from: BrokerId,
        to: BrokerId,
        subject: String,
        payload: Bytes,
    ) -> Result<Bytes, TransportError> {
        let handler = self.route(from, to, &subject)?;
        if self.fault(net_faults::PACKET_DROP, self.faults.packet_drop_prob) {
            debug!("dropping request {} from {} to {}", subject, from, to);
            return futures::future::pending().await;
        }
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        let response = (*handler)(payload).await;
        let reachable = Self::connected(&self.inner.lock(), from, to);
        if !reachable || self.fault(net_faults::RESPONSE_DROP, self.faults.response_drop_prob) {
            debug!("dropping response {} from {} to {}", subject, to, from);
            return futures::future::pending().await;
        }
        Ok(response)
    }
}

/// One broker's view of a `LocalCluster`.
#[derive(Clone)]
pub struct LocalMessaging {
    broker: BrokerId,
    cluster: LocalCluster,
}

impl LocalMessaging {
    pub fn cluster(&self) -> &LocalCluster {
        &self.cluster
    }
}

impl Messaging for LocalMessaging {
    fn local_broker(&self) -> BrokerId {
        self.broker
    }

    fn send_and_receive(
        &self,
        target: BrokerId,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Bytes, TransportError>> {
        let request = self
            .cluster
            .clone()
            .request(self.broker, target, subject.to_string(), payload);
        async move {
            match tokio::time::timeout(timeout, request).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(target)),
            }
        }
        .boxed()
    }

    fn register_handler(&self, subject: &str, handler: RequestHandler) {
        let mut inner = self.cluster.inner.lock();
        inner
            .brokers
            .entry(self.broker)
            .or_default()
            .handlers
            .insert(subject.to_string(), handler);
    }

    fn unregister_handler(&self, subject: &str) {
        if let Some(slot) = self.cluster.inner.lock().brokers.get_mut(&self.broker) {
            slot.handlers.remove(subject);
        }
    }

    fn broadcast(&self, topic: &str, payload: Bytes) {
        let targets: Vec<(BrokerId, mpsc::UnboundedSender<Bytes>)> = {
            let inner = self.cluster.inner.lock();
            inner
                .brokers
                .iter()
                .filter(|(id, _)| LocalCluster::connected(&inner, self.broker, **id))
                .filter_map(|(id, slot)| slot.subscriptions.get(topic).map(|tx| (*id, tx.clone())))
                .collect()
        };
        for (broker, tx) in targets {
            if self
                .cluster
                .fault(net_faults::BROADCAST_DROP, self.cluster.faults.broadcast_drop_prob)
            {
                debug!("dropping broadcast on {} to broker {}", topic, broker);
                continue;
            }
            let _ = tx.send(payload.clone());
        }
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.cluster
            .inner
            .lock()
            .brokers
            .entry(self.broker)
            .or_default()
            .subscriptions
            .insert(topic.to_string(), tx);
        Subscription {
            topic: topic.to_string(),
            rx,
        }
    }

    fn unsubscribe(&self, topic: &str) {
        if let Some(slot) = self.cluster.inner.lock().brokers.get_mut(&self.broker) {
            slot.subscriptions.remove(topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> RequestHandler {
        Arc::new(|payload: Bytes| async move { payload }.boxed())
    }

    #[tokio::test]
    async fn test_request_response() {
        let cluster = LocalCluster::new();
        let a = cluster.join(1);
        let b = cluster.join(2);
        b.register_handler("echo", echo());

        let response = a
            .send_and_receive(2, "echo", Bytes::from_static(b"ping"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&response[..], b"ping");

        let err = a
            .send_and_receive(2, "missing", Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoHandler { broker: 2, .. }));

        b.unregister_handler("echo");
        assert!(a
            .send_and_receive(2, "echo", Bytes::new(), Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_isolation_and_heal() {
        let cluster = LocalCluster::new();
        let a = cluster.join(1);
        let b = cluster.join(2);
        b.register_handler("echo", echo());
        let mut sub = b.subscribe("topic");

        cluster.isolate(2);
        let err = a
            .send_and_receive(2, "echo", Bytes::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Unreachable(2));
        a.broadcast("topic", Bytes::from_static(b"lost"));

        cluster.heal(2);
        a.broadcast("topic", Bytes::from_static(b"seen"));
        assert_eq!(&sub.recv().await.unwrap()[..], b"seen");
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let cluster = LocalCluster::new();
        let a = cluster.join(1);
        let b = cluster.join(2);
        b.register_handler(
            "slow",
            Arc::new(|payload: Bytes| {
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    payload
                }
                .boxed()
            }),
        );
        let err = a
            .send_and_receive(2, "slow", Bytes::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout(2));
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_and_unsubscribe_closes() {
        let cluster = LocalCluster::new();
        let a = cluster.join(1);
        let b = cluster.join(2);
        let c = cluster.join(3);
        let mut sub_b = b.subscribe("t");
        let mut sub_c = c.subscribe("t");
        assert_eq!(cluster.subscription_count("t"), 2);

        a.broadcast("t", Bytes::from_static(b"x"));
        assert_eq!(&sub_b.recv().await.unwrap()[..], b"x");
        assert_eq!(&sub_c.recv().await.unwrap()[..], b"x");

        c.unsubscribe("t");
        assert_eq!(cluster.subscription_count("t"), 1);
        assert_eq!(sub_c.recv().await, None);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces() {
        let cluster = LocalCluster::new();
        let a = cluster.join(1);
        let mut first = a.subscribe("t");
        let mut second = a.subscribe("t");
        assert_eq!(cluster.subscription_count("t"), 1);
        assert_eq!(first.recv().await, None);
        a.broadcast("t", Bytes::from_static(b"y"));
        assert_eq!(&second.recv().await.unwrap()[..], b"y");
    }
}
