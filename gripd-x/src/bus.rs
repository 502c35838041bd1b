//! In-process message bus.
//!
//! Components talk over named endpoints with three socket pairings:
//!
//! - **Push/Pull** — single-consumer fair queue. Senders wait when the
//!   endpoint's high-water mark is reached; a message accepted into the
//!   queue is never dropped.
//! - **Pub/Sub** — lossy fanout. Subscribers filter on a byte prefix of the
//!   first frame (by convention the instance id plus a space). Slow
//!   subscribers lose the oldest messages.
//! - **Router/Dealer** — each dealer registers an identity; messages it
//!   sends arrive at the router with that identity attached, and the router
//!   directs replies by identity.
//!
//! Endpoints are created on first use, so connect-before-bind works in
//! either order. Ordering is preserved per sender/receiver pair. Dropping a
//! socket releases its queues immediately (linger zero).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Default per-endpoint high-water mark.
pub const DEFAULT_HWM: usize = 1000;

/// High-water mark for the stats publish endpoint.
pub const STATS_HWM: usize = 200_000;

/// A multipart message.
pub type Message = Vec<Bytes>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("endpoint closed")]
    Closed,

    #[error("endpoint at high-water mark")]
    Full,

    #[error("endpoint '{0}' already bound")]
    AlreadyBound(String),

    #[error("no route to identity")]
    NoRoute,
}

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Default)]
struct PipeEndpoint {
    tx: Option<mpsc::Sender<Message>>,
    rx: Option<mpsc::Receiver<Message>>,
    bound: bool,
}

struct TopicEndpoint {
    tx: broadcast::Sender<Message>,
}

#[derive(Default)]
struct RoutedEndpoint {
    // dealer -> router
    inbound_tx: Option<mpsc::Sender<(Bytes, Message)>>,
    inbound_rx: Option<mpsc::Receiver<(Bytes, Message)>>,
    bound: bool,
    // router -> dealer, by identity
    peers: HashMap<Bytes, mpsc::Sender<Message>>,
}

#[derive(Default)]
struct BusInner {
    pipes: HashMap<String, PipeEndpoint>,
    topics: HashMap<String, TopicEndpoint>,
    routed: HashMap<String, RoutedEndpoint>,
}

/// Process-wide endpoint registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<Mutex<BusInner>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the pull side of a push/pull endpoint.
    pub fn bind_pull(&self, name: &str, hwm: usize) -> Result<PullSocket> {
        let mut inner = self.inner.lock().unwrap();
        let ep = inner.pipes.entry(name.to_string()).or_default();
        if ep.bound {
            return Err(BusError::AlreadyBound(name.to_string()));
        }
        if ep.tx.is_none() {
            let (tx, rx) = mpsc::channel(hwm);
            ep.tx = Some(tx);
            ep.rx = Some(rx);
        }
        ep.bound = true;
        let rx = ep.rx.take().ok_or(BusError::Closed)?;
        Ok(PullSocket { rx })
    }

    /// Connect the push side of a push/pull endpoint.
    pub fn connect_push(&self, name: &str) -> PushSocket {
        let mut inner = self.inner.lock().unwrap();
        let ep = inner.pipes.entry(name.to_string()).or_default();
        if ep.tx.is_none() {
            let (tx, rx) = mpsc::channel(DEFAULT_HWM);
            ep.tx = Some(tx);
            ep.rx = Some(rx);
        }
        PushSocket {
            tx: ep.tx.clone().expect("sender present"),
        }
    }

    /// Bind the publishing side of a pub/sub endpoint.
    pub fn bind_pub(&self, name: &str, hwm: usize) -> PubSocket {
        let mut inner = self.inner.lock().unwrap();
        let ep = inner
            .topics
            .entry(name.to_string())
            .or_insert_with(|| TopicEndpoint {
                tx: broadcast::channel(hwm).0,
            });
        PubSocket { tx: ep.tx.clone() }
    }

    /// Subscribe to a pub/sub endpoint, filtering on a first-frame prefix.
    pub fn connect_sub(&self, name: &str, prefix: impl Into<Bytes>) -> SubSocket {
        let mut inner = self.inner.lock().unwrap();
        let ep = inner
            .topics
            .entry(name.to_string())
            .or_insert_with(|| TopicEndpoint {
                tx: broadcast::channel(DEFAULT_HWM).0,
            });
        SubSocket {
            rx: ep.tx.subscribe(),
            prefix: prefix.into(),
        }
    }

    /// Bind the router side of a router/dealer endpoint.
    pub fn bind_router(&self, name: &str, hwm: usize) -> Result<RouterSocket> {
        let mut inner = self.inner.lock().unwrap();
        let ep = inner.routed.entry(name.to_string()).or_default();
        if ep.bound {
            return Err(BusError::AlreadyBound(name.to_string()));
        }
        if ep.inbound_tx.is_none() {
            let (tx, rx) = mpsc::channel(hwm);
            ep.inbound_tx = Some(tx);
            ep.inbound_rx = Some(rx);
        }
        ep.bound = true;
        let rx = ep.inbound_rx.take().ok_or(BusError::Closed)?;
        Ok(RouterSocket {
            bus: self.clone(),
            name: name.to_string(),
            rx,
        })
    }

    /// Connect a dealer with the given identity to a router endpoint.
    pub fn connect_dealer(&self, name: &str, identity: impl Into<Bytes>, hwm: usize) -> DealerSocket {
        let identity = identity.into();
        let mut inner = self.inner.lock().unwrap();
        let ep = inner.routed.entry(name.to_string()).or_default();
        if ep.inbound_tx.is_none() {
            let (tx, rx) = mpsc::channel(hwm);
            ep.inbound_tx = Some(tx);
            ep.inbound_rx = Some(rx);
        }
        let (tx, rx) = mpsc::channel(hwm);
        ep.peers.insert(identity.clone(), tx);
        DealerSocket {
            identity,
            tx: ep.inbound_tx.clone().expect("sender present"),
            rx,
        }
    }

    fn route_to_peer(&self, name: &str, identity: &Bytes) -> Option<mpsc::Sender<Message>> {
        let inner = self.inner.lock().unwrap();
        inner.routed.get(name)?.peers.get(identity).cloned()
    }
}

/// Receiving end of a push/pull endpoint.
pub struct PullSocket {
    rx: mpsc::Receiver<Message>,
}

impl PullSocket {
    /// Receive the next message. `None` when every sender is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Sending end of a push/pull endpoint.
#[derive(Clone)]
pub struct PushSocket {
    tx: mpsc::Sender<Message>,
}

impl PushSocket {
    /// Send, waiting if the endpoint is at its high-water mark.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| BusError::Closed)
    }

    /// Send without waiting; at the high-water mark the message is refused.
    pub fn try_send(&self, msg: Message) -> Result<()> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => BusError::Closed,
            mpsc::error::TrySendError::Full(_) => BusError::Full,
        })
    }
}

/// Publishing end of a pub/sub endpoint.
#[derive(Clone)]
pub struct PubSocket {
    tx: broadcast::Sender<Message>,
}

impl PubSocket {
    /// Publish to all current subscribers. No subscribers is not an error.
    pub fn send(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }
}

/// Subscribing end of a pub/sub endpoint.
pub struct SubSocket {
    rx: broadcast::Receiver<Message>,
    prefix: Bytes,
}

impl SubSocket {
    /// Receive the next message whose first frame starts with our prefix.
    ///
    /// Lagged messages are dropped with a warning, matching the lossy
    /// contract of the pairing.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    let matches = msg
                        .first()
                        .map(|f| f.starts_with(&self.prefix))
                        .unwrap_or(false);
                    if matches {
                        return Ok(msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }
}

/// Router side of a router/dealer endpoint.
pub struct RouterSocket {
    bus: Bus,
    name: String,
    rx: mpsc::Receiver<(Bytes, Message)>,
}

impl RouterSocket {
    /// Receive the next message along with the sending dealer's identity.
    pub async fn recv(&mut self) -> Option<(Bytes, Message)> {
        self.rx.recv().await
    }

    /// Send a message to the dealer with the given identity.
    pub async fn send_to(&self, identity: &Bytes, msg: Message) -> Result<()> {
        let tx = self
            .bus
            .route_to_peer(&self.name, identity)
            .ok_or(BusError::NoRoute)?;
        tx.send(msg).await.map_err(|_| BusError::Closed)
    }
}

/// Dealer side of a router/dealer endpoint.
pub struct DealerSocket {
    identity: Bytes,
    tx: mpsc::Sender<(Bytes, Message)>,
    rx: mpsc::Receiver<Message>,
}

impl DealerSocket {
    pub fn identity(&self) -> &Bytes {
        &self.identity
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send((self.identity.clone(), msg))
            .await
            .map_err(|_| BusError::Closed)
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// A cloneable handle for the sending half, usable while another task
    /// owns the socket for receiving.
    pub fn sender(&self) -> DealerSender {
        DealerSender {
            identity: self.identity.clone(),
            tx: self.tx.clone(),
        }
    }
}

/// Sending half of a dealer socket.
#[derive(Clone)]
pub struct DealerSender {
    identity: Bytes,
    tx: mpsc::Sender<(Bytes, Message)>,
}

impl DealerSender {
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send((self.identity.clone(), msg))
            .await
            .map_err(|_| BusError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(s: &str) -> Message {
        vec![Bytes::copy_from_slice(s.as_bytes())]
    }

    #[tokio::test]
    async fn push_pull_delivers_in_order() {
        let bus = Bus::new();
        let mut pull = bus.bind_pull("work", 10).unwrap();
        let push = bus.connect_push("work");

        push.send(msg("a")).await.unwrap();
        push.send(msg("b")).await.unwrap();

        assert_eq!(pull.recv().await.unwrap(), msg("a"));
        assert_eq!(pull.recv().await.unwrap(), msg("b"));
    }

    #[tokio::test]
    async fn connect_before_bind_works() {
        let bus = Bus::new();
        let push = bus.connect_push("late");
        push.send(msg("early")).await.unwrap();

        let mut pull = bus.bind_pull("late", 10).unwrap();
        assert_eq!(pull.recv().await.unwrap(), msg("early"));
    }

    #[tokio::test]
    async fn double_bind_is_an_error() {
        let bus = Bus::new();
        let _pull = bus.bind_pull("solo", 10).unwrap();
        assert!(matches!(
            bus.bind_pull("solo", 10),
            Err(BusError::AlreadyBound(_))
        ));
    }

    #[tokio::test]
    async fn push_waits_at_hwm() {
        let bus = Bus::new();
        let mut pull = bus.bind_pull("tight", 1).unwrap();
        let push = bus.connect_push("tight");

        push.send(msg("1")).await.unwrap();
        // queue full: the next send must park until the consumer drains
        let pending = tokio::spawn({
            let push = push.clone();
            async move { push.send(msg("2")).await }
        });

        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(pull.recv().await.unwrap(), msg("1"));
        pending.await.unwrap().unwrap();
        assert_eq!(pull.recv().await.unwrap(), msg("2"));
    }

    #[tokio::test]
    async fn sub_filters_by_prefix() {
        let bus = Bus::new();
        let mut sub = bus.connect_sub("events", "inst-a ");
        let publisher = bus.bind_pub("events", 16);

        publisher.send(msg("inst-b hello"));
        publisher.send(msg("inst-a world"));

        assert_eq!(sub.recv().await.unwrap(), msg("inst-a world"));
    }

    #[tokio::test]
    async fn router_dealer_directs_replies() {
        let bus = Bus::new();
        let mut router = bus.bind_router("rpc", 10).unwrap();
        let mut d1 = bus.connect_dealer("rpc", "one", 10);
        let mut d2 = bus.connect_dealer("rpc", "two", 10);

        d1.send(msg("from-one")).await.unwrap();
        d2.send(msg("from-two")).await.unwrap();

        let (id_a, m_a) = router.recv().await.unwrap();
        let (id_b, m_b) = router.recv().await.unwrap();
        assert_eq!(m_a, msg("from-one"));
        assert_eq!(m_b, msg("from-two"));

        router.send_to(&id_b, msg("reply-two")).await.unwrap();
        router.send_to(&id_a, msg("reply-one")).await.unwrap();

        assert_eq!(d1.recv().await.unwrap(), msg("reply-one"));
        assert_eq!(d2.recv().await.unwrap(), msg("reply-two"));
    }

    #[tokio::test]
    async fn router_send_to_unknown_identity_fails() {
        let bus = Bus::new();
        let router = bus.bind_router("rpc2", 10).unwrap();
        let err = router
            .send_to(&Bytes::from_static(b"ghost"), msg("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoRoute));
    }
}
