use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::error::ConnectError;
use super::message::InboundMessage;
use super::registry::{Handler, SubscriptionRegistry};
use super::state::{ConnectionState, ReconnectPolicy};
use super::transport::{Connector, WsConnector};

type PendingConnect = Shared<BoxFuture<'static, Result<(), ConnectError>>>;

#[derive(Default)]
struct Link {
    state: ConnectionState,
    attempts: u32,
    /// Bumped on every open and every explicit disconnect. Tasks carry the
    /// epoch they were started in and stand down once it moves on.
    epoch: u64,
    pending: Option<PendingConnect>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct Inner<C> {
    url: String,
    connector: C,
    policy: ReconnectPolicy,
    link: StdMutex<Link>,
    registry: StdMutex<SubscriptionRegistry>,
    state_tx: watch::Sender<ConnectionState>,
}

/// One persistent channel to one endpoint, with reconnect and dispatch by
/// message type. Independent managers share nothing.
pub struct ConnectionManager<C: Connector = WsConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(url: impl Into<String>, connector: C, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                connector,
                policy,
                link: StdMutex::new(Link::default()),
                registry: StdMutex::new(SubscriptionRegistry::default()),
                state_tx,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_link().state
    }

    /// Follows state changes; `Failed` is the fatal condition for this
    /// channel.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Reconnect attempts made since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.inner.lock_link().attempts
    }

    /// Opens the channel. While an attempt is in flight every caller awaits
    /// that same attempt and gets its outcome.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let pending = {
            let mut link = self.inner.lock_link();
            match link.state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Failed => {
                    return Err(ConnectError::Exhausted(self.inner.policy.max_attempts))
                }
                _ => {}
            }
            if let Some(retry) = link.retry.take() {
                retry.abort();
            }
            Inner::begin_attempt(&self.inner, &mut link)
        };
        pending.await
    }

    /// Closes the channel and cancels any scheduled reconnect. Resets the
    /// attempt counter, including out of `Failed`.
    pub fn disconnect(&self) {
        let mut link = self.inner.lock_link();
        link.epoch += 1;
        link.attempts = 0;
        link.pending = None;
        if let Some(retry) = link.retry.take() {
            retry.abort();
        }
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        if link.outbound.take().is_some() {
            log::info!("disconnected from {}", self.inner.url);
        }
        self.inner.set_state(&mut link, ConnectionState::Disconnected);
    }

    /// Serialises `message` as JSON and queues it. Fails when the channel is
    /// not open.
    pub fn send<M: Serialize>(&self, message: &M) -> Result<(), ConnectError> {
        let text =
            serde_json::to_string(message).map_err(|e| ConnectError::Encode(e.to_string()))?;
        let link = self.inner.lock_link();
        match (&link.outbound, link.state) {
            (Some(tx), ConnectionState::Open) => tx.send(text).map_err(|_| ConnectError::NotOpen),
            _ => {
                log::error!("cannot send to {}: socket is not open", self.inner.url);
                Err(ConnectError::NotOpen)
            }
        }
    }

    pub fn subscribe(&self, kind: &str, handler: Handler) {
        self.inner.lock_registry().subscribe(kind, handler);
    }

    pub fn unsubscribe(&self, kind: &str, handler: &Handler) {
        self.inner.lock_registry().unsubscribe(kind, handler);
    }
}

impl<C: Connector> Inner<C> {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, link: &mut Link, state: ConnectionState) {
        link.state = state;
        self.state_tx.send_replace(state);
    }

    fn begin_attempt(inner: &Arc<Self>, link: &mut Link) -> PendingConnect {
        if let Some(pending) = &link.pending {
            return pending.clone();
        }

        inner.set_state(link, ConnectionState::Connecting);
        let task = tokio::spawn(Self::run_attempt(inner.clone(), link.epoch));
        let pending = async move { task.await.unwrap_or(Err(ConnectError::Cancelled)) }
            .boxed()
            .shared();
        link.pending = Some(pending.clone());
        pending
    }

    fn run_attempt(inner: Arc<Self>, epoch: u64) -> BoxFuture<'static, Result<(), ConnectError>> {
        async move {
            log::debug!("connecting to {}", inner.url);
            let result = inner.connector.connect(&inner.url).await;

            let mut link = inner.lock_link();
            if link.epoch != epoch {
                // disconnected while the handshake was in flight
                return Err(ConnectError::Cancelled);
            }
            link.pending = None;

            match result {
                Ok(channel) => {
                    link.attempts = 0;
                    link.epoch += 1;
                    link.outbound = Some(channel.outbound);
                    link.reader = Some(tokio::spawn(Self::read_loop(
                        inner.clone(),
                        channel.inbound,
                        link.epoch,
                    )));
                    inner.set_state(&mut link, ConnectionState::Open);
                    log::info!("connected to {}", inner.url);
                    Ok(())
                }
                Err(e) => {
                    log::error!("connection to {} failed: {}", inner.url, e);
                    inner.set_state(&mut link, ConnectionState::Disconnected);
                    Self::schedule_reconnect(&inner, &mut link);
                    Err(e)
                }
            }
        }
        .boxed()
    }

    fn read_loop(
        inner: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<String>,
        epoch: u64,
    ) -> BoxFuture<'static, ()> {
        async move {
            while let Some(frame) = inbound.recv().await {
                inner.dispatch(&frame);
            }

            let mut link = inner.lock_link();
            if link.epoch != epoch {
                return;
            }
            link.outbound = None;
            link.reader = None;
            log::info!("connection to {} closed", inner.url);
            inner.set_state(&mut link, ConnectionState::Disconnected);
            Self::schedule_reconnect(&inner, &mut link);
        }
        .boxed()
    }

    fn schedule_reconnect(inner: &Arc<Self>, link: &mut Link) {
        let attempt = link.attempts + 1;
        let delay = match inner.policy.delay_for(attempt) {
            Some(delay) => delay,
            None => {
                log::error!(
                    "giving up on {} after {} reconnect attempts",
                    inner.url,
                    inner.policy.max_attempts
                );
                inner.set_state(link, ConnectionState::Failed);
                return;
            }
        };

        log::info!(
            "reconnecting to {} in {:?} (attempt {})",
            inner.url,
            delay,
            attempt
        );
        link.attempts = attempt;
        inner.set_state(link, ConnectionState::Reconnecting);
        link.retry = Some(tokio::spawn(Self::retry_after(
            inner.clone(),
            delay,
            link.epoch,
        )));
    }

    fn retry_after(inner: Arc<Self>, delay: Duration, epoch: u64) -> BoxFuture<'static, ()> {
        async move {
            tokio::time::sleep(delay).await;
            let mut link = inner.lock_link();
            if link.epoch != epoch || link.state != ConnectionState::Reconnecting {
                return;
            }
            link.retry = None;
            // run_attempt logs the outcome
            let _ = Self::begin_attempt(&inner, &mut link);
        }
        .boxed()
    }

    fn dispatch(&self, frame: &str) {
        let message = match InboundMessage::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("dropping malformed frame from {}: {}", self.url, e);
                return;
            }
        };

        let handlers = self.lock_registry().handlers_for(message.kind());
        for handler in handlers {
            handler(&message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Channel, OutboundMessage};
    use std::collections::VecDeque;
    use std::future::Future;
    use tokio::time::Instant;

    struct Peer {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    fn channel_pair() -> (Channel, Peer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Channel {
                outbound: out_tx,
                inbound: in_rx,
            },
            Peer {
                to_client: in_tx,
                from_client: out_rx,
            },
        )
    }

    #[derive(Default)]
    struct Script {
        ready: StdMutex<VecDeque<Channel>>,
        calls: StdMutex<Vec<Instant>>,
        handshake: Duration,
    }

    /// Hands out queued channels in order, refuses once the queue is empty.
    #[derive(Clone, Default)]
    struct FakeConnector {
        script: Arc<Script>,
    }

    impl FakeConnector {
        fn with_handshake(handshake: Duration) -> Self {
            Self {
                script: Arc::new(Script {
                    handshake,
                    ..Script::default()
                }),
            }
        }

        fn push(&self) -> Peer {
            let (channel, peer) = channel_pair();
            self.script.ready.lock().unwrap().push_back(channel);
            peer
        }

        fn calls(&self) -> Vec<Instant> {
            self.script.calls.lock().unwrap().clone()
        }
    }

    impl Connector for FakeConnector {
        fn connect(&self, _url: &str) -> impl Future<Output = Result<Channel, ConnectError>> + Send {
            let script = self.script.clone();
            async move {
                script.calls.lock().unwrap().push(Instant::now());
                if !script.handshake.is_zero() {
                    tokio::time::sleep(script.handshake).await;
                }
                let next = script.ready.lock().unwrap().pop_front();
                next.ok_or_else(|| ConnectError::Handshake("connection refused".to_string()))
            }
        }
    }

    fn manager(connector: &FakeConnector) -> ConnectionManager<FakeConnector> {
        ConnectionManager::new(
            "ws://test/api/ws/objects/c1",
            connector.clone(),
            ReconnectPolicy::default(),
        )
    }

    fn recorder(tx: mpsc::UnboundedSender<InboundMessage>) -> Handler {
        Arc::new(move |msg: &InboundMessage| {
            let _ = tx.send(msg.clone());
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_drops_malformed_and_unhandled() {
        let connector = FakeConnector::default();
        let peer = connector.push();
        let conn = manager(&connector);

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe("object_update", recorder(tx.clone()));
        conn.subscribe("weather", recorder(tx));

        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);

        peer.to_client.send("{not json".to_string()).unwrap();
        peer.to_client
            .send(r#"{"type":"subscribe_ack","message":"ok"}"#.to_string())
            .unwrap();
        peer.to_client.send(r#"{"type":"weather","wind":3}"#.to_string()).unwrap();
        peer.to_client
            .send(r#"{"type":"object_update","object_id":"b","data":{}}"#.to_string())
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "weather");
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, InboundMessage::ObjectUpdate { ref object_id, .. } if object_id == "b"));
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connect_shares_one_attempt() {
        let connector = FakeConnector::with_handshake(Duration::from_millis(200));
        let _peer = connector.push();
        let conn = manager(&connector);

        let (a, b) = tokio::join!(conn.connect(), conn.connect());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(connector.calls().len(), 1);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connect_shares_failure() {
        let connector = FakeConnector::with_handshake(Duration::from_millis(200));
        let conn = manager(&connector);

        let (a, b) = tokio::join!(conn.connect(), conn.connect());
        assert_eq!(a, b);
        assert!(matches!(a, Err(ConnectError::Handshake(_))));
        assert_eq!(connector.calls().len(), 1);
        // the failed handshake feeds the reconnect schedule
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        assert_eq!(conn.attempts(), 1);
        conn.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_bounded() {
        let connector = FakeConnector::default();
        let peer = connector.push();
        let conn = manager(&connector);
        let mut states = conn.watch_state();

        conn.connect().await.unwrap();
        drop(peer);

        states
            .wait_for(|s| *s == ConnectionState::Failed)
            .await
            .unwrap();

        let calls = connector.calls();
        assert_eq!(calls.len(), 6);
        let gaps: Vec<u128> = calls.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps, vec![1000, 2000, 3000, 4000, 5000]);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.calls().len(), 6);
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert_eq!(conn.attempts(), 5);
        assert_eq!(conn.connect().await, Err(ConnectError::Exhausted(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_counter_on_success() {
        let connector = FakeConnector::default();
        let first = connector.push();
        let conn = manager(&connector);
        let mut states = conn.watch_state();

        conn.connect().await.unwrap();
        let _second = connector.push();
        drop(first);

        states
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        states
            .wait_for(|s| *s == ConnectionState::Open)
            .await
            .unwrap();
        assert_eq!(conn.attempts(), 0);
        assert_eq!(connector.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_reconnecting() {
        let connector = FakeConnector::default();
        let peer = connector.push();
        let conn = manager(&connector);

        conn.connect().await.unwrap();
        conn.disconnect();
        drop(peer);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.calls().len(), 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let _again = connector.push();
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_channel_revives_after_disconnect() {
        let connector = FakeConnector::default();
        let conn = manager(&connector);
        let mut states = conn.watch_state();

        assert!(conn.connect().await.is_err());
        states
            .wait_for(|s| *s == ConnectionState::Failed)
            .await
            .unwrap();

        conn.disconnect();
        let _peer = connector.push();
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_open_channel() {
        let connector = FakeConnector::default();
        let mut peer = connector.push();
        let conn = manager(&connector);

        let msg = OutboundMessage::Subscribe {
            object_types: vec![],
        };
        assert_eq!(conn.send(&msg), Err(ConnectError::NotOpen));

        conn.connect().await.unwrap();
        conn.send(&msg).unwrap();
        let sent = peer.from_client.recv().await.unwrap();
        assert_eq!(sent, r#"{"type":"subscribe","object_types":[]}"#);
    }
}
