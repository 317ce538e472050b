//! Connection manager: owns the single peer link, runs its receive loop, and
//! fans decoded messages out to subscribers.
//!
//! Lifecycle: `Idle -> Listening | Connecting -> Connected -> Closed`. Every
//! start first tears down whatever the previous attempt left behind and gets
//! a fresh cancellation token, writer slot and receive task.
//!
//! Delivery: each [`Subscription`] has its own bounded buffer. The receive
//! loop never waits on a slow subscriber; when a buffer is full the incoming
//! message is dropped for that subscriber and counted in
//! [`Subscription::dropped`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use marmot_core::wire::DEFAULT_MAX_LINE_BYTES;
use marmot_core::{CodecError, MarmotCodec, Message};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, TransportError};
use crate::transport;

/// Default TCP port for the link.
pub const DEFAULT_PORT: u16 = 9898;

/// Default per-subscriber buffer, in messages.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

const EVENT_CAPACITY: usize = 64;

type LineReader = FramedRead<OwnedReadHalf, MarmotCodec>;
type LineWriter = FramedWrite<OwnedWriteHalf, MarmotCodec>;

/// Which side initiated the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    None,
    /// Listens and accepts one peer.
    Host,
    /// Dials a known host.
    Join,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Listening,
    Connecting,
    Connected,
    Closed,
}

impl ConnectionState {
    /// An attempt is pending or a stream is attached.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Listening | ConnectionState::Connecting | ConnectionState::Connected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub role: Role,
    pub state: ConnectionState,
}

/// Why a link or attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `stop()` was called.
    Stopped,
    /// A new start tore the previous link down.
    Replaced,
    /// The start attempt never produced a stream.
    Failed(String),
    /// Clean end-of-stream from the peer.
    PeerDisconnected,
    /// The peer sent a line that does not decode; the link fails closed.
    Protocol(String),
    Io(String),
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Host bound its listener; the actual port is in `addr`.
    Listening { addr: SocketAddr },
    Connected { role: Role, peer: SocketAddr },
    /// The peer handed the artifact over.
    HandOffReceived { edge: String, at_ms: i64 },
    Closed { reason: CloseReason },
}

/// Tunables for one manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Local address the host binds to.
    pub bind_ip: IpAddr,
    /// `None` waits for a peer indefinitely.
    pub accept_timeout: Option<Duration>,
    /// `None` lets the OS decide when a dial gives up.
    pub connect_timeout: Option<Duration>,
    pub subscriber_capacity: usize,
    pub max_line_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            accept_timeout: None,
            connect_timeout: None,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// Handle to the single peer link. Cheap to clone; all clones drive the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    status: watch::Sender<Status>,
    events: broadcast::Sender<ConnectionEvent>,
    subscribers: Subscribers,
    /// Serializes start/attach/teardown.
    session: Mutex<Session>,
    /// Serializes writers so lines never interleave.
    writer: Mutex<Option<Outbound>>,
}

#[derive(Default)]
struct Session {
    cancel: CancellationToken,
    receiver: Option<JoinHandle<()>>,
}

struct Outbound {
    framed: LineWriter,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let capacity = config.subscriber_capacity.max(1);
        let (status, _) = watch::channel(Status {
            role: Role::None,
            state: ConnectionState::Idle,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                status,
                events,
                subscribers: Subscribers::new(capacity),
                session: Mutex::new(Session::default()),
                writer: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.inner.status.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status().state == ConnectionState::Connected
    }

    /// Messages received from now on, in wire order. Ends when the link closes
    /// and yields nothing more once `stop()` has returned.
    ///
    /// Taken while no link is up, the subscription waits for the next one:
    /// the manager can be restarted, so it stays open until that link closes
    /// or `stop()` is called.
    pub fn subscribe(&self) -> Subscription {
        self.inner.subscribers.subscribe()
    }

    /// Listen on `port` and wait for one peer. Returns false if binding,
    /// accepting, or the wait itself fails or is cancelled. Dropping the
    /// future abandons the attempt like a failure.
    pub async fn start_as_host(&self, port: u16) -> bool {
        let cancel = self.begin(Role::Host, ConnectionState::Listening).await;
        let mut guard = StartGuard::new(&self.inner, Role::Host, &cancel);
        let addr = SocketAddr::new(self.inner.config.bind_ip, port);
        let accepted = async {
            let listener = transport::listen(addr).await?;
            self.inner.emit(ConnectionEvent::Listening {
                addr: listener.local_addr(),
            });
            listener
                .accept_one(self.inner.config.accept_timeout, &cancel)
                .await
        }
        .await;
        let started = match accepted {
            Ok((stream, peer)) => self.attach(stream, peer, Role::Host, cancel).await,
            Err(e) => {
                self.abandon(Role::Host, &cancel, e).await;
                false
            }
        };
        guard.disarm();
        started
    }

    /// Dial `host:port`. Returns false if resolution or connection fails or
    /// is cancelled. Dropping the future abandons the attempt like a failure.
    pub async fn start_as_join(&self, host: &str, port: u16) -> bool {
        let cancel = self.begin(Role::Join, ConnectionState::Connecting).await;
        let mut guard = StartGuard::new(&self.inner, Role::Join, &cancel);
        let started =
            match transport::dial(host, port, self.inner.config.connect_timeout, &cancel).await {
                Ok((stream, peer)) => self.attach(stream, peer, Role::Join, cancel).await,
                Err(e) => {
                    self.abandon(Role::Join, &cancel, e).await;
                    false
                }
            };
        guard.disarm();
        started
    }

    /// Write one line and flush it. Fails with `NotConnected` when no stream
    /// is attached (or it is torn down mid-write).
    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        let mut slot = self.inner.writer.lock().await;
        let out = slot.as_mut().ok_or(ConnectionError::NotConnected)?;
        let cancel = out.cancel.clone();
        let kind = message.kind();
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::NotConnected),
            res = out.framed.send(message) => res.map_err(ConnectionError::from),
        };
        match &res {
            Ok(()) => debug!(kind, "sent"),
            Err(e) => warn!(kind, error = %e, "send failed"),
        }
        res
    }

    /// Tear down the link or pending attempt. Safe to call at any time, any number of times.
    pub async fn stop(&self) {
        let mut session = self.inner.session.lock().await;
        self.inner
            .teardown(&mut session, CloseReason::Stopped)
            .await;
    }

    async fn begin(&self, role: Role, state: ConnectionState) -> CancellationToken {
        let mut session = self.inner.session.lock().await;
        self.inner
            .teardown(&mut session, CloseReason::Replaced)
            .await;
        session.cancel = CancellationToken::new();
        self.inner.set_status(role, state);
        session.cancel.clone()
    }

    async fn attach(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        role: Role,
        cancel: CancellationToken,
    ) -> bool {
        let mut session = self.inner.session.lock().await;
        if cancel.is_cancelled() {
            debug!(%peer, "attempt superseded; dropping stream");
            return false;
        }
        let max = self.inner.config.max_line_bytes;
        let (read, write) = stream.into_split();
        let reader = FramedRead::new(read, MarmotCodec::with_max_line_bytes(max));
        *self.inner.writer.lock().await = Some(Outbound {
            framed: FramedWrite::new(write, MarmotCodec::with_max_line_bytes(max)),
            cancel: cancel.clone(),
        });
        self.inner.set_status(role, ConnectionState::Connected);
        self.inner.emit(ConnectionEvent::Connected { role, peer });
        info!(?role, %peer, "link up");
        session.receiver = Some(tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            reader,
            cancel,
        )));
        true
    }

    /// A start attempt failed. Unless `stop()` or a newer start already took
    /// over, the attempt ends in `Closed`.
    async fn abandon(&self, role: Role, cancel: &CancellationToken, err: TransportError) {
        let _session = self.inner.session.lock().await;
        if cancel.is_cancelled() {
            debug!(?role, error = %err, "attempt cancelled");
            return;
        }
        cancel.cancel();
        warn!(?role, error = %err, "start failed");
        self.inner.set_status(role, ConnectionState::Closed);
        self.inner.emit(ConnectionEvent::Closed {
            reason: CloseReason::Failed(err.to_string()),
        });
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl Inner {
    fn set_status(&self, role: Role, state: ConnectionState) {
        debug!(?role, ?state, "status");
        self.status.send_replace(Status { role, state });
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Cancel the current attempt, wait for its receive loop, close the writer.
    /// Caller holds the session lock.
    async fn teardown(&self, session: &mut Session, reason: CloseReason) {
        session.cancel.cancel();
        if let Some(task) = session.receiver.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "receive loop ended abnormally");
            }
        }
        let mut writer = self.writer.lock().await.take().map(|o| o.framed.into_inner());
        transport::close(&mut writer).await;

        let prev = *self.status.borrow();
        let stopping = reason == CloseReason::Stopped;
        if prev.state.is_active() {
            info!(role = ?prev.role, ?reason, "link closed");
            self.set_status(prev.role, ConnectionState::Closed);
            self.emit(ConnectionEvent::Closed { reason });
            self.subscribers.close(stopping);
        } else if stopping {
            self.set_status(prev.role, ConnectionState::Closed);
            self.subscribers.close(true);
        }
    }

    /// The receive loop ended on its own (EOF, read error, bad line).
    async fn close_from_loop(&self, cancel: &CancellationToken, reason: CloseReason) {
        if cancel.is_cancelled() {
            return;
        }
        cancel.cancel();
        let mut writer = self.writer.lock().await.take().map(|o| o.framed.into_inner());
        transport::close(&mut writer).await;
        let role = self.status.borrow().role;
        info!(?role, ?reason, "link closed");
        self.set_status(role, ConnectionState::Closed);
        self.emit(ConnectionEvent::Closed { reason });
        self.subscribers.close(false);
    }
}

/// Closes out a start attempt whose future was dropped before it finished.
struct StartGuard<'a> {
    inner: &'a Inner,
    role: Role,
    cancel: CancellationToken,
    armed: bool,
}

impl<'a> StartGuard<'a> {
    fn new(inner: &'a Inner, role: Role, cancel: &CancellationToken) -> Self {
        Self {
            inner,
            role,
            cancel: cancel.clone(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // A held session lock means stop() or a newer start is tearing this
        // attempt down and will set the status itself.
        let Ok(_session) = self.inner.session.try_lock() else {
            self.cancel.cancel();
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        warn!(role = ?self.role, "start abandoned before it finished");
        self.inner.set_status(self.role, ConnectionState::Closed);
        self.inner.emit(ConnectionEvent::Closed {
            reason: CloseReason::Failed("start abandoned".into()),
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.session.get_mut().cancel.cancel();
    }
}

/// One per attached stream. Holds the manager weakly so dropping every
/// handle also ends the loop.
async fn receive_loop(inner: Weak<Inner>, mut reader: LineReader, cancel: CancellationToken) {
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = reader.next() => next,
        };
        let Some(manager) = inner.upgrade() else {
            return;
        };
        match next {
            Some(Ok(message)) => {
                debug!(kind = message.kind(), "received");
                if let Message::HandOff { edge, at_ms } = &message {
                    manager.emit(ConnectionEvent::HandOffReceived {
                        edge: edge.clone(),
                        at_ms: *at_ms,
                    });
                }
                manager.subscribers.publish(&message);
            }
            Some(Err(CodecError::Protocol(e))) => {
                warn!(error = %e, "undecodable line; closing link");
                break CloseReason::Protocol(e.to_string());
            }
            Some(Err(CodecError::Io(e))) => {
                warn!(error = %e, "read failed; closing link");
                break CloseReason::Io(e.to_string());
            }
            None => {
                info!("peer disconnected");
                break CloseReason::PeerDisconnected;
            }
        }
    };
    drop(reader);
    if let Some(manager) = inner.upgrade() {
        manager.close_from_loop(&cancel, reason).await;
    }
}

struct Subscribers {
    slots: std::sync::Mutex<Vec<Slot>>,
    capacity: usize,
}

struct Slot {
    tx: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
    silenced: CancellationToken,
}

impl Subscribers {
    fn new(capacity: usize) -> Self {
        Self {
            slots: std::sync::Mutex::new(Vec::new()),
            capacity,
        }
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let silenced = CancellationToken::new();
        self.lock().push(Slot {
            tx,
            dropped: dropped.clone(),
            silenced: silenced.clone(),
        });
        Subscription {
            rx,
            dropped,
            silenced,
        }
    }

    /// Non-blocking fan-out; full buffers lose this message, gone subscribers are pruned.
    fn publish(&self, message: &Message) {
        self.lock().retain(|slot| match slot.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(kind = message.kind(), dropped = total, "subscriber full; message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// End every current subscription. `silence` also discards whatever is
    /// still buffered.
    fn close(&self, silence: bool) {
        let slots = std::mem::take(&mut *self.lock());
        if silence {
            for slot in &slots {
                slot.silenced.cancel();
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stream of messages from the peer; see [`ConnectionManager::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Message>,
    dropped: Arc<AtomicU64>,
    silenced: CancellationToken,
}

impl Subscription {
    /// Next message, or `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.next().await
    }

    /// Messages lost because this subscriber's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        if self.silenced.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}
