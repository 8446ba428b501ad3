//! Coordinator-side listener.
//!
//! Accepts worker connections, tracks the live peer set, and offers
//! point-to-point messaging plus a correlation-free "wait until peer P sends
//! action X" primitive. Every inbound message is also run through the
//! configured action handler, independent of any pending wait, so streaming
//! progress actions are delivered while a completion wait is outstanding.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    CoordinatorAction, WorkerAction, WorkerActionHandler, WorkerActionKind, dispatch,
};
use crate::wire::codec::{ActionMessage, FrameCodec, ProtocolError};

/// Unique identifier for one tracked peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(uuid::Uuid);

impl PeerId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is not running")]
    NotRunning,

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("peer {peer} closed while waiting for '{action}'")]
    PeerClosed {
        peer: PeerId,
        action: WorkerActionKind,
    },

    #[error("peer {peer} errored while waiting for '{action}': {message}")]
    PeerError {
        peer: PeerId,
        action: WorkerActionKind,
        message: String,
    },

    #[error("wait for '{action}' from peer {peer} was abandoned")]
    WaitAbandoned {
        peer: PeerId,
        action: WorkerActionKind,
    },

    #[error("timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        after: Duration,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
}

enum WaitOutcome {
    Action(WorkerAction),
    Closed,
    Errored(String),
}

type Waiters = Arc<StdMutex<HashMap<WorkerActionKind, oneshot::Sender<WaitOutcome>>>>;
type PeerWriter = Arc<Mutex<FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec<CoordinatorAction>>>>;

struct Peer {
    addr: SocketAddr,
    writer: PeerWriter,
    waiters: Waiters,
}

enum ServerState {
    Stopped,
    Running {
        local_addr: SocketAddr,
        peers: Arc<DashMap<PeerId, Peer>>,
        peer_connected: Arc<Notify>,
        cancel: CancellationToken,
        accept_task: JoinHandle<()>,
    },
}

/// Listener tracking connected workers.
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn WorkerActionHandler>,
    state: ServerState,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn WorkerActionHandler>) -> Self {
        Self {
            config,
            handler,
            state: ServerState::Stopped,
        }
    }

    /// Bind and begin listening. Resolves once the listener is bound.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if matches!(self.state, ServerState::Running { .. }) {
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        let peers: Arc<DashMap<PeerId, Peer>> = Arc::new(DashMap::new());
        let peer_connected = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&peers),
            Arc::clone(&peer_connected),
            Arc::clone(&self.handler),
            cancel.clone(),
        ));

        self.state = ServerState::Running {
            local_addr,
            peers,
            peer_connected,
            cancel,
            accept_task,
        };
        Ok(())
    }

    /// Close the listener and every peer connection. Idempotent; resolves
    /// once everything is closed.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        match std::mem::replace(&mut self.state, ServerState::Stopped) {
            ServerState::Stopped => Ok(()),
            ServerState::Running {
                peers,
                cancel,
                accept_task,
                ..
            } => {
                cancel.cancel();
                if let Err(error) = accept_task.await {
                    tracing::warn!(%error, "accept loop panicked");
                }

                let mut first_error = None;
                let ids: Vec<PeerId> = peers.iter().map(|entry| *entry.key()).collect();
                for id in ids {
                    if let Some((_, peer)) = peers.remove(&id) {
                        drain_waiters(&peer.waiters, || WaitOutcome::Closed);
                        let mut writer = peer.writer.lock().await;
                        if let Err(error) = writer.close().await {
                            tracing::debug!(%id, %error, "error closing peer socket");
                            if first_error.is_none() {
                                first_error = Some(error);
                            }
                        }
                    }
                }
                tracing::info!("server stopped");
                match first_error {
                    Some(error) => Err(error.into()),
                    None => Ok(()),
                }
            }
        }
    }

    /// Address the listener is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            ServerState::Running { local_addr, .. } => Some(*local_addr),
            ServerState::Stopped => None,
        }
    }

    /// Currently tracked peers, in no particular order.
    pub fn peers(&self) -> Vec<PeerId> {
        match &self.state {
            ServerState::Running { peers, .. } => {
                peers.iter().map(|entry| *entry.key()).collect()
            }
            ServerState::Stopped => Vec::new(),
        }
    }

    pub fn client_count(&self) -> usize {
        match &self.state {
            ServerState::Running { peers, .. } => peers.len(),
            ServerState::Stopped => 0,
        }
    }

    /// Resolve with a connected peer: immediately if one is already tracked,
    /// otherwise as soon as the next connection arrives, failing once the
    /// deadline elapses.
    pub async fn wait_for_client(&self, wait: Duration) -> Result<PeerId, ServerError> {
        let ServerState::Running {
            peers,
            peer_connected,
            ..
        } = &self.state
        else {
            return Err(ServerError::NotRunning);
        };

        tokio::time::timeout(wait, async {
            loop {
                if let Some(entry) = peers.iter().next() {
                    return *entry.key();
                }
                peer_connected.notified().await;
            }
        })
        .await
        .map_err(|_| ServerError::Timeout {
            waiting_for: "a worker connection".to_string(),
            after: wait,
        })
    }

    /// Send one action to one tracked peer.
    pub async fn send(&self, peer: PeerId, action: CoordinatorAction) -> Result<(), ServerError> {
        let ServerState::Running { peers, .. } = &self.state else {
            return Err(ServerError::NotRunning);
        };
        let writer = peers
            .get(&peer)
            .map(|entry| Arc::clone(&entry.writer))
            .ok_or(ServerError::UnknownPeer(peer))?;

        tracing::trace!(%peer, action = action.action(), "sending action");
        let mut writer = writer.lock().await;
        writer.send(action).await?;
        Ok(())
    }

    /// Register interest in the next action of the given kind from `peer`.
    /// The waiter is installed before this returns, so a subscription taken
    /// out before the triggering send cannot lose the reply. A newer
    /// subscription for the same (peer, kind) supersedes an older one.
    pub fn subscribe_action(
        &self,
        peer: PeerId,
        kind: WorkerActionKind,
    ) -> Result<PendingAction, ServerError> {
        let ServerState::Running { peers, .. } = &self.state else {
            return Err(ServerError::NotRunning);
        };

        let (tx, rx) = oneshot::channel();
        {
            let entry = peers.get(&peer).ok_or(ServerError::UnknownPeer(peer))?;
            let mut waiters = lock_waiters(&entry.waiters);
            if waiters.insert(kind, tx).is_some() {
                tracing::warn!(%peer, %kind, "superseding an outstanding wait");
            }
        }
        Ok(PendingAction {
            peer,
            kind,
            rx,
            peers: Arc::clone(peers),
        })
    }

    /// Suspend until `peer` sends an action of the given kind and resolve
    /// with it. Fails if the peer's connection closes or errors first, or the
    /// deadline elapses. Correlation-free: only one outstanding wait per
    /// (peer, kind) is meaningful at a time.
    pub async fn wait_for_action(
        &self,
        peer: PeerId,
        kind: WorkerActionKind,
        wait: Duration,
    ) -> Result<WorkerAction, ServerError> {
        self.subscribe_action(peer, kind)?.wait(wait).await
    }
}

/// An installed wait for one action from one peer. See
/// [`Server::subscribe_action`].
pub struct PendingAction {
    peer: PeerId,
    kind: WorkerActionKind,
    rx: oneshot::Receiver<WaitOutcome>,
    peers: Arc<DashMap<PeerId, Peer>>,
}

impl PendingAction {
    pub async fn wait(self, wait: Duration) -> Result<WorkerAction, ServerError> {
        let Self {
            peer,
            kind,
            rx,
            peers,
        } = self;
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(WaitOutcome::Action(action))) => Ok(action),
            Ok(Ok(WaitOutcome::Closed)) => Err(ServerError::PeerClosed { peer, action: kind }),
            Ok(Ok(WaitOutcome::Errored(message))) => Err(ServerError::PeerError {
                peer,
                action: kind,
                message,
            }),
            Ok(Err(_)) => Err(ServerError::WaitAbandoned { peer, action: kind }),
            Err(_) => {
                if let Some(entry) = peers.get(&peer) {
                    lock_waiters(&entry.waiters).remove(&kind);
                }
                Err(ServerError::Timeout {
                    waiting_for: format!("'{}' from peer {}", kind, peer),
                    after: wait,
                })
            }
        }
    }
}

fn lock_waiters(
    waiters: &StdMutex<HashMap<WorkerActionKind, oneshot::Sender<WaitOutcome>>>,
) -> std::sync::MutexGuard<'_, HashMap<WorkerActionKind, oneshot::Sender<WaitOutcome>>> {
    match waiters.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn drain_waiters(waiters: &Waiters, outcome: impl Fn() -> WaitOutcome) {
    let drained: Vec<_> = {
        let mut map = lock_waiters(waiters);
        map.drain().collect()
    };
    for (_, tx) in drained {
        let _ = tx.send(outcome());
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: Arc<DashMap<PeerId, Peer>>,
    peer_connected: Arc<Notify>,
    handler: Arc<dyn WorkerActionHandler>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let id = PeerId::new();
                    let (read_half, write_half) = stream.into_split();
                    let waiters: Waiters = Arc::new(StdMutex::new(HashMap::new()));
                    peers.insert(
                        id,
                        Peer {
                            addr,
                            writer: Arc::new(Mutex::new(FramedWrite::new(
                                write_half,
                                FrameCodec::new(),
                            ))),
                            waiters: Arc::clone(&waiters),
                        },
                    );
                    tracing::info!(%id, %addr, "peer connected");
                    peer_connected.notify_one();
                    tokio::spawn(peer_read_loop(
                        id,
                        read_half,
                        Arc::clone(&peers),
                        waiters,
                        Arc::clone(&handler),
                        cancel.clone(),
                    ));
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                }
            }
        }
    }
    tracing::debug!("accept loop exiting");
}

async fn peer_read_loop(
    id: PeerId,
    read_half: OwnedReadHalf,
    peers: Arc<DashMap<PeerId, Peer>>,
    waiters: Waiters,
    handler: Arc<dyn WorkerActionHandler>,
    cancel: CancellationToken,
) {
    let mut framed = FramedRead::new(read_half, FrameCodec::<WorkerAction>::new());
    let failure: Option<String>;
    loop {
        tokio::select! {
            // stop() drains the waiters itself
            _ = cancel.cancelled() => return,
            frame = framed.next() => match frame {
                Some(Ok(action)) => {
                    tracing::trace!(%id, action = action.action(), "action received");
                    dispatch(handler.as_ref(), &action);
                    let sender = lock_waiters(&waiters).remove(&action.kind());
                    if let Some(tx) = sender {
                        let _ = tx.send(WaitOutcome::Action(action));
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(%id, %error, "peer socket error");
                    failure = Some(error.to_string());
                    break;
                }
                None => {
                    failure = None;
                    break;
                }
            }
        }
    }

    if let Some((_, peer)) = peers.remove(&id) {
        tracing::info!(%id, addr = %peer.addr, "peer disconnected");
        match failure {
            Some(message) => drain_waiters(&peer.waiters, || WaitOutcome::Errored(message.clone())),
            None => drain_waiters(&peer.waiters, || WaitOutcome::Closed),
        }
    }
}
