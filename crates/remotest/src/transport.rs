//! Reconnecting client socket.
//!
//! Owns one logical TCP connection to the coordinator. Connection state is
//! an explicit enum, so "no active connection" is a reachable state rather
//! than a null check. On unexpected close the transport re-establishes in
//! the background with capped exponential backoff; `disconnect` cancels all
//! of it.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::wire::codec::{ActionMessage, FrameCodec, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("not connected")]
    NotConnected,

    #[error("gave up connecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("transport is closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Everything the transport reports to its owner, in delivery order.
#[derive(Debug)]
pub enum TransportEvent<Rx> {
    /// A connection reached the open state. Fires on every successful open,
    /// including post-reconnect opens.
    Connected,
    /// The connection closed. A reconnect's `Connected` always follows the
    /// prior `Disconnected`.
    Disconnected { reason: Option<String> },
    /// One inbound action message. Per-connection ordering is preserved.
    Message(Rx),
}

enum ConnState<Tx> {
    Disconnected,
    Connecting,
    Open(FramedWrite<OwnedWriteHalf, FrameCodec<Tx>>),
    Closing,
}

/// Reconnecting point-to-point socket, sending `Tx` frames and receiving
/// `Rx` frames.
pub struct Transport<Tx, Rx> {
    config: TransportConfig,
    state: Arc<Mutex<ConnState<Tx>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent<Rx>>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent<Rx>>>,
    cancel: CancellationToken,
}

impl<Tx, Rx> Transport<Tx, Rx>
where
    Tx: ActionMessage + Send + 'static,
    Rx: ActionMessage + Send + 'static,
{
    pub fn new(config: TransportConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: Arc::new(Mutex::new(ConnState::Disconnected)),
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// The event stream. Yields `None` after the first call; the transport
    /// has a single owner.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent<Rx>>> {
        self.events_rx.take()
    }

    /// Open the connection. Resolves once a usable connection exists: with
    /// reconnection enabled, connect failures are absorbed and retried with
    /// capped backoff until the attempt limit is reached or the transport is
    /// disconnected.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        {
            let mut state = self.state.lock().await;
            if matches!(&*state, ConnState::Open(_) | ConnState::Connecting) {
                return Ok(());
            }
            *state = ConnState::Connecting;
        }
        establish(
            self.config.clone(),
            Arc::clone(&self.state),
            self.events_tx.clone(),
            self.cancel.clone(),
        )
        .await
    }

    /// Encode one action message and write it to the socket. Fails with
    /// `NotConnected` unless the connection is open at call time; nothing is
    /// queued across disconnects.
    pub async fn send(&self, action: Tx) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        match &mut *state {
            ConnState::Open(writer) => {
                writer.send(action).await?;
                Ok(())
            }
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Disable reconnection and close the socket if present. Idempotent.
    pub async fn disconnect(&self, reason: impl Into<String>) {
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        let prev = std::mem::replace(&mut *state, ConnState::Closing);
        if let ConnState::Open(mut writer) = prev {
            if let Err(error) = writer.close().await {
                tracing::debug!(%error, "error closing socket");
            }
            *state = ConnState::Disconnected;
            let _ = self.events_tx.send(TransportEvent::Disconnected {
                reason: Some(reason.into()),
            });
        } else {
            *state = ConnState::Disconnected;
        }
    }

    pub async fn is_connected(&self) -> bool {
        matches!(&*self.state.lock().await, ConnState::Open(_))
    }
}

async fn establish<Tx, Rx>(
    config: TransportConfig,
    state: Arc<Mutex<ConnState<Tx>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent<Rx>>,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    Tx: ActionMessage + Send + 'static,
    Rx: ActionMessage + Send + 'static,
{
    let mut attempts: u32 = 0;
    let mut delay = config.reconnect_delay;
    *state.lock().await = ConnState::Connecting;
    loop {
        if cancel.is_cancelled() {
            *state.lock().await = ConnState::Disconnected;
            return Err(TransportError::Closed);
        }
        match TcpStream::connect(&config.addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let (read_half, write_half) = stream.into_split();
                *state.lock().await = ConnState::Open(FramedWrite::new(
                    write_half,
                    FrameCodec::new(),
                ));
                tracing::info!(addr = %config.addr, "connected");
                let _ = events_tx.send(TransportEvent::Connected);
                spawn_read_loop(read_half, config, state, events_tx, cancel);
                return Ok(());
            }
            Err(error) => {
                if !config.reconnect {
                    *state.lock().await = ConnState::Disconnected;
                    return Err(TransportError::Connect {
                        addr: config.addr.clone(),
                        source: error,
                    });
                }
                attempts += 1;
                if let Some(max) = config.max_attempts
                    && attempts >= max
                {
                    *state.lock().await = ConnState::Disconnected;
                    return Err(TransportError::RetriesExhausted { attempts });
                }
                tracing::debug!(
                    addr = %config.addr,
                    %error,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "connect failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        *state.lock().await = ConnState::Disconnected;
                        return Err(TransportError::Closed);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(config.max_reconnect_delay);
            }
        }
    }
}

fn spawn_read_loop<Tx, Rx>(
    read_half: OwnedReadHalf,
    config: TransportConfig,
    state: Arc<Mutex<ConnState<Tx>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent<Rx>>,
    cancel: CancellationToken,
) where
    Tx: ActionMessage + Send + 'static,
    Rx: ActionMessage + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = FramedRead::new(read_half, FrameCodec::<Rx>::new());
        let close_reason: Option<String>;
        loop {
            tokio::select! {
                // An explicit disconnect owns the state transition and the
                // closing event.
                _ = cancel.cancelled() => return,
                frame = framed.next() => match frame {
                    Some(Ok(message)) => {
                        if events_tx.send(TransportEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(%error, "transport read error");
                        close_reason = Some(error.to_string());
                        break;
                    }
                    None => {
                        close_reason = None;
                        break;
                    }
                }
            }
        }

        tracing::info!(addr = %config.addr, reason = ?close_reason, "connection closed");
        *state.lock().await = ConnState::Disconnected;
        let _ = events_tx.send(TransportEvent::Disconnected {
            reason: close_reason,
        });

        if config.reconnect && !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(config.reconnect_delay) => {}
            }
            tracing::debug!(addr = %config.addr, "reconnecting");
            if let Err(error) =
                Box::pin(establish(config, state, events_tx, cancel)).await
            {
                // Absorbed: reconnection failures are never surfaced to the
                // owner while reconnect is enabled, only logged.
                tracing::warn!(%error, "gave up reconnecting");
            }
        }
    });
}
