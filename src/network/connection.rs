//! Connection manager
//!
//! Owns the one logical connection of a session. Everything observable
//! about the connection (state transitions, inbound messages, receive
//! errors, closure) is delivered as a [`ConnectionEvent`] on the single
//! channel returned by [`ConnectionManager::new`], in the order it
//! happened. `connect` never blocks: completion shows up as
//! `StateChanged(Connected)` on that channel.
//!
//! Reconnecting is the supervisor's job; this type only reports whether a
//! closure was deliberate.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::constants::{CLOSE_ABNORMAL, CLOSE_NORMAL};
use crate::error::NetworkError;
use crate::network::transport::{validate_endpoint, BlobHandle, Connector, Transport, WireMessage};
use crate::protocol::{CloseInfo, ConnectionState};

/// How long a deliberate close waits for the close frame to go out
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Status code used when the peer closed without giving one
const CLOSE_NO_STATUS: u16 = 1005;

/// A received payload, before classification
#[derive(Debug)]
pub enum InboundPayload {
    Binary(Bytes),
    Text(String),
    Blob(BlobHandle),
}

/// Everything the connection reports, in arrival order
#[derive(Debug)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Message(InboundPayload),
    /// Non-fatal problems, and the cause preceding an abnormal closure
    Error(NetworkError),
    Closed(CloseInfo),
}

struct Inner {
    state: ConnectionState,
    /// Bumped on every connect; tasks of older generations go silent
    generation: u64,
    /// Set once the current generation reported its closure
    closed: bool,
    outbound: Option<mpsc::Sender<Bytes>>,
    close_tx: Option<oneshot::Sender<u16>>,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    connect_attempts: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    abnormal_closures: AtomicU64,
}

struct Shared {
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    counters: ConnectionCounters,
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            tracing::debug!("Connection {} -> {}", inner.state, state);
            inner.state = state;
            let _ = self.events.send(ConnectionEvent::StateChanged(state));
        }
    }

    fn emit(&self, generation: u64, event: ConnectionEvent) {
        let inner = self.inner.lock();
        if inner.generation == generation && !inner.closed {
            let _ = self.events.send(event);
        }
    }

    fn opened(&self, generation: u64, outbound: mpsc::Sender<Bytes>) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.closed {
            return false;
        }
        inner.outbound = Some(outbound);
        self.set_state(&mut inner, ConnectionState::Connected);
        true
    }

    fn begin_closing(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && !inner.closed {
            self.set_state(&mut inner, ConnectionState::Closing);
        }
    }

    /// Report the end of a generation exactly once
    fn finish(&self, generation: u64, info: CloseInfo) {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.closed {
            return;
        }
        inner.closed = true;
        inner.outbound = None;
        inner.close_tx = None;

        let state = if info.is_abnormal() {
            self.counters.abnormal_closures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Connection closed abnormally (code {})", info.code);
            ConnectionState::Failed
        } else {
            tracing::info!("Connection closed (code {}, deliberate: {})", info.code, info.deliberate);
            ConnectionState::Disconnected
        };
        self.set_state(&mut inner, state);
        let _ = self.events.send(ConnectionEvent::Closed(info));
    }
}

/// Connection statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConnectionStats {
    pub connect_attempts: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub abnormal_closures: u64,
}

/// Single logical connection over an unreliable transport
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    queue_depth: usize,
}

impl ConnectionManager {
    /// Create a manager and the one receiver all of its events go to
    pub fn new(
        connector: Arc<dyn Connector>,
        queue_depth: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: 0,
                closed: true,
                outbound: None,
                close_tx: None,
            }),
            events,
            counters: ConnectionCounters::default(),
        });
        let manager = Self {
            connector,
            shared,
            task: Mutex::new(None),
            queue_depth: queue_depth.max(1),
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Start establishing the transport. Any previous connection is torn
    /// down first, silently, so at most one is ever live.
    pub fn connect(&self, endpoint: &str) -> Result<(), NetworkError> {
        validate_endpoint(endpoint)?;

        if let Some(previous) = self.task.lock().take() {
            previous.abort();
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.queue_depth);
        let (close_tx, close_rx) = oneshot::channel();
        let generation = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            inner.closed = false;
            inner.outbound = None;
            inner.close_tx = Some(close_tx);
            self.shared.set_state(&mut inner, ConnectionState::Connecting);
            inner.generation
        };
        self.shared.counters.connect_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Connecting to {}", endpoint);

        let handle = tokio::spawn(run_connection(
            self.shared.clone(),
            self.connector.clone(),
            endpoint.to_string(),
            generation,
            outbound_tx,
            outbound_rx,
            close_rx,
        ));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Queue one binary message. Fails at once unless connected; never
    /// holds more than the configured queue depth.
    pub fn send(&self, data: Bytes) -> Result<(), NetworkError> {
        let inner = self.shared.inner.lock();
        if inner.state != ConnectionState::Connected {
            return Err(NetworkError::NotConnected);
        }
        let tx = inner.outbound.as_ref().ok_or(NetworkError::NotConnected)?;
        let len = data.len() as u64;
        tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => NetworkError::NotConnected,
        })?;
        self.shared.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.shared.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Close deliberately. The resulting `Closed` event is never abnormal.
    /// Safe to call in any state, any number of times.
    pub async fn close(&self, code: u16) {
        let (generation, state, close_tx) = {
            let mut inner = self.shared.inner.lock();
            (inner.generation, inner.state, inner.close_tx.take())
        };
        let handle = self.task.lock().take();

        match (state, handle) {
            (ConnectionState::Connected, Some(mut handle)) => {
                self.shared.begin_closing(generation);
                if let Some(tx) = close_tx {
                    let _ = tx.send(code);
                }
                if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                    tracing::warn!("Close handshake timed out, dropping socket");
                    handle.abort();
                }
            }
            (_, Some(handle)) => handle.abort(),
            (_, None) => {}
        }
        self.shared.finish(generation, CloseInfo::deliberate(code));
    }

    pub fn stats(&self) -> ConnectionStats {
        let c = &self.shared.counters;
        ConnectionStats {
            connect_attempts: c.connect_attempts.load(Ordering::Relaxed),
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            abnormal_closures: c.abnormal_closures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    endpoint: String,
    generation: u64,
    outbound_tx: mpsc::Sender<Bytes>,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    mut close_rx: oneshot::Receiver<u16>,
) {
    let Transport { mut sink, mut stream } = match connector.connect(&endpoint).await {
        Ok(transport) => transport,
        Err(e) => {
            tracing::warn!("Connect to {} failed: {}", endpoint, e);
            shared.emit(generation, ConnectionEvent::Error(e));
            shared.finish(generation, CloseInfo::remote(CLOSE_ABNORMAL));
            return;
        }
    };

    if !shared.opened(generation, outbound_tx) {
        return;
    }
    tracing::info!("Connected to {}", endpoint);

    loop {
        tokio::select! {
            biased;

            code = &mut close_rx => {
                let code = code.unwrap_or(CLOSE_NORMAL);
                let _ = sink.send(WireMessage::Close(Some(code))).await;
                let _ = sink.close().await;
                shared.finish(generation, CloseInfo::deliberate(code));
                return;
            }

            outbound = outbound_rx.recv() => {
                let Some(data) = outbound else {
                    return;
                };
                if let Err(e) = sink.send(WireMessage::Binary(data)).await {
                    shared.emit(generation, ConnectionEvent::Error(e));
                    shared.finish(generation, CloseInfo::remote(CLOSE_ABNORMAL));
                    return;
                }
            }

            inbound = stream.next() => {
                let payload = match inbound {
                    Some(Ok(WireMessage::Binary(data))) => InboundPayload::Binary(data),
                    Some(Ok(WireMessage::Text(text))) => InboundPayload::Text(text),
                    Some(Ok(WireMessage::Blob(blob))) => InboundPayload::Blob(blob),
                    Some(Ok(WireMessage::Close(code))) => {
                        shared.finish(generation, CloseInfo::remote(code.unwrap_or(CLOSE_NO_STATUS)));
                        return;
                    }
                    Some(Err(e @ NetworkError::ConnectionLost(_))) => {
                        shared.emit(generation, ConnectionEvent::Error(e));
                        shared.finish(generation, CloseInfo::remote(CLOSE_ABNORMAL));
                        return;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Receive error: {}", e);
                        shared.emit(generation, ConnectionEvent::Error(e));
                        continue;
                    }
                    None => {
                        shared.finish(generation, CloseInfo::remote(CLOSE_ABNORMAL));
                        return;
                    }
                };
                shared.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                shared.emit(generation, ConnectionEvent::Message(payload));
            }
        }
    }
}
