//! Channel-backed transport for tests

use async_trait::async_trait;
use futures_util::future;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::NetworkError;
use crate::network::transport::{Connector, Transport, WireMessage};

/// What the next connect attempt does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Refuse,
    /// Never completes
    Hang,
}

/// The server end of one fake connection. Dropping it drops the socket.
pub struct FakeServer {
    from_client: mpsc::UnboundedReceiver<WireMessage>,
    to_client: mpsc::UnboundedSender<Result<WireMessage, NetworkError>>,
}

impl FakeServer {
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.from_client.try_recv().ok()
    }

    pub fn push(&self, msg: WireMessage) {
        let _ = self.to_client.send(Ok(msg));
    }

    pub fn push_error(&self, e: NetworkError) {
        let _ = self.to_client.send(Err(e));
    }
}

pub struct FakeConnector {
    outcomes: Mutex<VecDeque<Outcome>>,
    attempts: Mutex<Vec<Instant>>,
    servers_tx: mpsc::UnboundedSender<FakeServer>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeServer>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Self::with_outcomes([])
    }

    /// Scripted outcomes, then `Accept` forever
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            attempts: Mutex::new(Vec::new()),
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    /// An accepted connection not yet picked up, if any
    pub fn try_next_server(&self) -> Option<FakeServer> {
        self.servers_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Wait for the next accepted connection
    pub async fn next_server(&self) -> FakeServer {
        self.servers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &str) -> Result<Transport, NetworkError> {
        self.attempts.lock().push(Instant::now());
        let outcome = self.outcomes.lock().pop_front().unwrap_or(Outcome::Accept);

        match outcome {
            Outcome::Refuse => return Err(NetworkError::ConnectFailed(format!("{endpoint}: refused"))),
            Outcome::Hang => future::pending::<()>().await,
            Outcome::Accept => {}
        }

        let (to_server, from_client) = mpsc::unbounded_channel::<WireMessage>();
        let (to_client, from_server) = mpsc::unbounded_channel();

        let sink = futures_util::sink::unfold(to_server, |tx, msg: WireMessage| async move {
            tx.send(msg)
                .map_err(|_| NetworkError::SendFailed("fake server gone".into()))?;
            Ok::<_, NetworkError>(tx)
        });
        let stream = futures_util::stream::unfold(from_server, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        let _ = self.servers_tx.send(FakeServer {
            from_client,
            to_client,
        });
        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
