//! Session controller
//!
//! Orchestrates one streaming session at a time:
//!
//! 1. `start` acquires capture, negotiates a codec and waits (bounded) for
//!    the connection. Any failure tears down what was acquired and returns
//!    the controller to `Idle`.
//! 2. A supervisor task then owns every live resource and handles, in
//!    arrival order, connection events, the reconnect timer, classified
//!    inbound messages and the outbound pump's exit.
//! 3. When the supervisor leaves its loop (stop request, fatal error or
//!    the server ending the session) it runs the same best-effort teardown
//!    every time.
//!
//! The published [`SessionStatus`] always changes `state` and `connection`
//! together; `Streaming` is only ever published alongside `Connected`.

use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::{backend_from_config, CaptureBackend, CaptureConstraints, FrameTap, LiveStream};
use crate::codec::{ChunkEncoder, CodecRegistry, EncoderCounters};
use crate::config::AppConfig;
use crate::constants::CLOSE_NORMAL;
use crate::error::{Error, NetworkError, Result, SessionError};
use crate::network::{
    ConnectionEvent, ConnectionManager, Connector, OutboundPump, PumpCounters, PumpExit, WebSocketConnector,
};
use crate::overlay::{Composite, CompositeReceiver, DetectionStore, ImageSurface, OverlayRenderer};
use crate::playback::{
    DecodingSink, DispatchCounters, InboundDispatcher, PlaybackBuffer, PlaybackCounters, RemoteFrameReceiver,
    RemoteSurface,
};
use crate::protocol::{CloseInfo, ConnectionState};
use crate::session::state::{Session, SessionState, SessionStats, SessionStatus};

enum Lifecycle {
    Idle,
    Starting(CancellationToken),
    Running(ActiveSession),
    Stopping,
}

struct ActiveSession {
    id: Uuid,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Live counters of the running session
struct StatsSources {
    session_id: Uuid,
    tap: FrameTap,
    encoder: Arc<EncoderCounters>,
    pump: Arc<PumpCounters>,
    connection: Arc<ConnectionManager>,
    inbound: Arc<DispatchCounters>,
    playback: Arc<PlaybackCounters>,
    overlay_frames: Arc<AtomicU64>,
    detections: DetectionStore,
}

impl StatsSources {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            session_id: Some(self.session_id),
            frames_captured: self.tap.frames_published(),
            encoder: self.encoder.snapshot(),
            pump: self.pump.snapshot(),
            connection: self.connection.stats(),
            inbound: self.inbound.snapshot(),
            playback: self.playback.snapshot(),
            overlay_frames: self.overlay_frames.load(Ordering::Relaxed),
            detection_updates: self.detections.updates(),
        }
    }
}

enum StatsView {
    Empty,
    Live(StatsSources),
    /// Frozen at teardown so nothing of the session stays alive
    Final(SessionStats),
}

struct ControllerInner {
    config: AppConfig,
    capture: Arc<dyn CaptureBackend>,
    connector: Arc<dyn Connector>,
    codecs: CodecRegistry,
    status: watch::Sender<SessionStatus>,
    lifecycle: Mutex<Lifecycle>,
    stats: Mutex<StatsView>,
    overlay_output: Arc<watch::Sender<Option<Arc<Composite>>>>,
    remote_surface: RemoteSurface,
}

/// Everything `start` acquired, not yet handed to a supervisor
struct Resources {
    capture: LiveStream,
    encoder: ChunkEncoder,
    connection: Arc<ConnectionManager>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Resources {
    async fn shutdown(mut self) {
        self.connection.close(CLOSE_NORMAL).await;
        self.capture.release();
    }
}

/// Cheap to clone; all clones drive the same session
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(config: AppConfig, capture: Arc<dyn CaptureBackend>, connector: Arc<dyn Connector>) -> Self {
        Self::with_codecs(config, capture, connector, CodecRegistry::builtin())
    }

    pub fn with_codecs(
        config: AppConfig,
        capture: Arc<dyn CaptureBackend>,
        connector: Arc<dyn Connector>,
        codecs: CodecRegistry,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::idle(&config.network.endpoint));
        let (overlay_output, _) = watch::channel(None);
        Self {
            inner: Arc::new(ControllerInner {
                config,
                capture,
                connector,
                codecs,
                status,
                lifecycle: Mutex::new(Lifecycle::Idle),
                stats: Mutex::new(StatsView::Empty),
                overlay_output: Arc::new(overlay_output),
                remote_surface: RemoteSurface::new(),
            }),
        }
    }

    /// Capture backend from the config, WebSocket transport
    pub fn from_config(config: AppConfig) -> Self {
        let capture: Arc<dyn CaptureBackend> = Arc::from(backend_from_config(&config.capture));
        Self::new(config, capture, Arc::new(WebSocketConnector))
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        match &*self.inner.stats.lock() {
            StatsView::Empty => SessionStats::default(),
            StatsView::Live(sources) => sources.snapshot(),
            StatsView::Final(stats) => stats.clone(),
        }
    }

    /// Local preview with detections drawn on top
    pub fn overlay_frames(&self) -> CompositeReceiver {
        self.inner.overlay_output.subscribe()
    }

    /// Frames decoded from the remote stream
    pub fn remote_frames(&self) -> RemoteFrameReceiver {
        self.inner.remote_surface.subscribe()
    }

    /// Start a session. Resolves once streaming, or with the error that
    /// prevented it; in the latter case nothing stays acquired.
    pub async fn start(&self) -> Result<Session> {
        let cancel = CancellationToken::new();
        let session = Session::new(&self.inner.config.network.endpoint);
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Idle) {
                return Err(SessionError::AlreadyActive.into());
            }
            *lifecycle = Lifecycle::Starting(cancel.clone());
            self.inner.status.send_modify(|s| {
                s.session_id = Some(session.id);
                s.state = SessionState::Initializing;
                s.connection = ConnectionState::Disconnected;
                s.endpoint = session.endpoint.clone();
                s.started_at = Some(session.started_at);
                s.reconnect_attempts = 0;
            });
        }
        tracing::info!("Starting session {} against {}", session.id, session.endpoint);

        let resources = match self.inner.initialize(&cancel).await {
            Ok(resources) => resources,
            Err(e @ Error::Session(SessionError::StartCancelled)) => {
                tracing::info!("Session {} start cancelled", session.id);
                self.inner.finish_start(None);
                return Err(e);
            }
            Err(e) => {
                tracing::error!("Session {} failed to start: {}", session.id, e);
                self.inner.finish_start(Some(&e));
                return Err(e);
            }
        };

        let cancelled = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if cancel.is_cancelled() {
                Some(resources)
            } else {
                *lifecycle = Lifecycle::Running(self.inner.launch(&session, resources, cancel));
                None
            }
        };
        if let Some(resources) = cancelled {
            resources.shutdown().await;
            self.inner.finish_start(None);
            return Err(SessionError::StartCancelled.into());
        }
        Ok(session)
    }

    /// Stop whatever is running or starting. Returns once everything is
    /// released; a no-op when idle.
    pub async fn stop(&self) {
        enum Pending {
            Nothing,
            WaitIdle,
            Join(ActiveSession),
        }

        let pending = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Idle;
                    Pending::Nothing
                }
                Lifecycle::Starting(cancel) => {
                    cancel.cancel();
                    *lifecycle = Lifecycle::Starting(cancel);
                    Pending::WaitIdle
                }
                Lifecycle::Stopping => Pending::WaitIdle,
                Lifecycle::Running(active) => {
                    self.inner.status.send_modify(|s| s.state = SessionState::Stopping);
                    active.cancel.cancel();
                    Pending::Join(active)
                }
            }
        };

        match pending {
            Pending::Nothing => {}
            Pending::WaitIdle => {
                let mut status = self.inner.status.subscribe();
                let _ = status.wait_for(|s| s.state == SessionState::Idle).await;
            }
            Pending::Join(active) => {
                tracing::info!("Stopping session {}", active.id);
                if let Err(e) = active.supervisor.await {
                    tracing::warn!("Session supervisor ended abnormally: {}", e);
                }
                let mut lifecycle = self.inner.lifecycle.lock();
                *lifecycle = Lifecycle::Idle;
                self.inner.publish_idle(None);
            }
        }
    }
}

impl ControllerInner {
    async fn initialize(&self, cancel: &CancellationToken) -> Result<Resources> {
        let constraints = CaptureConstraints::from(&self.config.capture);
        let mut capture = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::StartCancelled.into()),
            acquired = self.capture.acquire(&constraints) => acquired?,
        };
        tracing::info!("Capture acquired from {}", capture.backend());

        let encoder = match ChunkEncoder::negotiate(&self.codecs, &self.config.encoder) {
            Ok(encoder) => encoder,
            Err(e) => {
                capture.release();
                return Err(e.into());
            }
        };

        let (connection, mut events) =
            ConnectionManager::new(self.connector.clone(), self.config.network.send_queue_depth);
        let connection = Arc::new(connection);
        if let Err(e) = connection.connect(&self.config.network.endpoint) {
            capture.release();
            return Err(e.into());
        }

        let limit = self.config.network.startup_timeout();
        let outcome: Result<()> = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::StartCancelled.into()),
            waited = tokio::time::timeout(limit, self.await_connected(&mut events)) => match waited {
                Ok(connected) => connected.map_err(Error::from),
                Err(_) => Err(SessionError::StartupTimeout { waited_ms: limit.as_millis() as u64 }.into()),
            },
        };

        let resources = Resources {
            capture,
            encoder,
            connection,
            events,
        };
        match outcome {
            Ok(()) => Ok(resources),
            Err(e) => {
                resources.shutdown().await;
                Err(e)
            }
        }
    }

    async fn await_connected(
        &self,
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> std::result::Result<(), NetworkError> {
        let mut cause = None;
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::StateChanged(state) => {
                    self.status.send_modify(|s| s.connection = state);
                    if state == ConnectionState::Connected {
                        return Ok(());
                    }
                }
                ConnectionEvent::Error(e) => cause = Some(e),
                ConnectionEvent::Closed(info) => {
                    return Err(cause.unwrap_or_else(|| {
                        NetworkError::ConnectFailed(format!("closed during handshake (code {})", info.code))
                    }));
                }
                ConnectionEvent::Message(_) => {}
            }
        }
        Err(NetworkError::ConnectFailed("connection dropped before opening".into()))
    }

    /// Wire up the pipeline and hand everything to a supervisor task
    fn launch(self: &Arc<Self>, session: &Session, resources: Resources, cancel: CancellationToken) -> ActiveSession {
        let Resources {
            capture,
            encoder,
            connection,
            events,
        } = resources;

        let tap = capture.tap();
        let codec = encoder.codec();
        let encoder_counters = encoder.counters();
        let pump = OutboundPump::new(connection.clone());
        let pump_counters = pump.counters();
        let pump_task = tokio::spawn(pump.run(encoder.start(tap.clone())));

        let detections = DetectionStore::new();
        let renderer = OverlayRenderer::start(
            capture.preview(),
            Box::new(ImageSurface::new(self.overlay_output.clone())),
            detections.clone(),
            &self.config.render,
        );
        let mut playback = PlaybackBuffer::new();
        playback.attach(Box::new(DecodingSink::new(self.remote_surface.clone())));
        let dispatcher = InboundDispatcher::new();

        *self.stats.lock() = StatsView::Live(StatsSources {
            session_id: session.id,
            tap,
            encoder: encoder_counters,
            pump: pump_counters,
            connection: connection.clone(),
            inbound: dispatcher.counters(),
            playback: playback.counters(),
            overlay_frames: renderer.frames_rendered_handle(),
            detections: detections.clone(),
        });

        self.status.send_modify(|s| {
            s.state = SessionState::Streaming;
            s.connection = ConnectionState::Connected;
            s.last_error = None;
            s.reconnect_attempts = 0;
        });
        tracing::info!("Session {} streaming {} to {}", session.id, codec, session.endpoint);

        let supervisor = Supervisor {
            inner: self.clone(),
            session_id: session.id,
            endpoint: session.endpoint.clone(),
            cancel: cancel.clone(),
            capture,
            connection,
            events,
            pump: pump_task,
            pump_done: false,
            renderer,
            playback,
            dispatcher,
            detections,
            reconnect_attempts: 0,
            last_cause: None,
        };
        ActiveSession {
            id: session.id,
            cancel,
            supervisor: tokio::spawn(supervisor.run()),
        }
    }

    /// Failed or cancelled start: back to idle
    fn finish_start(&self, error: Option<&Error>) {
        let mut lifecycle = self.lifecycle.lock();
        *lifecycle = Lifecycle::Idle;
        self.publish_idle(error.map(|e| e.to_string()));
    }

    fn publish_idle(&self, error: Option<String>) {
        self.status.send_modify(|s| {
            s.session_id = None;
            s.state = SessionState::Idle;
            s.connection = ConnectionState::Disconnected;
            s.started_at = None;
            if error.is_some() {
                s.last_error = error;
            }
        });
    }

    fn freeze_stats(&self) {
        let mut view = self.stats.lock();
        if let StatsView::Live(sources) = &*view {
            *view = StatsView::Final(sources.snapshot());
        }
    }
}

enum Ending {
    Stopped,
    ClosedByServer,
    Failed(Error),
}

enum Step {
    Continue,
    Reconnect(Duration),
    End(Ending),
}

async fn reconnect_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Owns every resource of a running session
struct Supervisor {
    inner: Arc<ControllerInner>,
    session_id: Uuid,
    endpoint: String,
    cancel: CancellationToken,
    capture: LiveStream,
    connection: Arc<ConnectionManager>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pump: JoinHandle<PumpExit>,
    pump_done: bool,
    renderer: OverlayRenderer,
    playback: PlaybackBuffer,
    dispatcher: InboundDispatcher,
    detections: DetectionStore,
    reconnect_attempts: u32,
    last_cause: Option<NetworkError>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut timer: Option<Pin<Box<Sleep>>> = None;

        let ending = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break Ending::Stopped,

                exit = &mut self.pump, if !self.pump_done => {
                    self.pump_done = true;
                    break Ending::Failed(self.pump_failure(exit));
                }

                event = self.events.recv() => {
                    let Some(event) = event else {
                        break Ending::Failed(NetworkError::ConnectionLost("event channel closed".into()).into());
                    };
                    match self.on_event(event) {
                        Step::Continue => {}
                        Step::Reconnect(delay) => timer = Some(Box::pin(tokio::time::sleep(delay))),
                        Step::End(ending) => break ending,
                    }
                }

                _ = reconnect_timer(&mut timer) => {
                    timer = None;
                    if let Err(e) = self.reconnect() {
                        break Ending::Failed(e);
                    }
                }

                Some(message) = self.dispatcher.next(), if self.dispatcher.has_pending() => {
                    self.dispatcher.route(message, &mut self.playback, &self.detections);
                }
            }
        };

        self.teardown(ending).await;
    }

    fn on_event(&mut self, event: ConnectionEvent) -> Step {
        match event {
            ConnectionEvent::StateChanged(state) => {
                self.on_state(state);
                Step::Continue
            }
            ConnectionEvent::Message(payload) => {
                self.dispatcher.push(payload);
                Step::Continue
            }
            ConnectionEvent::Error(e) => {
                tracing::warn!("Connection error: {}", e);
                // Only errors that end the socket explain the closure that follows
                if matches!(
                    e,
                    NetworkError::ConnectFailed(_) | NetworkError::ConnectionLost(_) | NetworkError::SendFailed(_)
                ) {
                    self.last_cause = Some(e);
                }
                Step::Continue
            }
            ConnectionEvent::Closed(info) => self.on_closed(info),
        }
    }

    fn on_state(&mut self, state: ConnectionState) {
        if state == ConnectionState::Connected {
            if self.reconnect_attempts > 0 {
                tracing::info!("Reconnected after {} attempt(s)", self.reconnect_attempts);
            }
            self.reconnect_attempts = 0;
            self.last_cause = None;
        }
        self.inner.status.send_modify(|s| {
            s.connection = state;
            match (s.state, state) {
                (SessionState::Streaming | SessionState::Degraded, ConnectionState::Connected) => {
                    s.state = SessionState::Streaming;
                    s.reconnect_attempts = 0;
                    s.last_error = None;
                }
                (SessionState::Streaming, _) => s.state = SessionState::Degraded,
                _ => {}
            }
        });
    }

    fn on_closed(&mut self, info: CloseInfo) -> Step {
        if info.deliberate {
            return Step::Continue;
        }
        if !info.is_abnormal() {
            tracing::info!("Server ended the session (code {})", info.code);
            return Step::End(Ending::ClosedByServer);
        }

        let max = self.inner.config.network.max_reconnect_attempts;
        if self.reconnect_attempts >= max {
            return Step::End(Ending::Failed(
                SessionError::ReconnectExhausted {
                    attempts: self.reconnect_attempts,
                }
                .into(),
            ));
        }

        let cause = self
            .last_cause
            .take()
            .unwrap_or(NetworkError::AbnormalClosure { code: info.code });
        let delay = self.inner.config.network.reconnect_delay();
        tracing::warn!("{}; reconnecting in {} ms", cause, delay.as_millis());
        self.inner.status.send_modify(|s| {
            if s.state == SessionState::Streaming {
                s.state = SessionState::Degraded;
            }
            s.last_error = Some(cause.to_string());
        });
        Step::Reconnect(delay)
    }

    fn reconnect(&mut self) -> Result<()> {
        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;
        tracing::info!(
            "Reconnect attempt {}/{}",
            attempt,
            self.inner.config.network.max_reconnect_attempts
        );
        self.inner.status.send_modify(|s| s.reconnect_attempts = attempt);
        self.connection.connect(&self.endpoint)?;
        Ok(())
    }

    fn pump_failure(&self, exit: std::result::Result<PumpExit, JoinError>) -> Error {
        match exit {
            Ok(PumpExit::EncoderFailed(e)) => e.into(),
            Ok(PumpExit::StreamEnded) => match self.capture.check_errors() {
                Some(e) => e.into(),
                None => SessionError::CaptureEnded.into(),
            },
            Err(e) => {
                tracing::error!("Outbound pump task failed: {}", e);
                SessionError::CaptureEnded.into()
            }
        }
    }

    /// Release everything, whatever the reason for ending
    async fn teardown(mut self, ending: Ending) {
        let last_error = match &ending {
            Ending::Failed(e) => {
                tracing::error!("Session {} failed: {}", self.session_id, e);
                Some(e.to_string())
            }
            Ending::ClosedByServer | Ending::Stopped => None,
        };
        self.inner.status.send_modify(|s| {
            s.state = SessionState::Stopping;
            if last_error.is_some() {
                s.last_error = last_error.clone();
            }
        });

        self.renderer.stop().await;
        self.inner.overlay_output.send_replace(None);
        if !self.pump_done {
            self.pump.abort();
        }
        self.playback.finalize();
        self.detections.clear();
        self.connection.close(CLOSE_NORMAL).await;
        self.capture.release();
        self.inner.freeze_stats();

        // A stop request resets the lifecycle itself once this task is joined
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if matches!(&*lifecycle, Lifecycle::Running(active) if active.id == self.session_id) {
                *lifecycle = Lifecycle::Idle;
                self.inner.publish_idle(last_error);
            }
        }
        tracing::info!("Session {} ended", self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::FakeCapture;
    use crate::error::{CaptureError, CodecError};
    use crate::network::testing::{FakeConnector, FakeServer, Outcome};
    use crate::network::WireMessage;
    use tokio::time::Instant;

    const ENDPOINT: &str = "ws://test.local/ws";

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.network.endpoint = ENDPOINT.into();
        config.capture.width = 16;
        config.capture.height = 16;
        config
    }

    fn controller(capture: &Arc<FakeCapture>, connector: &Arc<FakeConnector>) -> SessionController {
        SessionController::new(config(), capture.clone(), connector.clone())
    }

    async fn wait_for_state(controller: &SessionController, state: SessionState) -> SessionStatus {
        let mut rx = controller.subscribe();
        let status = rx.wait_for(|s| s.state == state).await.unwrap().clone();
        status
    }

    /// Drain a server until the client side goes away
    async fn received(mut server: FakeServer) -> Vec<WireMessage> {
        let mut messages = Vec::new();
        while let Some(msg) = server.recv().await {
            messages.push(msg);
        }
        messages
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);

        let session = controller.start().await.unwrap();
        let status = controller.status();
        assert_eq!(status.state, SessionState::Streaming);
        assert_eq!(status.connection, ConnectionState::Connected);
        assert_eq!(status.session_id, Some(session.id));
        assert_eq!(capture.acquired(), 1);

        let server = connector.next_server().await;
        let mut overlay = controller.overlay_frames();
        capture.publish(16, 16);
        overlay.wait_for(|c| c.is_some()).await.unwrap();
        controller.stop().await;

        assert_eq!(controller.status().state, SessionState::Idle);
        assert_eq!(controller.status().connection, ConnectionState::Disconnected);
        assert_eq!(capture.released(), 1);
        assert!(controller.overlay_frames().borrow().is_none());
        let messages = received(server).await;
        assert!(messages
            .iter()
            .all(|m| matches!(m, WireMessage::Binary(_) | WireMessage::Close(Some(1000)))));
        assert_eq!(messages.iter().filter(|m| matches!(m, WireMessage::Close(_))).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_releases_once() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);

        controller.start().await.unwrap();
        let server = connector.next_server().await;
        controller.stop().await;
        controller.stop().await;

        assert_eq!(capture.released(), 1);
        let closes = received(server)
            .await
            .into_iter()
            .filter(|m| matches!(m, WireMessage::Close(_)))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(controller.status().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stops_while_streaming() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);

        controller.start().await.unwrap();
        let server = connector.next_server().await;
        tokio::join!(controller.stop(), controller.stop());

        assert_eq!(controller.status().state, SessionState::Idle);
        assert_eq!(capture.released(), 1);
        let closes = received(server)
            .await
            .into_iter()
            .filter(|m| matches!(m, WireMessage::Close(_)))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stops_while_degraded() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);

        controller.start().await.unwrap();
        drop(connector.next_server().await);
        wait_for_state(&controller, SessionState::Degraded).await;

        tokio::join!(controller.stop(), controller.stop());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(controller.status().state, SessionState::Idle);
        assert_eq!(capture.released(), 1);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_idle_is_noop() {
        let controller = controller(&FakeCapture::new(), &FakeConnector::new());
        controller.stop().await;
        assert_eq!(controller.status().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);

        controller.start().await.unwrap();
        assert!(matches!(
            controller.start().await,
            Err(Error::Session(SessionError::AlreadyActive))
        ));
        assert_eq!(capture.acquired(), 1);
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);

        let first = controller.start().await.unwrap();
        controller.stop().await;
        let second = controller.start().await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(capture.acquired(), 2);
        controller.stop().await;
        assert_eq!(capture.released(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_refused() {
        let capture = FakeCapture::refusing(CaptureError::PermissionDenied("camera".into()));
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, Error::Capture(CaptureError::PermissionDenied(_))));
        assert_eq!(connector.attempts(), 0);

        let status = controller.status();
        assert_eq!(status.state, SessionState::Idle);
        assert!(status.last_error.unwrap().contains("Permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_supported_codec() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = SessionController::with_codecs(
            config(),
            capture.clone(),
            connector.clone(),
            CodecRegistry::with_supported([]),
        );

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, Error::Codec(CodecError::EncodingUnsupported(_))));
        assert_eq!(capture.released(), 1);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_refused_is_fatal() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::with_outcomes([Outcome::Refuse]);
        let controller = controller(&capture, &connector);

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::ConnectFailed(_))));
        assert_eq!(capture.released(), 1);
        assert_eq!(connector.attempts(), 1);
        assert_eq!(controller.status().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::with_outcomes([Outcome::Hang]);
        let controller = controller(&capture, &connector);

        let began = Instant::now();
        let err = controller.start().await.unwrap_err();

        assert!(matches!(
            err,
            Error::Session(SessionError::StartupTimeout { waited_ms: 5000 })
        ));
        assert!(began.elapsed() >= Duration::from_millis(5000));
        assert_eq!(capture.released(), 1);
        assert_eq!(controller.status().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_completes() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::with_outcomes([Outcome::Hang]);
        let controller = controller(&capture, &connector);

        let starting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.start().await }
        });
        let mut rx = controller.subscribe();
        rx.wait_for(|s| s.connection == ConnectionState::Connecting)
            .await
            .unwrap();

        tokio::join!(controller.stop(), controller.stop());

        assert_eq!(controller.status().state, SessionState::Idle);
        assert_eq!(capture.released(), 1);
        assert!(matches!(
            starting.await.unwrap(),
            Err(Error::Session(SessionError::StartCancelled))
        ));
        assert!(controller.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_delay() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);
        controller.start().await.unwrap();

        let lost_at = Instant::now();
        drop(connector.next_server().await);

        let mut rx = controller.subscribe();
        let degraded = rx
            .wait_for(|s| s.state == SessionState::Degraded && s.last_error.is_some())
            .await
            .unwrap()
            .clone();
        assert_ne!(degraded.connection, ConnectionState::Connected);

        let _server = connector.next_server().await;
        let recovered = wait_for_state(&controller, SessionState::Streaming).await;
        assert_eq!(recovered.connection, ConnectionState::Connected);
        assert!(recovered.last_error.is_none());

        let attempts = connector.attempt_times();
        assert_eq!(attempts.len(), 2);
        let waited = attempts[1] - lost_at;
        assert!(waited >= Duration::from_millis(3000), "reconnected after {:?}", waited);
        assert!(waited < Duration::from_millis(3100), "reconnected after {:?}", waited);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts(), 2);
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_is_not_reported_as_closure_cause() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);
        controller.start().await.unwrap();

        let server = connector.next_server().await;
        server.push_error(NetworkError::ReceiveError("garbled frame".into()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.status().state, SessionState::Streaming);
        drop(server);

        let mut rx = controller.subscribe();
        let degraded = rx
            .wait_for(|s| s.state == SessionState::Degraded && s.last_error.is_some())
            .await
            .unwrap()
            .clone();
        assert_eq!(
            degraded.last_error.as_deref(),
            Some("Connection closed abnormally (code 1006)")
        );
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_reconnect() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);
        controller.start().await.unwrap();

        drop(connector.next_server().await);
        wait_for_state(&controller, SessionState::Degraded).await;

        tokio::time::sleep(Duration::from_millis(1000)).await;
        controller.stop().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(connector.attempts(), 1);
        assert_eq!(capture.released(), 1);
        assert_eq!(controller.status().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_attempts_are_bounded() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::with_outcomes([Outcome::Accept, Outcome::Refuse, Outcome::Refuse]);
        let mut config = config();
        config.network.max_reconnect_attempts = 2;
        let controller = SessionController::new(config, capture.clone(), connector.clone());
        controller.start().await.unwrap();

        drop(connector.next_server().await);
        let status = wait_for_state(&controller, SessionState::Idle).await;

        assert_eq!(connector.attempts(), 3);
        assert_eq!(capture.released(), 1);
        assert_eq!(
            status.last_error.as_deref(),
            Some("Session error: Gave up after 2 reconnect attempts")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_session_drops_chunks() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);
        controller.start().await.unwrap();

        drop(connector.next_server().await);
        wait_for_state(&controller, SessionState::Degraded).await;

        capture.publish(16, 16);
        tokio::time::sleep(Duration::from_millis(600)).await;
        let stats = controller.stats();
        assert!(stats.pump.chunks_dropped >= 1);
        assert_eq!(stats.pump.chunks_sent, 0);

        // After recovery only fresh chunks go out
        let mut server = connector.next_server().await;
        wait_for_state(&controller, SessionState::Streaming).await;
        capture.publish(16, 16);
        match server.recv().await {
            Some(WireMessage::Binary(data)) => assert_eq!(&data[..2], &[0xFF, 0xD8]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(controller.stats().pump.chunks_sent, 1);
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_detections_reach_overlay_store() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);
        controller.start().await.unwrap();

        let server = connector.next_server().await;
        server.push(WireMessage::Text(
            r#"[{"id":1,"label":"cat","box":[10,20,100,80],"confidence":0.92}]"#.into(),
        ));
        server.push(WireMessage::Text("not json".into()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = controller.stats();
        assert_eq!(stats.inbound.detection_sets, 1);
        assert_eq!(stats.inbound.unrecognized, 1);
        assert_eq!(stats.detection_updates, 1);
        assert_eq!(controller.status().state, SessionState::Streaming);
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_ends_session_without_reconnect() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);
        controller.start().await.unwrap();

        connector.next_server().await.push(WireMessage::Close(Some(1000)));
        let status = wait_for_state(&controller, SessionState::Idle).await;

        assert!(status.last_error.is_none());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(capture.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_loss_is_fatal() {
        let capture = FakeCapture::new();
        let connector = FakeConnector::new();
        let controller = controller(&capture, &connector);
        controller.start().await.unwrap();
        let server = connector.next_server().await;

        capture.feed().close();
        let status = wait_for_state(&controller, SessionState::Idle).await;

        assert_eq!(
            status.last_error.as_deref(),
            Some("Session error: Capture ended unexpectedly")
        );
        assert_eq!(capture.released(), 1);
        let messages = received(server).await;
        assert!(matches!(messages.last(), Some(WireMessage::Close(Some(1000)))));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            DropSocket,
            ServerClose,
            Wait(u64),
            Stop,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                3 => Just(Op::DropSocket),
                1 => Just(Op::ServerClose),
                4 => (1u64..5000).prop_map(Op::Wait),
                1 => Just(Op::Stop),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn never_streaming_while_disconnected(ops in proptest::collection::vec(op(), 1..12)) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
                    .unwrap();

                let observed = runtime.block_on(async move {
                    let capture = FakeCapture::new();
                    let connector = FakeConnector::new();
                    let controller = controller(&capture, &connector);

                    let mut rx = controller.subscribe();
                    let watcher = tokio::spawn(async move {
                        let mut seen = vec![rx.borrow_and_update().clone()];
                        while rx.changed().await.is_ok() {
                            seen.push(rx.borrow_and_update().clone());
                        }
                        seen
                    });

                    controller.start().await.unwrap();
                    let mut server = None;
                    for op in ops {
                        if let Some(next) = connector.try_next_server() {
                            server = Some(next);
                        }
                        match op {
                            Op::DropSocket => drop(server.take()),
                            Op::ServerClose => {
                                if let Some(server) = &server {
                                    server.push(WireMessage::Close(Some(1000)));
                                }
                            }
                            Op::Wait(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                            Op::Stop => controller.stop().await,
                        }
                        tokio::task::yield_now().await;
                    }
                    controller.stop().await;
                    let released = capture.released();
                    drop(controller);
                    (watcher.await.unwrap(), released, capture.acquired())
                });

                let (statuses, released, acquired) = observed;
                for status in &statuses {
                    if status.state == SessionState::Streaming {
                        prop_assert_eq!(status.connection, ConnectionState::Connected);
                    }
                }
                prop_assert_eq!(statuses.last().map(|s| s.state), Some(SessionState::Idle));
                prop_assert_eq!(released, acquired);
            }
        }
    }
}
