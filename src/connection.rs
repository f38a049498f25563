use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use dashmap::DashSet;
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::credentials::{wait_for_credentials, CredentialStore};
use crate::registry::SubscriptionRegistry;
use crate::sockjs::{self, SockJsError};
use crate::stomp::{self, Command, Frame, HeartBeat, Negotiated, StompError};
use crate::transport::{Connector, Duplex, TransportError};
use crate::types::{Envelope, EnvelopeError, EnvelopeShape};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const ENDPOINT: &str = "/ws";

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid endpoint: {0}")]
    Url(#[from] SockJsError),
    #[error("malformed frame: {0}")]
    Frame(#[from] StompError),
    #[error("server rejected the session: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub ws_base_url: String,
    pub endpoint: String,
    pub sockjs: bool,
    pub host: String,
    pub reconnect_delay: Duration,
    pub heartbeat: Duration,
    pub credential_poll_interval: Duration,
    pub event_channels: bool,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        let host = Url::parse(&config.ws_base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".into());
        Self {
            ws_base_url: config.ws_base_url.clone(),
            endpoint: ENDPOINT.into(),
            sockjs: config.ws_sockjs,
            host,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            heartbeat: Duration::from_millis(config.heartbeat_ms),
            credential_poll_interval: Duration::from_millis(config.credential_poll_ms),
            event_channels: config.event_channels,
        }
    }

    // SockJS needs a fresh session path for every attempt.
    fn url(&self) -> Result<Url, SockJsError> {
        sockjs::websocket_url(&self.ws_base_url, &self.endpoint, self.sockjs)
    }
}

pub fn channel_destination(channel: &str) -> String {
    format!("/topic/channel/{channel}")
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct SessionHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

#[derive(Debug)]
enum SessionCommand {
    Subscribe(String),
    Unsubscribe(String),
    Restart,
}

enum SessionEnd {
    Cancelled,
    Restart,
    Failed(ConnectError),
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<SubscriptionRegistry>,
    state: watch::Sender<ConnectionState>,
    supervisor: Mutex<Option<Supervisor>>,
    session: Mutex<Option<SessionHandle>>,
    // bumped by every connect and disconnect; stale supervisors stop publishing
    generation: AtomicU64,
    channels: DashSet<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_running(supervisor: &Option<Supervisor>) -> bool {
    supervisor.as_ref().is_some_and(|s| !s.task.is_finished())
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            settings,
            connector,
            credentials,
            registry,
            state,
            supervisor: Mutex::new(None),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            channels: DashSet::new(),
        })
    }

    /// Resolves once the session is up and subscribed. A failed first attempt
    /// is returned while reconnection continues in the background.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        let ready = {
            let mut supervisor = lock(&self.supervisor);
            if is_running(&supervisor) {
                return match self.state() {
                    ConnectionState::Connected => Ok(()),
                    _ => Err(ConnectError::AlreadyConnecting),
                };
            }
            self.start(&mut supervisor)
        };

        ready.await.unwrap_or(Err(ConnectError::Cancelled))
    }

    // caller holds the supervisor lock, so a following disconnect() always
    // sees the new supervisor
    fn start(
        self: &Arc<Self>,
        supervisor: &mut Option<Supervisor>,
    ) -> oneshot::Receiver<Result<(), ConnectError>> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(self.clone().supervise(generation, cancel.clone(), ready_tx));
        *supervisor = Some(Supervisor { cancel, task });
        ready_rx
    }

    /// Tears everything down: the session, any pending wait or reconnect,
    /// ad-hoc channels and every registered handler.
    pub fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(supervisor) = lock(&self.supervisor).take() {
            supervisor.cancel.cancel();
        }
        lock(&self.session).take();
        self.channels.clear();
        self.registry.clear();
        self.publish(ConnectionState::Disconnected);
        info!("realtime connection closed");
    }

    /// Drops the live session and connects again with freshly read
    /// credentials. Handlers and channels are kept.
    pub fn reconnect(self: &Arc<Self>) {
        if self.send_command(SessionCommand::Restart) {
            return;
        }
        let mut supervisor = lock(&self.supervisor);
        if !is_running(&supervisor) {
            debug!("no live session, starting one");
            drop(self.start(&mut supervisor));
        }
    }

    pub fn get_connection_status(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_channel(&self, channel: &str) {
        let destination = channel_destination(channel);
        if self.channels.insert(destination.clone()) {
            self.send_command(SessionCommand::Subscribe(destination));
        }
    }

    pub fn unsubscribe_channel(&self, channel: &str) {
        let destination = channel_destination(channel);
        if self.channels.remove(&destination).is_some() {
            self.send_command(SessionCommand::Unsubscribe(destination));
        }
    }

    fn send_command(&self, command: SessionCommand) -> bool {
        match lock(&self.session).as_ref() {
            Some(handle) => handle.commands.send(command).is_ok(),
            None => false,
        }
    }

    fn publish(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "connection state changed");
            *current = next;
            true
        });
    }

    fn publish_for(&self, generation: u64, next: ConnectionState) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.publish(next);
        }
    }

    fn clear_session(&self, generation: u64) {
        let mut session = lock(&self.session);
        if session.as_ref().is_some_and(|h| h.generation == generation) {
            session.take();
        }
    }

    async fn supervise(
        self: Arc<Self>,
        generation: u64,
        cancel: CancellationToken,
        ready: oneshot::Sender<Result<(), ConnectError>>,
    ) {
        let mut ready = Some(ready);

        loop {
            self.publish_for(generation, ConnectionState::Connecting);
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.establish(generation) => result,
            };

            let delay = match attempt {
                Ok(mut session) => {
                    self.publish_for(generation, ConnectionState::Connected);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }

                    let end = self.run_session(&mut session, &cancel).await;
                    self.clear_session(generation);
                    match end {
                        SessionEnd::Cancelled => {
                            let _ = session.send(&Frame::disconnect()).await;
                            break;
                        }
                        SessionEnd::Restart => {
                            info!("restarting realtime session");
                            let _ = session.send(&Frame::disconnect()).await;
                            self.settings.credential_poll_interval
                        }
                        SessionEnd::Failed(e) => {
                            warn!(error = %e, "realtime session lost");
                            self.settings.reconnect_delay
                        }
                    }
                }
                Err(e) => {
                    self.clear_session(generation);
                    warn!(error = %e, "realtime connect failed");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e));
                    }
                    self.settings.reconnect_delay
                }
            };

            self.publish_for(generation, ConnectionState::Disconnected);
            debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.clear_session(generation);
        self.publish_for(generation, ConnectionState::Disconnected);
        debug!(generation, "connection supervisor stopped");
    }

    async fn establish(&self, generation: u64) -> Result<Session, ConnectError> {
        let credentials =
            wait_for_credentials(self.credentials.as_ref(), self.settings.credential_poll_interval)
                .await;

        let url = self.settings.url()?;
        debug!(%url, "opening realtime transport");
        let mut duplex = self.connector.open(&url).await?;

        let heart_beat = HeartBeat::symmetric(self.settings.heartbeat);
        let connect = Frame::connect(&self.settings.host, &credentials.token, heart_beat);
        send_frame(&duplex, &connect).await?;

        let server_beat = tokio::time::timeout(CONNECT_TIMEOUT, await_connected(&mut duplex))
            .await
            .map_err(|_| TransportError::Timeout("CONNECTED frame"))??;
        let negotiated = HeartBeat::negotiate(heart_beat, server_beat);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        *lock(&self.session) = Some(SessionHandle {
            generation,
            commands: commands_tx,
        });

        let mut session = Session::new(duplex, negotiated, commands_rx);
        let user = &credentials.user_id;
        session
            .subscribe(&format!("/user/{user}/queue/refresh"), EnvelopeShape::Refresh)
            .await?;
        if self.settings.event_channels {
            session
                .subscribe(&format!("/topic/user/{user}"), EnvelopeShape::Event)
                .await?;
            session
                .subscribe("/topic/broadcast", EnvelopeShape::Event)
                .await?;
        }
        let channels: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        for destination in channels {
            session.subscribe(&destination, EnvelopeShape::Event).await?;
        }

        info!(user_id = %user, subscriptions = session.subscriptions.len(), "realtime connected");
        Ok(session)
    }

    async fn run_session(&self, session: &mut Session, cancel: &CancellationToken) -> SessionEnd {
        let mut heartbeat = session.negotiated.send_every.map(|every| {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let silence_limit = session.negotiated.expect_within.map(|d| d * 2);
        let mut last_inbound = Instant::now();

        loop {
            let deadline = silence_limit.map(|limit| last_inbound + limit);
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                _ = next_tick(&mut heartbeat) => {
                    if let Err(e) = session.send_raw("\n".into()).await {
                        return SessionEnd::Failed(e.into());
                    }
                }
                _ = expire(deadline) => {
                    return SessionEnd::Failed(TransportError::Timeout("server heart-beat").into());
                }
                Some(command) = session.commands.recv() => {
                    let result = match command {
                        SessionCommand::Subscribe(destination) => {
                            session.subscribe(&destination, EnvelopeShape::Event).await
                        }
                        SessionCommand::Unsubscribe(destination) => {
                            session.unsubscribe(&destination).await
                        }
                        SessionCommand::Restart => return SessionEnd::Restart,
                    };
                    if let Err(e) = result {
                        return SessionEnd::Failed(e.into());
                    }
                }
                inbound = session.duplex.inbound.recv() => match inbound {
                    Some(Ok(text)) => {
                        last_inbound = Instant::now();
                        if let Err(e) = self.handle_inbound(session, &text) {
                            return SessionEnd::Failed(e);
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e.into()),
                    None => {
                        return SessionEnd::Failed(
                            TransportError::Closed("transport dropped".into()).into(),
                        )
                    }
                },
            }
        }
    }

    fn handle_inbound(&self, session: &Session, text: &str) -> Result<(), ConnectError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let frames = match stomp::decode_all(text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "dropping undecodable stomp payload");
                return Ok(());
            }
        };

        for frame in frames {
            match frame.command {
                Command::Message => self.dispatch_message(session, &frame),
                Command::Error => return Err(ConnectError::Protocol(error_message(&frame))),
                other => debug!(command = other.as_str(), "ignoring stomp frame"),
            }
        }
        Ok(())
    }

    fn dispatch_message(&self, session: &Session, frame: &Frame) {
        let destination = frame.get("destination").unwrap_or_default();
        let Some(shape) = session.shape_for(frame.get("subscription"), destination) else {
            debug!(destination, "message for unknown subscription");
            return;
        };

        match Envelope::parse(shape, &frame.body) {
            Ok(envelope) => {
                let handled = self.registry.dispatch(&envelope);
                debug!(destination, feature = ?envelope.target(), handled, "push dispatched");
            }
            Err(EnvelopeError::UnknownTarget(target)) => {
                debug!(destination, feature = %target, "dropping push for unknown target");
            }
            Err(e) => warn!(destination, error = %e, "dropping malformed push"),
        }
    }
}

struct Session {
    duplex: Duplex,
    negotiated: Negotiated,
    // subscription id -> (destination, shape)
    subscriptions: HashMap<String, (String, EnvelopeShape)>,
    next_id: usize,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl Session {
    fn new(
        duplex: Duplex,
        negotiated: Negotiated,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        Self {
            duplex,
            negotiated,
            subscriptions: HashMap::new(),
            next_id: 0,
            commands,
        }
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        send_frame(&self.duplex, frame).await
    }

    async fn send_raw(&self, text: String) -> Result<(), TransportError> {
        self.duplex
            .outbound
            .send(text)
            .await
            .map_err(|_| TransportError::Closed("outbound channel closed".into()))
    }

    async fn subscribe(&mut self, destination: &str, shape: EnvelopeShape) -> Result<(), TransportError> {
        if self.subscriptions.values().any(|(d, _)| d == destination) {
            return Ok(());
        }
        let id = format!("sub-{}", self.next_id);
        self.next_id += 1;
        self.send(&Frame::subscribe(&id, destination)).await?;
        debug!(subscription = %id, destination, "subscribed");
        self.subscriptions.insert(id, (destination.to_string(), shape));
        Ok(())
    }

    async fn unsubscribe(&mut self, destination: &str) -> Result<(), TransportError> {
        let id = self
            .subscriptions
            .iter()
            .find(|(_, (d, _))| d == destination)
            .map(|(id, _)| id.clone());
        if let Some(id) = id {
            self.subscriptions.remove(&id);
            self.send(&Frame::unsubscribe(&id)).await?;
            debug!(subscription = %id, destination, "unsubscribed");
        }
        Ok(())
    }

    fn shape_for(&self, subscription: Option<&str>, destination: &str) -> Option<EnvelopeShape> {
        subscription
            .and_then(|id| self.subscriptions.get(id))
            .or_else(|| self.subscriptions.values().find(|(d, _)| d == destination))
            .map(|(_, shape)| *shape)
    }
}

async fn send_frame(duplex: &Duplex, frame: &Frame) -> Result<(), TransportError> {
    duplex
        .outbound
        .send(frame.encode())
        .await
        .map_err(|_| TransportError::Closed("outbound channel closed".into()))
}

async fn await_connected(duplex: &mut Duplex) -> Result<HeartBeat, ConnectError> {
    loop {
        let text = match duplex.inbound.recv().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(TransportError::Closed("closed before CONNECTED".into()).into()),
        };
        for frame in stomp::decode_all(&text)? {
            match frame.command {
                Command::Connected => {
                    return Ok(frame
                        .get("heart-beat")
                        .and_then(HeartBeat::parse)
                        .unwrap_or_default())
                }
                Command::Error => return Err(ConnectError::Protocol(error_message(&frame))),
                other => debug!(command = other.as_str(), "frame before CONNECTED ignored"),
            }
        }
    }
}

fn error_message(frame: &Frame) -> String {
    frame
        .get("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.trim_end().to_string())
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
