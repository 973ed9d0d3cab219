//! Resilient device connection manager.
//!
//! [`DeviceClient`] owns at most one live WebSocket at a time together with
//! three kinds of background work:
//!
//! - the connect loop, retried at a fixed interval until it succeeds or the
//!   client is shut down,
//! - one receive loop per connection, which delivers messages to the
//!   subscribers and starts a fresh connect when the transport fails,
//! - a heartbeat timer that sends through the regular send path.
//!
//! The connection slot lives inside the [`SendGate`], so a sender either
//! sees the current transport or nothing; a retired transport is never
//! visible to `send`. Every installed transport gets a new generation
//! number, which lets a finishing receive loop tell whether it still owns
//! the connection before it triggers a reconnect.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use super::connector::{Connector, WsConnector, WsStream};
use super::gate::{GateError, SendGate};
use super::state::ConnectionState;
use super::subscribers::{SubscriptionId, Subscribers};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::{MessageKind, OutboundMessage};

/// Bound on the graceful close of a retired transport.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// The write half of the current transport.
struct Link {
    generation: u64,
    sink: WsSink,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

struct Inner {
    config: ClientConfig,
    ws_url: String,
    connector: Box<dyn Connector>,
    link: SendGate<Option<Link>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    subscribers: Subscribers,
}

/// Long-lived, self-healing connection to a device controller.
///
/// Must be created inside a Tokio runtime. Call [`DeviceClient::shutdown`]
/// when done; dropping the client stops all background work as well but
/// skips the graceful close of the socket.
pub struct DeviceClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClient")
            .field("url", &self.inner.ws_url)
            .field("state", &self.inner.state())
            .field("shut_down", &self.inner.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl DeviceClient {
    /// Creates a client for the device at `config.device_url`.
    ///
    /// No connection is made until [`DeviceClient::connect`] is called; the
    /// heartbeat timer starts right away and stays idle while disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidAddress`] if the device address has no
    /// host and [`ClientError::InvalidConfig`] if an interval is zero.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_connector(config, WsConnector)
    }

    /// Creates a client that establishes transports through `connector`.
    ///
    /// # Errors
    ///
    /// See [`DeviceClient::new`].
    pub fn with_connector<C: Connector>(
        config: ClientConfig,
        connector: C,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let ws_url = config.ws_url()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let heartbeat_interval = config.heartbeat_interval;

        let inner = Arc::new(Inner {
            config,
            ws_url,
            connector: Box::new(connector),
            link: SendGate::new(None),
            reader: Mutex::new(None),
            heartbeat: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            state,
            shutdown,
            subscribers: Subscribers::new(),
        });

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::downgrade(&inner),
            heartbeat_interval,
            inner.shutdown.subscribe(),
        ));
        *inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(heartbeat);

        Ok(Self { inner })
    }

    /// Drops any current transport and connects again, retrying at the
    /// configured interval until a transport is up. Returns once the
    /// handshake has been sent.
    ///
    /// Connection failures are logged and retried, never returned.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ShutDown`] if the client is shut down before
    /// or while connecting; the state is then left
    /// [`ConnectionState::Disconnected`]. Returns the send error if the
    /// handshake could not be written (the receive loop takes care of the
    /// broken transport).
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.connect(None).await
    }

    /// Writes one message as a single text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] if there is no live transport
    /// or the client is shut down, [`ClientError::SendTimeout`] if the send
    /// gate stays busy past the configured bound, and
    /// [`ClientError::Transport`] if the write itself fails.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), ClientError> {
        self.inner.send(message).await
    }

    /// Sends arbitrary text as a command.
    ///
    /// # Errors
    ///
    /// See [`DeviceClient::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.inner.send(OutboundMessage::command(text)).await
    }

    /// Stops reconnecting, stops the heartbeat and closes the transport.
    ///
    /// Idempotent. Close errors are logged and swallowed. Every later
    /// `send` fails with [`ClientError::NotConnected`].
    pub async fn shutdown(&self) {
        if !self.inner.begin_shutdown() {
            return;
        }
        if tokio::time::timeout(self.inner.config.send_timeout, self.inner.teardown())
            .await
            .is_err()
        {
            tracing::warn!("transport still busy at shutdown; abandoning it");
        }
        tracing::info!(url = %self.inner.ws_url, "device client shut down");
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Returns `true` while a transport is installed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state().is_connected()
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// WebSocket endpoint this client connects to.
    #[must_use]
    pub fn ws_url(&self) -> &str {
        &self.inner.ws_url
    }

    /// Registers a handler for every complete inbound message.
    ///
    /// Handlers run on the receive loop, one message at a time; they should
    /// return quickly and spawn any async follow-up work (see
    /// [`DeviceClient::sender`]).
    pub fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.subscribers.on_message(handler)
    }

    /// Registers a handler for every state transition.
    pub fn on_state_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.subscribers.on_state_change(handler)
    }

    /// Registers a handler called whenever the client becomes connected or
    /// stops being connected.
    pub fn on_connectivity_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.subscribers.on_connectivity_change(handler)
    }

    /// Removes a handler registered on this client.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    /// Cloneable send handle that does not keep the client alive.
    #[must_use]
    pub fn sender(&self) -> ClientSender {
        ClientSender {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Drop for DeviceClient {
    fn drop(&mut self) {
        self.inner.begin_shutdown();
    }
}

/// Weak send handle for subscribers that need to reply.
#[derive(Clone)]
pub struct ClientSender {
    inner: Weak<Inner>,
}

impl fmt::Debug for ClientSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSender")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl ClientSender {
    /// Sends through the originating client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] if the client is gone, otherwise
    /// the same errors as [`DeviceClient::send`].
    pub async fn send(&self, message: OutboundMessage) -> Result<(), ClientError> {
        match self.inner.upgrade() {
            Some(inner) => inner.send(message).await,
            None => Err(ClientError::NotConnected),
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stores `next`, returning the previous state if it changed. Once shut
    /// down, only `Disconnected` is accepted.
    fn set_state(&self, next: ConnectionState) -> Option<ConnectionState> {
        if self.is_shut_down() && next != ConnectionState::Disconnected {
            return None;
        }
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = Some(std::mem::replace(current, next));
            true
        });
        previous
    }

    fn announce(&self, previous: Option<ConnectionState>, next: ConnectionState) {
        if let Some(previous) = previous {
            tracing::debug!(from = %previous, to = %next, "connection state changed");
            self.subscribers.publish_state(previous, next);
        }
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.set_state(next);
        self.announce(previous, next);
    }

    /// Connect sequence. With `superseded_after` set, this is a reconnect
    /// started by the receive loop of that generation and is skipped when a
    /// newer connection has been installed meanwhile.
    async fn connect(self: &Arc<Self>, superseded_after: Option<u64>) -> Result<(), ClientError> {
        let _attempt = self.connect_lock.lock().await;
        if self.is_shut_down() {
            return Err(ClientError::ShutDown);
        }
        if let Some(generation) = superseded_after
            && self.generation.load(Ordering::Acquire) != generation
        {
            tracing::debug!(generation, "reconnect superseded by a newer connection");
            return Ok(());
        }

        tracing::info!(url = %self.ws_url, "connecting");
        self.teardown().await;
        self.transition(ConnectionState::Disconnected);

        let stream = self.establish().await?;
        match self.install(stream).await {
            Ok(()) => Ok(()),
            Err(_) if self.is_shut_down() => Err(ClientError::ShutDown),
            Err(err) => {
                tracing::warn!(error = %err, "failed to send handshake");
                Err(err)
            }
        }
    }

    /// Retries the connector until it yields a stream or shutdown is
    /// requested.
    async fn establish(&self) -> Result<WsStream, ClientError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u64 = 0;
        loop {
            if self.is_shut_down() {
                self.transition(ConnectionState::Disconnected);
                return Err(ClientError::ShutDown);
            }
            self.transition(ConnectionState::Connecting);
            attempt += 1;

            let result = tokio::select! {
                result = self.connector.connect(&self.ws_url) => result,
                () = shutdown_requested(&mut shutdown) => {
                    tracing::debug!(attempt, "connection attempt cancelled by shutdown");
                    self.transition(ConnectionState::Disconnected);
                    return Err(ClientError::ShutDown);
                }
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(err) => tracing::warn!(
                    url = %self.ws_url,
                    attempt,
                    error = %err,
                    retry_in = ?self.config.connect_retry_interval,
                    "failed to connect, retrying"
                ),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.connect_retry_interval) => {}
                () = shutdown_requested(&mut shutdown) => {
                    tracing::debug!(attempt, "retry delay cancelled by shutdown");
                    self.transition(ConnectionState::Disconnected);
                    return Err(ClientError::ShutDown);
                }
            }
        }
    }

    /// Makes `stream` the current transport, starts its receive loop and
    /// writes the handshake. The gate is held throughout, so no other send
    /// reaches the transport before the handshake.
    async fn install(self: &Arc<Self>, stream: WsStream) -> Result<(), ClientError> {
        let (mut sink, source) = stream.split();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let mut slot = self.link.lock().await;
        if self.is_shut_down() {
            drop(slot);
            close_sink(sink, generation).await;
            self.transition(ConnectionState::Disconnected);
            return Err(ClientError::ShutDown);
        }
        let reader = tokio::spawn(Arc::clone(self).receive_loop(source, generation));
        let stale = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(reader);
        if let Some(stale) = stale {
            stale.abort();
        }
        // A drop that raced the check above did not see the new reader.
        if self.is_shut_down() {
            self.abort_reader();
            drop(slot);
            close_sink(sink, generation).await;
            self.transition(ConnectionState::Disconnected);
            return Err(ClientError::ShutDown);
        }

        let previous = self.set_state(ConnectionState::Connected);
        tracing::info!(url = %self.ws_url, generation, "connected");
        let handshake = sink
            .send(Message::text(OutboundMessage::handshake().into_payload()))
            .await;
        *slot = Some(Link { generation, sink });
        drop(slot);

        self.announce(previous, ConnectionState::Connected);
        handshake?;
        tracing::debug!(generation, "handshake sent");
        Ok(())
    }

    fn abort_reader(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }

    /// Stops the receive loop and closes the current transport, if any.
    async fn teardown(&self) {
        self.abort_reader();
        let retired = self.link.lock().await.take();
        if let Some(link) = retired {
            close_sink(link.sink, link.generation).await;
        }
    }

    /// Removes the transport of `generation` after a read failure. Returns
    /// `false` if that transport is no longer current.
    async fn retire(&self, generation: u64) -> bool {
        let mut slot = self.link.lock().await;
        if !slot
            .as_ref()
            .is_some_and(|link| link.generation == generation)
        {
            return false;
        }
        let broken = slot.take();
        let previous = self.set_state(ConnectionState::Disconnected);
        drop(slot);
        drop(broken);
        self.announce(previous, ConnectionState::Disconnected);
        true
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), ClientError> {
        if self.is_shut_down() || !self.state().is_connected() {
            return Err(ClientError::NotConnected);
        }
        let mut slot = self
            .link
            .lock_within(self.config.send_timeout)
            .await
            .map_err(|err| match err {
                GateError::Timeout(limit) => ClientError::SendTimeout(limit),
                GateError::Closed => ClientError::NotConnected,
            })?;
        let Some(link) = slot.as_mut() else {
            return Err(ClientError::NotConnected);
        };

        let kind = message.kind();
        link.sink.send(Message::text(message.into_payload())).await?;
        match kind {
            MessageKind::Heartbeat => tracing::trace!(generation = link.generation, "heartbeat sent"),
            MessageKind::Command => tracing::debug!(generation = link.generation, "message sent"),
        }
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>, mut source: WsSource, generation: u64) {
        let reason = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => self.subscribers.publish_message(text.as_str()),
                Some(Ok(Message::Binary(data))) => {
                    self.subscribers
                        .publish_message(&String::from_utf8_lossy(&data));
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => format!(
                            "closed by device ({}): {}",
                            u16::from(frame.code),
                            frame.reason.as_str()
                        ),
                        None => "closed by device".to_string(),
                    };
                }
                // Ping/pong are answered by the codec.
                Some(Ok(_)) => {}
                Some(Err(err)) => break err.to_string(),
                None => break "stream ended".to_string(),
            }
        };
        drop(source);

        if self.is_shut_down() {
            tracing::debug!(generation, %reason, "receive loop stopped after shutdown");
            return;
        }
        tracing::warn!(generation, %reason, "connection lost");
        if !self.retire(generation).await {
            tracing::debug!(generation, "stale receive loop exited");
            return;
        }
        tokio::spawn(Arc::clone(&self).reconnect(generation));
    }

    /// Boxed so the receive loop and the connect sequence, which spawn each
    /// other, have nameable future types.
    fn reconnect(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(err) = self.connect(Some(generation)).await {
                tracing::debug!(generation, error = %err, "reconnect ended without a connection");
            }
        })
    }

    /// Synchronous part of shutdown. Returns `false` if it already ran.
    fn begin_shutdown(&self) -> bool {
        if self.shutdown.send_replace(true) {
            return false;
        }
        tracing::info!(url = %self.ws_url, "shutting down device client");
        for task in [&self.heartbeat, &self.reader] {
            let handle = task.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handle) = handle {
                handle.abort();
            }
        }
        self.link.close();
        self.transition(ConnectionState::Disconnected);
        true
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the client is gone, which counts as shutdown.
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn close_sink(mut sink: WsSink, generation: u64) {
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => tracing::debug!(generation, "transport closed"),
        Ok(Err(err)) => tracing::debug!(generation, error = %err, "transport close failed"),
        Err(_) => tracing::debug!(generation, "transport close timed out"),
    }
}

async fn heartbeat_loop(
    inner: Weak<Inner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shutdown_requested(&mut shutdown) => break,
        }
        let Some(client) = inner.upgrade() else {
            break;
        };
        if !client.state().is_connected() {
            tracing::trace!("heartbeat skipped while not connected");
            continue;
        }
        if let Err(err) = client.send(OutboundMessage::heartbeat()).await {
            tracing::warn!(error = %err, "failed to send heartbeat");
        }
    }
    tracing::debug!("heartbeat stopped");
}
