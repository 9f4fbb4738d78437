//! Client facade over one remote service.
//!
//! DESIGN
//! ======
//! A `Session` is a cheap `Clone` handle around shared state. `connect()`
//! spawns a driver task (see `driver`) that owns the connection lifecycle:
//! open the transport, authenticate, replay subscriptions, then drain inbound
//! frames until the connection ends, and reconnect with backoff.
//!
//! Outbound frames from any number of callers go through one unbounded queue
//! to a single writer task, so transports never see concurrent writes. The
//! correlation table, subscription registry, and state cache are each behind
//! their own lock and are mutated from the frame loop or from facade calls.
//!
//! Commands never queue across reconnects: anything issued outside `Ready`
//! fails with `NotReady` before touching the network.
//!
//! TRADE-OFFS
//! ==========
//! The driver task holds a reference to the shared state, so a connected
//! session keeps running until `disconnect()` is called even if every handle
//! is dropped.
//!
//! Auth-rejected commands are refreshed and retried exactly once. A second
//! rejection surfaces to the caller rather than looping against a server that
//! will never accept the credential.

mod driver;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::cache::{CachedEntity, StateCache};
use crate::codec::{Codec, WireFrame};
use crate::config::{ConfigError, SessionConfig};
use crate::correlation::{CorrelationTable, ResponseSlot};
use crate::credentials::CredentialManager;
use crate::error::SessionError;
use crate::message::{Command, Event, Outbound, RequestId};
use crate::registry::{Listener, SubscriptionHandle, SubscriptionRegistry};
use crate::state::ConnectionState;
use crate::transport::Transport;

type AuthWaiter = oneshot::Sender<Result<(), SessionError>>;

/// Outbound half of the live connection.
struct Link {
    outbound: mpsc::UnboundedSender<WireFrame>,
}

/// Running driver task plus its stop signal.
struct Supervisor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    credentials: CredentialManager,
    correlation: CorrelationTable,
    registry: SubscriptionRegistry,
    cache: StateCache,
    state_tx: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Server-side subscription ids on the current connection, by remote
    /// topic. Also orders subscribe calls against the post-auth replay.
    server_subscriptions: Mutex<HashMap<String, RequestId>>,
    /// In-band re-authentication waiting for the server's verdict.
    pending_auth: Mutex<Option<AuthWaiter>>,
    /// Serializes re-authentication attempts.
    reauth: tokio::sync::Mutex<()>,
    /// Wakes the driver out of a backoff sleep.
    restart: Notify,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Build a session. Nothing connects until `connect()`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn new(
        config: SessionConfig,
        transport: impl Transport + 'static,
        codec: impl Codec + 'static,
    ) -> Result<Self, ConfigError> {
        let credentials = CredentialManager::new(config.credentials.clone());
        Self::with_credentials(config, transport, codec, credentials)
    }

    /// Build a session around an existing credential manager, e.g. one shared
    /// with an HTTP client for the same service.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn with_credentials(
        config: SessionConfig,
        transport: impl Transport + 'static,
        codec: impl Codec + 'static,
        credentials: CredentialManager,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Inner {
            config,
            transport: Arc::new(transport),
            codec: Arc::new(codec),
            credentials,
            correlation: CorrelationTable::new(),
            registry: SubscriptionRegistry::new(),
            cache: StateCache::new(),
            state_tx,
            link: Mutex::new(None),
            supervisor: Mutex::new(None),
            server_subscriptions: Mutex::new(HashMap::new()),
            pending_auth: Mutex::new(None),
            reauth: tokio::sync::Mutex::new(()),
            restart: Notify::new(),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Connect and wait until the session is `Ready` or `Failed`.
    ///
    /// A no-op while `Ready`. While `Reconnecting`, skips the remaining
    /// backoff and restarts the attempt count from 1.
    ///
    /// # Errors
    ///
    /// Returns the error carried by `Failed` (auth rejection or exhausted
    /// retries), or [`SessionError::ConnectionLost`] if `disconnect()` races
    /// the connect.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut state_rx = self.inner.state_tx.subscribe();
        {
            let mut supervisor = lock(&self.inner.supervisor);
            let running = supervisor.as_ref().is_some_and(|s| !s.task.is_finished());
            match self.state() {
                ConnectionState::Ready if running => return Ok(()),
                ConnectionState::Reconnecting { .. } if running => {
                    tracing::info!(endpoint = %self.inner.transport.endpoint(), "session: restarting backoff");
                    self.inner.restart.notify_one();
                }
                _ if running => {}
                _ => {
                    self.inner.set_state(ConnectionState::Connecting);
                    let (shutdown, shutdown_rx) = watch::channel(false);
                    let task = tokio::spawn(driver::run(self.inner.clone(), shutdown_rx));
                    *supervisor = Some(Supervisor { shutdown, task });
                }
            }
        }

        loop {
            let state = state_rx.borrow_and_update().clone();
            if state.is_settled() {
                return match state {
                    ConnectionState::Ready => Ok(()),
                    ConnectionState::Failed(err) => Err(err),
                    _ => Err(SessionError::ConnectionLost),
                };
            }
            if state_rx.changed().await.is_err() {
                return Err(SessionError::ConnectionLost);
            }
        }
    }

    /// Close the connection, fail every pending request with `ConnectionLost`,
    /// and move to `Disconnected`. Idempotent.
    pub async fn disconnect(&self) {
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.shutdown.send(true);
            if let Err(e) = supervisor.task.await {
                tracing::warn!(error = %e, "session: driver task ended abnormally");
            }
        }
        self.inner.teardown_connection();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Stream of state changes; the receiver starts at the current state.
    #[must_use]
    pub fn observe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of commands awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlation.len()
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialManager {
        &self.inner.credentials
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Send `command` and wait for its correlated response.
    ///
    /// If the server rejects the command's credential, the session refreshes
    /// the credential in-band and retries the command once.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotReady`] when the session is not `Ready`
    /// - [`SessionError::Timeout`] when no response arrives in time
    /// - [`SessionError::ConnectionLost`] when the connection drops first
    /// - [`SessionError::AuthRejected`] when the retry is rejected as well
    /// - [`SessionError::Remote`] for any other server-reported failure
    pub async fn send_command(&self, command: Command) -> Result<Value, SessionError> {
        match self.issue(command.clone()).await {
            Err(SessionError::AuthRejected(reason)) => {
                tracing::info!(op = %command.op, %reason, "session: command auth rejected, refreshing credential");
                self.reauthenticate().await?;
                self.issue(command).await
            }
            other => other,
        }
    }

    /// Run a bulk query and load its entities into the cache.
    /// Returns the number of entities written.
    ///
    /// # Errors
    ///
    /// Same as [`Session::send_command`].
    pub async fn refresh_cache(&self, command: Command) -> Result<usize, SessionError> {
        let result = self.send_command(command).await?;
        let entities = self.inner.codec.bulk_entities(&result);
        Ok(self.inner.cache.load(entities))
    }

    async fn issue(&self, command: Command) -> Result<Value, SessionError> {
        if !self.state().is_ready() {
            return Err(SessionError::NotReady);
        }
        let op = command.op.clone();
        let timeout = self.inner.config.command_timeout;
        let (id, slot) = self.inner.correlation.register(timeout);
        if let Err(e) = self.inner.send(&Outbound::Command { id, command }) {
            self.inner.correlation.reject(id, e.clone());
            return Err(e);
        }
        tracing::debug!(id, %op, "session: command sent");

        match tokio::time::timeout(timeout, slot.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.inner.correlation.reject(id, SessionError::Timeout);
                tracing::warn!(id, %op, "session: command timed out");
                Err(SessionError::Timeout)
            }
        }
    }

    /// Re-acquire a credential and authenticate again on the live connection.
    async fn reauthenticate(&self) -> Result<(), SessionError> {
        let _guard = self.inner.reauth.lock().await;
        self.inner.credentials.on_rejected();
        let credential = self.inner.credentials.acquire().await?;

        let (tx, rx) = oneshot::channel();
        *lock(&self.inner.pending_auth) = Some(tx);
        if let Err(e) = self.inner.send(&Outbound::Auth { credential }) {
            lock(&self.inner.pending_auth).take();
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.handshake_timeout, rx).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_)) => Err(SessionError::ConnectionLost),
            Err(_) => {
                lock(&self.inner.pending_auth).take();
                Err(SessionError::Timeout)
            }
        }
    }

    // =========================================================================
    // SUBSCRIPTIONS & CACHE
    // =========================================================================

    /// Register `listener` for `topic` (or [`crate::message::WILDCARD_TOPIC`]).
    ///
    /// The subscription is recorded regardless of state and replayed after
    /// every successful authentication. On a live connection the server-side
    /// subscription is requested immediately, unless another topic already
    /// holds the same remote subscription.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        listener: impl Fn(Event) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let topic = topic.into();
        let listener: Listener = Arc::new(listener);
        // the driver replays under this lock, so a topic is either in its
        // snapshot or sees the link it installed
        let mut remote = lock(&self.inner.server_subscriptions);
        let handle = self.inner.registry.subscribe(topic.clone(), listener);
        if lock(&self.inner.link).is_some() {
            self.inner.subscribe_remote(&mut remote, &topic);
        }
        handle
    }

    /// Remove a listener. When no remaining topic needs its server-side
    /// subscription, that subscription is cancelled too.
    /// Returns `false` for an unknown handle.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut remote = lock(&self.inner.server_subscriptions);
        let Some(topic) = self.inner.registry.unsubscribe(handle) else {
            return false;
        };
        if self.inner.registry.has_topic(&topic) {
            return true;
        }
        let key = self.inner.codec.remote_topic(&topic);
        let shared = self.inner.registry.topics().iter().any(|t| self.inner.codec.remote_topic(t) == key);
        if shared {
            return true;
        }
        if let Some(subscription) = remote.remove(&key) {
            let timeout = self.inner.config.command_timeout;
            let (id, slot) = self.inner.correlation.register(timeout);
            let message = Outbound::Unsubscribe { id, topic: key.clone(), subscription: Some(subscription) };
            self.inner.send_tracked(&message, id, slot, key);
        }
        true
    }

    /// Last known value for `key`. Never touches the network.
    #[must_use]
    pub fn read_cached(&self, key: &str) -> Option<Value> {
        self.inner.cache.value(key)
    }

    /// Last known value for `key` with its update time.
    #[must_use]
    pub fn cached_entity(&self, key: &str) -> Option<CachedEntity> {
        self.inner.cache.get(key)
    }

    #[must_use]
    pub fn cache(&self) -> &StateCache {
        &self.inner.cache
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            match &next {
                ConnectionState::Failed(err) => {
                    tracing::error!(from = previous.label(), error = %err, code = err.code(), "session: failed");
                }
                _ => tracing::info!(from = previous.label(), to = %next, "session: state changed"),
            }
        }
    }

    /// Encode and queue one frame on the live connection.
    fn send(&self, message: &Outbound) -> Result<(), SessionError> {
        let frame = self.codec.encode(message)?;
        let link = lock(&self.link);
        let Some(link) = link.as_ref() else {
            return Err(SessionError::NotReady);
        };
        link.outbound.send(frame).map_err(|_| SessionError::ConnectionLost)
    }

    /// Ask the server to start pushing `topic`, unless the remote topic that
    /// carries it is already subscribed on this connection.
    fn subscribe_remote(&self, remote: &mut HashMap<String, RequestId>, topic: &str) {
        if !self.codec.supports_subscriptions() {
            return;
        }
        let key = self.codec.remote_topic(topic);
        if remote.contains_key(&key) {
            return;
        }
        let (id, slot) = self.correlation.register(self.config.command_timeout);
        remote.insert(key.clone(), id);
        self.send_tracked(&Outbound::Subscribe { id, topic: key.clone() }, id, slot, key);
    }

    /// Send a subscription-management frame and log its outcome in the background.
    fn send_tracked(&self, message: &Outbound, id: RequestId, slot: ResponseSlot, topic: String) {
        let kind = message.kind();
        if let Err(e) = self.send(message) {
            self.correlation.reject(id, e.clone());
            tracing::warn!(%topic, kind, error = %e, "session: subscription frame not sent");
            return;
        }
        tokio::spawn(async move {
            match slot.wait().await {
                Ok(_) => tracing::debug!(%topic, kind, id, "session: subscription acknowledged"),
                Err(e) => tracing::warn!(%topic, kind, id, error = %e, "session: subscription failed"),
            }
        });
    }

    /// Drop everything scoped to the current connection.
    fn teardown_connection(&self) {
        lock(&self.link).take();
        lock(&self.server_subscriptions).clear();
        if let Some(waiter) = lock(&self.pending_auth).take() {
            let _ = waiter.send(Err(SessionError::ConnectionLost));
        }
        let failed = self.correlation.fail_all(SessionError::ConnectionLost);
        if failed > 0 {
            tracing::info!(failed, "session: failed pending requests on disconnect");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
