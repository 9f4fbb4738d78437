//! Connection lifecycle driver.
//!
//! DESIGN
//! ======
//! One driver task per `connect()` runs the state machine:
//!
//! ```text
//! Connecting -> Authenticating -> Ready -> (connection ends) -> Reconnecting(1, d1)
//!      ^                |                                          |
//!      |                +-- auth rejected --> Failed               |
//!      +------------------- backoff elapsed -----------------------+
//! ```
//!
//! The handshake reads the stream directly with its own deadline. Once
//! authenticated, the sink moves into a writer task fed by the session's
//! outbound queue and the frame loop takes over the stream. Only the frame
//! loop completes pending requests, in arrival order.
//!
//! The attempt counter resets whenever a connection reached `Ready`, so a
//! session that drops after hours of uptime starts its backoff at `d1`.
//!
//! With a keepalive configured, a half-open connection that never errors on
//! read is detected by its unanswered ping and handled like any other drop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::{Inner, Link, lock};
use crate::codec::WireFrame;
use crate::error::SessionError;
use crate::message::{Inbound, Outbound};
use crate::state::ConnectionState;
use crate::transport::{FrameSink, FrameStream, TransportParts};

/// How one connection instance ended.
enum ConnectionEnd {
    /// `disconnect()` was called.
    Shutdown,
    /// The connection reached `Ready` and later dropped.
    Lost,
    /// The connection never reached `Ready`.
    Failed(SessionError),
}

pub(super) async fn run(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let policy = inner.config.reconnect;
    let mut attempt: u32 = 0;

    loop {
        inner.set_state(ConnectionState::Connecting);
        match run_connection(&inner, &mut shutdown).await {
            ConnectionEnd::Shutdown => return,
            ConnectionEnd::Lost => attempt = 0,
            ConnectionEnd::Failed(err) if is_terminal(&err) => {
                inner.set_state(ConnectionState::Failed(err));
                return;
            }
            ConnectionEnd::Failed(err) => {
                tracing::warn!(attempt, error = %err, code = err.code(), "session: connection attempt failed");
            }
        }

        attempt += 1;
        if !policy.allows(attempt) {
            let attempts = attempt - 1;
            inner.set_state(ConnectionState::Failed(SessionError::MaxRetriesExceeded { attempts }));
            return;
        }
        let delay = policy.delay_for(attempt);
        inner.set_state(ConnectionState::Reconnecting { attempt, delay });

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = inner.restart.notified() => attempt = 0,
            _ = shutdown.changed() => return,
        }
    }
}

/// Auth rejections and protocol violations will not improve by retrying.
fn is_terminal(err: &SessionError) -> bool {
    matches!(err, SessionError::AuthRejected(_) | SessionError::ProtocolError(_))
}

async fn run_connection(inner: &Arc<Inner>, shutdown: &mut watch::Receiver<bool>) -> ConnectionEnd {
    let opened = tokio::select! {
        _ = shutdown.changed() => return ConnectionEnd::Shutdown,
        result = open_and_authenticate(inner) => result,
    };
    let TransportParts { sink, stream } = match opened {
        Ok(parts) => parts,
        Err(err) => return ConnectionEnd::Failed(err),
    };

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, outbound_rx));
    {
        let mut remote = lock(&inner.server_subscriptions);
        *lock(&inner.link) = Some(Link { outbound });
        for topic in inner.registry.topics() {
            inner.subscribe_remote(&mut remote, &topic);
        }
    }
    inner.set_state(ConnectionState::Ready);
    if let Some(command) = inner.config.refresh_on_ready.clone() {
        let session = super::Session { inner: inner.clone() };
        tokio::spawn(async move {
            match session.refresh_cache(command).await {
                Ok(entities) => tracing::info!(entities, "session: cache refreshed"),
                Err(e) => tracing::warn!(error = %e, "session: cache refresh failed"),
            }
        });
    }

    let end = frame_loop(inner, stream, writer, shutdown).await;
    inner.teardown_connection();
    end
}

async fn open_and_authenticate(inner: &Inner) -> Result<TransportParts, SessionError> {
    let deadline = Instant::now() + inner.config.handshake_timeout;
    let mut parts = tokio::time::timeout_at(deadline, inner.transport.open())
        .await
        .map_err(|_| SessionError::Timeout)??;
    tracing::info!(endpoint = %inner.transport.endpoint(), "session: transport open");

    inner.set_state(ConnectionState::Authenticating);
    // an out-of-band token fetch shares the handshake deadline
    let credential = tokio::time::timeout_at(deadline, inner.credentials.acquire())
        .await
        .map_err(|_| SessionError::Timeout)??;
    let frame = inner.codec.encode(&Outbound::Auth { credential })?;
    parts.sink.send(frame).await?;

    loop {
        let next = tokio::time::timeout_at(deadline, parts.stream.next())
            .await
            .map_err(|_| SessionError::Timeout)?;
        let frame = match next {
            None => return Err(SessionError::ConnectionLost),
            Some(frame) => frame?,
        };
        match inner.codec.decode(frame) {
            Inbound::AuthAccepted { server_version } => {
                tracing::info!(server_version = server_version.as_deref().unwrap_or("unknown"), "session: authenticated");
                return Ok(parts);
            }
            Inbound::AuthRejected { message } => {
                inner.credentials.on_rejected();
                return Err(SessionError::AuthRejected(message));
            }
            Inbound::AuthRequired => tracing::debug!("session: server requested auth"),
            Inbound::Malformed { reason } => tracing::warn!(%reason, "session: malformed frame during handshake"),
            other => tracing::debug!(kind = other.kind(), "session: dropping frame received before auth"),
        }
    }
}

async fn frame_loop(
    inner: &Arc<Inner>,
    mut stream: Box<dyn FrameStream>,
    mut writer: JoinHandle<()>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let mut sweep = tokio::time::interval(inner.config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut keepalive = inner.config.keepalive.as_ref().map(|k| {
        let mut ticks = tokio::time::interval_at(Instant::now() + k.interval, k.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks
    });
    let mut ping: Option<JoinHandle<()>> = None;

    let end = loop {
        tokio::select! {
            _ = shutdown.changed() => break ConnectionEnd::Shutdown,
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    sweep_expired(inner);
                    dispatch(inner, inner.codec.decode(frame));
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, code = e.code(), "session: transport read failed");
                    break ConnectionEnd::Lost;
                }
                None => {
                    tracing::info!("session: connection closed by peer");
                    break ConnectionEnd::Lost;
                }
            },
            _ = sweep.tick() => sweep_expired(inner),
            () = next_tick(keepalive.as_mut()) => {
                if ping.as_ref().is_none_or(JoinHandle::is_finished) {
                    ping = send_keepalive(inner);
                }
            }
            _ = &mut writer => {
                tracing::warn!("session: writer stopped");
                lock(&inner.link).take();
                return ConnectionEnd::Lost;
            }
        }
    };

    if let Some(ping) = ping {
        ping.abort();
    }
    // dropping the queue lets the writer flush and close the sink
    lock(&inner.link).take();
    if tokio::time::timeout(inner.config.handshake_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
    end
}

async fn next_tick(ticks: Option<&mut Interval>) {
    match ticks {
        Some(ticks) => {
            ticks.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Issue the keepalive command. If it times out, detach this connection's
/// outbound queue; the writer then closes the sink and the frame loop sees
/// the connection end.
fn send_keepalive(inner: &Arc<Inner>) -> Option<JoinHandle<()>> {
    let keepalive = inner.config.keepalive.as_ref()?;
    let outbound = lock(&inner.link).as_ref()?.outbound.clone();
    let session = super::Session { inner: inner.clone() };
    let command = keepalive.command.clone();
    Some(tokio::spawn(async move {
        match session.issue(command).await {
            Ok(_) => tracing::trace!("session: keepalive answered"),
            Err(SessionError::Timeout) => {
                tracing::warn!("session: keepalive timed out, dropping connection");
                let mut link = lock(&session.inner.link);
                if link.as_ref().is_some_and(|l| l.outbound.same_channel(&outbound)) {
                    link.take();
                }
            }
            Err(e) => tracing::debug!(error = %e, "session: keepalive not answered"),
        }
    }))
}

fn sweep_expired(inner: &Inner) {
    let expired = inner.correlation.sweep_at(Instant::now());
    if expired > 0 {
        tracing::debug!(expired, "session: expired pending requests");
    }
}

/// Route one decoded frame to exactly one of: a pending request, the
/// subscription registry, a waiting re-authentication, or the log.
fn dispatch(inner: &Inner, inbound: Inbound) {
    match inbound {
        Inbound::Response { id, outcome } => {
            let routed = match outcome {
                Ok(value) => inner.correlation.resolve(id, value),
                Err(remote) if remote.is_auth_rejection() => {
                    inner.correlation.reject(id, SessionError::AuthRejected(remote.message))
                }
                Err(remote) => inner.correlation.reject(id, SessionError::Remote(remote)),
            };
            if !routed {
                tracing::warn!(id, "session: dropping response with no pending request");
            }
        }
        Inbound::Event(event) => {
            let cached = inner.cache.apply(&event);
            let listeners = inner.registry.publish(&event);
            tracing::debug!(topic = %event.topic, cached, listeners, "session: event");
        }
        Inbound::AuthAccepted { .. } => complete_reauth(inner, Ok(())),
        Inbound::AuthRejected { message } => complete_reauth(inner, Err(SessionError::AuthRejected(message))),
        Inbound::AuthRequired => tracing::debug!("session: ignoring auth_required on a live connection"),
        Inbound::Malformed { reason } => tracing::warn!(%reason, "session: dropping malformed frame"),
        Inbound::Ignored { kind } => tracing::debug!(%kind, "session: ignoring frame"),
    }
}

fn complete_reauth(inner: &Inner, verdict: Result<(), SessionError>) {
    match lock(&inner.pending_auth).take() {
        Some(waiter) => {
            let _ = waiter.send(verdict);
        }
        None => tracing::warn!(accepted = verdict.is_ok(), "session: dropping unsolicited auth frame"),
    }
}

async fn write_loop(mut sink: Box<dyn FrameSink>, mut outbound: mpsc::UnboundedReceiver<WireFrame>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::warn!(error = %e, code = e.code(), "session: transport write failed");
            return;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "session: close failed");
    }
}
