//! Datapath sessions — one task per switch connection.
//!
//! A session walks its connection through the lifecycle in [`SessionState`]:
//! OpenFlow hello and features exchange, a single admission decision, the
//! L2 switching push, then steady-state keepalive until the peer goes away.
//! Whatever ends the session, its fault (if any) is audited first, then the
//! transport is shut down and the registry entry is dropped.

pub mod handshake;
mod state;

pub use handshake::{authorize, HandshakeAuthorizer};
pub use state::SessionState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sdn_core::config::SessionConfig;
use sdn_core::wire::OFP_VERSION;
use sdn_core::{Identity, Message};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use crate::audit::{AuditEvent, AuditOutcome, SharedAudit};
use crate::registry::{Registration, SessionId, SessionTable};
use crate::switching::{InstallError, L2Switching};
use crate::transport::{Connection, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Budget for `Connecting`: from accept until the identity arrives.
    pub handshake_timeout: Duration,
    /// Silence tolerated on an active session before an echo probe.
    /// Zero disables keepalive.
    pub echo_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl SessionSettings {
    /// Longest a single send may block on a peer that stopped reading.
    pub fn write_timeout(&self) -> Duration {
        if self.echo_interval.is_zero() {
            self.handshake_timeout
        } else {
            self.echo_interval
        }
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(c: &SessionConfig) -> Self {
        Self {
            handshake_timeout: c.handshake_timeout(),
            echo_interval: c.echo_interval(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("datapath {0} is not in the authorization policy")]
    AuthorizationDenied(Identity),

    #[error("no identity announced within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("transport fault: {0}")]
    TransportFault(#[from] TransportError),

    #[error("rule install failed after {attempts} attempt(s): {cause}")]
    RuleInstallFault {
        attempts: u32,
        #[source]
        cause: InstallError,
    },
}

impl SessionError {
    fn audit_outcome(&self) -> Option<AuditOutcome> {
        match self {
            // Already recorded by the authorizer.
            SessionError::AuthorizationDenied(_) => None,
            SessionError::HandshakeTimeout(_) => Some(AuditOutcome::HandshakeTimeout),
            SessionError::TransportFault(_) => Some(AuditOutcome::TransportFault),
            SessionError::RuleInstallFault { .. } => Some(AuditOutcome::RuleInstallFault),
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionOutcome {
    pub id: SessionId,
    pub identity: Option<Identity>,
    /// `Closed` or `Rejected`.
    pub state: SessionState,
    /// `None` for a clean close (peer hung up, controller shut down).
    pub error: Option<SessionError>,
}

/// Everything a session borrows from the control plane.
#[derive(Clone)]
pub struct SessionContext {
    pub sessions: SessionTable,
    pub authorizer: HandshakeAuthorizer,
    pub switching: Arc<L2Switching>,
    pub settings: SessionSettings,
    pub audit: SharedAudit,
}

pub struct DatapathSession<T> {
    id: SessionId,
    peer: SocketAddr,
    conn: Connection<T>,
    state: SessionState,
    identity: Option<Identity>,
    ctx: SessionContext,
    registration: Registration,
}

impl<T> DatapathSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Register a freshly accepted connection in `Connecting`.
    pub fn new(id: SessionId, peer: SocketAddr, io: T, ctx: SessionContext) -> Self {
        let registration = Registration::insert(ctx.sessions.clone(), id, peer);
        Self {
            id,
            peer,
            conn: Connection::new(io).with_write_timeout(ctx.settings.write_timeout()),
            state: SessionState::Connecting,
            identity: None,
            ctx,
            registration,
        }
    }

    /// Drive the session to completion or until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> SessionOutcome {
        tracing::debug!(session = self.id, peer = %self.peer, "session started");

        let result = tokio::select! {
            r = self.drive() => r,
            _ = shutdown.recv() => {
                tracing::debug!(session = self.id, state = %self.state, "session cancelled by shutdown");
                Ok(())
            }
        };

        let error = result.err();
        if let Some(e) = &error {
            self.report(e);
        }
        if !self.state.is_terminal() {
            self.transition(SessionState::Closed);
        }
        self.conn.close().await;

        match &error {
            Some(SessionError::AuthorizationDenied(identity)) => tracing::info!(
                session = self.id,
                peer = %self.peer,
                %identity,
                "datapath rejected, connection closed"
            ),
            Some(e) => tracing::warn!(
                session = self.id,
                peer = %self.peer,
                error = %e,
                "session closed on fault"
            ),
            None => tracing::info!(session = self.id, peer = %self.peer, "session closed"),
        }

        SessionOutcome {
            id: self.id,
            identity: self.identity,
            state: self.state,
            error,
        }
        // `registration` drops here and unregisters the session.
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let limit = self.ctx.settings.handshake_timeout;
        let identity = match tokio::time::timeout(limit, self.announce()).await {
            Ok(r) => r?,
            Err(_) => return Err(SessionError::HandshakeTimeout(limit)),
        };
        self.identity = Some(identity);
        self.registration.set_identity(identity);
        self.transition(SessionState::AwaitingHandshake);

        if !self.ctx.authorizer.authorize(self.id, self.peer, identity) {
            self.transition(SessionState::Rejected);
            return Err(SessionError::AuthorizationDenied(identity));
        }
        self.transition(SessionState::Admitted);

        self.ctx
            .switching
            .install(&mut self.conn, identity)
            .await
            .map_err(|(attempts, cause)| SessionError::RuleInstallFault { attempts, cause })?;
        self.transition(SessionState::Active);

        self.serve().await
    }

    /// `Connecting`: hello, features request, wait for the features reply.
    async fn announce(&mut self) -> Result<Identity, SessionError> {
        self.conn.send(&Message::Hello).await?;
        loop {
            let envelope = self.conn.recv().await?;
            match envelope.message {
                Message::Hello => {
                    if envelope.version < OFP_VERSION {
                        return Err(TransportError::UnsupportedVersion(envelope.version).into());
                    }
                    self.conn.send(&Message::FeaturesRequest).await?;
                }
                Message::FeaturesReply(features) => {
                    let identity = Identity::from_datapath_id(features.datapath_id);
                    tracing::debug!(
                        session = self.id,
                        %identity,
                        datapath_id = %format!("{:016x}", features.datapath_id),
                        n_tables = features.n_tables,
                        "datapath announced"
                    );
                    return Ok(identity);
                }
                Message::EchoRequest(payload) => {
                    self.conn
                        .reply(envelope.xid, &Message::EchoReply(payload))
                        .await?;
                }
                Message::Error { err_type, code, .. } => {
                    tracing::warn!(session = self.id, err_type, code, "datapath error during handshake");
                }
                other => {
                    tracing::trace!(session = self.id, message = ?other, "ignored before handshake");
                }
            }
        }
    }

    /// `Active`: answer echoes, probe on silence, until the peer leaves.
    async fn serve(&mut self) -> Result<(), SessionError> {
        let interval = self.ctx.settings.echo_interval;
        let mut probe: Option<u32> = None;

        loop {
            let next = if interval.is_zero() {
                Ok(self.conn.recv().await)
            } else {
                tokio::time::timeout(interval, self.conn.recv()).await
            };
            let envelope = match next {
                Ok(Ok(envelope)) => envelope,
                Ok(Err(TransportError::Closed)) => {
                    tracing::debug!(session = self.id, "datapath disconnected");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) if probe.is_some() => {
                    return Err(TransportError::KeepaliveExpired.into());
                }
                Err(_) => {
                    probe = Some(self.conn.send(&Message::EchoRequest(Bytes::new())).await?);
                    continue;
                }
            };
            probe = None;

            match envelope.message {
                Message::EchoRequest(payload) => {
                    self.conn
                        .reply(envelope.xid, &Message::EchoReply(payload))
                        .await?;
                }
                Message::FeaturesReply(_) => {
                    tracing::warn!(
                        session = self.id,
                        "repeated features reply ignored, admission already decided"
                    );
                }
                Message::PacketIn(data) => {
                    tracing::trace!(session = self.id, len = data.len(), "packet-in ignored");
                }
                Message::PortStatus(_) => {
                    tracing::debug!(session = self.id, "port status changed");
                }
                Message::Error { err_type, code, .. } => {
                    tracing::warn!(session = self.id, xid = envelope.xid, err_type, code, "datapath error");
                }
                other => {
                    tracing::trace!(session = self.id, message = ?other, "ignored on active session");
                }
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(session = self.id, from = %self.state, to = %next, "session state");
        self.state = next;
        self.registration.set_state(next);
    }

    fn report(&self, error: &SessionError) {
        if let Some(outcome) = error.audit_outcome() {
            let event = AuditEvent::now(self.id, self.peer, self.identity, outcome)
                .with_detail(error.to_string());
            self.ctx.audit.record(&event);
        }
    }
}
