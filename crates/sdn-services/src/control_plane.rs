//! Control plane — owns the session registry and the accept loop.
//!
//! Lifecycle: `new` → `setup` → `setup_layer2_switching` (optional, defaults
//! otherwise) → `start(port)` → `shutdown`. Every session task lives in a
//! `JoinSet` owned by the accept loop and subscribes to the same shutdown
//! signal, so `shutdown` returns only after every session has released its
//! transport and left the registry.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sdn_core::AuthorizationPolicy;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::audit::SharedAudit;
use crate::policy::PolicyStore;
use crate::registry::{self, new_session_table, SessionId, SessionTable};
use crate::session::{
    DatapathSession, HandshakeAuthorizer, SessionContext, SessionOutcome, SessionSettings,
    SessionState,
};
use crate::switching::{L2Switching, SwitchingParams};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("control plane used before setup()")]
    NotSetup,

    #[error("control plane is already running")]
    AlreadyStarted,

    #[error("control plane is not running")]
    NotRunning,
}

type Attach = (TcpStream, SocketAddr);

struct Running {
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    attach: mpsc::UnboundedSender<Attach>,
    task: JoinHandle<()>,
}

pub struct ControlPlane {
    listen_addr: IpAddr,
    settings: SessionSettings,
    audit: SharedAudit,
    sessions: SessionTable,
    policy: PolicyStore,
    switching: Arc<L2Switching>,
    next_id: Arc<AtomicU64>,
    ready: bool,
    running: Option<Running>,
}

impl ControlPlane {
    pub fn new(listen_addr: IpAddr, settings: SessionSettings, audit: SharedAudit) -> Self {
        Self {
            listen_addr,
            settings,
            audit,
            sessions: new_session_table(),
            policy: PolicyStore::new(AuthorizationPolicy::default()),
            switching: Arc::new(L2Switching::new(SwitchingParams::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            ready: false,
            running: None,
        }
    }

    /// Bind the authorization policy. Calling it again publishes the new
    /// policy to the same store; the registry is left alone.
    pub fn setup(&mut self, policy: AuthorizationPolicy) {
        let entries = policy.len();
        let generation = self.policy.replace(policy);
        if self.ready {
            tracing::debug!(generation, entries, "setup repeated, policy republished");
        } else {
            tracing::info!(generation, entries, "control plane set up");
        }
        self.ready = true;
    }

    /// Parameters for the switching behavior pushed on admission. Applies
    /// to sessions accepted by the next `start`.
    pub fn setup_layer2_switching(&mut self, params: SwitchingParams) {
        if self.running.is_some() {
            tracing::warn!("switching parameters changed while running, effective after restart");
        }
        tracing::info!(
            table_id = params.table_id,
            priority = params.priority,
            idle_timeout = params.idle_timeout,
            hard_timeout = params.hard_timeout,
            flush_existing = params.flush_existing,
            retry = params.retry,
            "l2 switching configured"
        );
        self.switching = Arc::new(L2Switching::new(params));
    }

    /// Bind `listen_addr:port` and start accepting datapaths. Port 0 picks
    /// a free port; the bound address is returned.
    pub async fn start(&mut self, port: u16) -> Result<SocketAddr, ControlPlaneError> {
        if !self.ready {
            return Err(ControlPlaneError::NotSetup);
        }
        if self.running.is_some() {
            return Err(ControlPlaneError::AlreadyStarted);
        }

        let addr = SocketAddr::new(self.listen_addr, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ControlPlaneError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ControlPlaneError::Bind { addr, source })?;

        // The loop's receiver exists before the task is spawned, so a
        // shutdown sent before its first poll is still delivered.
        let (shutdown, stop) = broadcast::channel(1);
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        let accept_loop = AcceptLoop {
            listener,
            attach: attach_rx,
            stop,
            shutdown: shutdown.clone(),
            ctx: self.session_context(),
            next_id: self.next_id.clone(),
        };
        let task = tokio::spawn(accept_loop.run());

        tracing::info!(%local_addr, "control plane listening");
        self.running = Some(Running {
            local_addr,
            shutdown,
            attach: attach_tx,
            task,
        });
        Ok(local_addr)
    }

    /// Hand over a connection accepted elsewhere.
    pub fn attach(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ControlPlaneError> {
        let running = self.running.as_ref().ok_or(ControlPlaneError::NotRunning)?;
        running
            .attach
            .send((stream, peer))
            .map_err(|_| ControlPlaneError::NotRunning)
    }

    /// Stop accepting, close every session and wait for all of them.
    pub async fn shutdown(&mut self) -> Result<(), ControlPlaneError> {
        let running = self.running.take().ok_or(ControlPlaneError::NotRunning)?;
        tracing::info!(sessions = self.sessions.len(), "control plane shutting down");
        if running.shutdown.send(()).is_err() {
            tracing::debug!("accept loop already gone");
        }
        if let Err(e) = running.task.await {
            tracing::error!(error = %e, "accept loop failed");
        }
        tracing::info!("control plane stopped");
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn count_in_state(&self, state: SessionState) -> usize {
        registry::count_in_state(&self.sessions, state)
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            sessions: self.sessions.clone(),
            authorizer: HandshakeAuthorizer::new(self.policy.clone(), self.audit.clone()),
            switching: self.switching.clone(),
            settings: self.settings.clone(),
            audit: self.audit.clone(),
        }
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            let _ = running.shutdown.send(());
        }
    }
}

// ── Accept loop ──────────────────────────────────────────────────────────────

struct AcceptLoop {
    listener: TcpListener,
    attach: mpsc::UnboundedReceiver<Attach>,
    stop: broadcast::Receiver<()>,
    shutdown: broadcast::Sender<()>,
    ctx: SessionContext,
    next_id: Arc<AtomicU64>,
}

impl AcceptLoop {
    async fn run(mut self) {
        let mut tasks: JoinSet<SessionOutcome> = JoinSet::new();

        loop {
            // Subscribed before polling, so a signal racing with an accept
            // still reaches the session spawned for it.
            let session_shutdown = self.shutdown.subscribe();

            tokio::select! {
                biased;

                _ = self.stop.recv() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn(&mut tasks, stream, peer, session_shutdown),
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some((stream, peer)) = self.attach.recv() => {
                    self.spawn(&mut tasks, stream, peer, session_shutdown);
                }

                Some(joined) = tasks.join_next() => reap(joined),
            }
        }

        tracing::debug!(remaining = tasks.len(), "accept loop stopped, draining sessions");
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<SessionOutcome>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: broadcast::Receiver<()>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(%peer, error = %e, "set_nodelay failed");
        }
        let id: SessionId = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session = id, %peer, "datapath connected");
        let session = DatapathSession::new(id, peer, stream, self.ctx.clone());
        tasks.spawn(session.run(shutdown));
    }
}

fn reap(joined: Result<SessionOutcome, JoinError>) {
    match joined {
        Ok(outcome) => tracing::debug!(
            session = outcome.id,
            state = %outcome.state,
            faulted = outcome.error.is_some(),
            "session reaped"
        ),
        Err(e) => tracing::error!(error = %e, "session task failed"),
    }
}
