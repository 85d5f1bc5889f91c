//! Session registry — one entry per live datapath connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use sdn_core::Identity;

use crate::session::SessionState;

/// Connection-scoped key. Never reused within a controller's lifetime.
pub type SessionId = u64;

/// Metadata about a live session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub peer_addr: SocketAddr,
    /// Known once the datapath has announced itself.
    pub identity: Option<Identity>,
    pub state: SessionState,
    pub connected_at: Instant,
}

/// The session table — shared across the accept loop and all sessions.
pub type SessionTable = Arc<DashMap<SessionId, SessionEntry>>;

/// Create a new empty session table.
pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

/// Number of sessions currently in `state`.
pub fn count_in_state(table: &SessionTable, state: SessionState) -> usize {
    table.iter().filter(|e| e.value().state == state).count()
}

/// Ties a registry entry to the lifetime of its session.
///
/// The entry is removed when the guard drops, so every exit path of the
/// session task (including panics and cancellation) unregisters it.
pub(crate) struct Registration {
    table: SessionTable,
    id: SessionId,
}

impl Registration {
    pub(crate) fn insert(table: SessionTable, id: SessionId, peer_addr: SocketAddr) -> Self {
        table.insert(
            id,
            SessionEntry {
                peer_addr,
                identity: None,
                state: SessionState::Connecting,
                connected_at: Instant::now(),
            },
        );
        Self { table, id }
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        if let Some(mut entry) = self.table.get_mut(&self.id) {
            entry.state = state;
        }
    }

    pub(crate) fn set_identity(&self, identity: Identity) {
        if let Some(mut entry) = self.table.get_mut(&self.id) {
            entry.identity = Some(identity);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}
