//! Admission decision for a datapath that has announced its identity.

use std::net::SocketAddr;

use sdn_core::{AuthorizationPolicy, Identity};

use crate::audit::{AuditEvent, AuditOutcome, SharedAudit};
use crate::policy::PolicyStore;
use crate::registry::SessionId;

/// Pure membership decision.
pub fn authorize(policy: &AuthorizationPolicy, identity: &Identity) -> bool {
    policy.permits(identity)
}

/// Binds the shared policy to the audit sink.
///
/// Called exactly once per session. The decision is taken against a
/// single policy snapshot and recorded before it is returned; the audit
/// sink cannot alter or fail it.
#[derive(Clone)]
pub struct HandshakeAuthorizer {
    policy: PolicyStore,
    audit: SharedAudit,
}

impl HandshakeAuthorizer {
    pub fn new(policy: PolicyStore, audit: SharedAudit) -> Self {
        Self { policy, audit }
    }

    pub fn authorize(&self, session: SessionId, peer: SocketAddr, identity: Identity) -> bool {
        let snapshot = self.policy.load();
        let admitted = authorize(&snapshot.policy, &identity);

        tracing::debug!(
            session,
            %identity,
            generation = snapshot.generation,
            admitted,
            "handshake decision"
        );

        let outcome = if admitted {
            AuditOutcome::Admitted
        } else {
            AuditOutcome::Denied
        };
        self.audit
            .record(&AuditEvent::now(session, peer, Some(identity), outcome));
        admitted
    }
}
