//! Shared authorization policy.
//!
//! Readers load an immutable snapshot without locking. A replacement swaps
//! the whole snapshot atomically, so no reader ever sees a half-updated set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use sdn_core::AuthorizationPolicy;

/// A policy snapshot plus the generation it was published as.
#[derive(Debug)]
pub struct PolicySnapshot {
    pub generation: u64,
    pub policy: AuthorizationPolicy,
}

#[derive(Clone)]
pub struct PolicyStore {
    snapshot: Arc<ArcSwap<PolicySnapshot>>,
    next_generation: Arc<AtomicU64>,
}

impl PolicyStore {
    pub fn new(policy: AuthorizationPolicy) -> Self {
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(PolicySnapshot {
                generation: 0,
                policy,
            })),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Current snapshot. Holding it pins that generation for the caller.
    pub fn load(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    /// Publish a new policy. Decisions already in flight keep the snapshot
    /// they loaded.
    pub fn replace(&self, policy: AuthorizationPolicy) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.snapshot
            .store(Arc::new(PolicySnapshot { generation, policy }));
        tracing::info!(generation, "authorization policy replaced");
        generation
    }
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.load();
        f.debug_struct("PolicyStore")
            .field("generation", &snap.generation)
            .field("entries", &snap.policy.len())
            .finish()
    }
}
