//! Authorization policy — the set of datapaths allowed to join.

use std::collections::HashSet;

use crate::identity::Identity;

/// Allow-list of datapath identities.
///
/// Immutable once built. Duplicate entries collapse; iteration order
/// carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationPolicy {
    allowed: HashSet<Identity>,
}

impl AuthorizationPolicy {
    pub fn new<I>(identities: I) -> Self
    where
        I: IntoIterator<Item = Identity>,
    {
        Self {
            allowed: identities.into_iter().collect(),
        }
    }

    /// Whether `identity` may complete the handshake.
    /// Total over all identities: anything not configured is refused.
    pub fn permits(&self, identity: &Identity) -> bool {
        self.allowed.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.allowed.iter()
    }
}

impl FromIterator<Identity> for AuthorizationPolicy {
    fn from_iter<T: IntoIterator<Item = Identity>>(iter: T) -> Self {
        Self::new(iter)
    }
}
