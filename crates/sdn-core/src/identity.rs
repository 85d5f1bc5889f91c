//! Datapath identity — the 48-bit hardware address a switch announces.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

/// Hardware address identifying a datapath (or a host).
///
/// OpenFlow carries a 64-bit datapath id whose low 48 bits are, by
/// convention, the switch MAC. Only those 48 bits take part in admission.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity([u8; 6]);

impl Identity {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Low 48 bits of an OpenFlow datapath id.
    pub fn from_datapath_id(datapath_id: u64) -> Self {
        let be = datapath_id.to_be_bytes();
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&be[2..]);
        Self(bytes)
    }

    /// The datapath id a switch with this identity and no implementer
    /// prefix would announce.
    pub fn to_datapath_id(self) -> u64 {
        let mut be = [0u8; 8];
        be[2..].copy_from_slice(&self.0);
        u64::from_be_bytes(be)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid datapath identity {0:?}: expected six hex octets")]
pub struct ParseIdentityError(pub String);

impl FromStr for Identity {
    type Err = ParseIdentityError;

    /// Accepts `aa:bb:cc:dd:ee:01`, `aa-bb-cc-dd-ee-01` or `aabbccddee01`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let compact: String = if trimmed.contains(':') || trimmed.contains('-') {
            let parts: Vec<&str> = trimmed.split([':', '-']).collect();
            if parts.len() != 6 || parts.iter().any(|p| p.len() != 2) {
                return Err(ParseIdentityError(s.to_string()));
            }
            parts.concat()
        } else {
            trimmed.to_string()
        };

        let decoded = hex::decode(&compact).map_err(|_| ParseIdentityError(s.to_string()))?;
        let bytes: [u8; 6] = decoded
            .try_into()
            .map_err(|_| ParseIdentityError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
