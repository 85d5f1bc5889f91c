//! sdn-core — identities, authorization policy, configuration and the
//! OpenFlow wire subset. All other sdncore crates depend on this one.

pub mod codec;
pub mod config;
pub mod identity;
pub mod policy;
pub mod wire;

pub use codec::{Envelope, Features, FlowMod, FlowModCommand, Message};
pub use identity::Identity;
pub use policy::AuthorizationPolicy;
