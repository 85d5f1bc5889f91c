//! sdn-services — the controller's runtime: transport, datapath sessions,
//! admission, L2 switching and the control plane that ties them together.

pub mod audit;
pub mod control_plane;
pub mod policy;
pub mod registry;
pub mod session;
pub mod switching;
pub mod transport;

pub use audit::{AuditEvent, AuditOutcome, AuditSink, Fanout, JsonlAudit, SharedAudit, TracingAudit};
pub use control_plane::{ControlPlane, ControlPlaneError};
pub use policy::{PolicySnapshot, PolicyStore};
pub use registry::{count_in_state, new_session_table, SessionEntry, SessionId, SessionTable};
pub use session::{
    DatapathSession, HandshakeAuthorizer, SessionContext, SessionError, SessionOutcome,
    SessionSettings, SessionState,
};
pub use switching::{InstallError, L2Switching, SwitchingParams};
pub use transport::{Connection, TransportError};
