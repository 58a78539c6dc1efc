//! Canopy's server-side functionality modules: the replicated op log, the
//! applier actor, the peer transport, and the client-facing API.

mod applier;
mod external;
mod oplog;
mod transport;

/// Server replica ID type.
pub type ReplicaId = u8;

pub use external::{ApiReply, ApiRequest, RequestId};
pub use oplog::OpLog;

pub(crate) use applier::{ApplierHub, ApplierWork, CommandId};
pub(crate) use external::ExternalApi;
pub(crate) use transport::{ReqId, TransportEvent, TransportHub};
