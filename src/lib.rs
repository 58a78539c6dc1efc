//! Public interface to the Canopy core library, linked by both the server
//! executable and the client library/executable.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod utils;

pub mod statemach;
pub mod server;
pub mod replica;
pub mod client;

pub use crate::client::{CanopyClient, ClientId};
pub use crate::replica::{ReplicaConfig, VrReplica};
pub use crate::server::{ApiReply, ApiRequest, ReplicaId, RequestId};
pub use crate::statemach::{
    Command, CommandResult, DataNode, QueueMessage, ReplyValue, StatNode,
};
pub use crate::utils::CanopyError;
