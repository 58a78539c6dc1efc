//! Deterministic state machines driven by the replicated command log: a
//! hierarchical path-tree database and a FIFO work queue.

mod queue;
mod tree;

use serde::{Deserialize, Serialize};

use crate::utils::CanopyError;

pub use queue::{QueueMessage, WorkQueue};
pub use tree::{DataNode, StatNode, TreeDb};

/// Command to the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Creates a new node at path; fails if the path already exists.
    Create { path: String, value: String },

    /// Overwrites the value of an existing node; fails if not present.
    Set { path: String, value: String },

    /// Gets the value and stats of a node.
    Get { path: String },

    /// Removes a node (and its subtree); fails if not present.
    Delete { path: String },

    /// Lists the names of a node's children.
    Children { path: String },

    /// Gets the stats of a node.
    Stat { path: String },

    /// Digest over the whole tree state.
    TreeDigest,

    /// Appends a message to the back of the queue.
    Push { value: String },

    /// Moves the front message to the in-progress set and returns it.
    Pop,

    /// Acknowledges completion of an in-progress message.
    Done { id: u64 },

    /// Number of queued (not yet popped) messages.
    QueueLen,

    /// Number of popped but not yet acknowledged messages.
    InProgressLen,

    /// Digest over the whole queue state.
    QueueDigest,
}

impl Command {
    /// True for commands that do not mutate state machine state; these may
    /// be served locally by a master holding a valid lease.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Command::Get { .. }
                | Command::Children { .. }
                | Command::Stat { .. }
                | Command::TreeDigest
                | Command::QueueLen
                | Command::InProgressLen
                | Command::QueueDigest
        )
    }

    /// True for the digest commands, which are additionally answerable on
    /// any replica in Normal status (non-linearizable convergence probe).
    pub fn is_digest(&self) -> bool {
        matches!(self, Command::TreeDigest | Command::QueueDigest)
    }
}

/// Reply value carried inside a `CommandResult`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ReplyValue {
    /// No payload (successful `Set`/`Delete`/`Done`/`Push`).
    None,

    /// Node value + stats (`Create`/`Get`).
    Node(DataNode),

    /// Node stats only (`Stat`).
    Stat(StatNode),

    /// Sorted child name list (`Children`).
    Children(Vec<String>),

    /// Hex digest string (`TreeDigest`/`QueueDigest`).
    Digest(String),

    /// A popped queue message (`Pop`).
    Message(QueueMessage),

    /// A length (`QueueLen`/`InProgressLen`).
    Len(u64),

    /// Opaque state snapshot plus the commit index it covers.
    Snapshot { data: Vec<u8>, index: u64 },
}

/// Command execution result returned by the state machine. An empty error
/// string denotes success; a non-empty string is a user-visible error.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub value: ReplyValue,
    pub error: String,
}

impl CommandResult {
    /// Successful result carrying given value.
    pub fn ok(value: ReplyValue) -> Self {
        CommandResult {
            value,
            error: String::new(),
        }
    }

    /// Failed result carrying given user-visible error string.
    pub fn err(error: impl ToString) -> Self {
        CommandResult {
            value: ReplyValue::None,
            error: error.to_string(),
        }
    }

    /// True if the error string is empty.
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// Deterministic state machine interface: the applier actor drives exactly
/// one of these. `Clone` enables copy-on-write snapshotting.
pub trait StateMachine: Clone + Send + Sync + 'static {
    /// Executes given command against the state, returning exactly one
    /// result. Must be deterministic: the same command sequence produces the
    /// same result sequence and the same digest on every replica.
    fn execute(&mut self, cmd: &Command) -> CommandResult;

    /// Encodes the whole state into an opaque byte sequence.
    fn snapshot(&self) -> Result<Vec<u8>, CanopyError>;
}
