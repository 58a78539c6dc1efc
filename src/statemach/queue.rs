//! FIFO work-queue state machine. `Pop` moves a message into an in-progress
//! set; a worker acknowledges it with `Done(id)`. Workers must treat the
//! Pop..Done window as at-least-once delivery and keep their handlers
//! idempotent, since an unacknowledged message is eligible for re-queueing.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use sha2::{Digest, Sha256};

use crate::statemach::{Command, CommandResult, ReplyValue, StateMachine};
use crate::utils::CanopyError;

/// A queued message with its queue-assigned ID.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: u64,
    pub value: String,
}

/// The FIFO work-queue state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct WorkQueue {
    /// Messages pushed but not yet popped, in FIFO order.
    queue: VecDeque<QueueMessage>,

    /// Messages popped but not yet acknowledged, keyed by message ID.
    in_progress: BTreeMap<u64, QueueMessage>,

    /// Next message ID to assign on `Push`.
    next_id: u64,
}

impl WorkQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        WorkQueue {
            queue: VecDeque::new(),
            in_progress: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn push(&mut self, value: &str) -> CommandResult {
        let msg = QueueMessage {
            id: self.next_id,
            value: value.to_string(),
        };
        self.next_id += 1;
        self.queue.push_back(msg);
        CommandResult::ok(ReplyValue::None)
    }

    fn pop(&mut self) -> CommandResult {
        match self.queue.pop_front() {
            Some(msg) => {
                self.in_progress.insert(msg.id, msg.clone());
                CommandResult::ok(ReplyValue::Message(msg))
            }
            None => CommandResult::err("nothing to pop"),
        }
    }

    fn done(&mut self, id: u64) -> CommandResult {
        match self.in_progress.remove(&id) {
            Some(_) => CommandResult::ok(ReplyValue::None),
            None => CommandResult::err("message not in progress"),
        }
    }

    /// Hex SHA-256 digest over the canonical encoding of the whole queue.
    fn digest(&self) -> Result<String, CanopyError> {
        let bytes = rmp_serde::encode::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for WorkQueue {
    fn execute(&mut self, cmd: &Command) -> CommandResult {
        match cmd {
            Command::Push { value } => self.push(value),
            Command::Pop => self.pop(),
            Command::Done { id } => self.done(*id),
            Command::QueueLen => {
                CommandResult::ok(ReplyValue::Len(self.queue.len() as u64))
            }
            Command::InProgressLen => CommandResult::ok(ReplyValue::Len(
                self.in_progress.len() as u64,
            )),
            Command::QueueDigest => match self.digest() {
                Ok(digest) => CommandResult::ok(ReplyValue::Digest(digest)),
                Err(e) => CommandResult::err(e),
            },
            _ => CommandResult::err("unknown command"),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, CanopyError> {
        Ok(rmp_serde::encode::to_vec(self)?)
    }
}
