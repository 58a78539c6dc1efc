//! The applier actor: single consumer of committed commands, driving the
//! deterministic state machine and producing exactly one result per command.
//! Also serves snapshot requests without blocking subsequent writes, by
//! handing a copy-on-write reference of the state to a background encoder.

use std::sync::Arc;

use crate::server::ReplicaId;
use crate::statemach::{Command, CommandResult, ReplyValue, StateMachine};
use crate::utils::CanopyError;

use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

/// Applier command ID type; composed by the replica core from either a log
/// index or a local-read sequence number.
pub(crate) type CommandId = u64;

/// A unit of work for the applier actor.
pub(crate) enum ApplierWork {
    /// Execute a (committed or lease-guarded read-only) command.
    Execute { cmd: Command },

    /// Produce an opaque snapshot of the current state. `index_fn` is
    /// consulted at admission time so the returned index is obtained
    /// atomically with the snapshot.
    Snapshot {
        index_fn: Box<dyn FnOnce() -> u64 + Send>,
    },
}

/// The applier actor handle owned by the replica core.
pub(crate) struct ApplierHub {
    /// My replica ID.
    me: ReplicaId,

    /// Sender side of the work channel.
    tx_work: mpsc::UnboundedSender<(CommandId, ApplierWork)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(CommandId, CommandResult)>,

    /// Join handle of the executor task. The state machine is owned by that
    /// task.
    _executor_handle: JoinHandle<()>,
}

// ApplierHub public API implementation
impl ApplierHub {
    /// Creates an applier hub and spawns the executor task owning the given
    /// state machine.
    pub(crate) fn new_and_setup<S: StateMachine>(
        me: ReplicaId,
        state: S,
    ) -> Result<Self, CanopyError> {
        let (tx_work, rx_work) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let executor_handle = tokio::spawn(Self::executor_task(
            me,
            Arc::new(state),
            rx_work,
            tx_ack,
        ));

        Ok(ApplierHub {
            me,
            tx_work,
            rx_ack,
            _executor_handle: executor_handle,
        })
    }

    /// Submits a unit of work by sending it to the work channel.
    pub(crate) fn submit_work(
        &mut self,
        id: CommandId,
        work: ApplierWork,
    ) -> Result<(), CanopyError> {
        self.tx_work
            .send((id, work))
            .map_err(|e| CanopyError::msg(e.to_string()))
    }

    /// Waits for the next execution result by receiving from the ack
    /// channel. Results for `Execute` work arrive in submission order;
    /// `Snapshot` results may arrive later than work submitted after them.
    pub(crate) async fn get_result(
        &mut self,
    ) -> Result<(CommandId, CommandResult), CanopyError> {
        match self.rx_ack.recv().await {
            Some((id, result)) => Ok((id, result)),
            None => logged_err!(self.me; "ack channel has been closed"),
        }
    }
}

// ApplierHub executor task implementation
impl ApplierHub {
    /// Executor task function. The state machine is held behind an `Arc`:
    /// a snapshot clones the `Arc` and encodes on a blocking task, and the
    /// next command that executes afterwards clones the state itself
    /// (`Arc::make_mut`), so snapshotting never blocks the command stream.
    async fn executor_task<S: StateMachine>(
        me: ReplicaId,
        mut state: Arc<S>,
        mut rx_work: mpsc::UnboundedReceiver<(CommandId, ApplierWork)>,
        tx_ack: mpsc::UnboundedSender<(CommandId, CommandResult)>,
    ) {
        pf_debug!(me; "applier executor task spawned");

        while let Some((id, work)) = rx_work.recv().await {
            match work {
                ApplierWork::Execute { cmd } => {
                    let result = Arc::make_mut(&mut state).execute(&cmd);
                    pf_trace!(me; "executed {:?} result {:?}", cmd, result);
                    if let Err(e) = tx_ack.send((id, result)) {
                        pf_error!(me; "error sending to tx_ack: {}", e);
                    }
                }

                ApplierWork::Snapshot { index_fn } => {
                    let index = index_fn();
                    let frozen = state.clone();
                    let tx_ack_ref = tx_ack.clone();
                    task::spawn_blocking(move || {
                        let result = match frozen.snapshot() {
                            Ok(data) => CommandResult::ok(
                                ReplyValue::Snapshot { data, index },
                            ),
                            Err(e) => CommandResult::err(e),
                        };
                        if let Err(e) = tx_ack_ref.send((id, result)) {
                            pf_error!(me; "error sending snapshot ack: {}", e);
                        }
                    });
                }
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "applier executor task exited");
    }
}
