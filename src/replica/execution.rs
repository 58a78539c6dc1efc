//! VrReplica -- commit catch-up and applier result routing.

use super::*;

use crate::server::{ApiReply, ApplierWork, CommandId};
use crate::statemach::CommandResult;

use std::sync::atomic::Ordering;

// VrReplica execution logic
impl VrReplica {
    /// Advances `commit_number` to `target`, handing each newly committed
    /// command to the applier one index at a time. If `target` lies beyond
    /// my log, state transfer is required and recovery is initiated.
    pub(crate) fn do_commit_up_to(
        &mut self,
        target: OpNumber,
    ) -> Result<(), CanopyError> {
        if target <= self.commit_number {
            return Ok(()); // already committed up to target
        }
        if target > self.op_number {
            pf_debug!(self.id; "commit {} beyond op {}, need state transfer",
                               target, self.op_number);
            return self.prepare_recovery();
        }

        while self.commit_number < target {
            let next = self.commit_number + 1;
            let cmd = match self.log.get(next) {
                Some(cmd) => cmd.clone(),
                None => {
                    // cannot happen given the op_number check above
                    return logged_err!(self.id; "log entry {} missing", next);
                }
            };
            pf_trace!(self.id; "committing op {}", next);
            self.applier.submit_work(
                Self::make_apply_id(next),
                ApplierWork::Execute { cmd },
            )?;
            self.commit_number = next;
            self.commit_watch.store(next, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Handler of an applier execution result: routes it back to the
    /// waiting client, if any. Backups execute every committed command too
    /// but hold no client registrations, so their results are dropped here.
    pub(crate) fn handle_cmd_result(
        &mut self,
        cmd_id: CommandId,
        result: CommandResult,
    ) -> Result<(), CanopyError> {
        let (seq, is_read) = Self::split_command_id(cmd_id);

        let registered = if is_read {
            self.client_of_read.remove(&seq)
        } else {
            self.client_of_op.remove(&seq)
        };

        if let Some((client, req_id)) = registered {
            self.external_api.send_reply(
                ApiReply::Reply {
                    id: req_id,
                    result: Some(result),
                    redirect: None,
                },
                client,
            )?;
            pf_trace!(self.id; "replied -> client {} for req {}",
                               client, req_id);
        }

        Ok(())
    }
}
