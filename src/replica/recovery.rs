//! VrReplica -- the recovery protocol: one-replica catch-up via whole-log
//! state transfer from a quorum of Normal peers.

use super::*;

use crate::server::ReqId;

// Free function for unit-testability of the recovery source selection.
//
/// Selects which `RecoveryResponse` to adopt: the one with the largest
/// view, tie-broken by largest `op_number`.
pub(crate) fn select_recovery_source(
    msgs: &HashMap<ReplicaId, RecoveryResponseMsg>,
) -> ReplicaId {
    debug_assert!(!msgs.is_empty());

    let mut source: ReplicaId = 0;
    let mut source_key: (View, OpNumber, bool) = (0, 0, false);
    for (&replica, msg) in msgs {
        let key = (msg.view, msg.op_number, true);
        if key > source_key {
            source_key = key;
            source = replica;
        }
    }
    source
}

// VrReplica recovery logic
impl VrReplica {
    /// Enters Recovery status with a fresh nonce and asks all peers for
    /// their state. Idempotent while a recovery is already in progress.
    pub(crate) fn prepare_recovery(&mut self) -> Result<(), CanopyError> {
        if self.status == Status::Recovering {
            return Ok(()); // keep waiting on the in-flight recovery
        }

        self.status = Status::Recovering;
        self.nonce = rand::random();
        self.rec_replies.clear();
        self.rec_msgs.clear();
        self.abandon_client_state();
        self.renew_timer.cancel()?;
        pf_info!(self.id; "entering recovery with nonce {:#x}", self.nonce);

        self.transport.bcast_req(PeerRequest::Recovery {
            replica_number: self.id,
            nonce: self.nonce,
        })?;
        // re-arm the timer so a stalled recovery gets retried
        self.lease_timer.kickoff(self.lease())?;
        Ok(())
    }

    /// Re-broadcasts the in-flight `Recovery` (same nonce), keeping
    /// already-gathered responses valid.
    pub(crate) fn rebroadcast_recovery(&mut self) -> Result<(), CanopyError> {
        debug_assert_eq!(self.status, Status::Recovering);
        self.transport.bcast_req(PeerRequest::Recovery {
            replica_number: self.id,
            nonce: self.nonce,
        })?;
        self.lease_timer.kickoff(self.lease())?;
        Ok(())
    }

    /// Handler of a `Recovery` request from a recovering peer: answer only
    /// while Normal, echoing the nonce, by unicasting my whole state back.
    pub(crate) fn handle_recovery(
        &mut self,
        peer: ReplicaId,
        req_id: ReqId,
        replica_number: ReplicaId,
        nonce: Nonce,
    ) -> Result<(), CanopyError> {
        if self.status != Status::Normal {
            self.transport.send_reply(
                peer,
                req_id,
                Err("not in normal mode".into()),
            )?;
            return Ok(());
        }

        self.transport.send_reply(peer, req_id, Ok(PeerReply::Ack))?;
        pf_debug!(self.id; "answering recovery of {} nonce {:#x}",
                           replica_number, nonce);
        self.transport.send_req(
            replica_number,
            PeerRequest::RecoveryResponse {
                view: self.view,
                nonce,
                log: self.log.clone(),
                op_number: self.op_number,
                commit_number: self.commit_number,
                replica_number: self.id,
            },
        )?;
        Ok(())
    }

    /// Handler of a `RecoveryResponse` unicast to me while recovering.
    /// Completes the recovery once f + 1 distinct responses echoing my
    /// nonce have been gathered.
    pub(crate) fn handle_recovery_response(
        &mut self,
        peer: ReplicaId,
        req_id: ReqId,
        nonce: Nonce,
        replica_number: ReplicaId,
        msg: RecoveryResponseMsg,
    ) -> Result<(), CanopyError> {
        if self.status != Status::Recovering {
            self.transport
                .send_reply(peer, req_id, Err("not recovering".into()))?;
            return Ok(());
        }
        if nonce != self.nonce {
            // response to an earlier recovery of mine; cross-recovery
            // replay must not count
            self.transport
                .send_reply(peer, req_id, Err("stale nonce".into()))?;
            return Ok(());
        }

        self.transport.send_reply(peer, req_id, Ok(PeerReply::Ack))?;

        if self.rec_replies.get(replica_number)? {
            return Ok(()); // duplicate
        }
        self.rec_replies.set(replica_number, true)?;
        self.rec_msgs.insert(replica_number, msg);
        pf_debug!(self.id; "RecoveryResponse <- {} count {}",
                           replica_number, self.rec_msgs.len());

        if self.rec_msgs.len() as u8 == self.f + 1 {
            self.complete_recovery()?;
        }
        Ok(())
    }

    /// Adopts the state of the freshest gathered response and resumes
    /// Normal operation.
    fn complete_recovery(&mut self) -> Result<(), CanopyError> {
        let source = select_recovery_source(&self.rec_msgs);
        let msg = self.rec_msgs.remove(&source).unwrap();

        // views never decrease, even if all responders are behind me
        if msg.view > self.view {
            self.view = msg.view;
        }
        self.log = msg.log;
        self.op_number = msg.op_number;
        self.status = Status::Normal;
        self.normal_view = self.view;
        self.rec_replies.clear();
        self.rec_msgs.clear();
        self.heartbeats.clear();

        pf_info!(self.id; "recovery complete @ view {}: op {} commit {}",
                          self.view, self.op_number, msg.commit_number);

        if self.is_master() {
            self.become_master()?;
        } else {
            self.lease_timer.kickoff(self.lease())?;
        }

        // apply everything newly learned committed; my previously applied
        // prefix (if any) is identical by prefix agreement
        self.do_commit_up_to(msg.commit_number)
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;
    use crate::statemach::Command;

    fn log_of(n: u64) -> OpLog {
        let mut log = OpLog::new();
        for i in 1..=n {
            log.append(
                i,
                Command::Push {
                    value: format!("m{}", i),
                },
            )
            .unwrap();
        }
        log
    }

    fn rr(view: View, op_number: OpNumber) -> RecoveryResponseMsg {
        RecoveryResponseMsg {
            view,
            log: log_of(op_number),
            op_number,
            commit_number: op_number,
        }
    }

    #[test]
    fn select_largest_view_wins() {
        let mut msgs = HashMap::new();
        msgs.insert(0, rr(3, 2));
        msgs.insert(1, rr(5, 1));
        assert_eq!(select_recovery_source(&msgs), 1);
    }

    #[test]
    fn select_tie_broken_by_op_number() {
        let mut msgs = HashMap::new();
        msgs.insert(0, rr(4, 2));
        msgs.insert(2, rr(4, 6));
        assert_eq!(select_recovery_source(&msgs), 2);
    }
}
