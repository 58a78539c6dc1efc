//! VrReplica -- normal-case replication pipeline: `Prepare` / `PrepareOk` /
//! `Commit` handling, and dispatch of all peer traffic.

use super::*;

use crate::server::ReqId;

// VrReplica peer request/reply dispatch
impl VrReplica {
    /// Handler of an inbound peer request; every branch sends exactly one
    /// reply (refusals as the `Err(String)` arm).
    pub(crate) fn handle_peer_request(
        &mut self,
        peer: ReplicaId,
        req_id: ReqId,
        req: PeerRequest,
    ) -> Result<(), CanopyError> {
        match req {
            PeerRequest::Prepare {
                view,
                op_number,
                command,
                commit_number,
            } => self.handle_prepare(
                peer,
                req_id,
                view,
                op_number,
                command,
                commit_number,
            ),

            PeerRequest::Commit {
                view,
                commit_number,
            } => self.handle_commit(peer, req_id, view, commit_number),

            PeerRequest::StartViewChange {
                view,
                replica_number,
            } => self.handle_start_view_change(
                peer,
                req_id,
                view,
                replica_number,
            ),

            PeerRequest::DoViewChange {
                view,
                replica_number,
                log,
                normal_view,
                op_number,
                commit_number,
            } => self.handle_do_view_change(
                peer,
                req_id,
                replica_number,
                DoViewChangeMsg {
                    view,
                    log,
                    normal_view,
                    op_number,
                    commit_number,
                },
            ),

            PeerRequest::StartView {
                view,
                log,
                op_number,
                commit_number,
            } => self.handle_start_view(
                peer,
                req_id,
                view,
                log,
                op_number,
                commit_number,
            ),

            PeerRequest::Recovery {
                replica_number,
                nonce,
            } => self.handle_recovery(peer, req_id, replica_number, nonce),

            PeerRequest::RecoveryResponse {
                view,
                nonce,
                log,
                op_number,
                commit_number,
                replica_number,
            } => self.handle_recovery_response(
                peer,
                req_id,
                nonce,
                replica_number,
                RecoveryResponseMsg {
                    view,
                    log,
                    op_number,
                    commit_number,
                },
            ),
        }
    }

    /// Handler of a gathered peer reply. Refusals and unreachable-peer
    /// notices are logged and absorbed here; they never become fatal.
    pub(crate) fn handle_peer_reply(
        &mut self,
        peer: ReplicaId,
        reply: Result<PeerReply, String>,
    ) -> Result<(), CanopyError> {
        match reply {
            Ok(PeerReply::PrepareOk {
                view,
                op_number,
                replica_number,
                lease_deadline,
            }) => self.handle_prepare_ok(
                view,
                op_number,
                replica_number,
                lease_deadline,
            ),

            Ok(PeerReply::Heartbeat {
                replica_number,
                lease_deadline,
            }) => self.handle_heartbeat_reply(replica_number, lease_deadline),

            Ok(PeerReply::Ack) => Ok(()),

            Err(refusal) => {
                pf_debug!(self.id; "peer {} refused: {}", peer, refusal);
                Ok(())
            }
        }
    }
}

// VrReplica normal-case backup side
impl VrReplica {
    /// Handler of a `Prepare` from the master of my view: append the op,
    /// grant a fresh lease, and piggyback commit catch-up.
    #[allow(clippy::too_many_arguments)]
    fn handle_prepare(
        &mut self,
        peer: ReplicaId,
        req_id: ReqId,
        view: View,
        op_number: OpNumber,
        command: Command,
        commit_number: OpNumber,
    ) -> Result<(), CanopyError> {
        pf_trace!(self.id; "got Prepare op {} @ view {} <- {}",
                           op_number, view, peer);

        if view > self.view {
            // a new master must have been elected without me
            self.transport
                .send_reply(peer, req_id, Err("recovering".into()))?;
            return self.prepare_recovery();
        } else if view < self.view {
            // message from an old master
            self.transport
                .send_reply(peer, req_id, Err("wrong view".into()))?;
            return Ok(());
        }

        if self.status != Status::Normal {
            self.transport.send_reply(
                peer,
                req_id,
                Err("not in normal mode".into()),
            )?;
            return Ok(());
        }

        if op_number <= self.op_number {
            // master must be resending some old request
            self.transport
                .send_reply(peer, req_id, Err("old op number".into()))?;
            return Ok(());
        }
        if op_number > self.op_number + 1 {
            // I have fallen behind and my log has a hole
            self.transport
                .send_reply(peer, req_id, Err("log gap".into()))?;
            return self.prepare_recovery();
        }

        // accept: grant the master a fresh lease and re-arm my own timer
        let lease_deadline = SystemTime::now() + self.lease();
        self.lease_timer.kickoff(self.lease())?;

        self.op_number += 1;
        self.log.append(self.op_number, command)?;

        self.transport.send_reply(
            peer,
            req_id,
            Ok(PeerReply::PrepareOk {
                view: self.view,
                op_number: self.op_number,
                replica_number: self.id,
                lease_deadline,
            }),
        )?;

        // commit whatever the master has declared committed (this keeps the
        // number of standalone Commit messages low)
        self.do_commit_up_to(commit_number)
    }

    /// Handler of a `Commit` from the master of my view, doubling as the
    /// lease renewal heartbeat.
    fn handle_commit(
        &mut self,
        peer: ReplicaId,
        req_id: ReqId,
        view: View,
        commit_number: OpNumber,
    ) -> Result<(), CanopyError> {
        if view > self.view {
            self.transport
                .send_reply(peer, req_id, Err("recovering".into()))?;
            return self.prepare_recovery();
        } else if view < self.view {
            self.transport
                .send_reply(peer, req_id, Err("wrong view".into()))?;
            return Ok(());
        }

        if self.status != Status::Normal {
            self.transport.send_reply(
                peer,
                req_id,
                Err("not in normal mode".into()),
            )?;
            return Ok(());
        }

        let lease_deadline = SystemTime::now() + self.lease();
        self.lease_timer.kickoff(self.lease())?;

        self.transport.send_reply(
            peer,
            req_id,
            Ok(PeerReply::Heartbeat {
                replica_number: self.id,
                lease_deadline,
            }),
        )?;

        self.do_commit_up_to(commit_number)
    }
}

// VrReplica normal-case master side
impl VrReplica {
    /// Handler of a `PrepareOk` granted by a backup. When acks from f peers
    /// have been gathered (myself implicit, so f + 1 total), the in-flight
    /// op commits.
    fn handle_prepare_ok(
        &mut self,
        view: View,
        op_number: OpNumber,
        replica_number: ReplicaId,
        lease_deadline: SystemTime,
    ) -> Result<(), CanopyError> {
        if view != self.view || !self.is_master() || self.status != Status::Normal
        {
            return Ok(());
        }

        // any suitable PrepareOk also counts as a heartbeat grant, even if
        // it turns out stale for the in-flight op
        self.record_lease_grant(replica_number, lease_deadline)?;

        if op_number != self.op_number {
            return Ok(()); // stale ack of an already-committed op
        }
        if self.prepare_acks.get(replica_number)? {
            return Ok(()); // duplicate ack from this peer
        }

        self.prepare_acks.set(replica_number, true)?;
        self.acks_count += 1;
        pf_trace!(self.id; "PrepareOk op {} <- {} acks {:?}",
                           op_number, replica_number, self.prepare_acks);

        if self.acks_count == self.f {
            // quorum reached: commit, then piggyback a Commit broadcast so
            // backups learn the new commit number promptly
            self.do_commit_up_to(self.op_number)?;
            self.bcast_commits()?;
            self.try_launch_next_write()?;
        }

        Ok(())
    }

    /// Handler of a `Heartbeat` reply granted by a backup in response to a
    /// `Commit` broadcast.
    fn handle_heartbeat_reply(
        &mut self,
        replica_number: ReplicaId,
        lease_deadline: SystemTime,
    ) -> Result<(), CanopyError> {
        if !self.is_master() || self.status != Status::Normal {
            return Ok(());
        }
        self.record_lease_grant(replica_number, lease_deadline)
    }
}
