//! VrReplica -- the view-change protocol: `StartViewChange` /
//! `DoViewChange` / `StartView`.

use super::*;

use crate::server::ReqId;

// Free function for unit-testability of the post-view-change selection.
//
/// Selects the authoritative post-view-change state from a quorum of
/// retained `DoViewChange` messages: the new view is the largest view
/// carried (handles skipped views); the log comes from the message with the
/// largest `normal_view`, tie-broken by largest `op_number`; the commit
/// number is the largest one carried. Returns `(view, source_replica,
/// commit_number)`.
pub(crate) fn select_post_view_change(
    msgs: &HashMap<ReplicaId, DoViewChangeMsg>,
) -> (View, ReplicaId, OpNumber) {
    debug_assert!(!msgs.is_empty());

    let mut max_view: View = 0;
    let mut max_commit: OpNumber = 0;
    let mut source: ReplicaId = 0;
    let mut source_key: (View, OpNumber, bool) = (0, 0, false);

    for (&replica, msg) in msgs {
        if msg.view > max_view {
            max_view = msg.view;
        }
        if msg.commit_number > max_commit {
            max_commit = msg.commit_number;
        }
        let key = (msg.normal_view, msg.op_number, true);
        if key > source_key {
            source_key = key;
            source = replica;
        }
    }

    (max_view, source, max_commit)
}

// VrReplica view-change logic
impl VrReplica {
    /// Clears the per-view-change scratch state.
    fn clear_view_change_scratch(&mut self) {
        self.svc_replies.clear();
        self.svc_count = 0;
        self.dvc_replies.clear();
        self.dvc_msgs.clear();
    }

    /// Notices that a view change is needed and kicks it off: bump the
    /// view, tell everyone, and re-arm the lease timer so a stuck view
    /// change escalates into a further one.
    pub(crate) fn prepare_view_change(&mut self) -> Result<(), CanopyError> {
        if self.status == Status::Normal {
            self.normal_view = self.view;
        }
        self.status = Status::ViewChange;
        self.view += 1;
        self.clear_view_change_scratch();
        self.abandon_client_state();
        self.renew_timer.cancel()?;
        pf_info!(self.id; "view change started -> view {}", self.view);

        self.transport.bcast_req(PeerRequest::StartViewChange {
            view: self.view,
            replica_number: self.id,
        })?;
        self.lease_timer.kickoff(self.lease())?;
        Ok(())
    }

    /// Handler of a `StartViewChange` from a peer. Adopting a higher view
    /// re-broadcasts my own `StartViewChange`; once f peers proposed this
    /// view (myself implicit), my state goes to the presumed new master as
    /// a `DoViewChange`.
    pub(crate) fn handle_start_view_change(
        &mut self,
        peer: ReplicaId,
        req_id: ReqId,
        view: View,
        replica_number: ReplicaId,
    ) -> Result<(), CanopyError> {
        if view < self.view {
            // this view is already behind mine
            self.transport
                .send_reply(peer, req_id, Err("wrong view".into()))?;
            return Ok(());
        }
        if self.status == Status::Recovering {
            // cannot join a view change while my log is unusable
            self.transport
                .send_reply(peer, req_id, Err("recovering".into()))?;
            return Ok(());
        }

        if view > self.view {
            // first time I see this view change; join and re-broadcast
            if self.status == Status::Normal {
                self.normal_view = self.view;
            }
            self.view = view;
            self.status = Status::ViewChange;
            self.clear_view_change_scratch();
            self.abandon_client_state();
            self.renew_timer.cancel()?;
            pf_info!(self.id; "joining view change -> view {}", self.view);

            self.transport.bcast_req(PeerRequest::StartViewChange {
                view: self.view,
                replica_number: self.id,
            })?;
            self.lease_timer.kickoff(self.lease())?;
        }

        if self.status != Status::ViewChange {
            // stale proposal of my current, already-completed view
            self.transport
                .send_reply(peer, req_id, Ok(PeerReply::Ack))?;
            return Ok(());
        }

        if !self.svc_replies.get(replica_number)? {
            self.svc_replies.set(replica_number, true)?;
            self.svc_count += 1;
            pf_debug!(self.id; "StartViewChange <- {} count {} @ view {}",
                               replica_number, self.svc_count, self.view);

            if self.svc_count == self.f {
                // enough replicas propose this view change; my own proposal
                // is implicit, so a quorum agrees
                let dvc = DoViewChangeMsg {
                    view: self.view,
                    log: self.log.clone(),
                    normal_view: self.normal_view,
                    op_number: self.op_number,
                    commit_number: self.commit_number,
                };
                if self.is_master() {
                    // the new master short-circuits its own DoViewChange
                    self.ingest_do_view_change(self.id, dvc)?;
                } else {
                    pf_debug!(self.id; "sending DoViewChange -> {} @ view {}",
                                       self.master_id(), self.view);
                    self.transport.send_req(
                        self.master_id(),
                        PeerRequest::DoViewChange {
                            view: dvc.view,
                            replica_number: self.id,
                            log: dvc.log,
                            normal_view: dvc.normal_view,
                            op_number: dvc.op_number,
                            commit_number: dvc.commit_number,
                        },
                    )?;
                }
            }
        }

        self.transport.send_reply(peer, req_id, Ok(PeerReply::Ack))
    }

    /// Handler of a `DoViewChange` sent to me as the presumed new master.
    pub(crate) fn handle_do_view_change(
        &mut self,
        peer: ReplicaId,
        req_id: ReqId,
        replica_number: ReplicaId,
        msg: DoViewChangeMsg,
    ) -> Result<(), CanopyError> {
        if msg.view < self.view {
            self.transport
                .send_reply(peer, req_id, Err("wrong view".into()))?;
            return Ok(());
        }
        if self.status == Status::Recovering {
            self.transport
                .send_reply(peer, req_id, Err("recovering".into()))?;
            return Ok(());
        }

        if msg.view > self.view {
            // a view change for a later view reached me before any
            // StartViewChange did; join it now
            if self.status == Status::Normal {
                self.normal_view = self.view;
            }
            self.view = msg.view;
            self.status = Status::ViewChange;
            self.clear_view_change_scratch();
            self.abandon_client_state();
            self.renew_timer.cancel()?;
            self.transport.bcast_req(PeerRequest::StartViewChange {
                view: self.view,
                replica_number: self.id,
            })?;
            self.lease_timer.kickoff(self.lease())?;
        }

        if self.status != Status::ViewChange {
            self.transport.send_reply(
                peer,
                req_id,
                Err("not in view change".into()),
            )?;
            return Ok(());
        }
        if !self.is_master() {
            // mis-addressed: I am not the master of this view
            self.transport.send_reply(
                peer,
                req_id,
                Err("not the new master".into()),
            )?;
            return Ok(());
        }

        self.transport.send_reply(peer, req_id, Ok(PeerReply::Ack))?;
        self.ingest_do_view_change(replica_number, msg)
    }

    /// Records one `DoViewChange` message; completes the view change once
    /// f + 1 distinct replicas' states (mine included via short-circuit)
    /// have been gathered.
    pub(crate) fn ingest_do_view_change(
        &mut self,
        replica_number: ReplicaId,
        msg: DoViewChangeMsg,
    ) -> Result<(), CanopyError> {
        if self.dvc_replies.get(replica_number)? {
            return Ok(()); // duplicate
        }
        self.dvc_replies.set(replica_number, true)?;
        self.dvc_msgs.insert(replica_number, msg);
        pf_debug!(self.id; "DoViewChange <- {} count {} @ view {}",
                           replica_number, self.dvc_msgs.len(), self.view);

        if self.dvc_msgs.len() as u8 == self.f + 1 {
            self.complete_view_change()?;
        }
        Ok(())
    }

    /// Computes the authoritative post-view-change state from the gathered
    /// `DoViewChange` set, steps up as master, and announces `StartView`.
    fn complete_view_change(&mut self) -> Result<(), CanopyError> {
        let (new_view, source, max_commit) =
            select_post_view_change(&self.dvc_msgs);
        debug_assert!(new_view >= self.view);

        let chosen = self.dvc_msgs.remove(&source).unwrap();
        self.view = new_view;
        self.log = chosen.log;
        self.op_number = chosen.op_number;
        self.status = Status::Normal;
        self.normal_view = self.view;
        self.clear_view_change_scratch();

        pf_info!(self.id; "view change complete @ view {}: op {} commit {}",
                          self.view, self.op_number, max_commit);

        self.become_master()?;

        self.transport.bcast_req(PeerRequest::StartView {
            view: self.view,
            log: self.log.clone(),
            op_number: self.op_number,
            commit_number: max_commit,
        })?;

        // apply what is now known committed (my previously applied prefix
        // is identical by prefix agreement)
        self.do_commit_up_to(max_commit)
    }

    /// Handler of a `StartView` from the new master: adopt the carried
    /// state and resume Normal operation as a backup.
    pub(crate) fn handle_start_view(
        &mut self,
        peer: ReplicaId,
        req_id: ReqId,
        view: View,
        log: OpLog,
        op_number: OpNumber,
        commit_number: OpNumber,
    ) -> Result<(), CanopyError> {
        if view < self.view {
            self.transport
                .send_reply(peer, req_id, Err("wrong view".into()))?;
            return Ok(());
        }
        if view == self.view && self.status == Status::Normal {
            // duplicate announcement of my current view
            self.transport
                .send_reply(peer, req_id, Ok(PeerReply::Ack))?;
            return Ok(());
        }
        if self.status == Status::Recovering {
            self.transport
                .send_reply(peer, req_id, Err("recovering".into()))?;
            return Ok(());
        }

        self.view = view;
        self.log = log;
        self.op_number = op_number;
        self.status = Status::Normal;
        self.normal_view = self.view;
        self.clear_view_change_scratch();
        self.abandon_client_state();
        self.heartbeats.clear();
        self.renew_timer.cancel()?;
        self.lease_timer.kickoff(self.lease())?;

        pf_info!(self.id; "view change complete @ view {}: op {} commit {}",
                          self.view, self.op_number, commit_number);

        self.transport.send_reply(peer, req_id, Ok(PeerReply::Ack))?;
        self.do_commit_up_to(commit_number)
    }
}

#[cfg(test)]
mod leadership_tests {
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

    fn dvc(
        view: View,
        normal_view: View,
        op_number: OpNumber,
        commit_number: OpNumber,
    ) -> DoViewChangeMsg {
        DoViewChangeMsg {
            view,
            log: log_of(op_number),
            normal_view,
            op_number,
            commit_number,
        }
    }

    #[test]
    fn select_largest_normal_view_wins() {
        let mut msgs = HashMap::new();
        msgs.insert(0, dvc(2, 1, 3, 2));
        msgs.insert(1, dvc(2, 0, 9, 1));
        let (view, source, commit) = select_post_view_change(&msgs);
        // replica 0 was Normal more recently, so its shorter log wins
        assert_eq!((view, source, commit), (2, 0, 2));
    }

    #[test]
    fn select_tie_broken_by_op_number() {
        let mut msgs = HashMap::new();
        msgs.insert(1, dvc(3, 1, 4, 2));
        msgs.insert(2, dvc(3, 1, 6, 3));
        let (view, source, commit) = select_post_view_change(&msgs);
        assert_eq!((view, source, commit), (3, 2, 3));
    }

    #[test]
    fn select_takes_max_view_and_commit() {
        let mut msgs = HashMap::new();
        msgs.insert(0, dvc(5, 4, 7, 7));
        msgs.insert(2, dvc(7, 2, 5, 4));
        let (view, source, commit) = select_post_view_change(&msgs);
        // view 7 was proposed by a replica that skipped ahead; the log
        // still comes from the replica with the freshest normal view
        assert_eq!((view, source, commit), (7, 0, 7));
    }
}
