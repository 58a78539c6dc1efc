//! VrReplica -- master-lease bookkeeping and timing discipline.
//!
//! Followers grant a lease (`now + lease`) on every accepted `Prepare` or
//! `Commit`. The master aggregates grants and serves reads locally until
//! the largest instant that a quorum of followers has agreed to, minus a
//! clock-drift margin. Follower timers double as the view-change trigger.

use super::*;

// Free function for unit-testability of the quorum lease math.
//
/// Computes the largest instant granted by at least f followers: with the
/// master itself that makes a quorum of f + 1 replicas agreeing the master
/// is authoritative until then. Followers that never granted count as
/// ancient grants.
pub(crate) fn quorum_granted_deadline(
    heartbeats: &HashMap<ReplicaId, SystemTime>,
    population: u8,
    me: ReplicaId,
    f: u8,
) -> SystemTime {
    let mut grants: Vec<SystemTime> = (0..population)
        .filter(|&p| p != me)
        .map(|p| {
            heartbeats
                .get(&p)
                .copied()
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
        .collect();
    grants.sort();
    // 2f followers in ascending order: the entry at index (len - f) is the
    // f-th largest grant
    grants[grants.len() - f as usize]
}

// VrReplica lease bookkeeping
impl VrReplica {
    /// True iff my quorum-granted lease deadline lies in the future. Only
    /// meaningful on the master; callers must additionally check mastership
    /// and Normal status.
    pub(crate) fn lease_valid(&self) -> bool {
        self.lease_deadline > SystemTime::now()
    }

    /// Records a follower's lease grant and recomputes my authoritative
    /// deadline, re-arming the renewal and inactivity timers accordingly.
    pub(crate) fn record_lease_grant(
        &mut self,
        peer: ReplicaId,
        grant: SystemTime,
    ) -> Result<(), CanopyError> {
        debug_assert!(self.is_master());
        self.heartbeats.insert(peer, grant);

        let granted = quorum_granted_deadline(
            &self.heartbeats,
            self.population,
            self.id,
            self.f,
        );
        // guard against clock skew between replicas
        let deadline = granted - self.max_clock_drift();
        if deadline <= self.lease_deadline {
            return Ok(()); // nothing new granted
        }
        self.lease_deadline = deadline;

        if let Ok(remaining) = deadline.duration_since(SystemTime::now()) {
            pf_trace!(self.id; "lease extended by quorum for {:?}", remaining);
            // my own inactivity timer follows the granted lease
            self.lease_timer.kickoff(remaining)?;
            // renew once remaining / renew_factor of the lease is left
            self.renew_timer
                .kickoff(remaining / self.config.renew_factor)?;
        }

        Ok(())
    }

    /// Steps up as the master of the current view: resets master-side
    /// bookkeeping and seeds the lease. The seed is justified by
    /// view-change completion: it required f + 1 replicas' lease timers to
    /// have fired, each re-arming for a full lease.
    pub(crate) fn become_master(&mut self) -> Result<(), CanopyError> {
        debug_assert!(self.is_master());
        pf_info!(self.id; "becoming master @ view {}", self.view);

        self.heartbeats.clear();
        self.prepare_acks.clear();
        self.acks_count = 0;

        let seed = self.lease() - self.max_clock_drift();
        self.lease_deadline = SystemTime::now() + seed;
        self.lease_timer.kickoff(seed)?;
        self.renew_timer.kickoff(seed / self.config.renew_factor)?;

        Ok(())
    }

    /// Broadcasts `Commit` messages, which carry the commit number and act
    /// as the lease renewal heartbeat.
    pub(crate) fn bcast_commits(&mut self) -> Result<(), CanopyError> {
        pf_trace!(self.id; "broadcast Commit {} @ view {}",
                           self.commit_number, self.view);
        self.transport.bcast_req(PeerRequest::Commit {
            view: self.view,
            commit_number: self.commit_number,
        })?;
        Ok(())
    }

    /// Handler of the follower lease timer firing: the master has been
    /// silent for a whole lease (or a view change / recovery is stuck), so
    /// escalate.
    pub(crate) fn handle_lease_timeout(&mut self) -> Result<(), CanopyError> {
        if self.status == Status::Recovering {
            // a view change cannot start from Recovering; nudge the
            // recovery along instead
            pf_warn!(self.id; "recovery stalled, re-broadcasting");
            return self.rebroadcast_recovery();
        }

        if self.is_master() && self.status == Status::Normal {
            pf_info!(self.id; "couldn't stay master @ view {}", self.view);
        }
        pf_info!(self.id; "lease timed out, trying view change");
        self.prepare_view_change()
    }

    /// Handler of the master renewal timer firing: refresh follower grants
    /// with a `Commit` heartbeat even if no new op is pending. An in-flight
    /// op whose `Prepare` may have been dropped is retransmitted instead;
    /// backups that already hold it refuse with "old op number".
    pub(crate) fn handle_renew_timeout(&mut self) -> Result<(), CanopyError> {
        if !self.is_master() || self.status != Status::Normal {
            return Ok(());
        }

        if self.op_number > self.commit_number {
            let cmd = match self.log.get(self.op_number) {
                Some(cmd) => cmd.clone(),
                None => {
                    return logged_err!(self.id; "log entry {} missing",
                                                self.op_number);
                }
            };
            pf_debug!(self.id; "retransmitting Prepare for op {}",
                               self.op_number);
            self.transport.bcast_req(PeerRequest::Prepare {
                view: self.view,
                op_number: self.op_number,
                command: cmd,
                commit_number: self.commit_number,
            })?;
        } else {
            self.bcast_commits()?;
        }

        // keep a steady heartbeat cadence even if grants stagnate; a fresh
        // quorum grant will re-arm this timer anyway
        let interval =
            (self.lease() - self.max_clock_drift()) / self.config.renew_factor;
        self.renew_timer.kickoff(interval)?;
        Ok(())
    }
}

#[cfg(test)]
mod leasing_tests {
    use super::*;
    use tokio::time::Duration;

    fn at(base: SystemTime, offset_ms: u64) -> SystemTime {
        base + Duration::from_millis(offset_ms)
    }

    #[test]
    fn quorum_deadline_full_grants() {
        let base = SystemTime::now();
        // population 3, me = 0, f = 1: two follower grants
        let mut hb = HashMap::new();
        hb.insert(1, at(base, 100));
        hb.insert(2, at(base, 300));
        // the f-th largest of [100, 300] is 300: follower 2 plus the
        // master itself form a quorum agreeing on it
        assert_eq!(quorum_granted_deadline(&hb, 3, 0, 1), at(base, 300));
    }

    #[test]
    fn quorum_deadline_partial_grants() {
        let base = SystemTime::now();
        let mut hb = HashMap::new();
        hb.insert(2, at(base, 500));
        // follower 1 never granted; its slot counts as ancient, and the
        // single real grant is still the f-th largest
        assert_eq!(quorum_granted_deadline(&hb, 3, 0, 1), at(base, 500));

        let hb = HashMap::new();
        assert_eq!(
            quorum_granted_deadline(&hb, 3, 0, 1),
            SystemTime::UNIX_EPOCH
        );
    }

    #[test]
    fn quorum_deadline_five_replicas() {
        let base = SystemTime::now();
        // population 5, me = 2, f = 2: four follower grants
        let mut hb = HashMap::new();
        hb.insert(0, at(base, 100));
        hb.insert(1, at(base, 400));
        hb.insert(3, at(base, 200));
        hb.insert(4, at(base, 300));
        // sorted [100, 200, 300, 400]; the 2nd largest is 300: followers
        // {1, 4} plus the master form a quorum of 3
        assert_eq!(quorum_granted_deadline(&hb, 5, 2, 2), at(base, 300));
    }

    #[test]
    fn quorum_deadline_ignores_self_entry() {
        let base = SystemTime::now();
        let mut hb = HashMap::new();
        hb.insert(0, at(base, 900)); // bogus self entry must not count
        hb.insert(1, at(base, 100));
        hb.insert(2, at(base, 200));
        assert_eq!(quorum_granted_deadline(&hb, 3, 0, 1), at(base, 200));
    }
}
