//! VrReplica -- client request entrance (the server facade).

use super::*;

use crate::server::{ApiReply, ApiRequest, ApplierWork};
use crate::statemach::CommandResult;

use std::sync::atomic::Ordering;

// VrReplica client requests entrance
impl VrReplica {
    /// Handler of a client request received through the external API.
    pub(crate) fn handle_api_request(
        &mut self,
        client: ClientId,
        req: ApiRequest,
    ) -> Result<(), CanopyError> {
        match req {
            ApiRequest::Req { id: req_id, cmd } => {
                self.handle_client_command(client, req_id, cmd)
            }

            ApiRequest::Snapshot { id: req_id } => {
                self.handle_client_snapshot(client, req_id)
            }

            ApiRequest::GetMaster { id: req_id } => {
                let master = if self.status == Status::Normal {
                    Some(self.master_id())
                } else {
                    None
                };
                self.external_api.send_reply(
                    ApiReply::MasterInfo { id: req_id, master },
                    client,
                )
            }

            // leave notifications are absorbed by the client servant task
            ApiRequest::Leave => Ok(()),
        }
    }

    /// Handler of a state-machine command from a client.
    fn handle_client_command(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        cmd: Command,
    ) -> Result<(), CanopyError> {
        // digest probes are answerable on any replica in Normal status;
        // they are non-linearizable by design
        if cmd.is_digest() && self.status == Status::Normal {
            pf_trace!(self.id; "local digest probe from client {}", client);
            return self.submit_local_read(client, req_id, cmd);
        }

        if self.status != Status::Normal {
            return self.refuse_request(client, req_id, "master failover", None);
        }

        if cmd.is_read_only() {
            if self.is_master() && self.lease_valid() {
                // reads skip replication iff I hold a quorum-granted lease
                // at the moment of dispatch
                pf_trace!(self.id; "lease-guarded local read from client {}",
                                   client);
                return self.submit_local_read(client, req_id, cmd);
            }
            if !self.is_master() {
                return self.refuse_request(
                    client,
                    req_id,
                    "not master",
                    Some(self.master_id()),
                );
            }
            // master without a valid lease: fall through to the write path,
            // which linearizes the read through replication
            pf_debug!(self.id; "lease lapsed; read goes through replication");
        } else if !self.is_master() {
            return self.refuse_request(
                client,
                req_id,
                "not master",
                Some(self.master_id()),
            );
        }

        self.pending_writes.push_back((client, req_id, cmd));
        self.try_launch_next_write()
    }

    /// Handler of a snapshot request from a client: served as a
    /// lease-guarded read on the master.
    fn handle_client_snapshot(
        &mut self,
        client: ClientId,
        req_id: RequestId,
    ) -> Result<(), CanopyError> {
        if self.status != Status::Normal {
            return self.refuse_request(client, req_id, "master failover", None);
        }
        if !self.is_master() {
            return self.refuse_request(
                client,
                req_id,
                "not master",
                Some(self.master_id()),
            );
        }
        if !self.lease_valid() {
            return self.refuse_request(client, req_id, "lease lapsed", None);
        }

        let read_seq = self.read_seq;
        self.read_seq += 1;
        self.client_of_read.insert(read_seq, (client, req_id));

        // the applier consults this closure at admission time, so the index
        // is obtained atomically with the snapshot contents
        let commit_watch = self.commit_watch.clone();
        self.applier.submit_work(
            Self::make_read_id(read_seq),
            ApplierWork::Snapshot {
                index_fn: Box::new(move || commit_watch.load(Ordering::SeqCst)),
            },
        )
    }

    /// Submits a read-only command directly to the applier, bypassing
    /// replication.
    fn submit_local_read(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        cmd: Command,
    ) -> Result<(), CanopyError> {
        let read_seq = self.read_seq;
        self.read_seq += 1;
        self.client_of_read.insert(read_seq, (client, req_id));
        self.applier.submit_work(
            Self::make_read_id(read_seq),
            ApplierWork::Execute { cmd },
        )
    }

    /// Refuses a client request with given error string, optionally telling
    /// the client where the master is.
    fn refuse_request(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        error: &str,
        redirect: Option<ReplicaId>,
    ) -> Result<(), CanopyError> {
        pf_trace!(self.id; "refusing client {} req {}: {}",
                           client, req_id, error);
        self.external_api.send_reply(
            ApiReply::Reply {
                id: req_id,
                result: Some(CommandResult::err(error)),
                redirect,
            },
            client,
        )
    }

    /// If I am the master in Normal status with no op currently in flight,
    /// starts replicating the next admitted client command.
    pub(crate) fn try_launch_next_write(&mut self) -> Result<(), CanopyError> {
        if !self.is_master() || self.status != Status::Normal {
            return Ok(());
        }
        // one client op in flight at a time: the last op must have been
        // committed before the next may start
        if self.op_number != self.commit_number {
            return Ok(());
        }

        if let Some((client, req_id, cmd)) = self.pending_writes.pop_front() {
            self.op_number += 1;
            self.log.append(self.op_number, cmd.clone())?;
            self.prepare_acks.clear();
            self.acks_count = 0;
            self.client_of_op.insert(self.op_number, (client, req_id));

            self.transport.bcast_req(PeerRequest::Prepare {
                view: self.view,
                op_number: self.op_number,
                command: cmd,
                commit_number: self.commit_number,
            })?;
            pf_debug!(self.id; "broadcast Prepare for op {} @ view {}",
                               self.op_number, self.view);
        }

        Ok(())
    }

    /// Drops client-visible bookkeeping that no longer makes sense after
    /// leaving Normal status or adopting foreign state; affected clients
    /// will time out and retry against the (possibly new) master.
    pub(crate) fn abandon_client_state(&mut self) {
        self.pending_writes.clear();
        self.client_of_op.clear();
        self.prepare_acks.clear();
        self.acks_count = 0;
    }
}
