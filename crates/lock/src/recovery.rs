// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cluster membership, journal recovery coordination and withdraw.
//!
//! While a failed node's journal is being recovered, new lock requests are held back
//! (unless they are NOEXP) and grants that race with the block are parked at NL until
//! recovery finishes.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LockDlmError, Result};
use crate::lockspace::LockSpace;
use crate::types::{DlmMode, HandleId, LM_TYPE_JID, LockFlags, LockName, RecoveryEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeFlags {
    /// The filesystem was asked to recover this node's journal
    pub sent_cb: bool,
    /// The node left the cluster
    pub not_member: bool,
    pub recovery_done: bool,
    /// The last recovery attempt ran to completion (rather than giving up)
    pub last_finish: bool,
    pub have_jid: bool,
    /// The node announced a withdraw
    pub withdraw: bool,
}

/// What the lock space knows about one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    pub nodeid: u32,
    pub jid: u32,
    pub flags: NodeFlags,
    /// Request on the node's journal lock that waits for it to leave after a withdraw
    pub withdraw_handle: Option<HandleId>,
}

/// Outcome of a journal recovery reported by the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryResult {
    Success,
    /// Another node recovered the journal or recovery was abandoned
    GaveUp,
}

impl LockSpace {
    /// Register a cluster member and the journal it owns.
    pub fn add_node(&self, nodeid: u32, jid: u32) -> Result<()> {
        let mut nodes = self.inner.nodes.lock();
        let limit = self.inner.config.max_nodes;
        if !nodes.contains_key(&nodeid) && nodes.len() >= limit {
            return Err(LockDlmError::TableFull { table: "node", limit });
        }
        let record = nodes.entry(nodeid).or_insert_with(|| NodeRecord {
            nodeid,
            jid,
            flags: NodeFlags::default(),
            withdraw_handle: None,
        });
        record.jid = jid;
        record.flags.have_jid = true;
        record.flags.not_member = false;
        debug!(nodeid, jid, "node added");
        Ok(())
    }

    /// Forget a node that left cleanly.
    pub fn remove_node(&self, nodeid: u32) -> Option<NodeRecord> {
        let record = self.inner.nodes.lock().remove(&nodeid);
        if record.is_some() {
            debug!(nodeid, "node removed");
        }
        record
    }

    pub fn node(&self, nodeid: u32) -> Option<NodeRecord> {
        self.inner.nodes.lock().get(&nodeid).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.inner.nodes.lock().values().cloned().collect();
        nodes.sort_by_key(|node| node.nodeid);
        nodes
    }

    /// A member failed: block locks and ask the filesystem to recover its journal.
    pub fn node_failed(&self, nodeid: u32) -> Result<()> {
        let notify = {
            let mut nodes = self.inner.nodes.lock();
            let Some(record) = nodes.get_mut(&nodeid) else {
                return Err(LockDlmError::internal(format!("node {nodeid} is not known")));
            };
            record.flags.not_member = true;
            record.flags.recovery_done = false;
            let notify = record.flags.have_jid && !record.flags.sent_cb;
            if notify {
                record.flags.sent_cb = true;
            }
            notify.then_some(record.jid)
        };

        warn!(nodeid, "node failed, blocking locks for recovery");
        self.inner.flags.write().recover = true;
        self.block_locks();
        if let Some(jid) = notify {
            self.inner.callback.on_recovery_event(jid, RecoveryEvent::NeedRecovery);
        }
        Ok(())
    }

    /// The filesystem finished with a journal. Locks are unblocked once every failed
    /// node's journal is done.
    pub fn recovery_done(&self, jid: u32, result: RecoveryResult) -> Result<()> {
        let finished = {
            let mut nodes = self.inner.nodes.lock();
            let Some(record) = nodes
                .values_mut()
                .find(|node| node.jid == jid && node.flags.have_jid && node.flags.not_member)
            else {
                return Err(LockDlmError::internal(format!("no failed node owns journal {jid}")));
            };
            record.flags.recovery_done = true;
            record.flags.last_finish = result == RecoveryResult::Success;
            let finished = nodes
                .values()
                .filter(|node| node.flags.not_member)
                .all(|node| node.flags.recovery_done);
            if finished {
                nodes.retain(|_, node| !node.flags.not_member);
            }
            finished
        };

        match result {
            RecoveryResult::Success => info!(jid, "journal recovered"),
            RecoveryResult::GaveUp => warn!(jid, "journal recovery given up"),
        }
        self.inner.callback.on_recovery_event(jid, RecoveryEvent::RecoveryDone);

        if finished {
            self.inner.flags.write().recover = false;
            self.unblock_locks();
        }
        Ok(())
    }

    /// Hold back new requests that are not NOEXP.
    pub fn block_locks(&self) {
        self.inner.flags.write().block_locks = true;
        self.inner.dispatcher.set_blocked(true);
        info!("locks blocked");
    }

    /// Let held-back requests through.
    pub fn unblock_locks(&self) {
        self.inner.flags.write().block_locks = false;
        self.inner.dispatcher.set_blocked(false);
        info!("locks unblocked");
    }

    /// Another node announced a withdraw. Its journal is recovered once it has let go
    /// of its journal lock.
    pub fn node_withdrawing(&self, nodeid: u32) -> Result<()> {
        let jid = {
            let mut nodes = self.inner.nodes.lock();
            let Some(record) = nodes.get_mut(&nodeid) else {
                return Err(LockDlmError::internal(format!("node {nodeid} is not known")));
            };
            if record.flags.withdraw {
                return Ok(());
            }
            record.flags.withdraw = true;
            record.jid
        };
        self.check_usable()?;

        let handle = self.new_handle(LockName::new(LM_TYPE_JID, u64::from(jid)))?;
        {
            let mut st = handle.state.lock();
            st.flags.in_lock = true;
            st.flags.no_bast = true;
        }
        if let Some(record) = self.inner.nodes.lock().get_mut(&nodeid) {
            record.withdraw_handle = Some(handle.id);
        }
        info!(nodeid, jid, "node withdrawing, waiting for its journal lock");

        let ls = self.clone();
        let wait = tokio::spawn(async move {
            let taken = ls.request_wait(&handle, DlmMode::Pr, LockFlags::NOEXP).await;
            if let Some(record) = ls.inner.nodes.lock().get_mut(&nodeid) {
                record.withdraw_handle = None;
            }
            match taken {
                Ok(_) => {
                    if let Err(err) = ls.node_failed(nodeid) {
                        warn!(nodeid, error = %err, "withdrawn node not recovered");
                    }
                }
                Err(err) => debug!(nodeid, error = %err, "stopped waiting for withdrawn node"),
            }
            if let Err(err) = ls.unlock_and_delete(handle.id) {
                debug!(nodeid, error = %err, "journal lock of withdrawn node not released");
            }
        });
        self.inner.tasks.lock().push(wait);
        Ok(())
    }

    pub(crate) fn cancel_withdraw_waits(&self) {
        let waits: Vec<HandleId> = self
            .inner
            .nodes
            .lock()
            .values()
            .filter_map(|node| node.withdraw_handle)
            .collect();
        for id in waits {
            if let Err(err) = self.cancel(id) {
                debug!(handle = %id, error = %err, "withdraw wait not cancelled");
            }
        }
    }

    /// Leave the cluster after a fatal error: release every lock and refuse new
    /// requests.
    pub async fn withdraw(&self) -> Result<()> {
        {
            let mut flags = self.inner.flags.write();
            if flags.withdraw {
                return Ok(());
            }
            flags.withdraw = true;
        }
        warn!(lockspace = %self.name(), jid = self.jid(), "withdrawing from the cluster");

        let busy: Vec<HandleId> = self
            .inner
            .handles
            .iter()
            .filter(|entry| entry.value().state.lock().busy)
            .map(|entry| *entry.key())
            .collect();
        for id in busy {
            if let Err(err) = self.cancel(id) {
                debug!(handle = %id, error = %err, "request not cancelled");
            }
        }
        self.release_all().await;

        self.inner
            .callback
            .on_recovery_event(self.jid(), RecoveryEvent::Withdraw);
        Ok(())
    }

    /// Take this node's journal lock, held EX for as long as the lock space is mounted.
    pub(crate) async fn acquire_journal_lock(&self) -> Result<()> {
        let name = LockName::new(LM_TYPE_JID, u64::from(self.jid()));
        let handle = self.new_handle(name)?;
        {
            let mut st = handle.state.lock();
            st.flags.in_lock = true;
            st.flags.no_bast = true;
        }
        if let Err(err) = self.request_wait(&handle, DlmMode::Ex, LockFlags::NOEXP).await {
            self.delete_handle(handle.id);
            return Err(err);
        }
        *self.inner.jid_handle.lock() = Some(handle.id);
        debug!(name = %name, handle = %handle.id, "journal lock taken");
        Ok(())
    }
}
