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

//! In-process lock manager.
//!
//! `LocalDlm` keeps the whole "cluster" in one process: every joined node gets a
//! [`LocalDlmNode`] implementing [`Dlm`] and its own notification channel. It follows
//! the usual DLM rules (granted/converting/waiting queues, the mode compatibility
//! matrix, blocking notifications, conversion deadlock detection, value blocks that
//! survive as long as any lock remains on the resource) and supports fault injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::dlm::{
    Dlm, DlmEvent, DlmEventReceiver, DlmEventSender, DlmFlags, DlmLockRequest, DlmNotification, DlmStatus, Lksb, SbFlags,
    event_channel,
};
use crate::types::{DlmLockId, DlmMode, HandleId, LockName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Granted,
    Converting,
    Waiting,
}

#[derive(Debug)]
struct LockEntry {
    nodeid: u32,
    tag: HandleId,
    name: LockName,
    /// Mode held; `Iv` while a new request waits
    granted: DlmMode,
    requested: DlmMode,
    flags: DlmFlags,
    bast: bool,
    /// Highest blocking mode already reported to the holder
    bast_sent: Option<DlmMode>,
    queue: Queue,
    demoted: bool,
}

#[derive(Debug)]
struct ResourceState {
    /// Locks holding a mode, including those converting
    granted: Vec<DlmLockId>,
    converting: VecDeque<DlmLockId>,
    waiting: VecDeque<DlmLockId>,
    lvb: Vec<u8>,
    lvb_valid: bool,
}

impl ResourceState {
    fn new(lvb_len: usize) -> Self {
        Self {
            granted: Vec::new(),
            converting: VecDeque::new(),
            waiting: VecDeque::new(),
            lvb: vec![0; lvb_len],
            lvb_valid: true,
        }
    }

    fn is_idle(&self) -> bool {
        self.granted.is_empty() && self.converting.is_empty() && self.waiting.is_empty()
    }

    fn unlink(&mut self, lkid: DlmLockId) {
        self.granted.retain(|id| *id != lkid);
        self.converting.retain(|id| *id != lkid);
        self.waiting.retain(|id| *id != lkid);
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Accept the call, then complete it with this status
    Complete(DlmStatus),
    /// Fail the call itself
    Reject(DlmStatus),
}

/// Call counters of a [`LocalDlm`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalDlmStats {
    pub lock_calls: u64,
    pub convert_calls: u64,
    pub unlock_calls: u64,
    pub cancel_calls: u64,
}

#[derive(Debug)]
struct ClusterState {
    lvb_len: usize,
    next_lkid: DlmLockId,
    resources: HashMap<LockName, ResourceState>,
    locks: HashMap<DlmLockId, LockEntry>,
    nodes: HashMap<u32, DlmEventSender>,
    waiters: HashMap<DlmLockId, oneshot::Sender<Lksb>>,
    faults: HashMap<LockName, VecDeque<Fault>>,
    stats: LocalDlmStats,
}

fn alternate(flags: DlmFlags, mode: DlmMode) -> Option<DlmMode> {
    match mode {
        DlmMode::Cw if flags.alt_pr => Some(DlmMode::Pr),
        DlmMode::Pr if flags.alt_cw => Some(DlmMode::Cw),
        _ => None,
    }
}

impl ClusterState {
    fn take_fault(&mut self, name: &LockName) -> Option<Fault> {
        let queue = self.faults.get_mut(name)?;
        let fault = queue.pop_front();
        if queue.is_empty() {
            self.faults.remove(name);
        }
        fault
    }

    fn holders_compatible(&self, name: &LockName, lkid: DlmLockId, mode: DlmMode) -> bool {
        self.resources.get(name).is_none_or(|res| {
            res.granted
                .iter()
                .filter(|id| **id != lkid)
                .all(|id| self.locks.get(id).is_none_or(|e| e.granted.compatible(mode)))
        })
    }

    /// Each of the two converts waits for the other's granted mode.
    fn conversion_deadlock(&self, name: &LockName, lkid: DlmLockId, held: DlmMode, mode: DlmMode) -> bool {
        let Some(res) = self.resources.get(name) else {
            return false;
        };
        res.converting.iter().filter(|id| **id != lkid).any(|id| {
            self.locks
                .get(id)
                .is_some_and(|other| !other.requested.compatible(held) && !mode.compatible(other.granted))
        })
    }

    fn send(&self, nodeid: u32, event: DlmEvent) {
        if let Some(tx) = self.nodes.get(&nodeid) {
            let _ = tx.send(event);
        }
    }

    fn deliver(&mut self, nodeid: u32, tag: HandleId, lksb: Lksb) {
        if let Some(waiter) = lksb.lkid.and_then(|lkid| self.waiters.remove(&lkid)) {
            let _ = waiter.send(lksb);
            return;
        }
        self.send(
            nodeid,
            DlmEvent {
                tag,
                notification: DlmNotification::Completion(lksb),
            },
        );
    }

    fn send_basts(&mut self, name: LockName, requester: DlmLockId, mode: DlmMode) {
        let Some(res) = self.resources.get(&name) else {
            return;
        };
        let holders: Vec<DlmLockId> = res.granted.iter().copied().filter(|id| *id != requester).collect();
        for id in holders {
            let Some(entry) = self.locks.get_mut(&id) else {
                continue;
            };
            if !entry.bast || entry.granted.compatible(mode) || entry.bast_sent.is_some_and(|sent| sent >= mode) {
                continue;
            }
            entry.bast_sent = Some(mode);
            let (nodeid, tag) = (entry.nodeid, entry.tag);
            self.send(
                nodeid,
                DlmEvent {
                    tag,
                    notification: DlmNotification::Blocking(mode),
                },
            );
        }
    }

    fn write_lvb(&mut self, lkid: DlmLockId, lvb: Option<Vec<u8>>) {
        let (Some(entry), Some(mut value)) = (self.locks.get(&lkid), lvb) else {
            return;
        };
        if !entry.granted.writes_lvb() {
            return;
        }
        if let Some(res) = self.resources.get_mut(&entry.name) {
            value.resize(res.lvb.len(), 0);
            res.lvb = value;
            res.lvb_valid = true;
        }
    }

    fn status_block(&self, lkid: DlmLockId, status: DlmStatus, flags: SbFlags) -> Option<(u32, HandleId, Lksb)> {
        let entry = self.locks.get(&lkid)?;
        let res = self.resources.get(&entry.name);
        let mut flags = flags;
        let lvb = match (status, res) {
            (DlmStatus::Granted, Some(res)) if entry.flags.valblk => {
                flags.valnotvalid = !res.lvb_valid;
                Some(res.lvb.clone())
            }
            _ => None,
        };
        let lksb = Lksb {
            status,
            lkid: Some(lkid),
            mode: entry.granted,
            flags,
            lvb,
        };
        Some((entry.nodeid, entry.tag, lksb))
    }

    fn grant(&mut self, lkid: DlmLockId, mode: DlmMode, altmode: bool) {
        let Some(entry) = self.locks.get_mut(&lkid) else {
            return;
        };
        entry.granted = mode;
        entry.requested = mode;
        entry.queue = Queue::Granted;
        entry.bast_sent = None;
        let demoted = std::mem::take(&mut entry.demoted);
        let name = entry.name;
        if let Some(res) = self.resources.get_mut(&name) {
            res.converting.retain(|id| *id != lkid);
            res.waiting.retain(|id| *id != lkid);
            if !res.granted.contains(&lkid) {
                res.granted.push(lkid);
            }
        }
        let flags = SbFlags {
            demoted,
            altmode,
            valnotvalid: false,
        };
        if let Some((nodeid, tag, lksb)) = self.status_block(lkid, DlmStatus::Granted, flags) {
            self.deliver(nodeid, tag, lksb);
        }
    }

    /// Grant `mode`, or its alternate when the request allows one.
    fn try_grant(&mut self, lkid: DlmLockId, name: LockName, mode: DlmMode, flags: DlmFlags) -> bool {
        if self.holders_compatible(&name, lkid, mode) {
            self.grant(lkid, mode, false);
            return true;
        }
        if let Some(alt) = alternate(flags, mode) {
            if self.holders_compatible(&name, lkid, alt) {
                self.grant(lkid, alt, true);
                return true;
            }
        }
        false
    }

    /// Complete a request without granting it. A new lock disappears; a convert
    /// falls back to the mode it held.
    fn fail_request(&mut self, lkid: DlmLockId, status: DlmStatus) {
        let Some(entry) = self.locks.get_mut(&lkid) else {
            return;
        };
        let name = entry.name;
        let new_lock = entry.granted == DlmMode::Iv;
        entry.requested = entry.granted;
        entry.queue = Queue::Granted;
        let demoted = std::mem::take(&mut entry.demoted);
        let flags = SbFlags {
            demoted,
            ..SbFlags::default()
        };
        let Some((nodeid, tag, lksb)) = self.status_block(lkid, status, flags) else {
            return;
        };
        if new_lock {
            self.locks.remove(&lkid);
            if let Some(res) = self.resources.get_mut(&name) {
                res.unlink(lkid);
            }
            self.drop_if_idle(name);
        } else if let Some(res) = self.resources.get_mut(&name) {
            res.converting.retain(|id| *id != lkid);
        }
        self.deliver(nodeid, tag, lksb);
    }

    fn drop_if_idle(&mut self, name: LockName) {
        if self.resources.get(&name).is_some_and(ResourceState::is_idle) {
            self.resources.remove(&name);
        }
    }

    fn submit_new(&mut self, lkid: DlmLockId) {
        let Some(entry) = self.locks.get(&lkid) else {
            return;
        };
        let (name, mode, flags) = (entry.name, entry.requested, entry.flags);
        let queues_empty = self
            .resources
            .get(&name)
            .is_none_or(|res| res.converting.is_empty() && res.waiting.is_empty());
        let expedite = flags.expedite && mode == DlmMode::Nl;

        if (queues_empty || expedite) && self.try_grant(lkid, name, mode, flags) {
            return;
        }
        if flags.noqueue {
            if flags.noqueue_bast {
                self.send_basts(name, lkid, mode);
            }
            self.fail_request(lkid, DlmStatus::WouldBlock);
            return;
        }
        if let Some(res) = self.resources.get_mut(&name) {
            if flags.headque {
                res.waiting.push_front(lkid);
            } else {
                res.waiting.push_back(lkid);
            }
        }
        self.send_basts(name, lkid, mode);
    }

    fn submit_convert(&mut self, lkid: DlmLockId) {
        let Some(entry) = self.locks.get(&lkid) else {
            return;
        };
        let (name, held, mode, flags) = (entry.name, entry.granted, entry.requested, entry.flags);
        let queue_clear = self.resources.get(&name).is_none_or(|res| res.converting.is_empty());

        if (mode <= held || queue_clear) && self.try_grant(lkid, name, mode, flags) {
            self.grant_pending(name);
            return;
        }
        if flags.noqueue {
            if flags.noqueue_bast {
                self.send_basts(name, lkid, mode);
            }
            self.fail_request(lkid, DlmStatus::WouldBlock);
            return;
        }
        if self.conversion_deadlock(&name, lkid, held, mode) {
            if !flags.conv_deadlk {
                debug!(name = %name, lkid, "conversion deadlock, failing convert");
                self.fail_request(lkid, DlmStatus::Deadlock);
                return;
            }
            debug!(name = %name, lkid, "conversion deadlock, demoting to NL");
            if let Some(entry) = self.locks.get_mut(&lkid) {
                entry.granted = DlmMode::Nl;
                entry.demoted = true;
            }
        }
        if let Some(res) = self.resources.get_mut(&name) {
            if flags.headque {
                res.converting.push_front(lkid);
            } else {
                res.converting.push_back(lkid);
            }
        }
        self.grant_pending(name);
        if self.locks.get(&lkid).is_some_and(|e| e.queue == Queue::Converting) {
            self.send_basts(name, lkid, mode);
        }
    }

    /// Grant queued requests in order: converts first, then new locks, each queue
    /// stopping at its first blocked request.
    fn grant_pending(&mut self, name: LockName) {
        loop {
            let Some(res) = self.resources.get(&name) else {
                return;
            };
            let next = res
                .converting
                .front()
                .or_else(|| res.waiting.front())
                .copied();
            let Some(lkid) = next else {
                return;
            };
            let Some(entry) = self.locks.get(&lkid) else {
                return;
            };
            let (mode, flags) = (entry.requested, entry.flags);
            if !self.try_grant(lkid, name, mode, flags) {
                self.send_basts(name, lkid, mode);
                return;
            }
        }
    }

    fn release(&mut self, lkid: DlmLockId) -> Option<LockName> {
        let entry = self.locks.remove(&lkid)?;
        self.waiters.remove(&lkid);
        if let Some(res) = self.resources.get_mut(&entry.name) {
            res.unlink(lkid);
            if entry.granted.writes_lvb() {
                res.lvb_valid = false;
            }
        }
        Some(entry.name)
    }
}

/// Shared in-process lock manager; every node of the test "cluster" joins it.
#[derive(Debug, Clone)]
pub struct LocalDlm {
    state: Arc<Mutex<ClusterState>>,
}

impl Default for LocalDlm {
    fn default() -> Self {
        Self::new(lockdlm_config::DEFAULT_LOCKDLM_LVB_LEN)
    }
}

impl LocalDlm {
    pub fn new(lvb_len: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                lvb_len,
                next_lkid: 1,
                resources: HashMap::new(),
                locks: HashMap::new(),
                nodes: HashMap::new(),
                waiters: HashMap::new(),
                faults: HashMap::new(),
                stats: LocalDlmStats::default(),
            })),
        }
    }

    /// Join the cluster as `nodeid`, returning its DLM endpoint and notification channel.
    pub fn join(&self, nodeid: u32) -> (Arc<LocalDlmNode>, DlmEventReceiver) {
        let (tx, rx) = event_channel();
        self.state.lock().nodes.insert(nodeid, tx);
        let node = LocalDlmNode {
            nodeid,
            state: self.state.clone(),
        };
        (Arc::new(node), rx)
    }

    /// Drop every lock held by a node as if it crashed. Value blocks it held at PW
    /// or above become invalid.
    pub fn fail_node(&self, nodeid: u32) {
        let mut state = self.state.lock();
        state.nodes.remove(&nodeid);
        let lkids: Vec<DlmLockId> = state
            .locks
            .iter()
            .filter(|(_, entry)| entry.nodeid == nodeid)
            .map(|(lkid, _)| *lkid)
            .collect();
        let mut names = HashSet::new();
        for lkid in lkids {
            if let Some(name) = state.release(lkid) {
                names.insert(name);
            }
        }
        warn!(nodeid, resources = names.len(), "node failed, locks dropped");
        for name in names {
            state.grant_pending(name);
            state.drop_if_idle(name);
        }
    }

    /// Complete the next request on `name` with `status` instead of processing it.
    pub fn inject_completion(&self, name: LockName, status: DlmStatus) {
        self.state.lock().faults.entry(name).or_default().push_back(Fault::Complete(status));
    }

    /// Fail the next call on `name` with `status`.
    pub fn inject_rejection(&self, name: LockName, status: DlmStatus) {
        self.state.lock().faults.entry(name).or_default().push_back(Fault::Reject(status));
    }

    pub fn stats(&self) -> LocalDlmStats {
        self.state.lock().stats
    }

    /// Strongest mode a node holds on `name`; `Iv` when it holds nothing.
    pub fn granted_mode(&self, nodeid: u32, name: LockName) -> DlmMode {
        self.state
            .lock()
            .locks
            .values()
            .filter(|entry| entry.nodeid == nodeid && entry.name == name)
            .map(|entry| entry.granted)
            .max()
            .unwrap_or(DlmMode::Iv)
    }

    /// Number of locks (any state) on `name`.
    pub fn lock_count(&self, name: LockName) -> usize {
        self.state.lock().locks.values().filter(|entry| entry.name == name).count()
    }

    /// Current value block of `name`, if the resource exists.
    pub fn lvb(&self, name: LockName) -> Option<Vec<u8>> {
        self.state.lock().resources.get(&name).map(|res| res.lvb.clone())
    }
}

/// One node's endpoint on a [`LocalDlm`].
#[derive(Debug)]
pub struct LocalDlmNode {
    nodeid: u32,
    state: Arc<Mutex<ClusterState>>,
}

impl LocalDlmNode {
    pub fn nodeid(&self) -> u32 {
        self.nodeid
    }

    fn request_lock(
        &self,
        request: DlmLockRequest,
        waiter: Option<oneshot::Sender<Lksb>>,
    ) -> std::result::Result<DlmLockId, DlmStatus> {
        let mut state = self.state.lock();
        state.stats.lock_calls += 1;
        if request.mode == DlmMode::Iv || !state.nodes.contains_key(&self.nodeid) {
            return Err(DlmStatus::Invalid);
        }
        let fault = state.take_fault(&request.name);
        if let Some(Fault::Reject(status)) = fault {
            return Err(status);
        }

        let lkid = state.next_lkid;
        state.next_lkid += 1;
        let lvb_len = state.lvb_len;
        state
            .resources
            .entry(request.name)
            .or_insert_with(|| ResourceState::new(lvb_len));
        state.locks.insert(
            lkid,
            LockEntry {
                nodeid: self.nodeid,
                tag: request.tag,
                name: request.name,
                granted: DlmMode::Iv,
                requested: request.mode,
                flags: request.flags,
                bast: request.bast,
                bast_sent: None,
                queue: Queue::Waiting,
                demoted: false,
            },
        );
        if let Some(waiter) = waiter {
            state.waiters.insert(lkid, waiter);
        }

        match fault {
            Some(Fault::Complete(status)) => state.fail_request(lkid, status),
            _ => state.submit_new(lkid),
        }
        Ok(lkid)
    }

    fn request_convert(
        &self,
        lkid: DlmLockId,
        mode: DlmMode,
        flags: DlmFlags,
        lvb: Option<Vec<u8>>,
        waiter: Option<oneshot::Sender<Lksb>>,
    ) -> std::result::Result<(), DlmStatus> {
        let mut state = self.state.lock();
        state.stats.convert_calls += 1;
        let name = match state.locks.get(&lkid) {
            Some(entry) if entry.nodeid != self.nodeid || mode == DlmMode::Iv => return Err(DlmStatus::Invalid),
            Some(entry) if entry.queue != Queue::Granted => return Err(DlmStatus::Busy),
            Some(entry) => entry.name,
            None => return Err(DlmStatus::Invalid),
        };
        let fault = state.take_fault(&name);
        if let Some(Fault::Reject(status)) = fault {
            return Err(status);
        }

        state.write_lvb(lkid, lvb);
        if let Some(entry) = state.locks.get_mut(&lkid) {
            entry.requested = mode;
            entry.flags = flags;
            entry.queue = Queue::Converting;
        }
        if let Some(waiter) = waiter {
            state.waiters.insert(lkid, waiter);
        }

        match fault {
            Some(Fault::Complete(status)) => state.fail_request(lkid, status),
            _ => state.submit_convert(lkid),
        }
        Ok(())
    }

    fn request_unlock(
        &self,
        lkid: DlmLockId,
        lvb: Option<Vec<u8>>,
        waiter: Option<oneshot::Sender<Lksb>>,
    ) -> std::result::Result<(), DlmStatus> {
        let mut state = self.state.lock();
        state.stats.unlock_calls += 1;
        match state.locks.get(&lkid) {
            Some(entry) if entry.nodeid != self.nodeid => return Err(DlmStatus::Invalid),
            Some(entry) if entry.queue != Queue::Granted => return Err(DlmStatus::Busy),
            Some(_) => {}
            None => return Err(DlmStatus::Invalid),
        }

        state.write_lvb(lkid, lvb);
        let Some(entry) = state.locks.remove(&lkid) else {
            return Err(DlmStatus::Invalid);
        };
        if let Some(res) = state.resources.get_mut(&entry.name) {
            res.unlink(lkid);
        }
        if let Some(waiter) = waiter {
            state.waiters.insert(lkid, waiter);
        }
        let lksb = Lksb::local(DlmStatus::Unlocked, Some(lkid), DlmMode::Iv);
        state.deliver(entry.nodeid, entry.tag, lksb);
        state.grant_pending(entry.name);
        state.drop_if_idle(entry.name);
        Ok(())
    }

    fn held_mode(&self, lkid: DlmLockId) -> DlmMode {
        self.state
            .lock()
            .locks
            .get(&lkid)
            .map(|entry| entry.granted)
            .unwrap_or(DlmMode::Iv)
    }
}

fn sync_outcome(rx: std::result::Result<Lksb, oneshot::error::RecvError>, lkid: Option<DlmLockId>) -> Lksb {
    rx.unwrap_or_else(|_| Lksb::local(DlmStatus::Invalid, lkid, DlmMode::Iv))
}

#[async_trait]
impl Dlm for LocalDlmNode {
    fn lock(&self, request: DlmLockRequest) -> std::result::Result<DlmLockId, DlmStatus> {
        self.request_lock(request, None)
    }

    fn convert(
        &self,
        lkid: DlmLockId,
        mode: DlmMode,
        flags: DlmFlags,
        lvb: Option<Vec<u8>>,
    ) -> std::result::Result<(), DlmStatus> {
        self.request_convert(lkid, mode, flags, lvb, None)
    }

    fn unlock(&self, lkid: DlmLockId, lvb: Option<Vec<u8>>) -> std::result::Result<(), DlmStatus> {
        self.request_unlock(lkid, lvb, None)
    }

    fn cancel(&self, lkid: DlmLockId) -> std::result::Result<(), DlmStatus> {
        let mut state = self.state.lock();
        state.stats.cancel_calls += 1;
        let (queue, name) = match state.locks.get(&lkid) {
            Some(entry) if entry.nodeid != self.nodeid => return Err(DlmStatus::Invalid),
            Some(entry) => (entry.queue, entry.name),
            None => return Err(DlmStatus::Invalid),
        };
        match queue {
            Queue::Granted => return Err(DlmStatus::Busy),
            Queue::Converting | Queue::Waiting => {
                if let Some(res) = state.resources.get_mut(&name) {
                    res.converting.retain(|id| *id != lkid);
                    res.waiting.retain(|id| *id != lkid);
                }
                state.fail_request(lkid, DlmStatus::Cancelled);
            }
        }
        debug!(name = %name, lkid, "request cancelled");
        state.grant_pending(name);
        state.drop_if_idle(name);
        Ok(())
    }

    async fn lock_sync(&self, request: DlmLockRequest) -> Lksb {
        let (tx, rx) = oneshot::channel();
        match self.request_lock(request, Some(tx)) {
            Ok(lkid) => sync_outcome(rx.await, Some(lkid)),
            Err(status) => Lksb::local(status, None, DlmMode::Iv),
        }
    }

    async fn convert_sync(&self, lkid: DlmLockId, mode: DlmMode, flags: DlmFlags, lvb: Option<Vec<u8>>) -> Lksb {
        let (tx, rx) = oneshot::channel();
        match self.request_convert(lkid, mode, flags, lvb, Some(tx)) {
            Ok(()) => sync_outcome(rx.await, Some(lkid)),
            Err(status) => Lksb::local(status, Some(lkid), self.held_mode(lkid)),
        }
    }

    async fn unlock_sync(&self, lkid: DlmLockId, lvb: Option<Vec<u8>>) -> Lksb {
        let (tx, rx) = oneshot::channel();
        match self.request_unlock(lkid, lvb, Some(tx)) {
            Ok(()) => sync_outcome(rx.await, Some(lkid)),
            Err(status) => Lksb::local(status, Some(lkid), self.held_mode(lkid)),
        }
    }
}
