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

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callback::LockCallback;
use crate::config::{LockSpaceConfig, MountArgs};
use crate::dlm::{Dlm, DlmEventReceiver, DlmNotification};
use crate::error::{LockDlmError, Result};
use crate::handle::LockHandle;
use crate::queue::{Dispatcher, QueueDepths, QueueKind};
use crate::recovery::NodeRecord;
use crate::resource::Resource;
use crate::types::{HandleId, LockName, RecoveryEvent};

/// Mount state of a lock space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MountFlags {
    pub first_mount: bool,
    pub got_nodeid: bool,
    /// The mount group finished its start barrier
    pub mg_finish: bool,
    pub have_jid: bool,
    /// Lock requests wait for recovery
    pub block_locks: bool,
    pub start_error: bool,
    pub mount: bool,
    pub umount: bool,
    pub need_startdone: bool,
    pub recover: bool,
    pub withdraw: bool,
}

/// Snapshot of a lock space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockSpaceStats {
    pub handles: usize,
    pub resources: usize,
    pub queues: QueueDepths,
    /// DLM requests issued and not yet completed
    pub in_flight: usize,
    pub cached: usize,
    pub nodes: usize,
}

pub(crate) struct LockSpaceInner {
    pub(crate) config: LockSpaceConfig,
    pub(crate) args: MountArgs,
    pub(crate) flags: RwLock<MountFlags>,
    pub(crate) dlm: Arc<dyn Dlm>,
    pub(crate) callback: Arc<dyn LockCallback>,
    pub(crate) handles: DashMap<HandleId, Arc<LockHandle>>,
    next_handle: AtomicU64,
    pub(crate) resources: DashMap<LockName, Arc<Resource>>,
    pub(crate) dispatcher: Dispatcher,
    in_flight: AtomicUsize,
    drop_time: Mutex<Instant>,
    shrink_time: Mutex<Instant>,
    pub(crate) nodes: Mutex<HashMap<u32, NodeRecord>>,
    pub(crate) null_cache: Mutex<VecDeque<(LockName, HandleId)>>,
    pub(crate) jid_handle: Mutex<Option<HandleId>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One mounted filesystem instance: the owner of every handle, resource, queue and
/// worker task of the mount.
#[derive(Clone)]
pub struct LockSpace {
    pub(crate) inner: Arc<LockSpaceInner>,
}

impl fmt::Debug for LockSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockSpace")
            .field("name", &self.inner.args.lockspace_name())
            .field("jid", &self.inner.args.jid)
            .field("nodeid", &self.inner.args.nodeid)
            .field("flags", &*self.inner.flags.read())
            .finish()
    }
}

impl LockSpace {
    /// Mount a lock space: start the notification pump and the workers, register the
    /// local node and take the journal id lock.
    pub async fn mount(
        config: LockSpaceConfig,
        args: MountArgs,
        dlm: Arc<dyn Dlm>,
        events: DlmEventReceiver,
        callback: Arc<dyn LockCallback>,
    ) -> Result<Self> {
        config.validate()?;
        args.validate()?;

        let flags = MountFlags {
            first_mount: args.first_mount,
            got_nodeid: true,
            have_jid: true,
            mount: true,
            ..MountFlags::default()
        };
        let now = Instant::now();
        let inner = LockSpaceInner {
            dispatcher: Dispatcher::new(config.retry_delay),
            config,
            args,
            flags: RwLock::new(flags),
            dlm,
            callback,
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            resources: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            drop_time: Mutex::new(now),
            shrink_time: Mutex::new(now),
            nodes: Mutex::new(HashMap::new()),
            null_cache: Mutex::new(VecDeque::new()),
            jid_handle: Mutex::new(None),
            pump: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        };
        let ls = LockSpace { inner: Arc::new(inner) };

        *ls.inner.pump.lock() = Some(tokio::spawn(ls.clone().event_pump(events)));
        {
            let mut tasks = ls.inner.tasks.lock();
            for index in 0..ls.inner.config.worker_count {
                tasks.push(tokio::spawn(ls.clone().worker(index)));
            }
        }

        info!(
            lockspace = %ls.inner.args.lockspace_name(),
            jid = ls.inner.args.jid,
            nodeid = ls.inner.args.nodeid,
            first = ls.inner.args.first_mount,
            "mounting lock space"
        );

        let mounted: Result<()> = async {
            ls.add_node(ls.inner.args.nodeid, ls.inner.args.jid)?;
            ls.acquire_journal_lock().await
        }
        .await;
        if let Err(err) = mounted {
            error!(error = %err, "mount failed");
            ls.inner.flags.write().start_error = true;
            ls.stop_tasks().await;
            return Err(err);
        }
        Ok(ls)
    }

    /// Unmount: wait for in-flight DLM work, flush the null-lock cache, release every
    /// lock and stop the workers.
    pub async fn unmount(&self) -> Result<()> {
        {
            let mut flags = self.inner.flags.write();
            if flags.umount {
                return Err(LockDlmError::ShuttingDown);
            }
            flags.umount = true;
        }
        info!(lockspace = %self.inner.args.lockspace_name(), "unmounting lock space");

        self.release_all().await;
        self.stop_tasks().await;

        self.inner.flags.write().mount = false;
        info!(lockspace = %self.inner.args.lockspace_name(), "lock space unmounted");
        Ok(())
    }

    /// Bring every handle to the unlocked terminal state and free it.
    pub(crate) async fn release_all(&self) {
        // requests that never reached the DLM
        for id in self.inner.dispatcher.delayed_handles() {
            if let Err(err) = self.cancel(id) {
                debug!(handle = %id, error = %err, "delayed request not cancelled");
            }
        }
        self.cancel_withdraw_waits();
        self.wait_idle().await;

        self.clear_null_cache();
        self.retire_all_resources().await;

        let ids: Vec<HandleId> = self.inner.handles.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Err(err) = self.unlock_and_delete(id) {
                warn!(handle = %id, error = %err, "lock not released");
            }
        }
        *self.inner.jid_handle.lock() = None;
        self.wait_idle().await;
    }

    async fn stop_tasks(&self) {
        self.inner.dispatcher.shutdown();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "lock space task failed");
            }
        }
        // the DLM keeps its sender, so the pump never sees the channel close
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
    }

    /// Wait until no DLM request is in flight and the queues are empty.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.dispatcher.idle().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 && self.inner.dispatcher.is_idle() {
                return;
            }
            let _ = tokio::time::timeout(self.inner.dispatcher.retry_delay(), notified).await;
        }
    }

    async fn event_pump(self, mut events: DlmEventReceiver) {
        while let Some(event) = events.recv().await {
            if self.inner.dispatcher.is_shut_down() {
                break;
            }
            let handle = self.inner.handles.get(&event.tag).map(|entry| entry.value().clone());
            let Some(handle) = handle else {
                // a blocking notification may race with the unlock that freed the handle
                crate::dlm_assert!(
                    matches!(event.notification, DlmNotification::Blocking(_)),
                    handle = %event.tag,
                    "DLM completion for an unknown lock handle"
                );
                debug!(handle = %event.tag, "blocking notification for a freed handle");
                continue;
            };
            match event.notification {
                DlmNotification::Completion(lksb) => {
                    {
                        let mut st = handle.state.lock();
                        crate::dlm_assert!(
                            st.lksb.is_none(),
                            name = %handle.name,
                            handle = %handle.id,
                            "second completion before the first was processed"
                        );
                        st.lksb = Some(lksb);
                    }
                    self.inner.dispatcher.queue(handle.id, QueueKind::Complete, false);
                }
                DlmNotification::Blocking(mode) => {
                    if handle.state.lock().flags.no_bast {
                        continue;
                    }
                    debug!(name = %handle.name, handle = %handle.id, mode = %mode, "blocking notification");
                    self.inner.dispatcher.queue_blocking(handle.id, mode);
                }
            }
        }
        debug!("notification pump stopped");
    }

    async fn worker(self, index: usize) {
        // worker 0 also serves blocking callbacks and housekeeping
        let primary = index == 0;
        debug!(index, "lock space worker started");
        loop {
            let wake = self.inner.dispatcher.wake().notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            if primary {
                self.housekeeping();
            }
            if let Some((kind, id)) = self.inner.dispatcher.pop(primary) {
                self.process(kind, id);
                self.inner.dispatcher.finish(id);
                continue;
            }
            if self.inner.dispatcher.is_shut_down() {
                break;
            }
            let _ = tokio::time::timeout(self.inner.dispatcher.retry_delay(), wake).await;
        }
        debug!(index, "lock space worker stopped");
    }

    fn process(&self, kind: QueueKind, id: HandleId) {
        let Some(handle) = self.lookup(id) else {
            debug!(handle = %id, ?kind, "queued handle already freed");
            return;
        };
        match kind {
            QueueKind::Submit => self.process_submit(&handle),
            QueueKind::Delayed => self.process_delayed(&handle),
            QueueKind::Blocking => self.process_blocking(&handle),
            QueueKind::Complete => self.process_complete(&handle),
        }
    }

    fn housekeeping(&self) {
        self.check_drop_locks();
        self.check_shrink();
    }

    fn check_drop_locks(&self) {
        let config = &self.inner.config;
        let count = self.inner.handles.len();
        if count < config.drop_locks_count {
            return;
        }
        {
            let mut drop_time = self.inner.drop_time.lock();
            if drop_time.elapsed() < config.drop_locks_period {
                return;
            }
            *drop_time = Instant::now();
        }
        info!(count, "too many locks, asking the filesystem to drop some");
        self.inner
            .callback
            .on_recovery_event(self.inner.args.jid, RecoveryEvent::DropLocks);
    }

    fn check_shrink(&self) {
        {
            let mut shrink_time = self.inner.shrink_time.lock();
            if shrink_time.elapsed() < self.inner.config.shrink_cache_time {
                return;
            }
            *shrink_time = Instant::now();
        }
        self.shrink_null_cache();
    }

    pub(crate) fn lookup(&self, id: HandleId) -> Option<Arc<LockHandle>> {
        self.inner.handles.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn handle(&self, id: HandleId) -> Result<Arc<LockHandle>> {
        self.lookup(id).ok_or(LockDlmError::InvalidHandle { handle: id })
    }

    pub(crate) fn new_handle(&self, name: LockName) -> Result<Arc<LockHandle>> {
        let limit = self.inner.config.max_resources;
        if self.inner.handles.len() >= limit {
            return Err(LockDlmError::TableFull {
                table: "lock handle",
                limit,
            });
        }
        let id = HandleId(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(LockHandle::new(id, name));
        self.inner.handles.insert(id, handle.clone());
        debug!(name = %name, handle = %id, "lock handle created");
        Ok(handle)
    }

    pub(crate) fn in_flight_inc(&self) {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn in_flight_dec(&self) {
        let prev = self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        crate::dlm_assert!(prev > 0, "in-flight counter underflow");
        if prev == 1 {
            self.inner.dispatcher.idle().notify_waiters();
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// New requests are refused once the lock space withdraws or starts unmounting.
    pub(crate) fn check_usable(&self) -> Result<()> {
        let flags = self.inner.flags.read();
        if flags.withdraw {
            return Err(LockDlmError::Withdrawn);
        }
        if flags.umount {
            return Err(LockDlmError::ShuttingDown);
        }
        Ok(())
    }

    pub fn config(&self) -> &LockSpaceConfig {
        &self.inner.config
    }

    pub fn jid(&self) -> u32 {
        self.inner.args.jid
    }

    pub fn nodeid(&self) -> u32 {
        self.inner.args.nodeid
    }

    pub fn name(&self) -> String {
        self.inner.args.lockspace_name()
    }

    pub fn mount_flags(&self) -> MountFlags {
        *self.inner.flags.read()
    }

    pub fn stats(&self) -> LockSpaceStats {
        LockSpaceStats {
            handles: self.inner.handles.len(),
            resources: self.inner.resources.len(),
            queues: self.inner.dispatcher.depths(),
            in_flight: self.in_flight(),
            cached: self.inner.null_cache.lock().len(),
            nodes: self.inner.nodes.lock().len(),
        }
    }
}
