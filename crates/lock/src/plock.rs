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

//! POSIX-style byte-range locks.
//!
//! Local owners are arbitrated against the resource's range records. Across nodes a
//! single DLM lock per resource carries the strongest mode any local record needs
//! (PR for shared ranges, EX once any range is exclusive). Every change to the records
//! bumps a generation counter kept in the value block of the paired update lock.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::dlm::{DlmFlags, DlmLockRequest, DlmStatus};
use crate::error::{LockDlmError, Result};
use crate::handle::LockHandle;
use crate::lockspace::LockSpace;
use crate::resource::{PendingRange, RangeLock, Resource, ResourceState};
use crate::types::{DlmMode, HandleId, LockFlags, LockName};

/// A holder that would block a range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlockConflict {
    /// Local owner, or `None` for a holder on another node
    pub owner: Option<u64>,
    pub start: u64,
    pub end: u64,
    pub exclusive: bool,
}

impl PlockConflict {
    /// Holder on another node: its range is not known, so the whole file is reported.
    fn remote() -> Self {
        Self {
            owner: None,
            start: 0,
            end: u64::MAX,
            exclusive: true,
        }
    }
}

/// Tag of the short-lived probe locks; never assigned to a handle.
const PROBE_TAG: HandleId = HandleId(0);

fn check_range(start: u64, end: u64) -> Result<()> {
    if start >= end {
        return Err(LockDlmError::InvalidRange { start, end });
    }
    Ok(())
}

fn covers(held: DlmMode, needed: DlmMode) -> bool {
    held == DlmMode::Ex || held == needed
}

impl LockSpace {
    fn resource(&self, name: LockName) -> Result<Arc<Resource>> {
        if let Some(res) = self.inner.resources.get(&name) {
            return Ok(res.value().clone());
        }
        let limit = self.inner.config.max_resources;
        if self.inner.resources.len() >= limit {
            return Err(LockDlmError::TableFull { table: "resource", limit });
        }
        let res = self
            .inner
            .resources
            .entry(name)
            .or_insert_with(|| Arc::new(Resource::new(name)))
            .value()
            .clone();
        Ok(res)
    }

    async fn lock_resource(&self, name: LockName) -> Result<(Arc<Resource>, OwnedMutexGuard<ResourceState>)> {
        loop {
            self.check_usable()?;
            let res = self.resource(name)?;
            let state = res.gate.clone().lock_owned().await;
            if !state.retired {
                return Ok((res, state));
            }
        }
    }

    /// Handle carrying the resource's DLM lock: the recorded one, one revived from the
    /// null-lock cache, or a new one.
    fn range_handle(&self, state: &mut ResourceState, name: LockName) -> Result<Arc<LockHandle>> {
        if let Some(handle) = state.handle.and_then(|id| self.lookup(id)) {
            return Ok(handle);
        }
        let handle = match self.reacquire_from_cache(name).and_then(|id| self.lookup(id)) {
            Some(handle) => handle,
            None => self.new_handle(name)?,
        };
        {
            let mut st = handle.state.lock();
            st.flags.in_lock = true;
            st.flags.no_bast = true;
            st.plock = true;
        }
        state.handle = Some(handle.id);
        Ok(handle)
    }

    fn update_handle(&self, state: &mut ResourceState, name: LockName) -> Result<Arc<LockHandle>> {
        if let Some(handle) = state.update.and_then(|id| self.lookup(id)) {
            return Ok(handle);
        }
        let handle = self.new_handle(name.plock_update())?;
        {
            let mut st = handle.state.lock();
            st.flags.in_lock = true;
            st.flags.no_bast = true;
            st.plock = true;
            st.lvb = Some(vec![0; self.inner.config.lvb_len]);
        }
        state.update = Some(handle.id);
        Ok(handle)
    }

    /// Bump the generation in the update lock's value block.
    async fn stamp_update(&self, state: &mut ResourceState, name: LockName) -> Result<u64> {
        let update = self.update_handle(state, name)?;
        self.request_wait(&update, DlmMode::Ex, LockFlags::NONE).await?;
        let generation = {
            let mut st = update.state.lock();
            let lvb = st.lvb.get_or_insert_with(Vec::new);
            if lvb.len() < 8 {
                lvb.resize(8, 0);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&lvb[..8]);
            let next = u64::from_le_bytes(bytes).wrapping_add(1);
            lvb[..8].copy_from_slice(&next.to_le_bytes());
            next
        };
        self.request_wait(&update, DlmMode::Nl, LockFlags::NONE).await?;
        state.generation = generation;
        Ok(generation)
    }

    /// Lock `[start, end)` of `name` for `owner`.
    ///
    /// With `wait` the call blocks until the range is free, locally and across nodes;
    /// without it a conflict fails with `TryFailed`.
    pub async fn plock(&self, name: LockName, owner: u64, start: u64, end: u64, exclusive: bool, wait: bool) -> Result<()> {
        check_range(start, end)?;
        let range = PendingRange {
            owner,
            start,
            end,
            exclusive,
        };
        let mut pending_on: Option<Arc<Resource>> = None;

        let outcome = loop {
            let (res, mut state) = match self.lock_resource(name).await {
                Ok(locked) => locked,
                Err(err) => break Err(err),
            };

            if state.converting || state.conflict(owner, start, end, exclusive).is_some() {
                if !wait {
                    debug!(name = %name, owner, start, end, "range lock would block");
                    break Err(LockDlmError::try_failed(name));
                }
                let notified = res.waiters.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if pending_on.is_none() {
                    res.add_pending(range);
                    pending_on = Some(res.clone());
                }
                drop(state);
                debug!(name = %name, owner, start, end, "range lock waiting");
                notified.await;
                continue;
            }

            let needed = state.needed_mode(exclusive);
            let handle = match self.range_handle(&mut state, name) {
                Ok(handle) => handle,
                Err(err) => break Err(err),
            };
            if !covers(handle.cur(), needed) {
                state.converting = true;
                drop(state);
                let flags = if wait { LockFlags::NONE } else { LockFlags::TRY };
                let granted = self.request_wait(&handle, needed, flags).await;

                let mut state = res.gate.lock().await;
                state.converting = false;
                drop(state);
                res.waiters.notify_waiters();
                if let Err(err) = granted {
                    break Err(err);
                }
                continue;
            }

            state.insert(owner, start, end, exclusive);
            if let Err(err) = self.stamp_update(&mut state, name).await {
                warn!(name = %name, error = %err, "range update not recorded");
            }
            debug!(name = %name, owner, start, end, exclusive, mode = %handle.cur(), "range locked");
            break Ok(());
        };

        if let Some(res) = pending_on {
            res.remove_pending(range);
        }
        if outcome.is_err() {
            self.retire_if_unused(name).await;
        }
        outcome
    }

    /// Release `[start, end)` of `name` for `owner`.
    pub async fn punlock(&self, name: LockName, owner: u64, start: u64, end: u64) -> Result<()> {
        check_range(start, end)?;
        let Some(res) = self.inner.resources.get(&name).map(|res| res.value().clone()) else {
            return Ok(());
        };
        let mut state = res.gate.clone().lock_owned().await;
        if state.retired || !state.remove(owner, start, end) {
            return Ok(());
        }
        if let Err(err) = self.stamp_update(&mut state, name).await {
            warn!(name = %name, error = %err, "range update not recorded");
        }
        res.waiters.notify_waiters();
        debug!(name = %name, owner, start, end, "range unlocked");

        if state.locks.is_empty() {
            if !state.converting && !res.has_pending() {
                self.retire_resource(&res, state).await;
            }
            return Ok(());
        }
        if state.converting || state.needed_mode(false) != DlmMode::Pr {
            return Ok(());
        }
        // only shared ranges remain
        if let Some(handle) = state.handle.and_then(|id| self.lookup(id)) {
            if handle.cur() == DlmMode::Ex {
                if let Err(err) = self.request_wait(&handle, DlmMode::Pr, LockFlags::NONE).await {
                    warn!(name = %name, error = %err, "range lock not downgraded");
                }
            }
        }
        Ok(())
    }

    /// Report a holder that would block the given request, without taking anything.
    ///
    /// Local records are checked first. Holders on other nodes are found with a
    /// non-queueing probe lock, released right after; their exact range and owner are
    /// not known, so the whole file is reported. When this node already holds the
    /// resource shared, an exclusive query tries a non-queueing convert of that lock
    /// to EX instead and converts it straight back.
    pub async fn plock_get(
        &self,
        name: LockName,
        owner: u64,
        start: u64,
        end: u64,
        exclusive: bool,
    ) -> Result<Option<PlockConflict>> {
        check_range(start, end)?;
        self.check_usable()?;
        let needed = if exclusive { DlmMode::Ex } else { DlmMode::Pr };

        let mut held = DlmMode::Iv;
        let res = self.inner.resources.get(&name).map(|res| res.value().clone());
        if let Some(res) = res {
            let state = loop {
                let notified = res.waiters.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let state = res.gate.lock().await;
                if !state.converting {
                    break state;
                }
                drop(state);
                notified.await;
            };
            if let Some(lock) = state.conflict(owner, start, end, exclusive) {
                return Ok(Some(PlockConflict {
                    owner: Some(lock.owner),
                    start: lock.start,
                    end: lock.end,
                    exclusive: lock.exclusive,
                }));
            }
            if let Some(handle) = state.handle.and_then(|id| self.lookup(id)) {
                held = handle.cur();
                // our own PR would conflict with an EX probe lock
                if held == DlmMode::Pr && needed == DlmMode::Ex {
                    return self.try_promote(&handle).await;
                }
            }
        }
        if covers(held, needed) {
            return Ok(None);
        }

        let request = DlmLockRequest {
            name,
            mode: needed,
            flags: DlmFlags {
                noqueue: true,
                ..DlmFlags::default()
            },
            bast: false,
            tag: PROBE_TAG,
        };
        let lksb = self.inner.dlm.lock_sync(request).await;
        match lksb.status {
            DlmStatus::Granted => {
                if let Some(lkid) = lksb.lkid {
                    let released = self.inner.dlm.unlock_sync(lkid, None).await;
                    if released.status != DlmStatus::Unlocked {
                        warn!(name = %name, status = %released.status, "probe lock not released");
                    }
                }
                Ok(None)
            }
            DlmStatus::WouldBlock => Ok(Some(PlockConflict::remote())),
            status => Err(LockDlmError::dlm(name, status)),
        }
    }

    /// Non-queueing PR to EX convert of a range lock, undone when granted. The caller
    /// holds the resource gate.
    async fn try_promote(&self, handle: &Arc<LockHandle>) -> Result<Option<PlockConflict>> {
        match self.request_wait(handle, DlmMode::Ex, LockFlags::TRY).await {
            Ok(_) => {
                if let Err(err) = self.request_wait(handle, DlmMode::Pr, LockFlags::NONE).await {
                    warn!(name = %handle.name, error = %err, "range lock not returned to PR");
                }
                Ok(None)
            }
            Err(LockDlmError::TryFailed { .. }) => Ok(Some(PlockConflict::remote())),
            Err(err) => Err(err),
        }
    }

    /// Current update generation of `name`'s range locks, read from the update lock.
    pub async fn plock_generation(&self, name: LockName) -> Result<u64> {
        let (res, mut state) = self.lock_resource(name).await?;
        let update = self.update_handle(&mut state, name)?;
        let read = async {
            self.request_wait(&update, DlmMode::Pr, LockFlags::NONE).await?;
            let generation = {
                let st = update.state.lock();
                let mut bytes = [0u8; 8];
                if let Some(lvb) = st.lvb.as_ref().filter(|lvb| lvb.len() >= 8) {
                    bytes.copy_from_slice(&lvb[..8]);
                }
                u64::from_le_bytes(bytes)
            };
            self.request_wait(&update, DlmMode::Nl, LockFlags::NONE).await?;
            Ok::<u64, LockDlmError>(generation)
        };
        let generation = read.await;
        if let Ok(generation) = generation {
            state.generation = generation;
        }
        if state.is_unused() && !res.has_pending() && state.handle.is_none() {
            self.retire_resource(&res, state).await;
        }
        generation
    }

    /// Range records currently held on `name`.
    pub async fn plock_records(&self, name: LockName) -> Vec<RangeLock> {
        let Some(res) = self.inner.resources.get(&name).map(|res| res.value().clone()) else {
            return Vec::new();
        };
        let state = res.gate.lock().await;
        state.locks.clone()
    }

    async fn retire_if_unused(&self, name: LockName) {
        let Some(res) = self.inner.resources.get(&name).map(|res| res.value().clone()) else {
            return;
        };
        let state = res.gate.clone().lock_owned().await;
        if !state.retired && state.is_unused() && !res.has_pending() {
            self.retire_resource(&res, state).await;
        }
    }

    /// Drop a resource whose records are gone: its DLM lock goes to the null-lock cache
    /// and its update lock is released.
    pub(crate) async fn retire_resource(&self, res: &Arc<Resource>, mut state: OwnedMutexGuard<ResourceState>) {
        if let Some(id) = state.handle.take() {
            if let Err(err) = self.release_to_cache(id).await {
                warn!(name = %res.name, error = %err, "range lock not cached");
            }
        }
        if let Some(id) = state.update.take() {
            if let Err(err) = self.unlock_and_delete(id) {
                warn!(name = %res.name, error = %err, "update lock not released");
            }
        }
        state.retired = true;
        self.inner.resources.remove_if(&res.name, |_, current| Arc::ptr_eq(current, res));
        drop(state);
        res.waiters.notify_waiters();
        debug!(name = %res.name, "range resource retired");
    }

    /// Retire every resource, releasing their locks outright.
    pub(crate) async fn retire_all_resources(&self) {
        let resources: Vec<Arc<Resource>> = self.inner.resources.iter().map(|res| res.value().clone()).collect();
        for res in resources {
            let mut state = res.gate.clone().lock_owned().await;
            for id in [state.handle.take(), state.update.take()].into_iter().flatten() {
                if let Err(err) = self.unlock_and_delete(id) {
                    warn!(name = %res.name, handle = %id, error = %err, "range lock not released");
                }
            }
            state.locks.clear();
            state.retired = true;
            self.inner.resources.remove_if(&res.name, |_, current| Arc::ptr_eq(current, &res));
            drop(state);
            res.waiters.notify_waiters();
        }
    }
}
