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

//! Handle state machine: request submission, DLM issue, completion processing,
//! cancellation and unlock.

use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::dlm::{DlmFlags, DlmLockRequest, DlmStatus, Lksb};
use crate::error::{LockDlmError, Result};
use crate::handle::{HandleState, LockHandle};
use crate::lockspace::LockSpace;
use crate::queue::{DelayReason, QueueKind};
use crate::types::{Completion, DlmMode, HandleId, LmState, LockFlags, LockName, LockOutcome};

/// Who receives the completion of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Waiter {
    Callback,
    Caller,
    /// Caller waiting on an EX to EX value block publish
    SyncLvb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnlockKind {
    Callback,
    Wait,
    Delete,
}

/// DLM flags for the request about to be made on `st`.
fn make_flags(st: &HandleState, flags: LockFlags) -> DlmFlags {
    let mut lkf = DlmFlags::default();

    if flags.try_lock {
        lkf.noqueue = true;
    }
    if flags.try_1cb {
        lkf.noqueue = true;
        lkf.noqueue_bast = true;
    }
    if flags.priority {
        lkf.headque = true;
    }
    if flags.any {
        match st.req {
            DlmMode::Pr => lkf.alt_cw = true,
            DlmMode::Cw => lkf.alt_pr = true,
            _ => {}
        }
    }
    if st.lkid.is_some() {
        lkf.convert = true;
        // with conv_deadlk the DLM demotes this lock to NL instead of failing it; a
        // range lock must keep the mode its records rely on
        if !st.plock
            && !st.flags.force_promote
            && !lkf.noqueue
            && st.cur > DlmMode::Nl
            && st.req > DlmMode::Nl
            && st.cur != st.req
        {
            lkf.conv_deadlk = true;
        }
    }
    if st.lvb.is_some() {
        lkf.valblk = true;
    }
    if st.companion && st.req == DlmMode::Nl && st.lkid.is_none() {
        lkf.expedite = true;
    }
    lkf
}

fn completion_result(completion: Completion) -> Result<Completion> {
    if let Some(err) = completion.error {
        return Err(err);
    }
    if completion.cancelled {
        return Err(LockDlmError::Cancelled { name: completion.name });
    }
    Ok(completion)
}

impl LockSpace {
    /// Create a handle for `name`. The handle holds nothing until it is locked.
    pub fn get_lock(&self, name: LockName) -> Result<HandleId> {
        self.check_usable()?;
        self.new_handle(name).map(|handle| handle.id)
    }

    /// Free a handle that holds no DLM lock.
    pub fn put_lock(&self, id: HandleId) -> Result<()> {
        let handle = self.handle(id)?;
        {
            let st = handle.state.lock();
            if st.busy || st.lkid.is_some() {
                return Err(LockDlmError::invalid_state(handle.name, "handle still holds a DLM lock"));
            }
            if st.hold_null.is_some() {
                return Err(LockDlmError::invalid_state(handle.name, "value block is still held"));
            }
        }
        self.delete_handle(id);
        Ok(())
    }

    pub(crate) fn delete_handle(&self, id: HandleId) {
        let Some((_, handle)) = self.inner.handles.remove(&id) else {
            return;
        };
        let companion = {
            let mut st = handle.state.lock();
            st.lvb = None;
            st.hold_null.take()
        };
        if let Some(companion) = companion {
            if let Err(err) = self.unlock_and_delete(companion) {
                warn!(name = %handle.name, handle = %companion, error = %err, "value block companion not released");
            }
        }
        debug!(name = %handle.name, handle = %id, "lock handle freed");
    }

    /// Mode the DLM last granted to the handle.
    pub fn mode(&self, id: HandleId) -> Result<DlmMode> {
        Ok(self.handle(id)?.cur())
    }

    /// Request `state` on a handle. The result arrives through the callback.
    ///
    /// Returns [`LockOutcome::Unchanged`] without touching the DLM when the state is
    /// already held and no forced promotion is asked for.
    pub fn lock(&self, id: HandleId, state: LmState, flags: LockFlags) -> Result<LockOutcome> {
        self.check_usable()?;
        let handle = self.handle(id)?;
        self.submit(&handle, state.to_mode(), flags, Waiter::Callback)
    }

    /// Request `state` and wait for the grant.
    pub async fn lock_sync(&self, id: HandleId, state: LmState, flags: LockFlags) -> Result<LmState> {
        self.check_usable()?;
        let handle = self.handle(id)?;
        let completion = self.request_wait(&handle, state.to_mode(), flags).await?;
        Ok(completion.state)
    }

    pub(crate) async fn request_wait(
        &self,
        handle: &Arc<LockHandle>,
        mode: DlmMode,
        flags: LockFlags,
    ) -> Result<Completion> {
        match self.submit(handle, mode, flags, Waiter::Caller)? {
            LockOutcome::Unchanged => {
                let st = handle.state.lock();
                Ok(self.completion(handle, &st, false, false, None))
            }
            LockOutcome::Async => completion_result(handle.wait_result().await),
        }
    }

    pub(crate) fn submit(
        &self,
        handle: &Arc<LockHandle>,
        mode: DlmMode,
        flags: LockFlags,
        waiter: Waiter,
    ) -> Result<LockOutcome> {
        let head = {
            let mut st = handle.state.lock();
            if st.busy {
                return Err(LockDlmError::Busy { name: handle.name });
            }
            if mode == st.cur && !flags.force_promote {
                debug!(name = %handle.name, handle = %handle.id, mode = %mode, "mode already held");
                return Ok(LockOutcome::Unchanged);
            }
            st.req = mode;
            st.flags.no_block = flags.noexp;
            st.flags.force_promote = flags.force_promote;
            st.flags.head_queue = flags.priority;
            st.flags.try_failed = false;
            st.flags.cancel = false;
            st.flags.dlm_unlock = false;
            st.flags.rerequest = false;
            st.flags.wait_complete = waiter != Waiter::Callback;
            st.flags.sync_lvb = waiter == Waiter::SyncLvb;
            st.lkf = make_flags(&st, flags);
            st.result = None;
            st.busy = true;
            debug!(
                name = %handle.name,
                handle = %handle.id,
                cur = %st.cur,
                req = %st.req,
                flags = ?st.lkf,
                "lock request queued"
            );
            st.flags.head_queue
        };
        self.inner.dispatcher.queue(handle.id, QueueKind::Submit, head);
        Ok(LockOutcome::Async)
    }

    pub(crate) fn process_submit(&self, handle: &Arc<LockHandle>) {
        let unlock = handle.state.lock().flags.dlm_unlock;
        if unlock {
            self.do_dlm_unlock(handle);
        } else {
            self.do_dlm_lock(handle);
        }
    }

    pub(crate) fn process_delayed(&self, handle: &Arc<LockHandle>) {
        if self.inner.dispatcher.delay_reason(handle.id) == Some(DelayReason::ErrorRetry) {
            let mut st = handle.state.lock();
            if !st.flags.rerequest {
                debug!(name = %handle.name, handle = %handle.id, "retry no longer wanted");
                return;
            }
            st.flags.rerequest = false;
            st.req = st.prev_req;
        }
        self.process_submit(handle);
    }

    fn do_dlm_lock(&self, handle: &Arc<LockHandle>) {
        let mut st = handle.state.lock();

        if st.flags.cancel {
            debug!(name = %handle.name, handle = %handle.id, "cancelled before issue");
            let lksb = Lksb::local(DlmStatus::Cancelled, st.lkid, st.cur);
            return self.complete_locally(handle, st, lksb);
        }
        if self.inner.dispatcher.is_blocked() && !st.flags.no_block && st.req != DlmMode::Nl {
            drop(st);
            debug!(name = %handle.name, handle = %handle.id, "locks blocked, request delayed");
            self.inner.dispatcher.queue_delayed(handle.id, DelayReason::LocksBlocked);
            return;
        }

        let lvb = if st.lkf.valblk { st.lvb.clone() } else { None };
        self.in_flight_inc();
        let existing = st.lkid;
        let issued = match existing {
            Some(lkid) => self.inner.dlm.convert(lkid, st.req, st.lkf, lvb),
            None => {
                let request = DlmLockRequest {
                    name: handle.name,
                    mode: st.req,
                    flags: st.lkf,
                    bast: !st.flags.no_bast,
                    tag: handle.id,
                };
                match self.inner.dlm.lock(request) {
                    Ok(lkid) => {
                        st.lkid = Some(lkid);
                        Ok(())
                    }
                    Err(status) => Err(status),
                }
            }
        };
        let Err(status) = issued else {
            return;
        };

        self.in_flight_dec();
        if status == DlmStatus::NoMemory {
            drop(st);
            warn!(name = %handle.name, handle = %handle.id, "DLM out of memory, request delayed");
            self.inner.dispatcher.queue_delayed(handle.id, DelayReason::ErrorLock);
            return;
        }
        debug!(name = %handle.name, handle = %handle.id, status = %status, "DLM refused request");
        let lksb = Lksb::local(status, st.lkid, st.cur);
        self.complete_locally(handle, st, lksb);
    }

    fn do_dlm_unlock(&self, handle: &Arc<LockHandle>) {
        let st = handle.state.lock();
        let Some(lkid) = st.lkid else {
            let lksb = Lksb::local(DlmStatus::Unlocked, None, DlmMode::Iv);
            return self.complete_locally(handle, st, lksb);
        };

        let lvb = if st.cur.writes_lvb() { st.lvb.clone() } else { None };
        self.in_flight_inc();
        match self.inner.dlm.unlock(lkid, lvb) {
            Ok(()) => {}
            Err(DlmStatus::NoMemory) => {
                self.in_flight_dec();
                drop(st);
                warn!(name = %handle.name, handle = %handle.id, "DLM out of memory, unlock delayed");
                self.inner.dispatcher.queue_delayed(handle.id, DelayReason::ErrorUnlock);
            }
            Err(status) => {
                self.in_flight_dec();
                error!(name = %handle.name, handle = %handle.id, status = %status, "DLM refused unlock");
                let lksb = Lksb::local(status, Some(lkid), st.cur);
                self.complete_locally(handle, st, lksb);
            }
        }
    }

    /// Queue a completion the DLM never produced.
    fn complete_locally(&self, handle: &Arc<LockHandle>, mut st: MutexGuard<'_, HandleState>, lksb: Lksb) {
        st.lksb = Some(lksb);
        drop(st);
        self.in_flight_inc();
        self.inner.dispatcher.queue(handle.id, QueueKind::Complete, false);
    }

    pub(crate) fn process_complete(&self, handle: &Arc<LockHandle>) {
        let mut st = handle.state.lock();
        let lksb = st.lksb.take();
        crate::dlm_assert!(
            lksb.is_some(),
            name = %handle.name,
            handle = %handle.id,
            "completion queued without a status block"
        );
        let Some(lksb) = lksb else {
            return;
        };
        self.in_flight_dec();

        debug!(
            name = %handle.name,
            handle = %handle.id,
            status = %lksb.status,
            mode = %lksb.mode,
            cur = %st.cur,
            req = %st.req,
            "completion"
        );

        if st.flags.dlm_unlock {
            return self.complete_unlock(handle, st, lksb);
        }

        if lksb.status == DlmStatus::Cancelled {
            info!(name = %handle.name, handle = %handle.id, "request cancelled");
            st.cur = lksb.mode;
            st.req = st.cur;
            if st.cur == DlmMode::Iv {
                st.lkid = None;
            }
            st.flags.cancel = false;
            st.flags.dlm_cancel = false;
            st.flags.rerequest = false;
            st.flags.sync_lvb = false;
            let completion = self.completion(handle, &st, false, true, None);
            return self.deliver(handle, st, completion);
        }
        // a grant or failure that raced with a cancel wins
        st.flags.cancel = false;
        st.flags.dlm_cancel = false;

        let prev_cur = st.cur;
        match lksb.status {
            DlmStatus::Granted => {}
            DlmStatus::WouldBlock if st.lkf.noqueue => {
                debug!(name = %handle.name, handle = %handle.id, "try request would block");
                st.flags.try_failed = true;
                return self.fail(handle, st, lksb.mode, LockDlmError::try_failed(handle.name));
            }
            DlmStatus::Deadlock if st.plock => {
                info!(name = %handle.name, handle = %handle.id, req = %st.req, "range lock conversion deadlock");
                return self.fail(handle, st, lksb.mode, LockDlmError::dlm(handle.name, DlmStatus::Deadlock));
            }
            DlmStatus::Deadlock | DlmStatus::WouldBlock | DlmStatus::NoMemory => {
                if st.flags.no_block && lksb.status != DlmStatus::NoMemory {
                    st.flags.try_failed = true;
                    return self.fail(handle, st, lksb.mode, LockDlmError::try_failed(handle.name));
                }
                warn!(
                    name = %handle.name,
                    handle = %handle.id,
                    status = %lksb.status,
                    req = %st.req,
                    "request failed, retrying"
                );
                st.cur = lksb.mode;
                if st.cur == DlmMode::Iv {
                    st.lkid = None;
                }
                st.flags.rerequest = true;
                st.prev_req = st.req;
                drop(st);
                self.inner.dispatcher.queue_delayed(handle.id, DelayReason::ErrorRetry);
                return;
            }
            status => {
                error!(name = %handle.name, handle = %handle.id, status = %status, "request failed");
                return self.fail(handle, st, lksb.mode, LockDlmError::dlm(handle.name, status));
            }
        }

        crate::dlm_assert!(
            !(st.plock && lksb.flags.demoted),
            name = %handle.name,
            handle = %handle.id,
            "range lock demoted by the DLM"
        );
        if lksb.lkid.is_some() {
            st.lkid = lksb.lkid;
        }
        if lksb.flags.valnotvalid {
            if let Some(lvb) = st.lvb.as_mut() {
                lvb.fill(0);
            }
        } else if let (Some(dst), Some(src)) = (st.lvb.as_mut(), lksb.lvb.as_ref()) {
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        if lksb.flags.altmode {
            st.req = match st.req {
                DlmMode::Pr => DlmMode::Cw,
                DlmMode::Cw => DlmMode::Pr,
                other => other,
            };
        }
        st.cur = lksb.mode;
        crate::dlm_assert!(
            st.cur == st.req,
            name = %handle.name,
            handle = %handle.id,
            cur = %st.cur,
            req = %st.req,
            "DLM granted a mode other than the one requested"
        );

        if st.flags.rerequest {
            // the NL grant that parked this lock while locks were blocked
            st.flags.rerequest = false;
            st.req = st.prev_req;
            st.prev_req = DlmMode::Iv;
            st.flags.no_cache = true;
            st.lkf.convert = true;
            st.lkf.conv_deadlk = false;
            drop(st);
            debug!(name = %handle.name, handle = %handle.id, "re-requesting after demotion");
            self.inner.dispatcher.queue(handle.id, QueueKind::Submit, false);
            return;
        }

        if self.inner.dispatcher.is_blocked() && !st.flags.no_block && st.cur != DlmMode::Nl {
            info!(name = %handle.name, handle = %handle.id, mode = %st.cur, "granted while locks are blocked, demoting to NL");
            st.flags.rerequest = true;
            st.prev_req = st.req;
            st.req = DlmMode::Nl;
            st.lkf = DlmFlags {
                convert: true,
                valblk: st.lkf.valblk,
                ..DlmFlags::default()
            };
            drop(st);
            self.inner.dispatcher.queue(handle.id, QueueKind::Submit, false);
            return;
        }

        if lksb.flags.demoted {
            st.flags.no_cache = true;
        }
        st.flags.sync_lvb = false;
        let cacheable = !st.flags.no_cache && st.cur > DlmMode::Nl && prev_cur > DlmMode::Nl;
        st.flags.no_cache = false;
        let completion = self.completion(handle, &st, cacheable, false, None);
        self.deliver(handle, st, completion);
    }

    fn complete_unlock(&self, handle: &Arc<LockHandle>, mut st: MutexGuard<'_, HandleState>, lksb: Lksb) {
        st.flags.dlm_unlock = false;
        if lksb.status != DlmStatus::Unlocked {
            error!(name = %handle.name, handle = %handle.id, status = %lksb.status, "unlock failed");
            st.flags.unlock_delete = false;
            let err = LockDlmError::dlm(handle.name, lksb.status);
            let completion = self.completion(handle, &st, false, false, Some(err));
            return self.deliver(handle, st, completion);
        }

        st.cur = DlmMode::Iv;
        st.req = DlmMode::Iv;
        st.lkid = None;
        if st.flags.unlock_delete {
            st.busy = false;
            drop(st);
            self.delete_handle(handle.id);
            handle.signal();
            return;
        }
        let completion = self.completion(handle, &st, false, false, None);
        self.deliver(handle, st, completion);
    }

    fn fail(&self, handle: &Arc<LockHandle>, mut st: MutexGuard<'_, HandleState>, mode: DlmMode, err: LockDlmError) {
        st.cur = mode;
        st.req = st.cur;
        if st.cur == DlmMode::Iv {
            st.lkid = None;
        }
        st.flags.sync_lvb = false;
        let completion = self.completion(handle, &st, false, false, Some(err));
        self.deliver(handle, st, completion);
    }

    fn completion(
        &self,
        handle: &LockHandle,
        st: &HandleState,
        cacheable: bool,
        cancelled: bool,
        error: Option<LockDlmError>,
    ) -> Completion {
        Completion {
            name: handle.name,
            handle: handle.id,
            state: LmState::from_mode(st.cur),
            cacheable,
            cancelled,
            error,
        }
    }

    /// Hand the result to a waiting caller or to the callback, and release the handle.
    fn deliver(&self, handle: &Arc<LockHandle>, mut st: MutexGuard<'_, HandleState>, completion: Completion) {
        st.busy = false;
        if st.flags.in_lock || st.flags.wait_complete || st.flags.unlock_sync {
            st.result = Some(completion);
            drop(st);
        } else {
            drop(st);
            self.inner.callback.on_complete(completion);
        }
        handle.signal();
    }

    pub(crate) fn process_blocking(&self, handle: &Arc<LockHandle>) {
        let mode = self.inner.dispatcher.bast_mode(handle.id);
        if mode == DlmMode::Iv || handle.state.lock().flags.no_bast {
            return;
        }
        debug!(name = %handle.name, handle = %handle.id, mode = %mode, "blocking callback");
        self.inner.callback.on_blocking(handle.name, LmState::from_mode(mode));
    }

    /// Cancel the handle's outstanding request.
    ///
    /// A request still queued locally completes as cancelled right away. One already
    /// issued is cancelled in the DLM; if the grant wins the race, the grant is what
    /// the callback sees.
    pub fn cancel(&self, id: HandleId) -> Result<()> {
        let handle = self.handle(id)?;
        let mut st = handle.state.lock();
        if !st.busy || st.flags.dlm_unlock {
            debug!(name = %handle.name, handle = %id, "nothing to cancel");
            return Ok(());
        }
        st.flags.cancel = true;

        if self.inner.dispatcher.remove(id) {
            info!(name = %handle.name, handle = %id, "request cancelled before reaching the DLM");
            st.flags.rerequest = false;
            let lksb = Lksb::local(DlmStatus::Cancelled, st.lkid, st.cur);
            self.complete_locally(&handle, st, lksb);
            return Ok(());
        }

        // not issued yet: the worker sees the flag
        let Some(lkid) = st.lkid else {
            return Ok(());
        };
        if st.lksb.is_some() {
            return Ok(());
        }
        st.flags.dlm_cancel = true;
        match self.inner.dlm.cancel(lkid) {
            Ok(()) => debug!(name = %handle.name, handle = %id, "cancel issued to the DLM"),
            Err(DlmStatus::Busy) => {
                st.flags.dlm_cancel = false;
                debug!(name = %handle.name, handle = %id, "nothing queued in the DLM, cancel ignored");
            }
            Err(status) => {
                st.flags.dlm_cancel = false;
                warn!(name = %handle.name, handle = %id, status = %status, "DLM refused cancel");
            }
        }
        Ok(())
    }

    /// Release the handle's DLM lock and keep the handle. The result arrives through
    /// the callback.
    pub fn unlock(&self, id: HandleId) -> Result<LockOutcome> {
        let handle = self.handle(id)?;
        self.submit_unlock(&handle, UnlockKind::Callback)
    }

    /// Release the handle's DLM lock and wait for the DLM to confirm.
    pub async fn unlock_sync(&self, id: HandleId) -> Result<()> {
        let handle = self.handle(id)?;
        match self.submit_unlock(&handle, UnlockKind::Wait)? {
            LockOutcome::Unchanged => Ok(()),
            LockOutcome::Async => {
                let completion = handle.wait_result().await;
                handle.state.lock().flags.unlock_sync = false;
                completion_result(completion).map(|_| ())
            }
        }
    }

    /// Release the handle's DLM lock and free the handle once the unlock completes.
    pub fn unlock_and_delete(&self, id: HandleId) -> Result<()> {
        let handle = self.handle(id)?;
        self.submit_unlock(&handle, UnlockKind::Delete).map(|_| ())
    }

    fn submit_unlock(&self, handle: &Arc<LockHandle>, kind: UnlockKind) -> Result<LockOutcome> {
        {
            let mut st = handle.state.lock();
            if st.busy {
                return Err(LockDlmError::Busy { name: handle.name });
            }
            if st.lkid.is_none() {
                drop(st);
                if kind == UnlockKind::Delete {
                    self.delete_handle(handle.id);
                }
                return Ok(LockOutcome::Unchanged);
            }
            st.flags.dlm_unlock = true;
            st.flags.unlock_sync = kind == UnlockKind::Wait;
            st.flags.unlock_delete = kind == UnlockKind::Delete;
            st.result = None;
            st.busy = true;
        }
        debug!(name = %handle.name, handle = %handle.id, ?kind, "unlock queued");
        self.inner.dispatcher.queue(handle.id, QueueKind::Submit, false);
        Ok(LockOutcome::Async)
    }
}
