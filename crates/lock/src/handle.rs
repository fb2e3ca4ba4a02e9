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

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::dlm::{DlmFlags, Lksb};
use crate::types::{Completion, DlmLockId, DlmMode, HandleId, LockName};

/// Per-handle flags. Guarded by the handle's state mutex.
///
/// Queue membership and the blocking mode are not here: they belong to the
/// dispatcher and live under its guard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HandleFlags {
    /// Failures surface immediately instead of being retried; may run while locks are blocked
    pub no_block: bool,
    /// The next completion is reported as not cacheable
    pub no_cache: bool,
    /// The queued operation is an unlock
    pub dlm_unlock: bool,
    pub try_failed: bool,
    /// The request publishes the value block with an EX to EX convert
    pub sync_lvb: bool,
    pub force_promote: bool,
    /// `prev_req` must be requested again
    pub rerequest: bool,
    /// A caller waits on the completion signal instead of the callback
    pub wait_complete: bool,
    /// Internal handle: completions always signal, never reach the callback
    pub in_lock: bool,
    /// Cancel requested by the caller
    pub cancel: bool,
    /// Cancel issued to the DLM and not yet answered
    pub dlm_cancel: bool,
    /// A caller waits for the unlock to finish
    pub unlock_sync: bool,
    /// Blocking notifications are dropped
    pub no_bast: bool,
    /// Insert at the head of the submit queue
    pub head_queue: bool,
    /// Free the handle once the unlock completes
    pub unlock_delete: bool,
}

#[derive(Debug, Default)]
pub(crate) struct HandleState {
    pub cur: DlmMode,
    pub req: DlmMode,
    pub prev_req: DlmMode,
    pub lkid: Option<DlmLockId>,
    /// DLM flags of the request in progress
    pub lkf: DlmFlags,
    pub flags: HandleFlags,
    /// Request (lock, convert or unlock) accepted and not yet completed
    pub busy: bool,
    /// Status block delivered by the DLM, waiting for the complete queue
    pub lksb: Option<Lksb>,
    /// Result handed to a waiting caller
    pub result: Option<Completion>,
    pub lvb: Option<Vec<u8>>,
    /// NL companion keeping the value block while this handle holds nothing
    pub hold_null: Option<HandleId>,
    /// This handle is the NL companion of another one
    pub companion: bool,
    /// This handle backs the range locks of a resource
    pub plock: bool,
}

/// One DLM lock as the lock module tracks it.
#[derive(Debug)]
pub(crate) struct LockHandle {
    pub id: HandleId,
    pub name: LockName,
    pub state: Mutex<HandleState>,
    /// Completion signal for synchronous callers
    pub done: Notify,
}

impl LockHandle {
    pub(crate) fn new(id: HandleId, name: LockName) -> Self {
        Self {
            id,
            name,
            state: Mutex::new(HandleState {
                cur: DlmMode::Iv,
                req: DlmMode::Iv,
                prev_req: DlmMode::Iv,
                ..HandleState::default()
            }),
            done: Notify::new(),
        }
    }

    /// Wait for the result of the request this caller is waiting on.
    pub(crate) async fn wait_result(&self) -> Completion {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if let Some(completion) = st.result.take() {
                    st.flags.wait_complete = false;
                    return completion;
                }
            }
            notified.await;
        }
    }

    /// Wait until the handle has no request in progress.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.state.lock().busy {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn signal(&self) {
        self.done.notify_waiters();
    }

    pub(crate) fn cur(&self) -> DlmMode {
        self.state.lock().cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LmState;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_new_handle_holds_nothing() {
        let handle = LockHandle::new(HandleId(1), LockName::new(2, 9));
        let st = handle.state.lock();
        assert_eq!(st.cur, DlmMode::Iv);
        assert_eq!(st.req, DlmMode::Iv);
        assert!(st.lkid.is_none());
        assert_eq!(st.flags, HandleFlags::default());
    }

    #[tokio::test]
    async fn test_wait_result_sees_signal() {
        let handle = Arc::new(LockHandle::new(HandleId(1), LockName::new(2, 9)));
        handle.state.lock().flags.wait_complete = true;

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_result().await })
        };
        tokio::task::yield_now().await;

        handle.state.lock().result = Some(Completion {
            name: handle.name,
            handle: handle.id,
            state: LmState::Shared,
            cacheable: false,
            cancelled: false,
            error: None,
        });
        handle.signal();

        let completion = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(completion.state, LmState::Shared);
        assert!(!handle.state.lock().flags.wait_complete);
    }
}
