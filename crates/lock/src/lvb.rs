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

//! Lock value blocks.
//!
//! A handle's buffer is a copy of the resource's value block, refreshed on every grant.
//! Changes written while the handle holds PW or EX reach the resource on the next
//! down-conversion or unlock.

use tracing::{debug, info};

use crate::error::{LockDlmError, Result};
use crate::lock::Waiter;
use crate::lockspace::LockSpace;
use crate::types::{DlmMode, HandleId, LockFlags, LockOutcome};

impl LockSpace {
    /// Attach a zeroed value block buffer. Takes effect from the next request.
    pub fn attach_lvb(&self, id: HandleId) -> Result<()> {
        let handle = self.handle(id)?;
        let mut st = handle.state.lock();
        if st.lvb.is_none() {
            st.lvb = Some(vec![0; self.inner.config.lvb_len]);
        }
        Ok(())
    }

    pub fn detach_lvb(&self, id: HandleId) -> Result<()> {
        let handle = self.handle(id)?;
        let mut st = handle.state.lock();
        if st.hold_null.is_some() {
            return Err(LockDlmError::invalid_state(handle.name, "value block is held"));
        }
        st.lvb = None;
        Ok(())
    }

    /// Attach a value block and keep it valid while the handle holds nothing, with an
    /// NL companion lock on the same resource.
    pub async fn hold_lvb(&self, id: HandleId) -> Result<()> {
        let handle = self.handle(id)?;
        {
            let mut st = handle.state.lock();
            if st.hold_null.is_some() {
                return Ok(());
            }
            if st.lvb.is_none() {
                st.lvb = Some(vec![0; self.inner.config.lvb_len]);
            }
        }

        let companion = self.new_handle(handle.name)?;
        {
            let mut st = companion.state.lock();
            st.flags.in_lock = true;
            st.flags.no_bast = true;
            st.companion = true;
            st.lvb = Some(vec![0; self.inner.config.lvb_len]);
        }
        if let Err(err) = self.request_wait(&companion, DlmMode::Nl, LockFlags::NONE).await {
            self.delete_handle(companion.id);
            return Err(err);
        }
        handle.state.lock().hold_null = Some(companion.id);
        debug!(name = %handle.name, handle = %id, companion = %companion.id, "value block held");
        Ok(())
    }

    /// Drop the NL companion and detach the value block.
    pub fn unhold_lvb(&self, id: HandleId) -> Result<()> {
        let handle = self.handle(id)?;
        let companion = {
            let mut st = handle.state.lock();
            st.lvb = None;
            st.hold_null.take()
        };
        if let Some(companion) = companion {
            self.unlock_and_delete(companion)?;
        }
        Ok(())
    }

    /// Copy of the handle's value block. Valid only while a lock or a hold keeps it.
    pub fn read_lvb(&self, id: HandleId) -> Result<Vec<u8>> {
        let handle = self.handle(id)?;
        let st = handle.state.lock();
        match &st.lvb {
            Some(lvb) if st.lkid.is_some() || st.hold_null.is_some() => Ok(lvb.clone()),
            _ => Err(LockDlmError::LvbNotHeld { name: handle.name }),
        }
    }

    /// Overwrite the front of the handle's value block. The rest keeps its contents.
    pub fn set_lvb(&self, id: HandleId, data: &[u8]) -> Result<()> {
        let handle = self.handle(id)?;
        let mut st = handle.state.lock();
        let held = st.lkid.is_some() || st.hold_null.is_some();
        let Some(lvb) = st.lvb.as_mut().filter(|_| held) else {
            return Err(LockDlmError::LvbNotHeld { name: handle.name });
        };
        if data.len() > lvb.len() {
            return Err(LockDlmError::invalid_state(
                handle.name,
                format!("value block is {} bytes, got {}", lvb.len(), data.len()),
            ));
        }
        lvb[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Publish `data` to the resource's value block while keeping EX.
    pub async fn sync_lvb(&self, id: HandleId, data: &[u8]) -> Result<()> {
        let handle = self.handle(id)?;
        {
            let mut st = handle.state.lock();
            if st.cur != DlmMode::Ex {
                return Err(LockDlmError::invalid_state(
                    handle.name,
                    format!("value block is published at EX, held {}", st.cur),
                ));
            }
            let Some(lvb) = st.lvb.as_mut() else {
                return Err(LockDlmError::LvbNotHeld { name: handle.name });
            };
            if data.len() > lvb.len() {
                return Err(LockDlmError::invalid_state(
                    handle.name,
                    format!("value block is {} bytes, got {}", lvb.len(), data.len()),
                ));
            }
            lvb[..data.len()].copy_from_slice(data);
        }

        match self.submit(&handle, DlmMode::Ex, LockFlags::FORCE_PROMOTE, Waiter::SyncLvb)? {
            LockOutcome::Unchanged => Ok(()),
            LockOutcome::Async => {
                let completion = handle.wait_result().await;
                if let Some(err) = completion.error {
                    return Err(err);
                }
                info!(name = %handle.name, handle = %id, len = data.len(), "value block published");
                Ok(())
            }
        }
    }
}
