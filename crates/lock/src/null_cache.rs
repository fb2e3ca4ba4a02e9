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

//! Cache of handles parked at NL, so a later request on the same name converts an
//! existing DLM lock instead of creating one.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lockspace::LockSpace;
use crate::types::{DlmMode, HandleId, LockFlags, LockName};

impl LockSpace {
    /// Convert the handle to NL and park it in the cache. When the cache is full the
    /// handle is unlocked and freed instead.
    pub async fn release_to_cache(&self, id: HandleId) -> Result<()> {
        let handle = self.handle(id)?;
        if handle.cur() == DlmMode::Iv {
            handle.wait_idle().await;
            if handle.cur() == DlmMode::Iv {
                return self.unlock_and_delete(id);
            }
        }
        if handle.cur() > DlmMode::Nl {
            if let Err(err) = self.request_wait(&handle, DlmMode::Nl, LockFlags::NONE).await {
                warn!(name = %handle.name, handle = %id, error = %err, "lock not parked at NL");
                return self.unlock_and_delete(id);
            }
        }

        {
            let mut cache = self.inner.null_cache.lock();
            if cache.len() < self.inner.config.shrink_cache_max {
                cache.push_back((handle.name, id));
                debug!(name = %handle.name, handle = %id, cached = cache.len(), "lock cached at NL");
                return Ok(());
            }
        }
        debug!(name = %handle.name, handle = %id, "null-lock cache full, releasing");
        self.unlock_and_delete(id)
    }

    /// Take a cached NL handle for `name` out of the cache.
    pub fn reacquire_from_cache(&self, name: LockName) -> Option<HandleId> {
        let mut cache = self.inner.null_cache.lock();
        let at = cache.iter().position(|(cached, _)| *cached == name)?;
        let (_, id) = cache.remove(at)?;
        debug!(name = %name, handle = %id, "lock revived from the null-lock cache");
        Some(id)
    }

    /// Release the oldest cached handles until at most `shrink_cache_count` remain.
    /// Returns how many were released.
    pub fn shrink_null_cache(&self) -> usize {
        let evicted: Vec<HandleId> = {
            let mut cache = self.inner.null_cache.lock();
            let excess = cache.len().saturating_sub(self.inner.config.shrink_cache_count);
            cache.drain(..excess).map(|(_, id)| id).collect()
        };
        self.release_cached(&evicted);
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "null-lock cache shrunk");
        }
        evicted.len()
    }

    /// Release every cached handle.
    pub fn clear_null_cache(&self) -> usize {
        let evicted: Vec<HandleId> = self.inner.null_cache.lock().drain(..).map(|(_, id)| id).collect();
        self.release_cached(&evicted);
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "null-lock cache cleared");
        }
        evicted.len()
    }

    pub fn cached_count(&self) -> usize {
        self.inner.null_cache.lock().len()
    }

    fn release_cached(&self, ids: &[HandleId]) {
        for id in ids {
            if let Err(err) = self.unlock_and_delete(*id) {
                warn!(handle = %id, error = %err, "cached lock not released");
            }
        }
    }
}
