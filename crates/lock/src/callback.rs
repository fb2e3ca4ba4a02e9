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

use crate::types::{Completion, LmState, LockName, RecoveryEvent};

/// Filesystem side of the lock module.
///
/// Lock completions and blocking callbacks run on dispatcher worker tasks; recovery
/// events run on the task that reported the membership change. Never invoked from inside
/// a DLM upcall or while a lock module guard is held, so implementations may issue new
/// lock requests.
pub trait LockCallback: Send + Sync {
    /// A request finished (granted, failed, cancelled or unlocked)
    fn on_complete(&self, completion: Completion);

    /// A request elsewhere is blocked by the lock on `name` and wants `requested`
    fn on_blocking(&self, name: LockName, requested: LmState);

    fn on_recovery_event(&self, jid: u32, event: RecoveryEvent);
}

#[cfg(test)]
pub(crate) use recording::{Delivery, RecordingCallback};
