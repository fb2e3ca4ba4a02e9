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

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock type used for the per-node journal id lock.
pub const LM_TYPE_JID: u32 = 0x10;

/// Lock type used for the range-lock update lock of a resource.
pub const LM_TYPE_PLOCK_UPDATE: u32 = 0x11;

/// Length of the hex rendering of a lock name (8 digits of type, 16 of number).
pub const LOCK_NAME_HEX_LEN: usize = 24;

/// Filesystem lock name: a 32-bit lock type plus a 64-bit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockName {
    pub lock_type: u32,
    pub number: u64,
}

impl LockName {
    pub const fn new(lock_type: u32, number: u64) -> Self {
        Self { lock_type, number }
    }

    /// Name of the update lock paired with this name's range locks.
    pub const fn plock_update(&self) -> Self {
        Self::new(LM_TYPE_PLOCK_UPDATE, self.number)
    }

    /// Fixed-width hex rendering used by the DLM and by every diagnostic.
    pub fn to_hex_string(&self) -> String {
        format!("{:08x}{:016x}", self.lock_type, self.number)
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:016x}", self.lock_type, self.number)
    }
}

/// DLM lock modes, ordered by strength.
///
/// `Iv` is not a DLM mode: it marks a handle that holds no DLM lock at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum DlmMode {
    #[default]
    Iv = -1,
    /// Null: holds the resource (and its value block) without blocking anyone
    Nl = 0,
    /// Concurrent read
    Cr = 1,
    /// Concurrent write
    Cw = 2,
    /// Protected read
    Pr = 3,
    /// Protected write
    Pw = 4,
    /// Exclusive
    Ex = 5,
}

impl DlmMode {
    /// Standard DLM compatibility matrix.
    pub fn compatible(self, other: DlmMode) -> bool {
        use DlmMode::*;
        match (self, other) {
            (Iv, _) | (_, Iv) | (Nl, _) | (_, Nl) => true,
            (Cr, Ex) | (Ex, Cr) => false,
            (Cr, _) | (_, Cr) => true,
            (Cw, Cw) => true,
            (Pr, Pr) => true,
            _ => false,
        }
    }

    /// True for modes that write the value block back on down-conversion or unlock.
    pub fn writes_lvb(self) -> bool {
        self >= DlmMode::Pw
    }
}

impl fmt::Display for DlmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DlmMode::Iv => "IV",
            DlmMode::Nl => "NL",
            DlmMode::Cr => "CR",
            DlmMode::Cw => "CW",
            DlmMode::Pr => "PR",
            DlmMode::Pw => "PW",
            DlmMode::Ex => "EX",
        };
        f.write_str(s)
    }
}

/// Lock states as the filesystem sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LmState {
    Unlocked,
    Exclusive,
    Deferred,
    Shared,
}

impl LmState {
    /// Filesystem state for a DLM mode. IV and NL are both "unlocked".
    pub fn from_mode(mode: DlmMode) -> Self {
        match mode {
            DlmMode::Iv | DlmMode::Nl => LmState::Unlocked,
            DlmMode::Ex => LmState::Exclusive,
            DlmMode::Cw => LmState::Deferred,
            DlmMode::Pr => LmState::Shared,
            // CR and PW are never requested on behalf of the filesystem
            DlmMode::Cr => LmState::Shared,
            DlmMode::Pw => LmState::Exclusive,
        }
    }

    /// DLM mode requested for a filesystem state.
    pub fn to_mode(self) -> DlmMode {
        match self {
            LmState::Unlocked => DlmMode::Nl,
            LmState::Exclusive => DlmMode::Ex,
            LmState::Deferred => DlmMode::Cw,
            LmState::Shared => DlmMode::Pr,
        }
    }
}

/// Identifier of a lock handle inside one lock space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Identifier the DLM assigns to a lock (the lock status block's lock id).
pub type DlmLockId = u64;

/// Flags accompanying a filesystem lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockFlags {
    /// Fail instead of queueing behind incompatible holders.
    pub try_lock: bool,
    /// Like `try_lock`, but still send one blocking notification to the holders.
    pub try_1cb: bool,
    /// The request may proceed while the lock space is blocked for recovery.
    pub noexp: bool,
    /// Accept the alternate of PR/CW.
    pub any: bool,
    /// Jump to the head of the DLM and submit queues.
    pub priority: bool,
    /// Re-issue even when the requested mode is already held; skip conversion deadlock demotion.
    pub force_promote: bool,
}

impl LockFlags {
    pub const NONE: Self = Self {
        try_lock: false,
        try_1cb: false,
        noexp: false,
        any: false,
        priority: false,
        force_promote: false,
    };
    pub const TRY: Self = Self { try_lock: true, ..Self::NONE };
    pub const TRY_1CB: Self = Self { try_1cb: true, ..Self::NONE };
    pub const NOEXP: Self = Self { noexp: true, ..Self::NONE };
    pub const ANY: Self = Self { any: true, ..Self::NONE };
    pub const PRIORITY: Self = Self { priority: true, ..Self::NONE };
    pub const FORCE_PROMOTE: Self = Self {
        force_promote: true,
        ..Self::NONE
    };

    /// True when the request must not wait behind incompatible holders.
    pub fn is_try(&self) -> bool {
        self.try_lock || self.try_1cb
    }
}

/// What a non-blocking lock/unlock call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The request was handed to the DLM; the result arrives through the callback.
    Async,
    /// Nothing to do: the handle is already in the requested state.
    Unchanged,
}

/// Completion report delivered to the filesystem callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub name: LockName,
    pub handle: HandleId,
    /// State now granted. On failure this is the state still held.
    pub state: LmState,
    /// Both the previous and the new grant are above NL and nothing demoted the lock.
    pub cacheable: bool,
    /// The request was cancelled before it was granted.
    pub cancelled: bool,
    pub error: Option<crate::error::LockDlmError>,
}

/// Recovery-related notifications delivered to the filesystem callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryEvent {
    /// The node owning the journal id left the cluster; its journal must be replayed.
    NeedRecovery,
    /// Journal recovery for the journal id finished.
    RecoveryDone,
    /// The node owning the journal id is withdrawing from the cluster filesystem.
    Withdraw,
    /// Too many locks are live; the filesystem should drop cached ones.
    DropLocks,
}
