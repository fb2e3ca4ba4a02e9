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

// ============================================================================
// Core Module Declarations
// ============================================================================

// Core Modules
pub mod error;
pub mod types;

// DLM Boundary
pub mod dlm;
pub mod local;

// Lock Space
pub mod callback;
pub mod config;
mod handle;
mod lock;
pub mod lockspace;
mod lvb;
mod null_cache;
mod queue;
pub mod recovery;

// Range Locks
pub mod plock;
pub mod resource;

#[cfg(test)]
mod tests;

// ============================================================================
// Public API Exports
// ============================================================================

pub use crate::{
    // Filesystem side
    callback::LockCallback,
    config::{LockSpaceConfig, MountArgs},
    // DLM boundary
    dlm::{Dlm, DlmEvent, DlmEventReceiver, DlmEventSender, DlmFlags, DlmLockRequest, DlmNotification, DlmStatus, Lksb, SbFlags, event_channel},
    // Error types
    error::{LockDlmError, Result},
    local::{LocalDlm, LocalDlmNode, LocalDlmStats},
    // Main components
    lockspace::{LockSpace, LockSpaceStats, MountFlags},
    plock::PlockConflict,
    queue::QueueDepths,
    recovery::{NodeFlags, NodeRecord, RecoveryResult},
    resource::RangeLock,
    // Core types
    types::{
        Completion, DlmLockId, DlmMode, HandleId, LM_TYPE_JID, LM_TYPE_PLOCK_UPDATE, LmState, LockFlags, LockName, LockOutcome,
        RecoveryEvent,
    },
};

// ============================================================================
// Version Information
// ============================================================================

/// Current version of the lock crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
