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

//! Boundary to the distributed lock manager.
//!
//! Every request is asynchronous by default: the call returns as soon as the DLM has
//! accepted it and the outcome arrives later as a [`DlmEvent`] on the lock space's
//! notification channel. The `*_sync` variants wait for the outcome instead and never
//! produce a channel event.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::types::{DlmLockId, DlmMode, HandleId, LockName};

/// Result codes reported by the DLM, synchronously or in a lock status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DlmStatus {
    /// Request granted
    Granted,
    /// Incompatible holders exist and the request asked not to queue
    WouldBlock,
    /// The request was chosen as a conversion deadlock victim
    Deadlock,
    /// A queued request was cancelled
    Cancelled,
    /// Lock released
    Unlocked,
    /// The lock already has an operation in progress
    Busy,
    /// Unknown lock id or malformed request
    Invalid,
    /// The DLM could not allocate for the request
    NoMemory,
}

impl DlmStatus {
    /// Transient contention or exhaustion that a later retry may clear
    pub fn is_retryable(self) -> bool {
        matches!(self, DlmStatus::WouldBlock | DlmStatus::Deadlock | DlmStatus::NoMemory)
    }
}

impl fmt::Display for DlmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DlmStatus::Granted => "granted",
            DlmStatus::WouldBlock => "would block",
            DlmStatus::Deadlock => "deadlock detected",
            DlmStatus::Cancelled => "cancelled",
            DlmStatus::Unlocked => "unlocked",
            DlmStatus::Busy => "busy",
            DlmStatus::Invalid => "invalid request",
            DlmStatus::NoMemory => "out of memory",
        };
        f.write_str(s)
    }
}

/// Request flags understood by the DLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DlmFlags {
    /// Fail with `WouldBlock` instead of queueing
    pub noqueue: bool,
    /// With `noqueue`, still notify the blocking holders once
    pub noqueue_bast: bool,
    /// Queue at the head instead of the tail
    pub headque: bool,
    /// A PR request may be granted as CW
    pub alt_cw: bool,
    /// A CW request may be granted as PR
    pub alt_pr: bool,
    /// The request converts an existing lock
    pub convert: bool,
    /// Resolve a conversion deadlock by demoting this lock to NL
    pub conv_deadlk: bool,
    /// The lock carries a value block
    pub valblk: bool,
    /// NL request that skips the queues
    pub expedite: bool,
}

/// Status-block flags reported with a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SbFlags {
    /// The lock was demoted to NL before the grant to resolve a deadlock
    pub demoted: bool,
    /// The resource's value block is not valid (a writer died)
    pub valnotvalid: bool,
    /// The alternate mode was granted
    pub altmode: bool,
}

/// Lock status block: the outcome of one DLM operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lksb {
    pub status: DlmStatus,
    pub lkid: Option<DlmLockId>,
    /// Mode held after the operation
    pub mode: DlmMode,
    pub flags: SbFlags,
    /// Resource value block, present for locks that carry one
    pub lvb: Option<Vec<u8>>,
}

impl Lksb {
    /// Status block for an outcome the DLM never saw (rejected or cancelled locally).
    pub fn local(status: DlmStatus, lkid: Option<DlmLockId>, mode: DlmMode) -> Self {
        Self {
            status,
            lkid,
            mode,
            flags: SbFlags::default(),
            lvb: None,
        }
    }
}

/// A new lock request.
#[derive(Debug, Clone)]
pub struct DlmLockRequest {
    pub name: LockName,
    pub mode: DlmMode,
    pub flags: DlmFlags,
    /// Deliver blocking notifications for this lock
    pub bast: bool,
    /// Handle the notifications for this lock are addressed to
    pub tag: HandleId,
}

/// What a notification reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlmNotification {
    /// An issued request finished
    Completion(Lksb),
    /// A request elsewhere is blocked by this lock; carries the mode it wants
    Blocking(DlmMode),
}

/// One notification from the DLM, addressed to a lock handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlmEvent {
    pub tag: HandleId,
    pub notification: DlmNotification,
}

pub type DlmEventSender = mpsc::UnboundedSender<DlmEvent>;
pub type DlmEventReceiver = mpsc::UnboundedReceiver<DlmEvent>;

/// Create the single-consumer notification channel of a lock space.
pub fn event_channel() -> (DlmEventSender, DlmEventReceiver) {
    mpsc::unbounded_channel()
}

/// Lock manager primitives consumed by the lock space.
#[async_trait]
pub trait Dlm: Send + Sync + fmt::Debug {
    /// Request a new lock. The completion arrives on the notification channel.
    fn lock(&self, request: DlmLockRequest) -> std::result::Result<DlmLockId, DlmStatus>;

    /// Convert a granted lock. `lvb` is written to the resource when the held mode writes it.
    fn convert(
        &self,
        lkid: DlmLockId,
        mode: DlmMode,
        flags: DlmFlags,
        lvb: Option<Vec<u8>>,
    ) -> std::result::Result<(), DlmStatus>;

    /// Release a granted lock.
    fn unlock(&self, lkid: DlmLockId, lvb: Option<Vec<u8>>) -> std::result::Result<(), DlmStatus>;

    /// Cancel a queued request. Fails with `Busy` once the request was granted.
    fn cancel(&self, lkid: DlmLockId) -> std::result::Result<(), DlmStatus>;

    /// Request a new lock and wait for the outcome.
    async fn lock_sync(&self, request: DlmLockRequest) -> Lksb;

    /// Convert a granted lock and wait for the outcome.
    async fn convert_sync(&self, lkid: DlmLockId, mode: DlmMode, flags: DlmFlags, lvb: Option<Vec<u8>>) -> Lksb;

    /// Release a granted lock and wait for the outcome.
    async fn unlock_sync(&self, lkid: DlmLockId, lvb: Option<Vec<u8>>) -> Lksb;
}
