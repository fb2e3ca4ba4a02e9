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

//! Submit, delayed, blocking and complete queues.
//!
//! A handle is a member of at most one queue. Membership is recorded per handle, so
//! removal from the submit queue only clears the record and the stale entry is skipped
//! when popped. The delayed queue is scanned rather than popped, so its entries are
//! dropped as soon as the handle leaves it.
//! Work for a handle that is already queued or being serviced is parked and moves to
//! its queue once the current item finishes, which serializes everything that happens
//! to one handle.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

use crate::types::{DlmMode, HandleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum QueueKind {
    Submit,
    Delayed,
    Blocking,
    Complete,
}

/// Why a handle sits in the delayed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DelayReason {
    /// Lock requests are blocked for recovery
    LocksBlocked,
    /// The DLM rejected a lock or convert call
    ErrorLock,
    /// The DLM rejected an unlock call
    ErrorUnlock,
    /// The request completed with a transient failure and is retried
    ErrorRetry,
}

#[derive(Debug)]
struct Membership {
    queued: Option<QueueKind>,
    in_service: bool,
    parked: VecDeque<QueueKind>,
    /// Mode wanted by the blocked request elsewhere
    bast_mode: DlmMode,
    delay: Option<(DelayReason, Instant)>,
}

impl Membership {
    fn new() -> Self {
        Self {
            queued: None,
            in_service: false,
            parked: VecDeque::new(),
            bast_mode: DlmMode::Iv,
            delay: None,
        }
    }

    fn is_vacant(&self) -> bool {
        self.queued.is_none() && !self.in_service && self.parked.is_empty()
    }
}

#[derive(Debug, Default)]
struct Queues {
    submit: VecDeque<HandleId>,
    delayed: VecDeque<HandleId>,
    blocking: VecDeque<HandleId>,
    complete: VecDeque<HandleId>,
    members: HashMap<HandleId, Membership>,
    blocked: bool,
    shutdown: bool,
}

impl Queues {
    fn list(&mut self, kind: QueueKind) -> &mut VecDeque<HandleId> {
        match kind {
            QueueKind::Submit => &mut self.submit,
            QueueKind::Delayed => &mut self.delayed,
            QueueKind::Blocking => &mut self.blocking,
            QueueKind::Complete => &mut self.complete,
        }
    }

    fn enqueue(&mut self, id: HandleId, kind: QueueKind, head: bool) {
        if let Some(member) = self.members.get_mut(&id) {
            member.queued = Some(kind);
        }
        let list = self.list(kind);
        if head {
            list.push_front(id);
        } else {
            list.push_back(id);
        }
    }

    fn unlink_delayed(&mut self, id: HandleId) {
        self.delayed.retain(|queued| *queued != id);
    }

    /// Pop the first live entry of a queue.
    fn pop_live(&mut self, kind: QueueKind) -> Option<HandleId> {
        while let Some(id) = self.list(kind).pop_front() {
            if let Some(member) = self.members.get_mut(&id) {
                if member.queued == Some(kind) {
                    member.queued = None;
                    member.in_service = true;
                    return Some(id);
                }
            }
        }
        None
    }

    fn pop_delayed(&mut self, now: Instant, retry_delay: Duration) -> Option<HandleId> {
        let blocked = self.blocked;
        let members = &self.members;
        let due = self.delayed.iter().position(|id| {
            members.get(id).is_some_and(|m| {
                m.queued == Some(QueueKind::Delayed)
                    && match m.delay {
                        Some((DelayReason::LocksBlocked, _)) => !blocked,
                        Some((_, since)) => now.duration_since(since) >= retry_delay,
                        None => true,
                    }
            })
        });
        let id = self.delayed.remove(due?)?;
        if let Some(member) = self.members.get_mut(&id) {
            member.queued = None;
            member.in_service = true;
        }
        Some(id)
    }

    fn count(&self, kind: QueueKind) -> usize {
        self.members.values().filter(|m| m.queued == Some(kind)).count()
    }
}

/// Queue depths, as reported by [`crate::LockSpace::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub submit: usize,
    pub delayed: usize,
    pub blocking: usize,
    pub complete: usize,
}

/// The lock space's async guard and the queues it protects.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    queues: Mutex<Queues>,
    wake: Notify,
    idle: Notify,
    retry_delay: Duration,
}

impl Dispatcher {
    pub(crate) fn new(retry_delay: Duration) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            wake: Notify::new(),
            idle: Notify::new(),
            retry_delay,
        }
    }

    pub(crate) fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Queue work for a handle; parked while the handle is queued or being serviced.
    pub(crate) fn queue(&self, id: HandleId, kind: QueueKind, head: bool) {
        {
            let mut q = self.queues.lock();
            let member = q.members.entry(id).or_insert_with(Membership::new);
            if member.queued.is_some() || member.in_service {
                if member.queued != Some(kind) && !member.parked.contains(&kind) {
                    if head {
                        member.parked.push_front(kind);
                    } else {
                        member.parked.push_back(kind);
                    }
                }
                debug!(handle = %id, ?kind, "queue work parked");
            } else {
                q.enqueue(id, kind, head);
            }
        }
        self.wake.notify_waiters();
    }

    pub(crate) fn queue_delayed(&self, id: HandleId, reason: DelayReason) {
        {
            let mut q = self.queues.lock();
            let member = q.members.entry(id).or_insert_with(Membership::new);
            member.delay = Some((reason, Instant::now()));
        }
        debug!(handle = %id, ?reason, "request delayed");
        self.queue(id, QueueKind::Delayed, false);
    }

    /// Record the blocking mode and queue the handle for a blocking callback.
    pub(crate) fn queue_blocking(&self, id: HandleId, mode: DlmMode) {
        {
            let mut q = self.queues.lock();
            q.members.entry(id).or_insert_with(Membership::new).bast_mode = mode;
        }
        self.queue(id, QueueKind::Blocking, false);
    }

    pub(crate) fn bast_mode(&self, id: HandleId) -> DlmMode {
        self.queues
            .lock()
            .members
            .get(&id)
            .map(|m| m.bast_mode)
            .unwrap_or(DlmMode::Iv)
    }

    pub(crate) fn delay_reason(&self, id: HandleId) -> Option<DelayReason> {
        self.queues.lock().members.get(&id).and_then(|m| m.delay.map(|(reason, _)| reason))
    }

    /// Next item for a worker. Only the blocking worker serves blocking callbacks.
    pub(crate) fn pop(&self, serve_blocking: bool) -> Option<(QueueKind, HandleId)> {
        let mut q = self.queues.lock();
        if serve_blocking {
            if let Some(id) = q.pop_live(QueueKind::Blocking) {
                return Some((QueueKind::Blocking, id));
            }
        }
        if let Some(id) = q.pop_live(QueueKind::Complete) {
            return Some((QueueKind::Complete, id));
        }
        if let Some(id) = q.pop_live(QueueKind::Submit) {
            return Some((QueueKind::Submit, id));
        }
        let now = Instant::now();
        q.pop_delayed(now, self.retry_delay).map(|id| (QueueKind::Delayed, id))
    }

    /// The worker is done with the handle; parked work moves to its queue.
    pub(crate) fn finish(&self, id: HandleId) {
        let mut woke = false;
        {
            let mut q = self.queues.lock();
            let next = match q.members.get_mut(&id) {
                Some(member) => {
                    member.in_service = false;
                    if member.queued.is_none() {
                        member.parked.pop_front()
                    } else {
                        None
                    }
                }
                None => None,
            };
            match next {
                Some(kind) => {
                    q.enqueue(id, kind, false);
                    woke = true;
                }
                None => {
                    if q.members.get(&id).is_some_and(Membership::is_vacant) {
                        q.members.remove(&id);
                    }
                }
            }
        }
        if woke {
            self.wake.notify_waiters();
        }
        self.idle.notify_waiters();
    }

    /// Take a not yet issued request (submit or delayed) off the queues.
    pub(crate) fn remove(&self, id: HandleId) -> bool {
        let mut q = self.queues.lock();
        let Some(member) = q.members.get_mut(&id) else {
            return false;
        };
        let removed = match member.queued {
            Some(kind @ (QueueKind::Submit | QueueKind::Delayed)) => {
                member.queued = None;
                if kind == QueueKind::Delayed {
                    q.unlink_delayed(id);
                }
                true
            }
            _ => {
                let before = member.parked.len();
                member
                    .parked
                    .retain(|kind| !matches!(kind, QueueKind::Submit | QueueKind::Delayed));
                before != member.parked.len()
            }
        };
        if removed {
            if let Some(member) = q.members.get_mut(&id) {
                member.delay = None;
                if member.is_vacant() {
                    q.members.remove(&id);
                }
            }
        }
        removed
    }

    /// Handles waiting in the delayed queue.
    pub(crate) fn delayed_handles(&self) -> Vec<HandleId> {
        let q = self.queues.lock();
        q.members
            .iter()
            .filter(|(_, m)| m.queued == Some(QueueKind::Delayed) || m.parked.contains(&QueueKind::Delayed))
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn set_blocked(&self, blocked: bool) {
        self.queues.lock().blocked = blocked;
        if !blocked {
            self.release_blocked();
        }
    }

    /// Requests held back for recovery go to the submit queue.
    fn release_blocked(&self) {
        {
            let mut q = self.queues.lock();
            let held: Vec<HandleId> = q
                .members
                .iter()
                .filter(|(_, m)| {
                    m.queued == Some(QueueKind::Delayed) && matches!(m.delay, Some((DelayReason::LocksBlocked, _)))
                })
                .map(|(id, _)| *id)
                .collect();
            for id in held {
                if let Some(member) = q.members.get_mut(&id) {
                    member.delay = None;
                }
                q.unlink_delayed(id);
                q.enqueue(id, QueueKind::Submit, false);
            }
        }
        self.wake.notify_waiters();
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.queues.lock().blocked
    }

    /// Nothing queued, parked or in service.
    pub(crate) fn is_idle(&self) -> bool {
        self.queues.lock().members.values().all(Membership::is_vacant)
    }

    pub(crate) fn depths(&self) -> QueueDepths {
        let q = self.queues.lock();
        QueueDepths {
            submit: q.count(QueueKind::Submit),
            delayed: q.count(QueueKind::Delayed),
            blocking: q.count(QueueKind::Blocking),
            complete: q.count(QueueKind::Complete),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.queues.lock().shutdown = true;
        self.wake.notify_waiters();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.queues.lock().shutdown
    }

    /// Wake-up future for workers; enable it before looking at the queues.
    pub(crate) fn wake(&self) -> &Notify {
        &self.wake
    }

    /// Notified whenever a worker finishes an item.
    pub(crate) fn idle(&self) -> &Notify {
        &self.idle
    }
}
