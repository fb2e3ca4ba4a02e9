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

//! Multi-node scenarios: every node mounts its own lock space on one shared
//! [`LocalDlm`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::callback::{Delivery, RecordingCallback};
use crate::config::{LockSpaceConfig, MountArgs};
use crate::dlm::DlmStatus;
use crate::error::LockDlmError;
use crate::local::LocalDlm;
use crate::lockspace::LockSpace;
use crate::plock::PlockConflict;
use crate::recovery::RecoveryResult;
use crate::resource::RangeLock;
use crate::types::{DlmMode, LmState, LockFlags, LockName, LockOutcome, RecoveryEvent};

struct Node {
    ls: LockSpace,
    cb: Arc<RecordingCallback>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> LockSpaceConfig {
    LockSpaceConfig {
        retry_delay: Duration::from_millis(20),
        ..LockSpaceConfig::default()
    }
}

async fn mount_with(dlm: &LocalDlm, nodeid: u32, config: LockSpaceConfig) -> Node {
    init_tracing();
    let (dlm_node, events) = dlm.join(nodeid);
    let cb = Arc::new(RecordingCallback::default());
    let ls = LockSpace::mount(config, MountArgs::new("alpha", "fs0", nodeid - 1, nodeid), dlm_node, events, cb.clone())
        .await
        .unwrap();
    Node { ls, cb }
}

async fn mount(dlm: &LocalDlm, nodeid: u32) -> Node {
    mount_with(dlm, nodeid, test_config()).await
}

fn blockings_on(deliveries: &[Delivery], name: LockName) -> usize {
    deliveries
        .iter()
        .filter(|d| matches!(d, Delivery::Blocking(n, _) if *n == name))
        .count()
}

async fn eventually(what: &str, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_range_locks_between_local_owners() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(6, 1);

    n1.ls.plock(name, 1, 0, 100, true, true).await.unwrap();
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Ex);

    let err = n1.ls.plock(name, 2, 50, 60, false, false).await.unwrap_err();
    assert_eq!(err, LockDlmError::TryFailed { name });
    assert_eq!(
        n1.ls.plock_get(name, 2, 50, 60, false).await.unwrap(),
        Some(PlockConflict {
            owner: Some(1),
            start: 0,
            end: 100,
            exclusive: true,
        })
    );
    // an owner never conflicts with itself
    assert_eq!(n1.ls.plock_get(name, 1, 50, 60, true).await.unwrap(), None);

    let waiter = {
        let ls = n1.ls.clone();
        tokio::spawn(async move { ls.plock(name, 2, 50, 60, false, true).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    n1.ls.punlock(name, 1, 0, 100).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap().unwrap();

    let records = n1.ls.plock_records(name).await;
    assert_eq!(records.len(), 1);
    assert_eq!((records[0].owner, records[0].start, records[0].end, records[0].exclusive), (2, 50, 60, false));

    n1.ls.punlock(name, 2, 50, 60).await.unwrap();
    assert!(n1.ls.plock_records(name).await.is_empty());
    assert_eq!(n1.ls.stats().resources, 0);
    assert_eq!(n1.ls.cached_count(), 1);
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Nl);

    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_range_locks_across_nodes() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let n2 = mount(&dlm, 2).await;
    let name = LockName::new(6, 2);

    n1.ls.plock(name, 1, 0, 100, true, true).await.unwrap();
    assert_eq!(
        n2.ls.plock_get(name, 9, 0, 10, true).await.unwrap(),
        Some(PlockConflict {
            owner: None,
            start: 0,
            end: u64::MAX,
            exclusive: true,
        })
    );
    let err = n2.ls.plock(name, 9, 0, 10, true, false).await.unwrap_err();
    assert_eq!(err, LockDlmError::TryFailed { name });
    assert_eq!(n2.ls.stats().resources, 0);

    let waiter = {
        let ls = n2.ls.clone();
        tokio::spawn(async move { ls.plock(name, 9, 0, 10, true, true).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    let before = n2.ls.plock_generation(name).await.unwrap();
    n1.ls.punlock(name, 1, 0, 100).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap().unwrap();
    assert_eq!(dlm.granted_mode(2, name), DlmMode::Ex);
    // the unlock on node 1 and the lock on node 2 each stamped the update lock
    assert_eq!(n2.ls.plock_generation(name).await.unwrap(), before + 2);

    n1.ls.unmount().await.unwrap();
    n2.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_range_handoff_between_local_owners() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(6, 4);

    n1.ls.plock(name, 1, 0, 100, true, true).await.unwrap();
    let waiter = {
        let ls = n1.ls.clone();
        tokio::spawn(async move { ls.plock(name, 2, 50, 150, true, true).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    n1.ls.punlock(name, 1, 0, 100).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap().unwrap();

    assert_eq!(
        n1.ls.plock_records(name).await,
        vec![RangeLock {
            owner: 2,
            start: 50,
            end: 150,
            exclusive: true,
            count: 1,
        }]
    );
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Ex);

    n1.ls.punlock(name, 2, 50, 150).await.unwrap();
    assert!(n1.ls.plock_records(name).await.is_empty());
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crossing_range_upgrades_keep_shared_holders() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let n2 = mount(&dlm, 2).await;
    let name = LockName::new(6, 5);

    n1.ls.plock(name, 1, 0, 10, false, true).await.unwrap();
    n2.ls.plock(name, 2, 0, 10, false, true).await.unwrap();
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Pr);
    assert_eq!(dlm.granted_mode(2, name), DlmMode::Pr);

    // node 1 queues its PR to EX convert behind node 2's PR
    let upgrade = {
        let ls = n1.ls.clone();
        tokio::spawn(async move { ls.plock(name, 1, 100, 200, true, true).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!upgrade.is_finished());

    // the crossing convert on node 2 fails instead of dropping node 2 to NL
    let err = n2.ls.plock(name, 2, 300, 400, true, true).await.unwrap_err();
    assert_eq!(
        err,
        LockDlmError::Dlm {
            name,
            status: DlmStatus::Deadlock,
        }
    );
    assert_eq!(dlm.granted_mode(2, name), DlmMode::Pr);
    assert_eq!(
        n2.ls.plock_records(name).await,
        vec![RangeLock {
            owner: 2,
            start: 0,
            end: 10,
            exclusive: false,
            count: 1,
        }]
    );
    assert!(!upgrade.is_finished());

    n2.ls.punlock(name, 2, 0, 10).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), upgrade).await.unwrap().unwrap().unwrap();
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Ex);
    assert_eq!(dlm.granted_mode(2, name), DlmMode::Nl);

    let err = n2.ls.plock(name, 2, 0, 10, false, false).await.unwrap_err();
    assert_eq!(err, LockDlmError::TryFailed { name });

    // range locks never raise blocking callbacks
    assert_eq!(blockings_on(&n1.cb.deliveries(), name), 0);
    assert_eq!(blockings_on(&n2.cb.deliveries(), name), 0);

    n1.ls.unmount().await.unwrap();
    n2.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plock_get_exclusive_over_shared_holders() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let n2 = mount(&dlm, 2).await;
    let name = LockName::new(6, 6);
    let remote = PlockConflict {
        owner: None,
        start: 0,
        end: u64::MAX,
        exclusive: true,
    };

    n1.ls.plock(name, 1, 0, 10, false, true).await.unwrap();
    n2.ls.plock(name, 2, 0, 10, false, true).await.unwrap();

    assert_eq!(n1.ls.plock_get(name, 1, 0, 10, true).await.unwrap(), Some(remote));
    let err = n1.ls.plock(name, 1, 0, 10, true, false).await.unwrap_err();
    assert_eq!(err, LockDlmError::TryFailed { name });
    assert_eq!(n1.ls.plock_get(name, 1, 0, 10, false).await.unwrap(), None);
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Pr);

    n2.ls.punlock(name, 2, 0, 10).await.unwrap();
    assert_eq!(n1.ls.plock_get(name, 1, 0, 10, true).await.unwrap(), None);
    // the query left node 1's lock where it was
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Pr);
    assert_eq!(n2.ls.plock_get(name, 5, 0, 10, false).await.unwrap(), None);

    n1.ls.unmount().await.unwrap();
    n2.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_range_argument_checks() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(6, 3);

    let err = n1.ls.plock(name, 1, 10, 10, true, true).await.unwrap_err();
    assert_eq!(err, LockDlmError::InvalidRange { start: 10, end: 10 });
    assert!(n1.ls.punlock(name, 1, 20, 10).await.is_err());
    // unlocking a range never locked is a no-op
    n1.ls.punlock(name, 1, 0, 10).await.unwrap();
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_completion_reports_dlm_mode() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(2, 10);

    let id = n1.ls.get_lock(name).unwrap();
    assert_eq!(n1.ls.lock(id, LmState::Shared, LockFlags::NONE).unwrap(), LockOutcome::Async);
    let first = n1.cb.nth_completion(name, 1).await;
    assert_eq!(first.state, LmState::Shared);
    assert!(first.error.is_none());
    assert!(!first.cacheable);
    assert_eq!(n1.ls.mode(id).unwrap(), dlm.granted_mode(1, name));

    assert_eq!(n1.ls.lock(id, LmState::Exclusive, LockFlags::NONE).unwrap(), LockOutcome::Async);
    let second = n1.cb.nth_completion(name, 2).await;
    assert_eq!(second.state, LmState::Exclusive);
    assert!(second.cacheable);
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Ex);

    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_for_held_mode_is_a_no_op() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(2, 11);

    let id = n1.ls.get_lock(name).unwrap();
    n1.ls.lock_sync(id, LmState::Shared, LockFlags::NONE).await.unwrap();
    let before = dlm.stats();

    assert_eq!(n1.ls.lock(id, LmState::Shared, LockFlags::NONE).unwrap(), LockOutcome::Unchanged);
    assert_eq!(n1.ls.lock_sync(id, LmState::Shared, LockFlags::NONE).await.unwrap(), LmState::Shared);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dlm.stats(), before);
    assert!(n1.cb.completions(name).is_empty());

    // a forced promotion goes to the DLM anyway
    n1.ls.lock_sync(id, LmState::Shared, LockFlags::FORCE_PROMOTE).await.unwrap();
    assert_eq!(dlm.stats().convert_calls, before.convert_calls + 1);
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handle_misuse() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(2, 12);

    let id = n1.ls.get_lock(name).unwrap();
    n1.ls.lock_sync(id, LmState::Exclusive, LockFlags::NONE).await.unwrap();
    assert!(matches!(n1.ls.put_lock(id), Err(LockDlmError::InvalidState { .. })));

    n1.ls.unlock_sync(id).await.unwrap();
    assert_eq!(n1.ls.mode(id).unwrap(), DlmMode::Iv);
    assert_eq!(n1.ls.unlock(id).unwrap(), LockOutcome::Unchanged);
    n1.ls.put_lock(id).unwrap();
    assert_eq!(n1.ls.lock(id, LmState::Shared, LockFlags::NONE).unwrap_err(), LockDlmError::InvalidHandle { handle: id });
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadlock_is_retried_after_delay() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(2, 20);

    let id = n1.ls.get_lock(name).unwrap();
    dlm.inject_completion(name, DlmStatus::Deadlock);
    let before = dlm.stats().lock_calls;
    let started = Instant::now();

    n1.ls.lock(id, LmState::Exclusive, LockFlags::NONE).unwrap();
    let completion = n1.cb.nth_completion(name, 1).await;
    assert!(completion.error.is_none());
    assert_eq!(completion.state, LmState::Exclusive);
    assert!(started.elapsed() >= n1.ls.config().retry_delay);
    assert_eq!(dlm.stats().lock_calls, before + 2);
    assert_eq!(n1.cb.completions(name).len(), 1);
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_block_request_fails_instead_of_retrying() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(2, 21);

    let id = n1.ls.get_lock(name).unwrap();
    dlm.inject_completion(name, DlmStatus::Deadlock);
    let err = n1.ls.lock_sync(id, LmState::Exclusive, LockFlags::NOEXP).await.unwrap_err();
    assert_eq!(err, LockDlmError::TryFailed { name });
    assert_eq!(n1.ls.mode(id).unwrap(), DlmMode::Iv);
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_out_of_memory_is_retried() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(2, 22);

    let id = n1.ls.get_lock(name).unwrap();
    dlm.inject_rejection(name, DlmStatus::NoMemory);
    let before = dlm.stats().lock_calls;
    assert_eq!(
        n1.ls.lock_sync(id, LmState::Shared, LockFlags::NONE).await.unwrap(),
        LmState::Shared
    );
    assert_eq!(dlm.stats().lock_calls, before + 2);
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refused_request_reports_error() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(2, 23);

    let id = n1.ls.get_lock(name).unwrap();
    dlm.inject_rejection(name, DlmStatus::Invalid);
    n1.ls.lock(id, LmState::Shared, LockFlags::NONE).unwrap();
    let completion = n1.cb.nth_completion(name, 1).await;
    assert_eq!(
        completion.error,
        Some(LockDlmError::Dlm {
            name,
            status: DlmStatus::Invalid,
        })
    );
    assert_eq!(completion.state, LmState::Unlocked);
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_callback_and_handoff() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let n2 = mount(&dlm, 2).await;
    let name = LockName::new(2, 30);

    let a = n1.ls.get_lock(name).unwrap();
    n1.ls.lock_sync(a, LmState::Exclusive, LockFlags::NONE).await.unwrap();

    let b = n2.ls.get_lock(name).unwrap();
    n2.ls.lock(b, LmState::Shared, LockFlags::NONE).unwrap();
    n1.cb.wait_until(|d| blockings_on(d, name) > 0).await;
    assert_eq!(n1.cb.blockings(name), vec![LmState::Shared]);
    assert!(n2.cb.completions(name).is_empty());

    // the holder reacts to the callback by demoting
    n1.ls.lock_sync(a, LmState::Shared, LockFlags::NONE).await.unwrap();
    let granted = n2.cb.nth_completion(name, 1).await;
    assert_eq!(granted.state, LmState::Shared);

    n1.ls.unmount().await.unwrap();
    n2.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_try_requests() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let n2 = mount(&dlm, 2).await;
    let name = LockName::new(2, 31);

    let a = n1.ls.get_lock(name).unwrap();
    n1.ls.lock_sync(a, LmState::Exclusive, LockFlags::NONE).await.unwrap();

    let b = n2.ls.get_lock(name).unwrap();
    n2.ls.lock(b, LmState::Shared, LockFlags::TRY).unwrap();
    let failed = n2.cb.nth_completion(name, 1).await;
    assert_eq!(failed.error, Some(LockDlmError::TryFailed { name }));
    assert_eq!(failed.state, LmState::Unlocked);
    assert!(n1.cb.blockings(name).is_empty());

    // TRY_1CB still tells the holder once
    n2.ls.lock(b, LmState::Shared, LockFlags::TRY_1CB).unwrap();
    let failed = n2.cb.nth_completion(name, 2).await;
    assert_eq!(failed.error, Some(LockDlmError::TryFailed { name }));
    n1.cb.wait_until(|d| blockings_on(d, name) == 1).await;

    n1.ls.unmount().await.unwrap();
    n2.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_alternate_mode_grant() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let n2 = mount(&dlm, 2).await;
    let name = LockName::new(2, 32);

    let a = n2.ls.get_lock(name).unwrap();
    n2.ls.lock_sync(a, LmState::Deferred, LockFlags::NONE).await.unwrap();

    let b = n1.ls.get_lock(name).unwrap();
    let state = n1.ls.lock_sync(b, LmState::Shared, LockFlags::ANY).await.unwrap();
    assert_eq!(state, LmState::Deferred);
    assert_eq!(n1.ls.mode(b).unwrap(), DlmMode::Cw);
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Cw);

    n1.ls.unmount().await.unwrap();
    n2.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_conversion_deadlock_demotes_one_side() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let n2 = mount(&dlm, 2).await;
    let name = LockName::new(2, 33);

    let a = n1.ls.get_lock(name).unwrap();
    let b = n2.ls.get_lock(name).unwrap();
    n1.ls.lock_sync(a, LmState::Shared, LockFlags::NONE).await.unwrap();
    n2.ls.lock_sync(b, LmState::Shared, LockFlags::NONE).await.unwrap();

    n1.ls.lock(a, LmState::Exclusive, LockFlags::NONE).unwrap();
    eventually("node 1 convert queued", || dlm.stats().convert_calls >= 1).await;
    n2.ls.lock(b, LmState::Exclusive, LockFlags::NONE).unwrap();

    let first = n1.cb.nth_completion(name, 1).await;
    assert_eq!(first.state, LmState::Exclusive);
    assert!(first.cacheable);

    n1.ls.unlock(a).unwrap();
    let second = n2.cb.nth_completion(name, 1).await;
    assert_eq!(second.state, LmState::Exclusive);
    // node 2 went through NL to break the deadlock
    assert!(!second.cacheable);

    n1.ls.unmount().await.unwrap();
    n2.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_queued_request() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let n2 = mount(&dlm, 2).await;
    let name = LockName::new(2, 40);

    let a = n2.ls.get_lock(name).unwrap();
    n2.ls.lock_sync(a, LmState::Exclusive, LockFlags::NONE).await.unwrap();

    let b = n1.ls.get_lock(name).unwrap();
    n1.ls.lock(b, LmState::Exclusive, LockFlags::NONE).unwrap();
    eventually("request queued in the DLM", || dlm.lock_count(name) == 2).await;
    n1.ls.cancel(b).unwrap();

    let completion = n1.cb.nth_completion(name, 1).await;
    assert!(completion.cancelled);
    assert_eq!(completion.state, LmState::Unlocked);
    assert_eq!(dlm.lock_count(name), 1);
    assert_eq!(n1.ls.mode(b).unwrap(), DlmMode::Iv);

    // cancelling an idle handle is harmless
    n1.ls.cancel(b).unwrap();
    n1.ls.put_lock(b).unwrap();

    n1.ls.unmount().await.unwrap();
    n2.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_delayed_request() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(2, 41);

    n1.ls.block_locks();
    let id = n1.ls.get_lock(name).unwrap();
    n1.ls.lock(id, LmState::Exclusive, LockFlags::NONE).unwrap();
    eventually("request delayed", || n1.ls.stats().queues.delayed == 1).await;

    let before = dlm.stats().lock_calls;
    n1.ls.cancel(id).unwrap();
    let completion = n1.cb.nth_completion(name, 1).await;
    assert!(completion.cancelled);
    assert_eq!(dlm.stats().lock_calls, before);

    n1.ls.unblock_locks();
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recovery_blocks_and_releases_requests() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let name = LockName::new(2, 50);
    let noexp = LockName::new(2, 51);

    n1.ls.add_node(2, 1).unwrap();
    n1.ls.node_failed(2).unwrap();
    n1.ls.node_failed(2).unwrap();
    assert!(n1.ls.mount_flags().block_locks);
    assert!(n1.ls.mount_flags().recover);
    // asked once per failure
    assert_eq!(n1.cb.recovery_events(), vec![(1, RecoveryEvent::NeedRecovery)]);

    let id = n1.ls.get_lock(name).unwrap();
    n1.ls.lock(id, LmState::Exclusive, LockFlags::NONE).unwrap();
    let other = n1.ls.get_lock(noexp).unwrap();
    n1.ls.lock(other, LmState::Exclusive, LockFlags::NOEXP).unwrap();

    let granted = n1.cb.nth_completion(noexp, 1).await;
    assert_eq!(granted.state, LmState::Exclusive);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(n1.cb.completions(name).is_empty());
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Iv);

    n1.ls.recovery_done(1, RecoveryResult::Success).unwrap();
    let granted = n1.cb.nth_completion(name, 1).await;
    assert_eq!(granted.state, LmState::Exclusive);
    assert!(!n1.ls.mount_flags().block_locks);
    assert!(n1.ls.node(2).is_none());
    assert_eq!(n1.cb.recovery_events().last(), Some(&(1, RecoveryEvent::RecoveryDone)));
    assert!(n1.ls.recovery_done(1, RecoveryResult::Success).is_err());

    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_grant_during_recovery_is_parked_at_null() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let n2 = mount(&dlm, 2).await;
    let name = LockName::new(2, 52);

    let a = n2.ls.get_lock(name).unwrap();
    n2.ls.lock_sync(a, LmState::Exclusive, LockFlags::NONE).await.unwrap();

    let b = n1.ls.get_lock(name).unwrap();
    n1.ls.lock(b, LmState::Exclusive, LockFlags::NONE).unwrap();
    eventually("request queued in the DLM", || dlm.lock_count(name) == 2).await;

    n1.ls.block_locks();
    n2.ls.unlock_sync(a).await.unwrap();
    eventually("grant parked at NL", || {
        dlm.granted_mode(1, name) == DlmMode::Nl && n1.ls.stats().queues.delayed == 1
    })
    .await;
    assert!(n1.cb.completions(name).is_empty());

    n1.ls.unblock_locks();
    let granted = n1.cb.nth_completion(name, 1).await;
    assert_eq!(granted.state, LmState::Exclusive);
    assert!(!granted.cacheable);
    assert_eq!(dlm.granted_mode(1, name), DlmMode::Ex);

    n1.ls.unmount().await.unwrap();
    n2.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_locks_request() {
    let dlm = LocalDlm::default();
    let config = LockSpaceConfig {
        drop_locks_count: 3,
        drop_locks_period: Duration::from_millis(10),
        ..test_config()
    };
    let n1 = mount_with(&dlm, 1, config).await;

    for n in 0..3 {
        n1.ls.get_lock(LockName::new(2, 60 + n)).unwrap();
    }
    n1.cb
        .wait_until(|d| d.contains(&Delivery::Recovery(0, RecoveryEvent::DropLocks)))
        .await;
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_table_limits() {
    let dlm = LocalDlm::default();
    let config = LockSpaceConfig {
        max_resources: 3,
        max_nodes: 1,
        ..test_config()
    };
    let n1 = mount_with(&dlm, 1, config).await;

    // the journal lock already uses one handle
    n1.ls.get_lock(LockName::new(2, 1)).unwrap();
    n1.ls.get_lock(LockName::new(2, 2)).unwrap();
    assert!(matches!(n1.ls.get_lock(LockName::new(2, 3)), Err(LockDlmError::TableFull { .. })));
    assert!(matches!(n1.ls.add_node(2, 1), Err(LockDlmError::TableFull { .. })));
    n1.ls.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unmount_releases_everything() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let held = LockName::new(2, 70);
    let cached = LockName::new(2, 71);
    let range = LockName::new(6, 72);

    let a = n1.ls.get_lock(held).unwrap();
    n1.ls.attach_lvb(a).unwrap();
    n1.ls.lock_sync(a, LmState::Exclusive, LockFlags::NONE).await.unwrap();
    let b = n1.ls.get_lock(cached).unwrap();
    n1.ls.lock_sync(b, LmState::Shared, LockFlags::NONE).await.unwrap();
    n1.ls.release_to_cache(b).await.unwrap();
    n1.ls.plock(range, 1, 0, 10, true, true).await.unwrap();

    n1.ls.unmount().await.unwrap();
    for name in [held, cached, range, range.plock_update()] {
        assert_eq!(dlm.lock_count(name), 0, "{name} still locked");
    }
    let stats = n1.ls.stats();
    assert_eq!(stats.handles, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.cached, 0);
    assert!(!n1.ls.mount_flags().mount);

    assert_eq!(n1.ls.get_lock(held).unwrap_err(), LockDlmError::ShuttingDown);
    assert_eq!(n1.ls.unmount().await.unwrap_err(), LockDlmError::ShuttingDown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_withdraw_and_peer_recovery() {
    let dlm = LocalDlm::default();
    let n1 = mount(&dlm, 1).await;
    let n2 = mount(&dlm, 2).await;
    let name = LockName::new(2, 80);

    let a = n1.ls.get_lock(name).unwrap();
    n1.ls.lock_sync(a, LmState::Exclusive, LockFlags::NONE).await.unwrap();

    // node 2 learns node 1 is withdrawing and waits for its journal lock
    n2.ls.add_node(1, 0).unwrap();
    n2.ls.node_withdrawing(1).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(n2.cb.recovery_events().is_empty());

    n1.ls.withdraw().await.unwrap();
    assert_eq!(n1.cb.recovery_events(), vec![(0, RecoveryEvent::Withdraw)]);
    assert_eq!(dlm.lock_count(name), 0);
    assert_eq!(n1.ls.get_lock(name).unwrap_err(), LockDlmError::Withdrawn);

    n2.cb
        .wait_until(|d| d.contains(&Delivery::Recovery(0, RecoveryEvent::NeedRecovery)))
        .await;
    assert!(n2.ls.mount_flags().block_locks);
    n2.ls.recovery_done(0, RecoveryResult::Success).unwrap();
    assert!(!n2.ls.mount_flags().block_locks);

    n1.ls.unmount().await.unwrap();
    n2.ls.unmount().await.unwrap();
}
