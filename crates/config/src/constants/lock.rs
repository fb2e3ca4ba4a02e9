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

/// Environment variable name for the number of dispatcher workers per lock space.
/// - Unit: tasks (usize).
/// - Valid values: 1 or more. Worker 0 is the only one that delivers blocking callbacks.
/// - Example: `export LOCKDLM_WORKER_COUNT=2`
pub const ENV_LOCKDLM_WORKER_COUNT: &str = "LOCKDLM_WORKER_COUNT";

/// Default number of dispatcher workers.
/// - Value: 2, one for blocking callbacks and one for completions and submissions.
pub const DEFAULT_LOCKDLM_WORKER_COUNT: usize = 2;

/// Environment variable name for the delayed-queue retry quantum in milliseconds.
/// - Unit: milliseconds (u64).
/// - Semantics: minimum time a request parked on the delayed queue waits before it is re-issued.
/// - Example: `export LOCKDLM_RETRY_DELAY_MS=100`
pub const ENV_LOCKDLM_RETRY_DELAY_MS: &str = "LOCKDLM_RETRY_DELAY_MS";

/// Default delayed-queue retry quantum in milliseconds.
pub const DEFAULT_LOCKDLM_RETRY_DELAY_MS: u64 = 100;

/// Environment variable name for the live lock count that triggers a drop-locks callback.
/// - Unit: locks (usize). 0 disables the callback.
/// - Example: `export LOCKDLM_DROP_LOCKS_COUNT=50000`
pub const ENV_LOCKDLM_DROP_LOCKS_COUNT: &str = "LOCKDLM_DROP_LOCKS_COUNT";

/// Default live lock count that triggers a drop-locks callback.
pub const DEFAULT_LOCKDLM_DROP_LOCKS_COUNT: usize = 50000;

/// Environment variable name for how often the drop-locks threshold is checked.
/// - Unit: seconds (u64).
/// - Example: `export LOCKDLM_DROP_LOCKS_PERIOD_SECS=60`
pub const ENV_LOCKDLM_DROP_LOCKS_PERIOD_SECS: &str = "LOCKDLM_DROP_LOCKS_PERIOD_SECS";

/// Default drop-locks check period in seconds.
pub const DEFAULT_LOCKDLM_DROP_LOCKS_PERIOD_SECS: u64 = 60;

/// Environment variable name for the size the null-lock cache is shrunk to by housekeeping.
/// - Unit: cached locks (usize).
/// - Example: `export LOCKDLM_SHRINK_CACHE_COUNT=100`
pub const ENV_LOCKDLM_SHRINK_CACHE_COUNT: &str = "LOCKDLM_SHRINK_CACHE_COUNT";

/// Default null-lock cache size after a shrink pass.
pub const DEFAULT_LOCKDLM_SHRINK_CACHE_COUNT: usize = 100;

/// Environment variable name for the null-lock cache cap.
/// - Unit: cached locks (usize).
/// - Semantics: a lock released while the cache holds this many entries is unlocked instead of cached.
/// - Example: `export LOCKDLM_SHRINK_CACHE_MAX=1000`
pub const ENV_LOCKDLM_SHRINK_CACHE_MAX: &str = "LOCKDLM_SHRINK_CACHE_MAX";

/// Default null-lock cache cap.
pub const DEFAULT_LOCKDLM_SHRINK_CACHE_MAX: usize = 1000;

/// Environment variable name for the null-lock cache shrink period.
/// - Unit: seconds (u64).
/// - Example: `export LOCKDLM_SHRINK_CACHE_TIME_SECS=30`
pub const ENV_LOCKDLM_SHRINK_CACHE_TIME_SECS: &str = "LOCKDLM_SHRINK_CACHE_TIME_SECS";

/// Default null-lock cache shrink period in seconds.
pub const DEFAULT_LOCKDLM_SHRINK_CACHE_TIME_SECS: u64 = 30;

/// Environment variable name for the maximum number of cluster nodes tracked for recovery.
/// - Example: `export LOCKDLM_MAX_NODES=128`
pub const ENV_LOCKDLM_MAX_NODES: &str = "LOCKDLM_MAX_NODES";

/// Default maximum number of cluster nodes.
pub const DEFAULT_LOCKDLM_MAX_NODES: usize = 128;

/// Environment variable name for the resource table bound.
/// - Semantics: range-lock requests on a new name fail once this many resources are live.
/// - Example: `export LOCKDLM_MAX_RESOURCES=65536`
pub const ENV_LOCKDLM_MAX_RESOURCES: &str = "LOCKDLM_MAX_RESOURCES";

/// Default resource table bound.
pub const DEFAULT_LOCKDLM_MAX_RESOURCES: usize = 65536;

/// Environment variable name for the lock value block length in bytes.
/// - Note: every node of a cluster must agree on this value.
/// - Example: `export LOCKDLM_LVB_LEN=32`
pub const ENV_LOCKDLM_LVB_LEN: &str = "LOCKDLM_LVB_LEN";

/// Default lock value block length in bytes.
pub const DEFAULT_LOCKDLM_LVB_LEN: usize = 32;
