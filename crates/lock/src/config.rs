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

use lockdlm_config::{
    DEFAULT_LOCKDLM_DROP_LOCKS_COUNT, DEFAULT_LOCKDLM_DROP_LOCKS_PERIOD_SECS, DEFAULT_LOCKDLM_LVB_LEN,
    DEFAULT_LOCKDLM_MAX_NODES, DEFAULT_LOCKDLM_MAX_RESOURCES, DEFAULT_LOCKDLM_RETRY_DELAY_MS,
    DEFAULT_LOCKDLM_SHRINK_CACHE_COUNT, DEFAULT_LOCKDLM_SHRINK_CACHE_MAX, DEFAULT_LOCKDLM_SHRINK_CACHE_TIME_SECS,
    DEFAULT_LOCKDLM_WORKER_COUNT, ENV_LOCKDLM_DROP_LOCKS_COUNT, ENV_LOCKDLM_DROP_LOCKS_PERIOD_SECS, ENV_LOCKDLM_LVB_LEN,
    ENV_LOCKDLM_MAX_NODES, ENV_LOCKDLM_MAX_RESOURCES, ENV_LOCKDLM_RETRY_DELAY_MS, ENV_LOCKDLM_SHRINK_CACHE_COUNT,
    ENV_LOCKDLM_SHRINK_CACHE_MAX, ENV_LOCKDLM_SHRINK_CACHE_TIME_SECS, ENV_LOCKDLM_WORKER_COUNT, get_env_u64, get_env_usize,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LockDlmError, Result};

/// Lock space configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSpaceConfig {
    /// Number of dispatcher worker tasks
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Minimum wait before a delayed request is re-issued
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// Live handle count that triggers a drop-locks request
    #[serde(default = "default_drop_locks_count")]
    pub drop_locks_count: usize,

    /// Interval between drop-locks checks
    #[serde(default = "default_drop_locks_period")]
    pub drop_locks_period: Duration,

    /// Null-lock cache size after a shrink
    #[serde(default = "default_shrink_cache_count")]
    pub shrink_cache_count: usize,

    /// Null-lock cache cap
    #[serde(default = "default_shrink_cache_max")]
    pub shrink_cache_max: usize,

    /// Interval between null-lock cache shrinks
    #[serde(default = "default_shrink_cache_time")]
    pub shrink_cache_time: Duration,

    /// Capacity of the node table
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    /// Capacity of the resource table
    #[serde(default = "default_max_resources")]
    pub max_resources: usize,

    /// Lock value block length in bytes
    #[serde(default = "default_lvb_len")]
    pub lvb_len: usize,
}

impl Default for LockSpaceConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            retry_delay: default_retry_delay(),
            drop_locks_count: default_drop_locks_count(),
            drop_locks_period: default_drop_locks_period(),
            shrink_cache_count: default_shrink_cache_count(),
            shrink_cache_max: default_shrink_cache_max(),
            shrink_cache_time: default_shrink_cache_time(),
            max_nodes: default_max_nodes(),
            max_resources: default_max_resources(),
            lvb_len: default_lvb_len(),
        }
    }
}

// Default value functions
fn default_worker_count() -> usize {
    DEFAULT_LOCKDLM_WORKER_COUNT
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(DEFAULT_LOCKDLM_RETRY_DELAY_MS)
}

fn default_drop_locks_count() -> usize {
    DEFAULT_LOCKDLM_DROP_LOCKS_COUNT
}

fn default_drop_locks_period() -> Duration {
    Duration::from_secs(DEFAULT_LOCKDLM_DROP_LOCKS_PERIOD_SECS)
}

fn default_shrink_cache_count() -> usize {
    DEFAULT_LOCKDLM_SHRINK_CACHE_COUNT
}

fn default_shrink_cache_max() -> usize {
    DEFAULT_LOCKDLM_SHRINK_CACHE_MAX
}

fn default_shrink_cache_time() -> Duration {
    Duration::from_secs(DEFAULT_LOCKDLM_SHRINK_CACHE_TIME_SECS)
}

fn default_max_nodes() -> usize {
    DEFAULT_LOCKDLM_MAX_NODES
}

fn default_max_resources() -> usize {
    DEFAULT_LOCKDLM_MAX_RESOURCES
}

fn default_lvb_len() -> usize {
    DEFAULT_LOCKDLM_LVB_LEN
}

impl LockSpaceConfig {
    /// Defaults overridden by `LOCKDLM_*` environment variables
    pub fn from_env() -> Self {
        Self {
            worker_count: get_env_usize(ENV_LOCKDLM_WORKER_COUNT, DEFAULT_LOCKDLM_WORKER_COUNT),
            retry_delay: Duration::from_millis(get_env_u64(ENV_LOCKDLM_RETRY_DELAY_MS, DEFAULT_LOCKDLM_RETRY_DELAY_MS)),
            drop_locks_count: get_env_usize(ENV_LOCKDLM_DROP_LOCKS_COUNT, DEFAULT_LOCKDLM_DROP_LOCKS_COUNT),
            drop_locks_period: Duration::from_secs(get_env_u64(
                ENV_LOCKDLM_DROP_LOCKS_PERIOD_SECS,
                DEFAULT_LOCKDLM_DROP_LOCKS_PERIOD_SECS,
            )),
            shrink_cache_count: get_env_usize(ENV_LOCKDLM_SHRINK_CACHE_COUNT, DEFAULT_LOCKDLM_SHRINK_CACHE_COUNT),
            shrink_cache_max: get_env_usize(ENV_LOCKDLM_SHRINK_CACHE_MAX, DEFAULT_LOCKDLM_SHRINK_CACHE_MAX),
            shrink_cache_time: Duration::from_secs(get_env_u64(
                ENV_LOCKDLM_SHRINK_CACHE_TIME_SECS,
                DEFAULT_LOCKDLM_SHRINK_CACHE_TIME_SECS,
            )),
            max_nodes: get_env_usize(ENV_LOCKDLM_MAX_NODES, DEFAULT_LOCKDLM_MAX_NODES),
            max_resources: get_env_usize(ENV_LOCKDLM_MAX_RESOURCES, DEFAULT_LOCKDLM_MAX_RESOURCES),
            lvb_len: get_env_usize(ENV_LOCKDLM_LVB_LEN, DEFAULT_LOCKDLM_LVB_LEN),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(LockDlmError::configuration("Worker count must be greater than zero"));
        }

        if self.retry_delay.is_zero() {
            return Err(LockDlmError::configuration("Retry delay must be greater than zero"));
        }

        if self.drop_locks_period.is_zero() || self.shrink_cache_time.is_zero() {
            return Err(LockDlmError::configuration("Housekeeping periods must be greater than zero"));
        }

        if self.shrink_cache_count > self.shrink_cache_max {
            return Err(LockDlmError::configuration("Shrink target must not exceed the null-lock cache cap"));
        }

        if self.max_nodes == 0 || self.max_resources == 0 {
            return Err(LockDlmError::configuration("Table capacities must be greater than zero"));
        }

        // range-lock generations are stamped as a u64
        if self.lvb_len < 8 {
            return Err(LockDlmError::configuration("Lock value block must hold at least 8 bytes"));
        }

        Ok(())
    }
}

/// Identity of one mount, supplied by the mount-group collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountArgs {
    pub cluster_name: String,
    pub fs_name: String,
    /// Journal id assigned to this node
    pub jid: u32,
    pub nodeid: u32,
    /// This node is the first to mount the filesystem
    #[serde(default)]
    pub first_mount: bool,
}

impl MountArgs {
    pub fn new(cluster_name: impl Into<String>, fs_name: impl Into<String>, jid: u32, nodeid: u32) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            fs_name: fs_name.into(),
            jid,
            nodeid,
            first_mount: false,
        }
    }

    /// Lock space name used by the DLM: `cluster:fs`
    pub fn lockspace_name(&self) -> String {
        format!("{}:{}", self.cluster_name, self.fs_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() || self.fs_name.is_empty() {
            return Err(LockDlmError::configuration("Cluster and filesystem names must not be empty"));
        }
        Ok(())
    }
}
