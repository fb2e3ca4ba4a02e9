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

use crate::dlm::DlmStatus;
use crate::types::{HandleId, LockName};
use thiserror::Error;

/// Lock module error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockDlmError {
    /// A no-block request met an incompatible holder
    #[error("Lock request on {name} would block")]
    TryFailed { name: LockName },

    /// The request was cancelled before it was granted
    #[error("Lock request on {name} was cancelled")]
    Cancelled { name: LockName },

    /// The DLM refused or failed the request
    #[error("DLM request on {name} failed: {status}")]
    Dlm { name: LockName, status: DlmStatus },

    /// Handle id is not (or no longer) known to the lock space
    #[error("Invalid lock handle: {handle}")]
    InvalidHandle { handle: HandleId },

    /// Another request on the same handle has not completed yet
    #[error("Lock {name} already has a request in progress")]
    Busy { name: LockName },

    /// Operation does not apply to the handle's current state
    #[error("Invalid state for {name}: {reason}")]
    InvalidState { name: LockName, reason: String },

    /// Lock value block access without a held lock or attached buffer
    #[error("Lock value block of {name} is not held")]
    LvbNotHeld { name: LockName },

    /// Byte range is empty or reversed
    #[error("Invalid byte range [{start}, {end})")]
    InvalidRange { start: u64, end: u64 },

    /// Bounded table is full
    #[error("{table} table is full ({limit} entries)")]
    TableFull { table: &'static str, limit: usize },

    /// Lock space is being unmounted
    #[error("Lock space is shutting down")]
    ShuttingDown,

    /// Lock space withdrew from the cluster
    #[error("Lock space has withdrawn")]
    Withdrawn,

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LockDlmError {
    pub fn try_failed(name: LockName) -> Self {
        Self::TryFailed { name }
    }

    pub fn dlm(name: LockName, status: DlmStatus) -> Self {
        Self::Dlm { name, status }
    }

    pub fn invalid_state(name: LockName, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            name,
            reason: reason.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Transient contention: retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TryFailed { .. } | Self::Busy { .. } => true,
            Self::Dlm { status, .. } => status.is_retryable(),
            _ => false,
        }
    }

    /// The lock space can not serve any further request
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Withdrawn | Self::Configuration { .. })
    }
}

/// Lock module Result type
pub type Result<T> = std::result::Result<T, LockDlmError>;

/// Fatal assertion for states where the lock module and the DLM have diverged.
///
/// Logs the failed condition with its context and panics; it is never turned into a
/// recoverable error.
#[macro_export]
macro_rules! dlm_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            tracing::error!(assertion = stringify!($cond), $($arg)+);
            panic!("lockdlm: assertion failed: {}", stringify!($cond));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let name = LockName::new(2, 17);
        let err = LockDlmError::try_failed(name);
        assert_eq!(err.to_string(), "Lock request on 000000020000000000000011 would block");

        let err = LockDlmError::dlm(name, DlmStatus::Deadlock);
        assert!(err.to_string().contains("deadlock"));
    }

    #[test]
    fn test_error_retryable() {
        let name = LockName::new(2, 1);
        assert!(LockDlmError::try_failed(name).is_retryable());
        assert!(LockDlmError::dlm(name, DlmStatus::Deadlock).is_retryable());
        assert!(LockDlmError::dlm(name, DlmStatus::NoMemory).is_retryable());
        assert!(!LockDlmError::dlm(name, DlmStatus::Invalid).is_retryable());
        assert!(!LockDlmError::LvbNotHeld { name }.is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(LockDlmError::ShuttingDown.is_fatal());
        assert!(LockDlmError::Withdrawn.is_fatal());
        assert!(LockDlmError::configuration("bad").is_fatal());
        assert!(!LockDlmError::try_failed(LockName::new(2, 1)).is_fatal());
    }

    #[test]
    #[should_panic(expected = "assertion failed")]
    fn test_dlm_assert_panics() {
        let handle = 3;
        dlm_assert!(handle == 4, handle, "unexpected handle");
    }
}
