use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::dtype::DType;

/// Errors surfaced by the launch pipeline and its collaborators.
///
/// Shape mismatches and recoverable timing shortfalls are not errors; they are recorded as
/// warnings on the [`LaunchOutcome`](crate::runtime::LaunchOutcome).
#[derive(Debug, Clone, Error)]
pub enum LaunchError {
    #[error("contract violation: {0}")]
    ContractViolation(String),
    #[error("unsupported data type {dtype} ({context})")]
    UnsupportedDType { dtype: DType, context: String },
    #[error("failed to acquire device: {0}")]
    DeviceAcquisition(String),
    #[error("device {op} failed: {message}")]
    Device { op: &'static str, message: String },
    #[error("failed to capture device run time: {0}")]
    TimingShortfall(String),
    #[error("data provider: {0}")]
    DataProvider(String),
    #[error(
        "data mismatch in tensor {tensor} at index {index}: first run {first}, second run {second}"
    )]
    DataMismatch {
        tensor: String,
        index: usize,
        first: String,
        second: String,
    },
    #[error("{0} mutex poisoned")]
    Poisoned(String),
}

impl LaunchError {
    pub fn contract(message: impl Into<String>) -> Self {
        LaunchError::ContractViolation(message.into())
    }

    pub fn device(op: &'static str, message: impl Into<String>) -> Self {
        LaunchError::Device {
            op,
            message: message.into(),
        }
    }

    pub fn unsupported(dtype: DType, context: impl Into<String>) -> Self {
        LaunchError::UnsupportedDType {
            dtype,
            context: context.into(),
        }
    }

    pub fn data(message: impl Into<String>) -> Self {
        LaunchError::DataProvider(message.into())
    }

    /// Returns `true` for errors that must abort the calling test without retry.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            LaunchError::ContractViolation(_) | LaunchError::UnsupportedDType { .. }
        )
    }
}

/// Convenience alias for results returned by launch routines.
pub type LaunchResult<T> = Result<T, LaunchError>;

/// Locks `mutex`, mapping poisoning to [`LaunchError::Poisoned`].
pub fn lock_named<'a, T>(mutex: &'a Mutex<T>, name: &str) -> LaunchResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| LaunchError::Poisoned(name.to_string()))
}
