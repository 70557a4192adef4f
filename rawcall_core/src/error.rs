//! Error types for the injection pipeline.

use std::fmt;
use std::io;

/// Error raised while turning raw bytes into executable native code.
///
/// Each variant maps onto one failure point of the allocate → protect →
/// flush pipeline. None of these conditions are retried internally; the one
/// local recovery behavior is that `ProtectionFailed` and `CacheFlushFailed`
/// are only surfaced after the partially-initialized region has been
/// released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCodeError {
    /// An empty code buffer was supplied to a creation call.
    ///
    /// Raised before any OS resource is touched.
    InvalidCode,
    /// The reserve+commit call failed. No region exists to clean up.
    AllocationFailed(i32),
    /// The protection-change call failed after the region was committed.
    ProtectionFailed(i32),
    /// The instruction-cache flush failed after protection succeeded.
    CacheFlushFailed(i32),
    /// The host processor is not an x86-family target this crate's fixed
    /// machine-code payloads support.
    UnsupportedArchitecture,
}

impl NativeCodeError {
    /// The raw OS error code carried by this error, if one was captured.
    #[inline]
    pub fn os_code(&self) -> Option<i32> {
        match self {
            NativeCodeError::AllocationFailed(code)
            | NativeCodeError::ProtectionFailed(code)
            | NativeCodeError::CacheFlushFailed(code) => Some(*code),
            NativeCodeError::InvalidCode | NativeCodeError::UnsupportedArchitecture => None,
        }
    }
}

impl fmt::Display for NativeCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeCodeError::InvalidCode => {
                write!(f, "native code buffer is empty")
            }
            NativeCodeError::AllocationFailed(code) => {
                write!(
                    f,
                    "failed to allocate code memory: {}",
                    io::Error::from_raw_os_error(*code)
                )
            }
            NativeCodeError::ProtectionFailed(code) => {
                write!(
                    f,
                    "failed to give executable permission to code memory: {}",
                    io::Error::from_raw_os_error(*code)
                )
            }
            NativeCodeError::CacheFlushFailed(code) => {
                write!(
                    f,
                    "failed to flush instruction cache: {}",
                    io::Error::from_raw_os_error(*code)
                )
            }
            NativeCodeError::UnsupportedArchitecture => {
                write!(f, "processor architecture is not x86 or x86_64")
            }
        }
    }
}

impl std::error::Error for NativeCodeError {}
