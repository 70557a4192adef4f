//! The bytes-in → executable-region-out pipeline.
//!
//! Orchestrates acquire → copy → protect → flush so that the sequence is
//! atomic from the caller's perspective: the returned region is always
//! execute-only and instruction-cache-coherent, and on any partial failure
//! the committed region is released *before* the error propagates. No
//! intermediate state — read-write pages or a stale instruction cache — is
//! ever observable.

use crate::error::NativeCodeError;
use crate::memory::CodeRegion;

/// Turn a buffer of machine-code bytes into an execute-only region.
///
/// Fails fast with [`NativeCodeError::InvalidCode`] on an empty buffer,
/// before any OS resource is touched, and with
/// [`NativeCodeError::AllocationFailed`] if the commit itself fails (no
/// region exists to clean up in either case).
pub fn make_executable(code: &[u8]) -> Result<CodeRegion, NativeCodeError> {
    if code.is_empty() {
        return Err(NativeCodeError::InvalidCode);
    }
    let mut region = CodeRegion::acquire(code.len())?;
    region.copy_from_slice(code);
    seal(region)
}

/// Run the same pipeline with an existing live region as the byte source.
///
/// The copy is memory-to-memory, byte for byte, prior to the protection
/// change; the result shares no pages with `source`.
pub fn duplicate_region(source: &CodeRegion) -> Result<CodeRegion, NativeCodeError> {
    let mut region = CodeRegion::acquire(source.size())?;
    region.copy_from_slice(source.as_slice());
    seal(region)
}

/// Flip a staged read-write region to execute-only and synchronize the
/// instruction cache.
///
/// On failure the region is released before the error propagates — a region
/// left read-write would not leak, but it must never be handed out as
/// executable code.
fn seal(mut region: CodeRegion) -> Result<CodeRegion, NativeCodeError> {
    if let Err(err) = region.set_execute_only() {
        region.release();
        return Err(err);
    }
    if let Err(err) = region.flush_instruction_cache() {
        region.release();
        return Err(err);
    }
    Ok(region)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{page_size, Protection};

    #[test]
    fn test_empty_code_fails_before_allocation() {
        let err = make_executable(&[]).unwrap_err();
        assert_eq!(err, NativeCodeError::InvalidCode);
    }

    #[test]
    fn test_make_executable_seals_region() {
        let code = [0x90, 0x90, 0xc3];
        let region = make_executable(&code).expect("pipeline failed");
        assert_eq!(region.size(), code.len());
        assert_eq!(region.protection(), Protection::Execute);
        assert_eq!(region.as_slice(), &code);
    }

    #[test]
    fn test_duplicate_region_is_independent_copy() {
        let code = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
        let original = make_executable(&code).expect("pipeline failed");
        let copy = duplicate_region(&original).expect("duplicate failed");

        assert_ne!(original.base_ptr(), copy.base_ptr());
        assert_eq!(original.as_slice(), copy.as_slice());
        assert_eq!(copy.protection(), Protection::Execute);

        // Releasing one leaves the other intact.
        let mut original = original;
        assert!(original.release());
        assert_eq!(copy.as_slice(), &code);
    }

    #[cfg(unix)]
    #[test]
    fn test_seal_releases_region_on_protect_failure() {
        // Sabotage: hand seal() a region whose pages are already unmapped,
        // so the protection change fails with a genuine OS error.
        let mut donor = CodeRegion::acquire(page_size()).expect("failed to allocate");
        let base = std::ptr::NonNull::new(donor.base_ptr() as *mut u8).unwrap();
        let size = donor.size();
        assert!(donor.release());

        let sabotaged = CodeRegion::from_raw_parts(base, size);
        let err = seal(sabotaged).unwrap_err();
        assert!(matches!(err, NativeCodeError::ProtectionFailed(_)));
        // The sabotaged region was consumed and released inside seal();
        // its Drop already ran as a no-op second release.
    }
}
