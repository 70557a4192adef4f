//! OS-backed executable memory regions.
//!
//! A [`CodeRegion`] owns exactly one committed virtual-memory allocation and
//! guarantees it is freed exactly once. Regions move through a fixed
//! lifecycle:
//!
//! ```text
//! acquire (read-write, zeroed) -> set_execute_only -> release
//! ```
//!
//! The read-write → execute transition is the only protection change this
//! system performs; there is no way back to writable. Release is idempotent
//! and also runs from `Drop`, so a region can never leak or double-free.
//!
//! # Safety
//!
//! All OS interaction is encapsulated behind safe methods. The unsafety of
//! actually *executing* a region's contents lives in
//! [`crate::handle::NativeMethodHandle`].

use std::io;
use std::ptr::NonNull;

use crate::error::NativeCodeError;

// =============================================================================
// Platform-specific imports
// =============================================================================

#[cfg(unix)]
mod platform {
    use std::ptr;
    use std::sync::atomic::{compiler_fence, Ordering};

    /// Reserve and commit `size` bytes with read-write permission.
    ///
    /// Returns null on failure. The kernel zero-fills anonymous mappings.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Make the range execute-only.
    pub unsafe fn protect_exec(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_EXEC) == 0 }
    }

    /// Synchronize the instruction-fetch path with freshly written bytes.
    ///
    /// x86 instruction fetch is coherent with data stores once `mprotect`
    /// has synchronized the TLB, and libc exposes no flush primitive here,
    /// so this only prevents the compiler from reordering the code copy
    /// past the first call.
    pub unsafe fn flush_icache(_ptr: *const u8, _size: usize) -> bool {
        compiler_fence(Ordering::SeqCst);
        true
    }

    /// Free the mapping.
    pub unsafe fn free(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::munmap(ptr as *mut _, size) == 0 }
    }

    /// OS page size in bytes.
    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
}

#[cfg(windows)]
mod platform {
    use std::mem;
    use std::ptr;

    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE, PAGE_READWRITE,
    };
    use windows_sys::Win32::System::SystemInformation::GetSystemInfo;
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    /// Reserve and commit `size` bytes with read-write permission.
    ///
    /// Returns null on failure. `VirtualAlloc` zero-initializes committed
    /// pages.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    /// Make the range execute-only.
    pub unsafe fn protect_exec(ptr: *mut u8, size: usize) -> bool {
        let mut old_protect = 0;
        unsafe { VirtualProtect(ptr as *const _, size, PAGE_EXECUTE, &mut old_protect) != 0 }
    }

    /// Flush the instruction cache for the range.
    ///
    /// `GetCurrentProcess` returns a pseudo handle that must not be closed.
    pub unsafe fn flush_icache(ptr: *const u8, size: usize) -> bool {
        unsafe { FlushInstructionCache(GetCurrentProcess(), ptr as *const _, size) != 0 }
    }

    /// Release the reservation. Size must be zero for `MEM_RELEASE`.
    pub unsafe fn free(ptr: *mut u8, _size: usize) -> bool {
        unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) != 0 }
    }

    /// OS page size in bytes.
    pub fn page_size() -> usize {
        let mut info = unsafe { mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }
}

/// OS page size in bytes, for callers sizing payload buffers.
pub fn page_size() -> usize {
    platform::page_size()
}

/// The raw OS error code of the most recent failed call.
fn last_os_code() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// =============================================================================
// Protection
// =============================================================================

/// OS-enforced access mode of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Pages are readable and writable; code is staged in this mode.
    ReadWrite,
    /// Pages are executable; the terminal mode for injected code.
    Execute,
}

// =============================================================================
// CodeRegion
// =============================================================================

/// An exclusively-owned region of committed virtual memory.
///
/// A region is created read-write via [`CodeRegion::acquire`], transitioned
/// to executable exactly once, and physically freed exactly once — either by
/// an explicit [`CodeRegion::release`] or by `Drop`, whichever comes first.
///
/// Regions are move-only: there is no `Clone`. Duplicating code requires a
/// brand-new region (see [`crate::pipeline::duplicate_region`]); two live
/// regions never alias the same pages.
pub struct CodeRegion {
    /// Base address of the allocation.
    base: NonNull<u8>,
    /// Size in bytes, fixed at acquisition.
    size: usize,
    /// Current protection mode.
    protection: Protection,
    /// Whether the backing allocation has been returned to the OS.
    released: bool,
}

// Safety: the region is an exclusively-owned allocation; shared references
// only permit reads of memory this region owns for its entire lifetime.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    /// Reserve and commit `size` bytes of read-write memory.
    ///
    /// The new memory is zero-initialized by the underlying allocation
    /// primitive. Zero-length requests are passed through unchanged and
    /// surface the OS's own rejection as [`NativeCodeError::AllocationFailed`].
    pub fn acquire(size: usize) -> Result<CodeRegion, NativeCodeError> {
        let ptr = unsafe { platform::alloc_rw(size) };
        match NonNull::new(ptr) {
            Some(base) => Ok(CodeRegion {
                base,
                size,
                protection: Protection::ReadWrite,
                released: false,
            }),
            None => Err(NativeCodeError::AllocationFailed(last_os_code())),
        }
    }

    /// Base address of the region.
    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Size in bytes, fixed at acquisition.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current protection mode.
    #[inline]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Whether the backing allocation has been returned to the OS.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// View the region's bytes.
    ///
    /// Valid in both protection modes: on x86-family hardware executable
    /// pages remain readable.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        debug_assert!(!self.released, "read from released region");
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.size) }
    }

    /// Copy `bytes` verbatim to the start of the region.
    ///
    /// # Panics
    /// Panics if the region is no longer writable or `bytes` does not fit.
    pub(crate) fn copy_from_slice(&mut self, bytes: &[u8]) {
        assert!(
            self.protection == Protection::ReadWrite && !self.released,
            "write to non-writable region"
        );
        assert!(bytes.len() <= self.size, "code larger than region");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr(), bytes.len());
        }
    }

    /// Transition the region's protection from read-write to execute.
    ///
    /// On failure the region stays read-write; per the pipeline's rollback
    /// policy the caller must release it before propagating the error.
    pub fn set_execute_only(&mut self) -> Result<(), NativeCodeError> {
        debug_assert_eq!(self.protection, Protection::ReadWrite);
        if unsafe { platform::protect_exec(self.base.as_ptr(), self.size) } {
            self.protection = Protection::Execute;
            Ok(())
        } else {
            Err(NativeCodeError::ProtectionFailed(last_os_code()))
        }
    }

    /// Invalidate stale instruction-fetch state for the range so the CPU
    /// observes the freshly written bytes as code.
    pub fn flush_instruction_cache(&self) -> Result<(), NativeCodeError> {
        if unsafe { platform::flush_icache(self.base.as_ptr(), self.size) } {
            Ok(())
        } else {
            Err(NativeCodeError::CacheFlushFailed(last_os_code()))
        }
    }

    /// Free the backing OS allocation.
    ///
    /// Returns whether freeing succeeded. Idempotent: the first call frees,
    /// every later call is a no-op reporting success without touching the OS.
    pub fn release(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;
        unsafe { platform::free(self.base.as_ptr(), self.size) }
    }

    /// Rebuild a region from raw parts, for fault-injection tests.
    #[cfg(test)]
    pub(crate) fn from_raw_parts(base: NonNull<u8>, size: usize) -> CodeRegion {
        CodeRegion {
            base,
            size,
            protection: Protection::ReadWrite,
            released: false,
        }
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRegion")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("protection", &self.protection)
            .field("released", &self.released)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_starts_read_write() {
        let region = CodeRegion::acquire(64).expect("failed to allocate");
        assert_eq!(region.size(), 64);
        assert_eq!(region.protection(), Protection::ReadWrite);
        assert!(!region.is_released());
        assert!(!region.base_ptr().is_null());
    }

    #[test]
    fn test_acquire_zero_initialized() {
        let region = CodeRegion::acquire(128).expect("failed to allocate");
        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_acquire_zero_length_rejected_by_os() {
        let err = CodeRegion::acquire(0).unwrap_err();
        assert!(matches!(err, NativeCodeError::AllocationFailed(_)));
    }

    #[test]
    fn test_acquire_absurd_size_fails_with_os_code() {
        let err = CodeRegion::acquire(usize::MAX / 2).unwrap_err();
        match err {
            NativeCodeError::AllocationFailed(code) => assert_ne!(code, 0),
            other => panic!("expected AllocationFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_copy_then_read_back() {
        let mut region = CodeRegion::acquire(16).expect("failed to allocate");
        region.copy_from_slice(&[0x90, 0x90, 0xc3]);
        assert_eq!(&region.as_slice()[..3], &[0x90, 0x90, 0xc3]);
        // Remainder stays zeroed.
        assert!(region.as_slice()[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_protection_transition() {
        let mut region = CodeRegion::acquire(page_size()).expect("failed to allocate");
        region.copy_from_slice(&[0xc3]);
        region.set_execute_only().expect("mprotect failed");
        assert_eq!(region.protection(), Protection::Execute);
        region.flush_instruction_cache().expect("flush failed");
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut region = CodeRegion::acquire(32).expect("failed to allocate");
        assert!(region.release());
        assert!(region.is_released());
        // Second call must report success without another OS free.
        assert!(region.release());
        assert!(region.is_released());
    }

    #[test]
    fn test_drop_after_release_is_noop() {
        let mut region = CodeRegion::acquire(32).expect("failed to allocate");
        assert!(region.release());
        drop(region);
    }

    #[cfg(unix)]
    #[test]
    fn test_protect_failure_on_unmapped_region() {
        // Fabricate a region over an address range we know is unmapped:
        // acquire real memory, release it, then rebuild the tracking struct.
        let mut donor = CodeRegion::acquire(page_size()).expect("failed to allocate");
        let base = std::ptr::NonNull::new(donor.base_ptr() as *mut u8).unwrap();
        let size = donor.size();
        assert!(donor.release());

        let mut region = CodeRegion::from_raw_parts(base, size);
        let err = region.set_execute_only().unwrap_err();
        match err {
            NativeCodeError::ProtectionFailed(code) => assert_ne!(code, 0),
            other => panic!("expected ProtectionFailed, got {:?}", other),
        }
        // Protection did not advance; cleanup still works (munmap of an
        // unmapped page-aligned range succeeds).
        assert_eq!(region.protection(), Protection::ReadWrite);
        assert!(region.release());
        assert!(region.release());
    }

    #[test]
    fn test_page_size_sane() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }
}
