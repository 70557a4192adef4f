//! Injected `cpuid` execution.
//!
//! The probe never calls compiler intrinsics: it pushes small fixed
//! machine-code routines through the `rawcall_core` pipeline and invokes
//! them like any other injected method, exercising the same allocate →
//! protect → flush path its callers use.
//!
//! Payloads are selected at compile time by target architecture and calling
//! convention. The Microsoft x64 and 32-bit routines match the hardware ABI
//! the instruction has always been probed with; the System V variants differ
//! only in which registers carry the arguments.
//!
//! # Caching
//!
//! The `cpuid` routine is injected once per process, on first use, behind a
//! `OnceLock`. The first successful initialization wins for the lifetime of
//! the process and is never invalidated; losers of the init race release
//! their redundant region immediately. The cached handle is shared
//! invocation-only — nothing ever disposes it.

use std::fmt;
use std::sync::OnceLock;

use rawcall_core::{NativeCodeError, NativeMethodHandle};

// =============================================================================
// CpuInfo
// =============================================================================

/// Register quad produced by one `cpuid` invocation.
///
/// Field order matches the store order of the injected routine, which
/// writes eax, ebx, ecx, edx at consecutive 4-byte offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuInfo {
    /// Output value of eax.
    pub eax: u32,
    /// Output value of ebx.
    pub ebx: u32,
    /// Output value of ecx.
    pub ecx: u32,
    /// Output value of edx.
    pub edx: u32,
}

impl fmt::Display for CpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(eax, ebx, ecx, edx) = (0x{:08X}, 0x{:08X}, 0x{:08X}, 0x{:08X})",
            self.eax, self.ebx, self.ecx, self.edx
        )
    }
}

// =============================================================================
// Signatures
// =============================================================================

/// Signature of the injected cpuid routine: out-pointer, leaf (eax),
/// subleaf (ecx).
#[cfg(not(all(target_arch = "x86", windows)))]
pub type CpuIdFn = unsafe extern "C" fn(*mut CpuInfo, u32, u32);

/// On 32-bit windows the routine is stdcall (callee cleans the stack).
#[cfg(all(target_arch = "x86", windows))]
pub type CpuIdFn = unsafe extern "stdcall" fn(*mut CpuInfo, u32, u32);

/// Signature of the EFLAGS.ID probe routine; nonzero means `cpuid` exists.
#[cfg(not(all(target_arch = "x86", windows)))]
pub type IsCpuIdSupportedFn = unsafe extern "C" fn() -> usize;

/// On 32-bit windows the routine is stdcall (callee cleans the stack).
#[cfg(all(target_arch = "x86", windows))]
pub type IsCpuIdSupportedFn = unsafe extern "stdcall" fn() -> usize;

// =============================================================================
// Payloads
// =============================================================================

/// cpuid routine, x86_64 System V: info in rdi, leaf in esi, subleaf in edx.
#[cfg(all(target_arch = "x86_64", not(windows)))]
const CPUID_CODE: &[u8] = &[
    0x53, // push   rbx
    0x49, 0x89, 0xf9, // mov    r9, rdi
    0x89, 0xf0, // mov    eax, esi
    0x89, 0xd1, // mov    ecx, edx
    0x0f, 0xa2, // cpuid
    0x41, 0x89, 0x01, // mov    dword ptr [r9], eax
    0x41, 0x89, 0x59, 0x04, // mov    dword ptr [r9 + 04h], ebx
    0x41, 0x89, 0x49, 0x08, // mov    dword ptr [r9 + 08h], ecx
    0x41, 0x89, 0x51, 0x0c, // mov    dword ptr [r9 + 0ch], edx
    0x5b, // pop    rbx
    0xc3, // ret
];

/// cpuid routine, Microsoft x64: info in rcx, leaf in edx, subleaf in r8d.
#[cfg(all(target_arch = "x86_64", windows))]
const CPUID_CODE: &[u8] = &[
    0x53, // push   rbx
    0x49, 0x89, 0xc9, // mov    r9, rcx
    0x89, 0xd0, // mov    eax, edx
    0x44, 0x89, 0xc1, // mov    ecx, r8d
    0x0f, 0xa2, // cpuid
    0x41, 0x89, 0x01, // mov    dword ptr [r9], eax
    0x41, 0x89, 0x59, 0x04, // mov    dword ptr [r9 + 04h], ebx
    0x41, 0x89, 0x49, 0x08, // mov    dword ptr [r9 + 08h], ecx
    0x41, 0x89, 0x51, 0x0c, // mov    dword ptr [r9 + 0ch], edx
    0x5b, // pop    rbx
    0xc3, // ret
];

/// cpuid routine, 32-bit x86: all three arguments on the stack.
///
/// cdecl and stdcall read identically; only the return differs.
#[cfg(all(target_arch = "x86", not(windows)))]
const CPUID_CODE: &[u8] = &[
    0x56, // push   esi
    0x53, // push   ebx
    0x8b, 0x74, 0x24, 0x0c, // mov    esi, dword ptr [esp + 0ch]
    0x8b, 0x44, 0x24, 0x10, // mov    eax, dword ptr [esp + 10h]
    0x8b, 0x4c, 0x24, 0x14, // mov    ecx, dword ptr [esp + 14h]
    0x0f, 0xa2, // cpuid
    0x89, 0x06, // mov    dword ptr [esi], eax
    0x89, 0x5e, 0x04, // mov    dword ptr [esi + 04h], ebx
    0x89, 0x4e, 0x08, // mov    dword ptr [esi + 08h], ecx
    0x89, 0x56, 0x0c, // mov    dword ptr [esi + 0ch], edx
    0x5b, // pop    ebx
    0x5e, // pop    esi
    0xc3, // ret
];

#[cfg(all(target_arch = "x86", windows))]
const CPUID_CODE: &[u8] = &[
    0x56, // push   esi
    0x53, // push   ebx
    0x8b, 0x74, 0x24, 0x0c, // mov    esi, dword ptr [esp + 0ch]
    0x8b, 0x44, 0x24, 0x10, // mov    eax, dword ptr [esp + 10h]
    0x8b, 0x4c, 0x24, 0x14, // mov    ecx, dword ptr [esp + 14h]
    0x0f, 0xa2, // cpuid
    0x89, 0x06, // mov    dword ptr [esi], eax
    0x89, 0x5e, 0x04, // mov    dword ptr [esi + 04h], ebx
    0x89, 0x4e, 0x08, // mov    dword ptr [esi + 08h], ecx
    0x89, 0x56, 0x0c, // mov    dword ptr [esi + 0ch], edx
    0x5b, // pop    ebx
    0x5e, // pop    esi
    0xc2, 0x0c, 0x00, // ret    0ch
];

/// EFLAGS.ID toggle probe, 64-bit: flips bit 21 and reports whether the
/// change sticks. Uses only caller-saved registers under both 64-bit ABIs.
#[cfg(target_arch = "x86_64")]
const IS_CPUID_SUPPORTED_CODE: &[u8] = &[
    0x9c, // pushfq
    0x9c, // pushfq
    0x58, // pop    rax
    0x48, 0x89, 0xc1, // mov    rcx, rax
    0x48, 0x35, 0x00, 0x00, 0x20, 0x00, // xor    rax, 200000h
    0x50, // push   rax
    0x9d, // popfq
    0x9c, // pushfq
    0x58, // pop    rax
    0x48, 0x31, 0xc8, // xor    rax, rcx
    0x48, 0xc1, 0xe8, 0x15, // shr    rax, 21
    0x9d, // popfq
    0xc3, // ret
];

/// EFLAGS.ID toggle probe, 32-bit: no arguments, so cdecl and stdcall agree.
#[cfg(target_arch = "x86")]
const IS_CPUID_SUPPORTED_CODE: &[u8] = &[
    0x9c, // pushf
    0x9c, // pushf
    0x58, // pop    eax
    0x89, 0xc1, // mov    ecx, eax
    0x35, 0x00, 0x00, 0x20, 0x00, // xor    eax, 200000h
    0x50, // push   eax
    0x9d, // popf
    0x9c, // pushf
    0x58, // pop    eax
    0x31, 0xc8, // xor    eax, ecx
    0xc1, 0xe8, 0x15, // shr    eax, 21
    0x9d, // popf
    0xc3, // ret
];

// =============================================================================
// Architecture gate
// =============================================================================

/// Whether the host processor family is one the fixed payloads target.
///
/// Windows asks the OS, which matters under emulation layers; elsewhere the
/// compile target is the truth.
pub fn is_supported_architecture() -> bool {
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::SystemInformation::{
            GetSystemInfo, PROCESSOR_ARCHITECTURE_AMD64, PROCESSOR_ARCHITECTURE_INTEL,
            SYSTEM_INFO,
        };

        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        let arch = unsafe { info.Anonymous.Anonymous.wProcessorArchitecture };
        arch == PROCESSOR_ARCHITECTURE_AMD64 || arch == PROCESSOR_ARCHITECTURE_INTEL
    }
    #[cfg(not(windows))]
    {
        cfg!(any(target_arch = "x86", target_arch = "x86_64"))
    }
}

// =============================================================================
// cpuid
// =============================================================================

static CPUID_HANDLE: OnceLock<NativeMethodHandle<CpuIdFn>> = OnceLock::new();

/// Execute `cpuid` with the given leaf (eax) and subleaf (ecx).
///
/// The injected routine is built once per process and cached; see the
/// module docs for the cache's lifetime rules.
pub fn cpuid(leaf: u32, subleaf: u32) -> Result<CpuInfo, NativeCodeError> {
    let handle = cached_cpuid_handle()?;
    let mut info = CpuInfo::default();
    unsafe { (handle.method())(&mut info, leaf, subleaf) };
    Ok(info)
}

fn cached_cpuid_handle() -> Result<&'static NativeMethodHandle<CpuIdFn>, NativeCodeError> {
    if let Some(handle) = CPUID_HANDLE.get() {
        return Ok(handle);
    }
    let handle = create_cpuid_handle()?;
    // If another thread initialized meanwhile, this handle is dropped and
    // its region released; first successful initialization wins.
    Ok(CPUID_HANDLE.get_or_init(|| handle))
}

/// Inject a fresh `cpuid` routine and bind it.
///
/// Most callers want [`cpuid`] instead, which reuses the process-wide
/// cached handle.
pub fn create_cpuid_handle() -> Result<NativeMethodHandle<CpuIdFn>, NativeCodeError> {
    if !is_supported_architecture() {
        return Err(NativeCodeError::UnsupportedArchitecture);
    }
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        // The payload writes four dwords through the first argument and
        // clobbers nothing callee-saved it does not restore.
        unsafe { NativeMethodHandle::create(CPUID_CODE) }
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        Err(NativeCodeError::UnsupportedArchitecture)
    }
}

// =============================================================================
// cpuid support probe
// =============================================================================

/// Whether the processor supports the `cpuid` instruction.
///
/// Every x86_64 processor does; a 32-bit x86 host is probed by toggling
/// the ID bit (bit 21) of EFLAGS through an injected routine. Any other
/// architecture has no `cpuid` at all.
pub fn is_cpuid_supported() -> bool {
    cfg!(target_arch = "x86_64")
        || (cfg!(target_arch = "x86") && probe_cpuid_support().unwrap_or(false))
}

/// Run the EFLAGS.ID probe through a freshly injected routine.
///
/// The routine's handle is disposed before returning; unlike [`cpuid`],
/// nothing is cached.
pub fn probe_cpuid_support() -> Result<bool, NativeCodeError> {
    if !is_supported_architecture() {
        return Err(NativeCodeError::UnsupportedArchitecture);
    }
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        let mut handle: NativeMethodHandle<IsCpuIdSupportedFn> =
            unsafe { NativeMethodHandle::create(IS_CPUID_SUPPORTED_CODE) }?;
        let supported = unsafe { (handle.method())() } != 0;
        handle.dispose();
        Ok(supported)
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        Err(NativeCodeError::UnsupportedArchitecture)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_info_display_format() {
        let info = CpuInfo {
            eax: 0x0000_000D,
            ebx: 0x756E_6547,
            ecx: 0x6C65_746E,
            edx: 0x4965_6E69,
        };
        assert_eq!(
            info.to_string(),
            "(eax, ebx, ecx, edx) = (0x0000000D, 0x756E6547, 0x6C65746E, 0x49656E69)"
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_supported_architecture_on_x86_64() {
        assert!(is_supported_architecture());
        assert!(is_cpuid_supported());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_basic_leaf_is_populated() {
        let info = cpuid(0, 0).expect("cpuid failed");
        // Every x86_64 processor reports at least leaf 1 and a vendor id.
        assert!(info.eax >= 1);
        assert_ne!(info.ebx, 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_handle_is_cached_across_calls() {
        cpuid(0, 0).expect("cpuid failed");
        let first = CPUID_HANDLE.get().expect("cache not populated") as *const _;
        cpuid(1, 0).expect("cpuid failed");
        let second = CPUID_HANDLE.get().expect("cache not populated") as *const _;
        assert_eq!(first, second);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_eflags_probe_reports_support() {
        // The probe itself must agree with the architectural guarantee.
        assert!(probe_cpuid_support().expect("probe failed"));
    }
}
