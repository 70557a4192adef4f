//! Processor identity queries built on the injected `cpuid` routine.
//!
//! Thin consumers of [`crate::cpuid::cpuid`]: vendor id, brand string, and
//! L2 cache geometry, each decoded exactly as the extended-leaf contract
//! documents.

use rawcall_core::NativeCodeError;

use crate::cpuid::cpuid;

/// L2 cache geometry reported by extended leaf 0x8000_0006.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCacheInfo {
    /// Cache size in bytes.
    pub cache_size: u32,
    /// Cache line size in bytes.
    pub cache_line_size: u32,
}

/// The 12-byte CPU vendor id, e.g. `"GenuineIntel"` or `"AuthenticAMD"`.
///
/// Leaf 0 scatters the string across ebx, edx, ecx — in that order.
pub fn cpu_vendor_id() -> Result<String, NativeCodeError> {
    let info = cpuid(0, 0)?;
    let mut bytes = [0u8; 12];
    bytes[0..4].copy_from_slice(&info.ebx.to_le_bytes());
    bytes[4..8].copy_from_slice(&info.edx.to_le_bytes());
    bytes[8..12].copy_from_slice(&info.ecx.to_le_bytes());
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The processor brand string, e.g. `"Intel(R) Core(TM) i7-9700K ..."`.
///
/// Returns an empty string when the processor does not report extended
/// leaves 0x8000_0002 through 0x8000_0004.
pub fn cpu_brand_string() -> Result<String, NativeCodeError> {
    let max_extended = cpuid(0x8000_0000, 0)?;
    if max_extended.eax < 0x8000_0004 {
        return Ok(String::new());
    }

    let mut bytes = Vec::with_capacity(48);
    for leaf in 0x8000_0002u32..=0x8000_0004 {
        let info = cpuid(leaf, 0)?;
        for register in [info.eax, info.ebx, info.ecx, info.edx] {
            bytes.extend_from_slice(&register.to_le_bytes());
        }
    }

    // The 48-byte field is NUL-padded and often left-padded with spaces.
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).trim().to_owned())
}

/// L2 cache size and line size, or `None` when extended leaf 0x8000_0006
/// is not reported.
pub fn cpu_cache_info() -> Result<Option<CpuCacheInfo>, NativeCodeError> {
    let max_extended = cpuid(0x8000_0000, 0)?;
    if max_extended.eax < 0x8000_0006 {
        return Ok(None);
    }

    let info = cpuid(0x8000_0006, 0)?;
    Ok(Some(CpuCacheInfo {
        // ecx[31:16] is the cache size in KiB: (x << 10) >> 16 == x >> 6.
        cache_size: (info.ecx & 0xffff_0000) >> 6,
        cache_line_size: info.ecx & 0xff,
    }))
}
