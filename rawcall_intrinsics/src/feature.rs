//! SIMD capability detection.
//!
//! [`CpuSimdFeatures`] is a fixed bit-set of the SIMD instruction-set
//! extensions a processor can report through `cpuid`. Detection reads leaf 1
//! (the MMX/SSE/AVX generation), leaf 7 (AVX2 and the AVX-512 family), and —
//! when the processor exposes it — extended leaf 0x8000_0001 (SSE4A).
//!
//! For a fixed physical CPU, repeated detection returns identical results;
//! nothing about the *result* is cached, only the injected `cpuid` routine
//! underneath ([`crate::cpuid`]).

use std::fmt;

use bitflags::bitflags;
use smallvec::SmallVec;

use rawcall_core::NativeCodeError;

use crate::cpuid::cpuid;

bitflags! {
    /// SIMD instruction sets available on the host CPU, one bit per flag.
    ///
    /// Declaration order is the stable rendering order of [`fmt::Display`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuSimdFeatures: u32 {
        /// MMX is available.
        const MMX = 0x0000_0001;
        /// SSE is available.
        const SSE = 0x0000_0002;
        /// SSE2 is available.
        const SSE2 = 0x0000_0004;
        /// SSE3 is available.
        const SSE3 = 0x0000_0008;
        /// SSSE3 is available.
        const SSSE3 = 0x0000_0010;
        /// SSE4.1 is available.
        const SSE41 = 0x0000_0020;
        /// SSE4.2 is available.
        const SSE42 = 0x0000_0040;
        /// AES-NI is available.
        const AES = 0x0000_0080;
        /// SSE4A is available (AMD extended leaf).
        const SSE4A = 0x0000_0100;
        /// AVX is available.
        const AVX = 0x0000_0200;
        /// AVX2 is available.
        const AVX2 = 0x0000_0400;
        /// FMA is available.
        const FMA = 0x0000_0800;
        /// AVX-512 Foundation is available.
        const AVX512F = 0x0000_1000;
        /// AVX-512 Byte and Word instructions are available.
        const AVX512BW = 0x0000_2000;
        /// AVX-512 Conflict Detection instructions are available.
        const AVX512CD = 0x0000_4000;
        /// AVX-512 Doubleword and Quadword instructions are available.
        const AVX512DQ = 0x0000_8000;
        /// AVX-512 Exponential and Reciprocal instructions are available.
        const AVX512ER = 0x0001_0000;
        /// AVX-512 52-bit Integer FMA instructions are available.
        const AVX512IFMA52 = 0x0002_0000;
        /// AVX-512 Prefetch instructions are available.
        const AVX512PF = 0x0004_0000;
        /// AVX-512 Vector Length extensions are available.
        const AVX512VL = 0x0008_0000;
        /// AVX-512 Vector Population Count is available.
        const AVX512VPOPCNTDQ = 0x0010_0000;
        /// AVX-512 4-iteration Fused Multiply-Add is available.
        const AVX512_4FMAPS = 0x0020_0000;
        /// AVX-512 4-iteration Vector Neural Network instructions are available.
        const AVX512_4VNNIW = 0x0040_0000;
        /// AVX-512 Bit Algorithms are available.
        const AVX512BITALG = 0x0080_0000;
        /// AVX-512 Vector Byte Manipulation instructions are available.
        const AVX512VBMI = 0x0100_0000;
        /// AVX-512 Vector Byte Manipulation instructions 2 are available.
        const AVX512VBMI2 = 0x0200_0000;
        /// AVX-512 Vector Neural Network instructions are available.
        const AVX512VNNI = 0x0400_0000;
    }
}

impl CpuSimdFeatures {
    /// Flag → display-name table, in declaration order.
    const NAMES: [(CpuSimdFeatures, &'static str); 27] = [
        (CpuSimdFeatures::MMX, "MMX"),
        (CpuSimdFeatures::SSE, "SSE"),
        (CpuSimdFeatures::SSE2, "SSE2"),
        (CpuSimdFeatures::SSE3, "SSE3"),
        (CpuSimdFeatures::SSSE3, "SSSE3"),
        (CpuSimdFeatures::SSE41, "SSE4.1"),
        (CpuSimdFeatures::SSE42, "SSE4.2"),
        (CpuSimdFeatures::AES, "AES"),
        (CpuSimdFeatures::SSE4A, "SSE4A"),
        (CpuSimdFeatures::AVX, "AVX"),
        (CpuSimdFeatures::AVX2, "AVX2"),
        (CpuSimdFeatures::FMA, "FMA"),
        (CpuSimdFeatures::AVX512F, "AVX-512F"),
        (CpuSimdFeatures::AVX512BW, "AVX-512BW"),
        (CpuSimdFeatures::AVX512CD, "AVX-512CD"),
        (CpuSimdFeatures::AVX512DQ, "AVX-512DQ"),
        (CpuSimdFeatures::AVX512ER, "AVX-512ER"),
        (CpuSimdFeatures::AVX512IFMA52, "AVX-512IFMA52"),
        (CpuSimdFeatures::AVX512PF, "AVX-512PF"),
        (CpuSimdFeatures::AVX512VL, "AVX-512VL"),
        (CpuSimdFeatures::AVX512VPOPCNTDQ, "AVX-512VPOPCNTDQ"),
        (CpuSimdFeatures::AVX512_4FMAPS, "AVX-512_4FMAPS"),
        (CpuSimdFeatures::AVX512_4VNNIW, "AVX-512_4VNNIW"),
        (CpuSimdFeatures::AVX512BITALG, "AVX-512_BITALG"),
        (CpuSimdFeatures::AVX512VBMI, "AVX-512_VBMI"),
        (CpuSimdFeatures::AVX512VBMI2, "AVX-512_VBMI2"),
        (CpuSimdFeatures::AVX512VNNI, "AVX-512_VNNI"),
    ];

    /// Probe the host CPU.
    ///
    /// Issues `cpuid` leaf 1, leaf 7, and — if the extended-leaf count
    /// allows — leaf 0x8000_0001, and decodes the documented feature bits.
    pub fn detect() -> Result<CpuSimdFeatures, NativeCodeError> {
        let mut features = CpuSimdFeatures::empty();

        let leaf1 = cpuid(1, 0)?;
        features.set(CpuSimdFeatures::MMX, leaf1.edx & (1 << 23) != 0);
        features.set(CpuSimdFeatures::SSE, leaf1.edx & (1 << 25) != 0);
        features.set(CpuSimdFeatures::SSE2, leaf1.edx & (1 << 26) != 0);
        features.set(CpuSimdFeatures::SSE3, leaf1.ecx & (1 << 0) != 0);
        features.set(CpuSimdFeatures::SSSE3, leaf1.ecx & (1 << 9) != 0);
        features.set(CpuSimdFeatures::FMA, leaf1.ecx & (1 << 12) != 0);
        features.set(CpuSimdFeatures::SSE41, leaf1.ecx & (1 << 19) != 0);
        features.set(CpuSimdFeatures::SSE42, leaf1.ecx & (1 << 20) != 0);
        features.set(CpuSimdFeatures::AES, leaf1.ecx & (1 << 25) != 0);
        features.set(CpuSimdFeatures::AVX, leaf1.ecx & (1 << 28) != 0);

        let leaf7 = cpuid(7, 0)?;
        features.set(CpuSimdFeatures::AVX2, leaf7.ebx & (1 << 5) != 0);
        features.set(CpuSimdFeatures::AVX512F, leaf7.ebx & (1 << 16) != 0);
        features.set(CpuSimdFeatures::AVX512DQ, leaf7.ebx & (1 << 17) != 0);
        features.set(CpuSimdFeatures::AVX512IFMA52, leaf7.ebx & (1 << 21) != 0);
        features.set(CpuSimdFeatures::AVX512PF, leaf7.ebx & (1 << 26) != 0);
        features.set(CpuSimdFeatures::AVX512ER, leaf7.ebx & (1 << 27) != 0);
        features.set(CpuSimdFeatures::AVX512CD, leaf7.ebx & (1 << 28) != 0);
        features.set(CpuSimdFeatures::AVX512BW, leaf7.ebx & (1 << 30) != 0);
        features.set(CpuSimdFeatures::AVX512VL, leaf7.ebx & (1 << 31) != 0);
        features.set(CpuSimdFeatures::AVX512VBMI, leaf7.ecx & (1 << 1) != 0);
        features.set(CpuSimdFeatures::AVX512VBMI2, leaf7.ecx & (1 << 6) != 0);
        features.set(CpuSimdFeatures::AVX512VNNI, leaf7.ecx & (1 << 11) != 0);
        features.set(CpuSimdFeatures::AVX512BITALG, leaf7.ecx & (1 << 12) != 0);
        features.set(CpuSimdFeatures::AVX512VPOPCNTDQ, leaf7.ecx & (1 << 14) != 0);
        features.set(CpuSimdFeatures::AVX512_4FMAPS, leaf7.edx & (1 << 2) != 0);
        features.set(CpuSimdFeatures::AVX512_4VNNIW, leaf7.edx & (1 << 3) != 0);

        // SSE4A lives in an extended leaf that not every CPU reports.
        let max_extended = cpuid(0x8000_0000, 0)?;
        if max_extended.eax >= 0x8000_0001 {
            let ext1 = cpuid(0x8000_0001, 0)?;
            features.set(CpuSimdFeatures::SSE4A, ext1.ecx & (1 << 6) != 0);
        }

        Ok(features)
    }
}

impl fmt::Display for CpuSimdFeatures {
    /// Comma-separated supported-instruction-set list, e.g. `"MMX, SSE, SSE2"`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: SmallVec<[&str; 27]> = SmallVec::new();
        for (flag, name) in CpuSimdFeatures::NAMES {
            if self.contains(flag) {
                names.push(name);
            }
        }
        f.write_str(&names.join(", "))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bit_positions_are_stable() {
        assert_eq!(CpuSimdFeatures::MMX.bits(), 0x0000_0001);
        assert_eq!(CpuSimdFeatures::SSE2.bits(), 0x0000_0004);
        assert_eq!(CpuSimdFeatures::AES.bits(), 0x0000_0080);
        assert_eq!(CpuSimdFeatures::AVX.bits(), 0x0000_0200);
        assert_eq!(CpuSimdFeatures::AVX512F.bits(), 0x0000_1000);
        assert_eq!(CpuSimdFeatures::AVX512VNNI.bits(), 0x0400_0000);
    }

    #[test]
    fn test_display_follows_declaration_order() {
        let features = CpuSimdFeatures::SSE2 | CpuSimdFeatures::MMX | CpuSimdFeatures::SSE;
        assert_eq!(features.to_string(), "MMX, SSE, SSE2");
    }

    #[test]
    fn test_display_uses_canonical_names() {
        let features =
            CpuSimdFeatures::SSE41 | CpuSimdFeatures::AVX512F | CpuSimdFeatures::AVX512BITALG;
        assert_eq!(features.to_string(), "SSE4.1, AVX-512F, AVX-512_BITALG");
    }

    #[test]
    fn test_display_of_empty_set() {
        assert_eq!(CpuSimdFeatures::empty().to_string(), "");
    }

    #[test]
    fn test_name_table_covers_every_flag() {
        let mut union = CpuSimdFeatures::empty();
        for (flag, _) in CpuSimdFeatures::NAMES {
            union |= flag;
        }
        assert_eq!(union, CpuSimdFeatures::all());
    }
}
