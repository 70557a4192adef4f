//! CPU feature probing through injected `cpuid` machine code.
//!
//! This crate detects SIMD instruction-set availability and processor
//! identity without compiler intrinsics: fixed machine-code routines are
//! injected through the `rawcall_core` pipeline and invoked as native
//! methods, so the probe exercises exactly the same allocate → protect →
//! flush path that user-supplied code does.
//!
//! # Usage
//!
//! ```ignore
//! use rawcall_intrinsics::CpuSimdFeatures;
//!
//! let features = CpuSimdFeatures::detect()?;
//! if features.contains(CpuSimdFeatures::AVX2) {
//!     println!("supported: {}", features);
//! }
//! ```
//!
//! On a processor family the fixed payloads do not target, every probe
//! fails with `NativeCodeError::UnsupportedArchitecture`.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cpuid;
pub mod feature;
pub mod info;

pub use cpuid::{cpuid, is_cpuid_supported, CpuInfo};
pub use feature::CpuSimdFeatures;
pub use info::{cpu_brand_string, cpu_cache_info, cpu_vendor_id, CpuCacheInfo};
