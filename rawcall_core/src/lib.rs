//! Runtime native-code injection for Rust.
//!
//! This crate turns a buffer of raw machine-code bytes into a safely
//! invocable, disposable, clonable native function. It does not assemble or
//! validate anything — the caller supplies pre-built code for the target
//! architecture and calling convention, and this crate sequences the memory
//! work needed to run it:
//!
//! 1. Reserve and commit a read-write region (`mmap` / `VirtualAlloc`)
//! 2. Copy the code bytes in verbatim
//! 3. Flip the region to execute-only (`mprotect` / `VirtualProtect`)
//! 4. Synchronize the instruction cache
//! 5. Bind the region's base address to a caller-declared function type
//!
//! Any partial failure releases the committed region before the error
//! propagates, so callers never observe a half-initialized region.
//!
//! # Usage
//!
//! ```ignore
//! use rawcall_core::NativeMethodHandle;
//!
//! // mov eax, 42; ret  (System V x86_64)
//! let code = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
//!
//! type ReturnI32 = unsafe extern "C" fn() -> i32;
//! let handle = unsafe { NativeMethodHandle::<ReturnI32>::create(&code)? };
//! let value = unsafe { (handle.method())() };
//! assert_eq!(value, 42);
//! ```
//!
//! # Safety
//!
//! Injected code is executed exactly as supplied. The caller is responsible
//! for its correctness; invoking a handle after `dispose` is undefined
//! behavior and is not guarded against.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod handle;
pub mod memory;
pub mod pipeline;

pub use error::NativeCodeError;
pub use handle::NativeMethodHandle;
pub use memory::{page_size, CodeRegion, Protection};
pub use pipeline::{duplicate_region, make_executable};
