//! Typed handles over injected native code.
//!
//! A [`NativeMethodHandle`] binds a caller-declared function-pointer type to
//! the base address of an execute-only [`CodeRegion`], which it owns
//! exclusively. The one unsafe cast from raw address to typed callable
//! happens at construction and nowhere else; everything after that is
//! ordinary Rust, right up until the caller invokes the pointer.
//!
//! # Lifecycle
//!
//! A handle has two states: created (active) and disposed. `create`/
//! `try_clone` are the only entries into the active state; [`dispose`]
//! releases the owned region exactly once and is repeat-safe. Invoking the
//! entry point after disposal is undefined behavior — there is no guard.
//!
//! [`dispose`]: NativeMethodHandle::dispose

use std::mem;

use crate::error::NativeCodeError;
use crate::memory::CodeRegion;
use crate::pipeline;

/// A disposable, clonable native function created from raw machine code.
///
/// `F` is the caller-declared call signature, e.g.
/// `unsafe extern "C" fn(i32, i32) -> i32`. Declaring `F` as an `unsafe fn`
/// pointer keeps every invocation an explicit unsafe operation, which is
/// what it is.
pub struct NativeMethodHandle<F> {
    /// The typed entry point, cast once from the region base.
    method: F,
    /// Size of the injected code in bytes.
    code_size: usize,
    /// Set by the first `dispose`; later calls are no-ops.
    disposed: bool,
    /// The exclusively-owned backing region.
    region: CodeRegion,
}

impl<F: Copy> NativeMethodHandle<F> {
    /// Inject `code` and bind the resulting entry point as an `F`.
    ///
    /// Runs the full allocate → copy → protect → flush pipeline; any partial
    /// failure is rolled back before the error surfaces. An empty buffer
    /// fails with [`NativeCodeError::InvalidCode`] before any OS call.
    ///
    /// # Safety
    ///
    /// `code` must be valid machine code for the host architecture whose
    /// entry point matches the calling convention and signature declared by
    /// `F`, and `F` must be a function-pointer type. This crate performs no
    /// validation of either.
    pub unsafe fn create(code: &[u8]) -> Result<NativeMethodHandle<F>, NativeCodeError> {
        let region = pipeline::make_executable(code)?;
        Ok(unsafe { NativeMethodHandle::bind(region) })
    }

    /// Bind a sealed region's base address as the typed entry point.
    ///
    /// # Safety
    ///
    /// The region must contain code valid for signature `F`.
    unsafe fn bind(region: CodeRegion) -> NativeMethodHandle<F> {
        debug_assert_eq!(
            mem::size_of::<F>(),
            mem::size_of::<*const ()>(),
            "F must be a function pointer"
        );
        let entry = region.base_ptr();
        NativeMethodHandle {
            method: unsafe { mem::transmute_copy(&entry) },
            code_size: region.size(),
            disposed: false,
            region,
        }
    }

    /// The bound entry point.
    ///
    /// Invocation is a direct call through this pointer with the declared
    /// signature; the handle does not intercept or validate arguments, and
    /// calling it after [`dispose`](Self::dispose) is undefined behavior.
    #[inline]
    pub fn method(&self) -> F {
        debug_assert!(!self.disposed, "method() on disposed handle");
        self.method
    }

    /// Copy the injected code into a brand-new region and bind an
    /// independent handle to it.
    ///
    /// The two handles share no state: disposing either leaves the other
    /// invocable.
    ///
    /// # Panics
    /// Panics if this handle is already disposed.
    pub fn try_clone(&self) -> Result<NativeMethodHandle<F>, NativeCodeError> {
        assert!(!self.disposed, "clone of disposed handle");
        let region = pipeline::duplicate_region(&self.region)?;
        Ok(unsafe { NativeMethodHandle::bind(region) })
    }
}

impl<F> NativeMethodHandle<F> {
    /// Size of the injected code in bytes.
    #[inline]
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Whether this handle has been disposed.
    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Release the owned region.
    ///
    /// The first call frees the backing memory; every later call is a no-op.
    /// Exclusive access (`&mut self`) statically serializes concurrent
    /// disposal.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.region.release();
    }
}

impl<F> Drop for NativeMethodHandle<F> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<F> std::fmt::Debug for NativeMethodHandle<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeMethodHandle")
            .field("entry", &self.region.base_ptr())
            .field("code_size", &self.code_size)
            .field("disposed", &self.disposed)
            .finish()
    }
}
