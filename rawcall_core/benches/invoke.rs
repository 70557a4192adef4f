//! Injection pipeline benchmarks.
//!
//! Measures the two costs callers actually pay: the one-time
//! allocate/protect/flush round-trip when a handle is created, and the
//! per-call overhead of invoking through the bound entry point (which
//! should be indistinguishable from a plain indirect call).
//!
//! Payloads are x86_64 machine code; on other hosts the harness is empty.

#[cfg(target_arch = "x86_64")]
mod x64 {
    use std::hint::black_box;

    use criterion::Criterion;
    use rawcall_core::NativeMethodHandle;

    /// `mov eax, 42; ret` — identical under System V and Microsoft x64.
    const RETURN_42: [u8; 6] = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];

    type ReturnI32 = unsafe extern "C" fn() -> i32;

    pub fn bench_create_dispose(c: &mut Criterion) {
        c.bench_function("create_dispose_roundtrip", |b| {
            b.iter(|| {
                let handle =
                    unsafe { NativeMethodHandle::<ReturnI32>::create(black_box(&RETURN_42)) }
                        .expect("injection failed");
                black_box(handle)
            });
        });
    }

    pub fn bench_invoke(c: &mut Criterion) {
        let handle = unsafe { NativeMethodHandle::<ReturnI32>::create(&RETURN_42) }
            .expect("injection failed");
        let method = handle.method();

        c.bench_function("invoke_bound_entry", |b| {
            b.iter(|| black_box(unsafe { method() }));
        });
    }

    pub fn bench_clone(c: &mut Criterion) {
        let handle = unsafe { NativeMethodHandle::<ReturnI32>::create(&RETURN_42) }
            .expect("injection failed");

        c.bench_function("clone_handle", |b| {
            b.iter(|| black_box(handle.try_clone().expect("clone failed")));
        });
    }
}

#[cfg(target_arch = "x86_64")]
criterion::criterion_group!(
    benches,
    x64::bench_create_dispose,
    x64::bench_invoke,
    x64::bench_clone
);

#[cfg(target_arch = "x86_64")]
criterion::criterion_main!(benches);

#[cfg(not(target_arch = "x86_64"))]
fn main() {}
