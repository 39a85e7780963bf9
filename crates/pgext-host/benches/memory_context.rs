// Memory context benchmarks for the in-process host
//
// These measure bump allocation inside a context, block growth, and the
// cost of resetting a context that has callbacks registered.

use std::ffi::c_void;

use criterion::{
    BenchmarkId, Criterion, black_box, criterion_group, criterion_main,
};
use pgext_host::memory::{
    alloc_set_context_create, memory_context_alloc, memory_context_delete,
    memory_context_register_reset_callback, memory_context_reset,
    top_memory_context,
};

/// Allocation of a fixed size, repeated; the context is reset whenever it
/// has grown past a few blocks so the measurement stays in the fast path.
fn bench_sequential_allocations(c: &mut Criterion) {
    let mut group = c.benchmark_group("palloc");
    group.sample_size(1000);

    for size in &[8usize, 64, 256, 1024, 4096] {
        group.bench_with_input(
            BenchmarkId::from_parameter(size),
            size,
            |b, &size| {
                let ctx = alloc_set_context_create(top_memory_context(), "bench");
                let mut n = 0usize;
                b.iter(|| {
                    black_box(memory_context_alloc(ctx, black_box(size)));
                    n += size;
                    if n > 1 << 20 {
                        memory_context_reset(ctx);
                        n = 0;
                    }
                });
                memory_context_delete(ctx);
            },
        );
    }

    group.finish();
}

/// Creating a context, filling several blocks and deleting it.
fn bench_block_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_growth");
    group.sample_size(100);

    group.bench_function("create_fill_delete", |b| {
        b.iter(|| {
            let ctx = alloc_set_context_create(top_memory_context(), "grow");
            for _ in 0..256 {
                memory_context_alloc(ctx, black_box(512));
            }
            memory_context_delete(ctx);
        });
    });

    group.finish();
}

unsafe extern "C" fn noop(_arg: *mut c_void) {}

/// Reset of a context carrying a handful of callbacks.
fn bench_reset_with_callbacks(c: &mut Criterion) {
    let mut group = c.benchmark_group("reset");

    group.bench_function("eight_callbacks", |b| {
        let ctx = alloc_set_context_create(top_memory_context(), "reset");
        for _ in 0..8 {
            unsafe {
                memory_context_register_reset_callback(
                    ctx,
                    noop,
                    std::ptr::null_mut(),
                );
            }
        }
        b.iter(|| {
            memory_context_alloc(ctx, 128);
            memory_context_reset(ctx);
        });
        memory_context_delete(ctx);
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_sequential_allocations,
    bench_block_growth,
    bench_reset_with_callbacks,
);
criterion_main!(benches);
