//! Raw context-switch benchmark
//!
//! Measures the round-trip cost of the assembly switch on its own,
//! without any scheduler involvement.

use criterion::{criterion_group, criterion_main, Criterion};
use fibra_runtime::arch::{make_context, switch_context, Transfer};

unsafe extern "C" fn pong(mut t: Transfer) -> ! {
    loop {
        t = switch_context(t.ctx, t.data);
    }
}

fn bench_switch(c: &mut Criterion) {
    let mut stack = vec![0u8; 64 * 1024];
    let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
    let mut ctx = Some(unsafe { make_context(top, pong) });

    c.bench_function("context_switch_roundtrip", |b| {
        b.iter(|| {
            let t = unsafe { switch_context(ctx.take().unwrap(), 1) };
            ctx = Some(t.ctx);
            t.data
        })
    });
}

criterion_group!(benches, bench_switch);
criterion_main!(benches);
