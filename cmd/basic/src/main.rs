//! Basic fibra example
//!
//! Spawns a pool, runs a task batch behind a barrier, and waits on the
//! completion handle.

use fibra::{spawn_pool, task, CommandBuffer, PoolConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn main() {
    println!("=== fibra basic example ===\n");

    let pool = spawn_pool(
        &PoolConfig::from_env()
            .worker_count(4)
            .label("basic-example"),
    )
    .expect("failed to spawn pool");
    println!("pool {} up with {} workers", pool.id(), pool.worker_count());

    let counter = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&counter);
    let total = Arc::clone(&counter);
    let mut buf = CommandBuffer::new();
    buf.spawn_batch(8, move |i| {
        println!("[task {}] starting", i);
        for _ in 0..3 {
            task::yield_now();
        }
        c.fetch_add(1, Ordering::SeqCst);
        println!("[task {}] done", i);
    })
    .wait_barrier()
    .spawn_task(move || {
        println!("[check] all {} tasks ran", total.load(Ordering::SeqCst));
    });

    let handle = pool.enqueue(buf).expect("enqueue failed");
    let status = handle.wait_on();
    println!("\nbuffer finished: {:?}", status);
    println!("counter = {}", counter.load(Ordering::SeqCst));

    pool.request_close();
    pool.join();
    println!("\n=== example complete ===");
}
