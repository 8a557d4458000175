//! Stress test: many buffers, tight stack budget, wait/wake traffic
//!
//! Exercises stack-pressure serialization (the budget is far smaller
//! than the task count) and cross-task wake-ups under load.

use fibra::{spawn_pool, task, CommandBuffer, PoolConfig, StackClassConfig};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

const BUFFERS: usize = 32;
const BATCH: usize = 64;

fn main() {
    println!("=== fibra stress ===");

    // Deliberately small budget so spawning outpaces the stacks
    let pool = spawn_pool(
        &PoolConfig::from_env().label("stress").stacks(vec![
            StackClassConfig {
                size: 64 * 1024,
                preallocated: 8,
                cold: 8,
                hot: 8,
                max_allocated: 24,
            },
        ]),
    )
    .expect("failed to spawn pool");
    println!(
        "pool {} with {} workers, stack budget 24",
        pool.id(),
        pool.worker_count()
    );

    let counter = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(AtomicU32::new(0));

    let start = Instant::now();

    // The opener goes in first so it gets a stack ahead of the flood
    let g = Arc::clone(&gate);
    let mut opener = CommandBuffer::new();
    opener.spawn_task(move || {
        task::yield_now();
        g.store(1, Ordering::Release);
        task::wake(&g, 0);
    });
    pool.enqueue_detached(opener).expect("enqueue failed");

    let mut handles = Vec::new();
    for _ in 0..BUFFERS {
        let c = Arc::clone(&counter);
        let g = Arc::clone(&gate);
        let mut buf = CommandBuffer::new();
        buf.spawn_batch(BATCH, move |i| {
            // Odd tasks wait for the gate to open
            if i % 2 == 1 {
                while g.load(Ordering::Acquire) == 0 {
                    task::wait(&g, 0);
                }
            } else {
                task::yield_now();
            }
            c.fetch_add(1, Ordering::Relaxed);
        })
        .wait_barrier();
        handles.push(pool.enqueue(buf).expect("enqueue failed"));
    }

    for h in handles {
        let status = h.wait_on();
        assert_eq!(status, fibra::BufferStatus::Completed);
    }
    let elapsed = start.elapsed();

    let ran = counter.load(Ordering::Relaxed);
    println!(
        "{} tasks across {} buffers in {:?} ({:.0} tasks/s)",
        ran,
        BUFFERS,
        elapsed,
        ran as f64 / elapsed.as_secs_f64()
    );
    assert_eq!(ran, BUFFERS * BATCH);

    pool.request_close();
    pool.join();
    println!("=== stress complete ===");
}
