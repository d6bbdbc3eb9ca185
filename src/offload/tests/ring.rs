use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::thread;

use offload::queue::{Dequeue, JobRing};
use offload::JobId;

const NUM_ITERS: usize = 100_000;

#[test]
fn spsc_order_preserved() {
    let ring = JobRing::with_capacity(32);
    thread::scope(|s| {
        let sender = s.spawn(|_| {
            for i in 0..NUM_ITERS {
                while !ring.enqueue(JobId(i as u32)) {
                    std::hint::spin_loop();
                }
            }
        });
        let receiver = s.spawn(|_| {
            let mut expected = 0u32;
            while (expected as usize) < NUM_ITERS {
                match ring.dequeue() {
                    Dequeue::Ok(id) => {
                        assert_eq!(id, JobId(expected));
                        expected += 1;
                    }
                    Dequeue::Empty | Dequeue::Contended => std::hint::spin_loop(),
                }
            }
        });

        sender.join().unwrap();
        receiver.join().unwrap();
    })
    .unwrap();
}

#[test]
fn mpmc_exactly_once() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: usize = 10_000;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let ring = JobRing::with_capacity(64);
    let consumed = AtomicUsize::new(0);

    let mut collected: Vec<Vec<u32>> = Vec::new();
    thread::scope(|s| {
        let ring = &ring;
        let consumed = &consumed;
        for p in 0..PRODUCERS {
            s.spawn(move |_| {
                for i in 0..PER_PRODUCER {
                    let id = JobId((p * PER_PRODUCER + i) as u32);
                    while !ring.enqueue(id) {
                        std::hint::spin_loop();
                    }
                }
            });
        }

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                s.spawn(move |_| {
                    let mut seen = Vec::new();
                    while consumed.load(Ordering::Relaxed) < TOTAL {
                        match ring.dequeue() {
                            Dequeue::Ok(id) => {
                                seen.push(id.0);
                                consumed.fetch_add(1, Ordering::Relaxed);
                            }
                            Dequeue::Empty | Dequeue::Contended => std::hint::spin_loop(),
                        }
                    }
                    seen
                })
            })
            .collect();

        for c in consumers {
            collected.push(c.join().unwrap());
        }
    })
    .unwrap();

    let mut all: Vec<u32> = collected.into_iter().flatten().collect();
    all.sort_unstable();
    let expected: Vec<u32> = (0..TOTAL as u32).collect();
    assert_eq!(all, expected, "every id delivered exactly once");
}
