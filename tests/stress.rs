//! Concurrent stress tests.
//!
//! These don't try to compare against a model (the interleavings make that meaningless);
//! instead they hammer one map from many threads and check invariants that must hold under
//! any interleaving: values never come out of thin air, single-key histories stay ordered,
//! and keys that nobody touches stay visible.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::thread;
use rand::{thread_rng, Rng};
use splitmap::SplitMap;

const THREADS: usize = 4;
const KEYS: usize = 64;
const OPS: usize = 10_000;

/// Values for key `k` are always manufactured as `k * STRIDE + x` with `x < STRIDE`, so any
/// value observed for a key can be checked for provenance.
const STRIDE: usize = 1_000;

fn value_for(key: usize, x: usize) -> usize {
    key * STRIDE + x % STRIDE
}

fn assert_provenance(key: usize, value: usize) {
    assert_eq!(
        key,
        value / STRIDE,
        "Value {} was never stored for key {}",
        value,
        key,
    );
}

#[test]
fn mixed_ops_never_invent_values() {
    let map: SplitMap<usize, usize> = SplitMap::new();

    thread::scope(|s| {
        for _ in 0..THREADS {
            let map = &map;
            s.spawn(move |_| {
                let mut rng = thread_rng();
                for _ in 0..OPS {
                    let key = rng.gen_range(0..KEYS);
                    match rng.gen_range(0..6) {
                        0 => {
                            if let Some(value) = map.load(&key) {
                                assert_provenance(key, value);
                            }
                        }
                        1 => map.store(key, value_for(key, rng.gen())),
                        2 => {
                            if let Some(previous) = map.swap(key, value_for(key, rng.gen())) {
                                assert_provenance(key, previous);
                            }
                        }
                        3 => {
                            if let Some(taken) = map.load_and_delete(&key) {
                                assert_provenance(key, taken);
                            }
                        }
                        4 => {
                            let actual =
                                map.load_or_store(key, value_for(key, rng.gen())).into_inner();
                            assert_provenance(key, actual);
                        }
                        _ => {
                            // Compare against the current value when there is one; a stale
                            // read simply makes the swap fail, which is fine.
                            if let Some(current) = map.load(&key) {
                                map.compare_and_swap(&key, &current, value_for(key, rng.gen()));
                            }
                        }
                    }
                }
            });
        }
    })
    .unwrap();

    map.range(|&key, &value| {
        assert_provenance(key, value);
        true
    });
}

// One writer per key storing an increasing sequence; readers must never observe the sequence
// going backwards. This exercises the publication ordering of promotions: a value reachable
// from a freshly published snapshot has to be fully visible.
#[test]
fn single_key_history_stays_ordered() {
    const WRITES: usize = 2_000;

    let map: SplitMap<usize, usize> = SplitMap::new();
    let done = AtomicUsize::new(0);

    thread::scope(|s| {
        for writer in 0..THREADS {
            let map = &map;
            s.spawn(move |_| {
                for i in 0..WRITES {
                    map.store(writer, i);
                }
            });
        }
        for _ in 0..THREADS {
            let map = &map;
            let done = &done;
            s.spawn(move |_| {
                let mut highest = [0usize; THREADS];
                while done.load(Ordering::Relaxed) < THREADS {
                    for (key, seen) in highest.iter_mut().enumerate() {
                        if let Some(value) = map.load(&key) {
                            assert!(
                                value >= *seen,
                                "Key {} went back from {} to {}",
                                key,
                                *seen,
                                value,
                            );
                            *seen = value;
                        }
                    }
                }
            });
        }
        // The writers finish first; let the readers know once they are all done.
        for writer in 0..THREADS {
            let map = &map;
            let done = &done;
            s.spawn(move |_| {
                while map.load(&writer) != Some(WRITES - 1) {
                    std::thread::yield_now();
                }
                done.fetch_add(1, Ordering::Relaxed);
            });
        }
    })
    .unwrap();

    for writer in 0..THREADS {
        assert_eq!(Some(WRITES - 1), map.load(&writer));
    }
}

// Keys present for the whole duration of a range call must all be visited, no matter how many
// fresh keys are being inserted concurrently (each insertion re-amends the snapshot and the
// iteration itself promotes).
#[test]
fn range_sees_stable_keys() {
    let map: SplitMap<usize, usize> = SplitMap::new();
    for key in 0..KEYS {
        map.store(key, value_for(key, 0));
    }

    thread::scope(|s| {
        let map = &map;
        let writer = s.spawn(move |_| {
            for extra in KEYS..KEYS + 1_000 {
                map.store(extra, value_for(extra, 0));
            }
        });

        for _ in 0..8 {
            let mut stable_seen = 0;
            map.range(|&key, &value| {
                assert_provenance(key, value);
                if key < KEYS {
                    stable_seen += 1;
                }
                true
            });
            assert_eq!(KEYS, stable_seen);
        }

        writer.join().unwrap();
    })
    .unwrap();
}

#[test]
fn load_or_store_single_winner() {
    for key in 0..KEYS {
        let map: SplitMap<usize, usize> = SplitMap::new();
        let winners = AtomicUsize::new(0);
        thread::scope(|s| {
            for t in 0..THREADS {
                let map = &map;
                let winners = &winners;
                s.spawn(move |_| {
                    let result = map.load_or_store(key, value_for(key, t));
                    assert_provenance(key, *result);
                    if result.is_new() {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(1, winners.load(Ordering::Relaxed));
        let settled = map.load_or_store(key, value_for(key, 0));
        assert!(!settled.is_new());
        assert_eq!(map.load(&key), Some(settled.into_inner()));
    }
}
