//! Property tests for the universal cache invariants: stats accounting,
//! bound enforcement, round-trips, and single-slot boundary behavior.

use std::collections::HashSet;

use cachet_core::{Cache, PolicyKind};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u16),
    Get(u8),
    Remove(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), any::<u16>()).prop_map(|(k, v)| Op::Put(k, v)),
        any::<u8>().prop_map(Op::Get),
        any::<u8>().prop_map(Op::Remove),
    ]
}

fn bounded_cache(maximum_size: u64, policy: PolicyKind) -> Cache<u8, u16> {
    Cache::builder()
        .maximum_size(maximum_size)
        .eviction_policy(policy)
        .record_stats(true)
        .background_maintenance(false)
        .build()
        .unwrap()
}

proptest! {
    /// Invariant: hits + misses equals the number of reads performed.
    #[test]
    fn hits_plus_misses_equal_reads(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let cache = bounded_cache(32, PolicyKind::Lru);
        let mut reads = 0u64;

        for op in &ops {
            match op {
                Op::Put(k, v) => {
                    cache.put(*k, *v).unwrap();
                }
                Op::Get(k) => {
                    reads += 1;
                    cache.get(k).unwrap();
                }
                Op::Remove(k) => {
                    cache.remove(*k).unwrap();
                }
            }
        }

        let stats = cache.stats();
        prop_assert_eq!(stats.hits + stats.misses, reads);
    }

    /// Invariant: after quiescence the size never exceeds the bound.
    #[test]
    fn size_respects_the_bound_after_quiescence(
        ops in prop::collection::vec(op_strategy(), 1..300),
        policy_choice in 0usize..4,
    ) {
        let policy = [
            PolicyKind::Lru,
            PolicyKind::Lfu,
            PolicyKind::Fifo,
            PolicyKind::TinyLfu,
        ][policy_choice];
        let cache = bounded_cache(10, policy);

        for op in &ops {
            match op {
                Op::Put(k, v) => { cache.put(*k, *v).unwrap(); }
                Op::Get(k) => { cache.get(k).unwrap(); }
                Op::Remove(k) => { cache.remove(*k).unwrap(); }
            }
        }

        cache.run_pending_tasks();
        prop_assert!(cache.size() <= 10, "size {} after quiescence", cache.size());
    }

    /// Invariant: each key appears at most once in an iteration snapshot.
    #[test]
    fn iteration_never_sees_duplicate_keys(
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let cache = bounded_cache(16, PolicyKind::TinyLfu);
        for op in &ops {
            match op {
                Op::Put(k, v) => { cache.put(*k, *v).unwrap(); }
                Op::Get(k) => { cache.get(k).unwrap(); }
                Op::Remove(k) => { cache.remove(*k).unwrap(); }
            }
        }

        let mut seen = HashSet::new();
        let mut duplicate = None;
        cache.for_each(|key, _| {
            if !seen.insert(*key) {
                duplicate = Some(*key);
            }
        }).unwrap();
        prop_assert!(duplicate.is_none(), "key {:?} appeared twice", duplicate);
    }

    /// Round-trip: a put is immediately readable when nothing can evict it.
    #[test]
    fn put_then_get_round_trips(key in any::<u8>(), value in any::<u16>()) {
        let cache = bounded_cache(1024, PolicyKind::TinyLfu);
        cache.put(key, value).unwrap();
        let got = cache.get(&key).unwrap();
        prop_assert_eq!(got.as_deref(), Some(&value));
    }

    /// Idempotence: repeating a put leaves the same observable state.
    #[test]
    fn repeated_put_is_idempotent(key in any::<u8>(), value in any::<u16>()) {
        let cache = bounded_cache(1024, PolicyKind::Lru);
        cache.put(key, value).unwrap();
        cache.put(key, value).unwrap();
        cache.run_pending_tasks();

        prop_assert_eq!(cache.size(), 1);
        let got = cache.get(&key).unwrap();
        prop_assert_eq!(got.as_deref(), Some(&value));
    }

    /// Boundary: a single-slot LRU cache holds exactly the last key put.
    #[test]
    fn single_slot_lru_keeps_the_last_key(keys in prop::collection::vec(any::<u8>(), 1..50)) {
        let cache = bounded_cache(1, PolicyKind::Lru);
        for key in &keys {
            cache.put(*key, 0).unwrap();
        }
        cache.run_pending_tasks();

        prop_assert_eq!(cache.size(), 1);
        let last = keys.last().unwrap();
        prop_assert!(cache.contains_key(last), "last key {last} missing");
    }

    /// Boundary: a single-slot W-TinyLFU cache holds exactly one key, though
    /// admission may have preferred a frequent earlier one.
    #[test]
    fn single_slot_tinylfu_keeps_exactly_one_key(
        keys in prop::collection::vec(any::<u8>(), 1..50),
    ) {
        let cache = bounded_cache(1, PolicyKind::TinyLfu);
        for key in &keys {
            cache.put(*key, 0).unwrap();
        }
        cache.run_pending_tasks();
        prop_assert_eq!(cache.size(), 1);
    }
}

/// W-TinyLFU beats plain LRU on a skewed workload whose working set far
/// exceeds the cache: 20% of keys receive 80% of the traffic.
#[test]
fn tinylfu_hit_rate_beats_lru_on_skewed_traffic() {
    fn run(policy: PolicyKind) -> f64 {
        let cache: Cache<u16, u16> = Cache::builder()
            .maximum_size(50)
            .eviction_policy(policy)
            .record_stats(true)
            .background_maintenance(false)
            .build()
            .unwrap();

        // Deterministic linear-congruential stream: 20% of 1000 keys draw
        // 80% of the traffic.
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut next = || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            state >> 16
        };

        for _ in 0..60_000 {
            let key = if next() % 100 < 80 {
                (next() % 200) as u16
            } else {
                (200 + next() % 800) as u16
            };
            if cache.get(&key).unwrap().is_none() {
                cache.put(key, 0).unwrap();
            }
        }
        cache.stats().hit_rate()
    }

    let lru = run(PolicyKind::Lru);
    let tinylfu = run(PolicyKind::TinyLfu);
    assert!(
        tinylfu > lru,
        "tiny-lfu {tinylfu:.3} should beat lru {lru:.3}"
    );
}
