//! ConcurrentTable unit tests

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use super::*;

#[test]
fn test_insert_then_find() {
    let table: ConcurrentTable<u64> = ConcurrentTable::new(4, 16);
    table.insert(1, 100);
    table.insert(2, 200);
    assert_eq!(table.find(1), Some(100));
    assert_eq!(table.find(2), Some(200));
    assert_eq!(table.find(3), None);
    assert_eq!(table.len(), 2);
}

#[test]
fn test_remove() {
    let table: ConcurrentTable<u64> = ConcurrentTable::new(4, 16);
    table.insert(1, 100);
    assert_eq!(table.remove(1), Some(100));
    assert_eq!(table.find(1), None);
    assert_eq!(table.remove(1), None);
    assert!(table.is_empty());
}

#[test]
fn test_latest_insertion_shadows() {
    let table: ConcurrentTable<u64> = ConcurrentTable::new(4, 16);
    table.insert(1, 100);
    table.insert(1, 101);
    assert_eq!(table.find(1), Some(101));
    assert_eq!(table.remove(1), Some(101));
    assert_eq!(table.find(1), Some(100));
}

#[test]
fn test_get_or_insert_with() {
    let table: ConcurrentTable<Arc<u64>> = ConcurrentTable::new(4, 16);
    let first = table.get_or_insert_with(9, || Arc::new(42));
    let second = table.get_or_insert_with(9, || Arc::new(43));
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(table.len(), 1);
}

#[test]
fn test_forced_resize_keeps_key_set() {
    // Tiny table with an aggressive hint so a resize is guaranteed.
    let table: ConcurrentTable<u64> = ConcurrentTable::new(1, 2);
    let keys: Vec<Key> = (0..512).map(|i| i * 7 + 1).collect();
    for &key in &keys {
        table.insert(key, key * 10);
    }
    assert!(table.nb_generations() > 1, "resize did not trigger");

    let mut seen = HashSet::new();
    table.for_each(|key, _| {
        assert!(seen.insert(key), "key {key} duplicated across generations");
    });
    let expected: HashSet<Key> = keys.iter().copied().collect();
    assert_eq!(seen, expected);

    // Every key is still reachable through the generation chain.
    for &key in &keys {
        assert_eq!(table.find(key), Some(key * 10));
    }
}

#[test]
fn test_old_generations_drain_and_unlink() {
    let table: ConcurrentTable<u64> = ConcurrentTable::new(1, 2);
    let keys: Vec<Key> = (0..256).collect();
    for &key in &keys {
        table.insert(key, key);
    }
    assert!(table.nb_generations() > 1);
    for &key in &keys {
        assert_eq!(table.remove(key), Some(key));
    }
    assert!(table.is_empty());
    // Removing the last entry of each drained generation unlinks it.
    assert_eq!(table.nb_generations(), 1);
}

#[test]
fn test_find_after_insert_across_threads() {
    let table: Arc<ConcurrentTable<u64>> = Arc::new(ConcurrentTable::new(2, 4));
    let nb_threads = 4;
    let per_thread = 200u64;
    let barrier = Arc::new(Barrier::new(nb_threads as usize));

    let handles: Vec<_> = (0..nb_threads)
        .map(|t| {
            let table = table.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let base = t * per_thread;
                for key in base..base + per_thread {
                    table.insert(key, key + 1);
                    // A find after a successful insert of the same key must
                    // succeed, resizes notwithstanding.
                    assert_eq!(table.find(key), Some(key + 1));
                }
                for key in base..base + per_thread {
                    assert_eq!(table.remove(key), Some(key + 1));
                    assert_eq!(table.find(key), None);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(table.is_empty());
}

#[test]
fn test_racing_creators_observe_one_winner() {
    let table: Arc<ConcurrentTable<Arc<u64>>> = Arc::new(ConcurrentTable::new(2, 4));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let table = table.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                table.get_or_insert_with(77, || Arc::new(t))
            })
        })
        .collect();

    let winners: Vec<Arc<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for winner in &winners {
        assert!(Arc::ptr_eq(winner, &winners[0]));
    }
    assert_eq!(table.len(), 1);
}

#[cfg(test)]
mod fold_key_tests {
    use super::*;

    #[test]
    fn test_identity_at_full_width() {
        assert_eq!(fold_key(0xDEAD_BEEF_CAFE_F00D, 64), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn test_range_and_determinism() {
        for bits in 1..=16 {
            for key in [0u64, 1, 42, u64::MAX, 0x8000_0000_0000_0000] {
                let hash = fold_key(key, bits);
                assert!(hash < (1u64 << bits));
                assert_eq!(hash, fold_key(key, bits));
            }
        }
    }

    #[test]
    fn test_high_bits_participate() {
        // Keys differing only in their top bits must not all collapse into
        // one bucket.
        let buckets: HashSet<u64> = (0..64u64)
            .map(|i| fold_key(i << 58, 6))
            .collect();
        assert!(buckets.len() > 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_fold_in_range(key: u64, bits in 1u32..=64) {
            let hash = fold_key(key, bits);
            if bits < 64 {
                proptest::prop_assert!(hash < (1u64 << bits));
            }
        }
    }
}
