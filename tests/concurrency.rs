//! Multi-threaded scenarios: duplicate rejection, readers racing a resize,
//! reclamation across open reader sections, and concurrent bulk deletion.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use chaintable::{ConcurrentHashTable, Lookup, TableConfig, ThreadToken};

struct U64Config;

impl TableConfig for U64Config {
    type Value = u64;

    fn get_hash(value: &u64, _is_dead: &mut bool) -> u64 {
        *value
    }

    fn notfound() -> u64 {
        u64::MAX
    }
}

struct ByValue(u64);

impl Lookup<u64> for ByValue {
    fn hash(&self) -> u64 {
        self.0
    }

    fn equals(&self, value: &u64, _is_dead: &mut bool) -> bool {
        *value == self.0
    }
}

#[test]
fn concurrent_duplicate_insert() {
    const THREADS: usize = 8;

    let table = Arc::new(ConcurrentHashTable::<U64Config>::new());
    let barrier = Arc::new(Barrier::new(THREADS));
    let inserted_count = Arc::new(AtomicUsize::new(0));
    let duplicate_count = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            let inserted_count = Arc::clone(&inserted_count);
            let duplicate_count = Arc::clone(&duplicate_count);
            thread::spawn(move || {
                let token = ThreadToken::attach();
                barrier.wait();
                table.insert(
                    &token,
                    &ByValue(99),
                    || 99,
                    |inserted, value| {
                        assert_eq!(*value, 99);
                        if inserted {
                            inserted_count.fetch_add(1, Ordering::SeqCst);
                        } else {
                            duplicate_count.fetch_add(1, Ordering::SeqCst);
                        }
                    },
                    None,
                );
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(inserted_count.load(Ordering::SeqCst), 1);
    assert_eq!(duplicate_count.load(Ordering::SeqCst), THREADS - 1);

    // Exactly one node is present afterwards.
    let token = ThreadToken::attach();
    let mut count = 0;
    assert!(table.try_scan(&token, |_| {
        count += 1;
        true
    }));
    assert_eq!(count, 1);
}

#[test]
fn readers_during_grow() {
    const KEYS: u64 = 10_000;
    const READERS: usize = 4;

    let table = Arc::new(ConcurrentHashTable::<U64Config>::with_sizes(12, 20, 4));
    {
        let token = ThreadToken::attach();
        for key in 0..KEYS {
            assert!(table.insert(&token, &ByValue(key), || key, |_, _| (), None));
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let table = Arc::clone(&table);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let token = ThreadToken::attach();
                while !done.load(Ordering::Relaxed) {
                    for key in (0..KEYS).step_by(7) {
                        assert!(
                            table.get(&token, &ByValue(key), |v| assert_eq!(*v, key), None),
                            "key {key} lost during grow"
                        );
                    }
                }
            })
        })
        .collect();

    {
        let token = ThreadToken::attach();
        for target in [13, 14] {
            assert!(table.grow(&token, target));
            assert_eq!(table.get_size_log2(&token), target);
        }
    }
    done.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    let token = ThreadToken::attach();
    for key in 0..KEYS {
        assert!(table.get(&token, &ByValue(key), |_| (), None));
    }
}

#[test]
fn readers_during_shrink() {
    const KEYS: u64 = 5_000;

    let table = Arc::new(ConcurrentHashTable::<U64Config>::with_sizes(5, 20, 4));
    {
        let token = ThreadToken::attach();
        assert!(table.grow(&token, 13));
        for key in 0..KEYS {
            assert!(table.insert(&token, &ByValue(key), || key, |_, _| (), None));
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let table = Arc::clone(&table);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let token = ThreadToken::attach();
            while !done.load(Ordering::Relaxed) {
                for key in (0..KEYS).step_by(11) {
                    assert!(
                        table.get(&token, &ByValue(key), |_| (), None),
                        "key {key} lost during shrink"
                    );
                }
            }
        })
    };

    {
        let token = ThreadToken::attach();
        assert!(table.shrink(&token, 5));
        assert_eq!(table.get_size_log2(&token), 5);
    }
    done.store(true, Ordering::Relaxed);
    reader.join().unwrap();

    let token = ThreadToken::attach();
    for key in 0..KEYS {
        assert!(table.get(&token, &ByValue(key), |_| (), None));
    }
}

#[test]
fn remove_waits_for_open_reader_section() {
    let table = Arc::new(ConcurrentHashTable::<U64Config>::new());
    {
        let token = ThreadToken::attach();
        assert!(table.insert(&token, &ByValue(7), || 7, |_, _| (), None));
    }

    let deleted = Arc::new(AtomicBool::new(false));
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let reader = {
        let table = Arc::clone(&table);
        let deleted = Arc::clone(&deleted);
        thread::spawn(move || {
            let token = ThreadToken::attach();
            let handle = table.multi_get(&token);
            let value = handle.get(&ByValue(7), None).expect("value present");
            assert_eq!(*value, 7);
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            // The outstanding reference must still be valid, and the delete
            // functor must not have fired while this section is open.
            assert_eq!(*value, 7);
            assert!(!deleted.load(Ordering::SeqCst));
            drop(handle);
        })
    };

    held_rx.recv().unwrap();
    let remover = {
        let table = Arc::clone(&table);
        let deleted = Arc::clone(&deleted);
        thread::spawn(move || {
            let token = ThreadToken::attach();
            assert!(table.remove(&token, &ByValue(7), |v| {
                assert_eq!(*v, 7);
                deleted.store(true, Ordering::SeqCst);
            }));
        })
    };

    // The unlink happens immediately, but reclamation must stall on the
    // open section.
    thread::sleep(Duration::from_millis(200));
    assert!(!deleted.load(Ordering::SeqCst));

    release_tx.send(()).unwrap();
    reader.join().unwrap();
    remover.join().unwrap();
    assert!(deleted.load(Ordering::SeqCst));

    let token = ThreadToken::attach();
    assert!(!table.get(&token, &ByValue(7), |_| (), None));
}

#[test]
fn bulk_delete_with_concurrent_readers() {
    const KEYS: u64 = 10_000;

    let table = Arc::new(ConcurrentHashTable::<U64Config>::with_sizes(10, 20, 4));
    {
        let token = ThreadToken::attach();
        for key in 0..KEYS {
            assert!(table.insert(&token, &ByValue(key), || key, |_, _| (), None));
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let table = Arc::clone(&table);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let token = ThreadToken::attach();
            while !done.load(Ordering::Relaxed) {
                // Odd keys are never deleted and must stay findable.
                for key in (1..KEYS).step_by(26) {
                    assert!(table.get(&token, &ByValue(key), |_| (), None));
                }
            }
        })
    };

    let deleted = {
        let token = ThreadToken::attach();
        let deleted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&deleted);
        table.bulk_delete(&token, |v| v % 2 == 0, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        deleted.load(Ordering::Relaxed)
    };
    done.store(true, Ordering::Relaxed);
    reader.join().unwrap();

    assert_eq!(deleted, (KEYS / 2) as usize);
    let token = ThreadToken::attach();
    for key in 0..KEYS {
        let found = table.get(&token, &ByValue(key), |_| (), None);
        assert_eq!(found, key % 2 == 1, "key {key}");
    }
}

#[test]
fn concurrent_inserts_then_grow_preserves_all_keys() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 2_000;

    let table = Arc::new(ConcurrentHashTable::<U64Config>::with_sizes(8, 20, 4));
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let writers: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let token = ThreadToken::attach();
                barrier.wait();
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    assert!(table.insert(&token, &ByValue(key), || key, |_, _| (), None));
                }
            })
        })
        .collect();

    // Resize while the writers are running.
    {
        let token = ThreadToken::attach();
        let _ = table.grow(&token, 11);
    }
    for writer in writers {
        writer.join().unwrap();
    }

    let token = ThreadToken::attach();
    let mut count = 0;
    assert!(table.try_scan(&token, |_| {
        count += 1;
        true
    }));
    assert_eq!(count, (THREADS * PER_THREAD) as usize);
}
