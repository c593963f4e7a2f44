//! A global-counter reclamation primitive in the style of RCU.
//!
//! Readers bracket their work with critical sections on a shared version
//! counter. A writer calls [`write_synchronize`] after unlinking shared
//! data; the call returns once every critical section that was open at call
//! time has ended, at which point no reader can still hold a reference to
//! the unlinked data and it may be destroyed.
//!
//! Every participating thread attaches a [`ThreadToken`] once and passes it
//! to each table operation. The token owns a cache-padded slot in a global
//! registry; entering a critical section publishes the current counter
//! version into the slot, leaving one clears it. `write_synchronize` bumps
//! the version and then waits, per slot, until the slot is either inactive
//! or has observed the bumped version.

use std::cell::Cell;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::{hint, thread};

use crossbeam_utils::CachePadded;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

// Plain spin/yield loops are used instead of a backoff with sleeping;
// a sleeping waiter would be unfair against short critical sections.
pub(crate) const SPIN_PAUSES_PER_YIELD: u32 = 8192;

const ACTIVE_BIT: u64 = 1;
const VERSION_STEP: u64 = 2;

struct ReaderSlot {
    state: AtomicU64,
}

struct Registry {
    version: CachePadded<AtomicU64>,
    readers: Mutex<Vec<Arc<CachePadded<ReaderSlot>>>>,
    next_token_id: AtomicU64,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    version: CachePadded::new(AtomicU64::new(0)),
    readers: Mutex::new(Vec::new()),
    next_token_id: AtomicU64::new(1),
});

/// Per-thread handle for the reclamation scheme.
///
/// Attach one token per thread and pass it to every table operation. The
/// token deregisters itself when dropped. Tokens are `Send` but not `Sync`;
/// they must not be shared between threads.
pub struct ThreadToken {
    slot: Arc<CachePadded<ReaderSlot>>,
    id: u64,
    nesting: Cell<u32>,
}

impl ThreadToken {
    /// Registers the calling thread with the global reader registry.
    pub fn attach() -> Self {
        let slot = Arc::new(CachePadded::new(ReaderSlot {
            state: AtomicU64::new(0),
        }));
        REGISTRY.readers.lock().push(Arc::clone(&slot));
        let id = REGISTRY.next_token_id.fetch_add(1, Ordering::Relaxed);
        Self {
            slot,
            id,
            nesting: Cell::new(0),
        }
    }

    /// Non-zero id, stable for the lifetime of the token.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Opens a critical section. Sections may nest; only the outermost
    /// entry touches the shared slot.
    pub(crate) fn critical_section_begin(&self) {
        let nesting = self.nesting.get();
        if nesting == 0 {
            let version = REGISTRY.version.load(Ordering::SeqCst);
            self.slot.state.store(version | ACTIVE_BIT, Ordering::SeqCst);
            // The slot store must be visible before any read of shared data,
            // and pairs with the fence in `write_synchronize`.
            fence(Ordering::SeqCst);
        }
        self.nesting.set(nesting + 1);
    }

    /// Closes a critical section opened with [`critical_section_begin`].
    ///
    /// [`critical_section_begin`]: ThreadToken::critical_section_begin
    pub(crate) fn critical_section_end(&self) {
        let nesting = self.nesting.get();
        debug_assert!(nesting > 0, "unbalanced critical section");
        self.nesting.set(nesting - 1);
        if nesting == 1 {
            self.slot.state.store(0, Ordering::Release);
        }
    }
}

impl Drop for ThreadToken {
    fn drop(&mut self) {
        debug_assert_eq!(self.nesting.get(), 0, "detached inside a critical section");
        let mut readers = REGISTRY.readers.lock();
        readers.retain(|slot| !Arc::ptr_eq(slot, &self.slot));
    }
}

impl std::fmt::Debug for ThreadToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadToken").field("id", &self.id).finish()
    }
}

/// Scoped reader critical section.
///
/// Node references obtained from the table stay valid until the section is
/// dropped.
pub struct CriticalSection<'a> {
    token: &'a ThreadToken,
}

impl<'a> CriticalSection<'a> {
    pub fn new(token: &'a ThreadToken) -> Self {
        token.critical_section_begin();
        Self { token }
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.token.critical_section_end();
    }
}

/// Waits until every critical section that was open at call time has ended.
///
/// Establishes a happens-before between the caller's prior writes and the
/// return of the call: once it returns, data unlinked before the call can be
/// destroyed without any reader observing it.
pub fn write_synchronize() {
    // Pairs with the fence in `critical_section_begin`: either a reader's
    // slot store is visible to the scan below and we wait for it, or the
    // reader's subsequent loads see everything written before this fence.
    fence(Ordering::SeqCst);
    let target = REGISTRY.version.fetch_add(VERSION_STEP, Ordering::SeqCst) + VERSION_STEP;
    let readers = REGISTRY.readers.lock().clone();
    for slot in &readers {
        let mut pauses: u32 = 0;
        loop {
            let state = slot.state.load(Ordering::SeqCst);
            if state & ACTIVE_BIT == 0 || (state & !ACTIVE_BIT) >= target {
                break;
            }
            pauses += 1;
            if pauses == SPIN_PAUSES_PER_YIELD {
                thread::yield_now();
                pauses = 0;
            } else {
                hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{write_synchronize, CriticalSection, ThreadToken};

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn nested_sections() {
        let token = ThreadToken::attach();
        token.critical_section_begin();
        token.critical_section_begin();
        token.critical_section_end();
        // Still active; the outer section is open.
        assert_eq!(token.nesting.get(), 1);
        token.critical_section_end();
        assert_eq!(token.nesting.get(), 0);
    }

    #[test]
    fn synchronize_without_readers_completes() {
        let _token = ThreadToken::attach();
        write_synchronize();
    }

    #[test]
    fn synchronize_waits_for_open_section() {
        let done = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let reader = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let token = ThreadToken::attach();
                let cs = CriticalSection::new(&token);
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                assert!(!done.load(Ordering::SeqCst));
                drop(cs);
            })
        };

        entered_rx.recv().unwrap();
        let writer = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                write_synchronize();
                done.store(true, Ordering::SeqCst);
            })
        };

        // The writer must not finish while the reader section is open.
        thread::sleep(Duration::from_millis(200));
        assert!(!done.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        reader.join().unwrap();
        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn section_opened_after_synchronize_does_not_block_it() {
        let token = ThreadToken::attach();
        write_synchronize();
        let _cs = CriticalSection::new(&token);
        // A fresh section observes the bumped version; another synchronize
        // from this thread would deadlock on our own slot, so just check the
        // recorded version is current.
        let state = token.slot.state.load(Ordering::SeqCst);
        assert_eq!(state & 1, 1);
    }
}
