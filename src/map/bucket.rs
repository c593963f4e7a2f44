use std::alloc::Layout;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::{hint, thread};

use super::TableConfig;
use crate::epoch::SPIN_PAUSES_PER_YIELD;

pub(crate) const STATE_LOCK_BIT: usize = 0b01;
pub(crate) const STATE_REDIRECT_BIT: usize = 0b10;
const STATE_MASK: usize = STATE_LOCK_BIT | STATE_REDIRECT_BIT;

// 2^5 = 32 buckets
pub(crate) const SIZE_SMALL_LOG2: usize = 5;
// 2^30 = 1G buckets
pub(crate) const SIZE_BIG_LOG2: usize = 30;

#[inline]
fn state_of<V>(raw: *mut Node<V>) -> usize {
    raw as usize & STATE_MASK
}

#[inline]
fn clear_state<V>(raw: *mut Node<V>) -> *mut Node<V> {
    (raw as usize & !STATE_MASK) as *mut Node<V>
}

#[inline]
fn set_state<V>(node: *mut Node<V>, state: usize) -> *mut Node<V> {
    (clear_state(node) as usize | state) as *mut Node<V>
}

/// A single chained entry: the value and an acquire/release next pointer.
///
/// Chain cells are plain atomic pointers whose two low bits are reserved for
/// the bucket state, so the same assign helpers work on a bucket's head cell
/// (which carries the state bits) and on interior next cells (which never
/// do). The 4-byte *minimum* alignment reserves the space for the 2-bit
/// state.
#[repr(align(4))]
pub(crate) struct Node<V> {
    next: AtomicPtr<Node<V>>,
    value: V,
}

impl<V> Node<V> {
    pub(crate) fn create<C>(value: V, next: *mut Node<V>) -> *mut Node<V>
    where
        C: TableConfig<Value = V>,
    {
        let layout = Layout::new::<Node<V>>();
        let node = C::allocate_node(layout).cast::<Node<V>>();
        assert!(!node.is_null(), "node allocation failed");
        unsafe {
            node.write(Node {
                next: AtomicPtr::new(next),
                value,
            });
        }
        node
    }

    /// Drops the value and returns the memory to the config's allocator.
    ///
    /// # Safety
    ///
    /// `node` must come from [`Node::create`] with the same config, must not
    /// be reachable from any bucket, and no reader critical section that
    /// could have observed it may still be open.
    pub(crate) unsafe fn destroy<C>(node: *mut Node<V>)
    where
        C: TableConfig<Value = V>,
    {
        ptr::drop_in_place(node);
        C::free_node(node.cast(), Layout::new::<Node<V>>());
    }

    pub(crate) fn next(&self) -> *mut Node<V> {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn next_cell(&self) -> &AtomicPtr<Node<V>> {
        &self.next
    }

    /// Only for nodes not yet published to any chain.
    pub(crate) fn set_next(&self, next: *mut Node<V>) {
        self.next.store(next, Ordering::Relaxed);
    }

    pub(crate) fn value(&self) -> &V {
        &self.value
    }
}

/// Head of a chain plus the two state bits packed into the pointer's low
/// bits.
///
/// State machine on the head cell:
///
/// - clean -> locked: `trylock` (CAS, fails against any state bit)
/// - locked -> clean: `unlock` (release store, forbidden once redirected)
/// - locked -> redirect: `redirect` (release store; terminal)
///
/// Readers traverse locked chains freely; only the redirect bit reroutes
/// them.
pub(crate) struct Bucket<V> {
    first: AtomicPtr<Node<V>>,
}

impl<V> Bucket<V> {
    fn first_raw(&self) -> *mut Node<V> {
        self.first.load(Ordering::Acquire)
    }

    /// The head node with the state bits stripped.
    pub(crate) fn first(&self) -> *mut Node<V> {
        clear_state(self.first_raw())
    }

    pub(crate) fn first_cell(&self) -> &AtomicPtr<Node<V>> {
        &self.first
    }

    pub(crate) fn have_redirect(&self) -> bool {
        state_of(self.first_raw()) & STATE_REDIRECT_BIT != 0
    }

    pub(crate) fn is_locked(&self) -> bool {
        state_of(self.first_raw()) & STATE_LOCK_BIT != 0
    }

    pub(crate) fn trylock(&self) -> bool {
        let current = self.first_raw();
        if state_of(current) & STATE_LOCK_BIT != 0 {
            return false;
        }
        // We will expect a clean first pointer.
        let head = clear_state(current);
        self.first
            .compare_exchange(
                head,
                set_state(head, STATE_LOCK_BIT),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn lock(&self) {
        let mut pauses: u32 = 0;
        // A sleeping backoff would be unfair here.
        while !self.trylock() {
            pauses += 1;
            if pauses == SPIN_PAUSES_PER_YIELD {
                // Yielding gives the CPU to another runnable thread when
                // none is available.
                thread::yield_now();
                pauses = 0;
            } else {
                hint::spin_loop();
            }
        }
    }

    pub(crate) fn unlock(&self) {
        debug_assert!(self.is_locked(), "must be locked");
        debug_assert!(
            !self.have_redirect(),
            "unlocking a bucket after it has reached terminal state"
        );
        self.first.store(self.first(), Ordering::Release);
    }

    /// Marks the bucket as moved to the new table. Terminal.
    pub(crate) fn redirect(&self) {
        debug_assert!(self.is_locked(), "must be locked");
        let current = self.first.load(Ordering::Relaxed);
        self.first.store(
            set_state(current, state_of(current) | STATE_REDIRECT_BIT),
            Ordering::Release,
        );
    }

    /// Installs `node` as the new head, expecting a clean head cell equal to
    /// `expect`. Fails if the bucket is locked or redirected.
    pub(crate) fn cas_first(&self, node: *mut Node<V>, expect: *mut Node<V>) -> bool {
        if self.is_locked() {
            return false;
        }
        self.first
            .compare_exchange(expect, node, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Copies another bucket's raw head cell, state bits included. Used by
    /// the resize paths before the source bucket is redirected; the copy is
    /// published by that redirect store.
    pub(crate) fn copy_raw_from(&self, src: &Bucket<V>) {
        self.first.store(src.first_raw(), Ordering::Relaxed);
    }

    /// Walks to the end of the chain and assigns `node` as the last next
    /// pointer. The bucket must be locked.
    pub(crate) fn release_assign_last_node_next(&self, node: *mut Node<V>) {
        debug_assert!(self.is_locked(), "must be locked");
        let mut cell = &self.first;
        loop {
            let next = clear_state(cell.load(Ordering::Acquire));
            if next.is_null() {
                break;
            }
            cell = unsafe { (*next).next_cell() };
        }
        release_assign_node_ptr(cell, node);
    }
}

/// Release-stores `node` into `dst`, preserving whatever state bits `dst`
/// currently carries. `dst` may be a locked bucket's head cell or any
/// interior next cell; either way the caller must hold the bucket lock of
/// the chain that contains it.
pub(crate) fn release_assign_node_ptr<V>(dst: &AtomicPtr<Node<V>>, node: *mut Node<V>) {
    let state = state_of(dst.load(Ordering::Relaxed));
    dst.store(set_state(node, state), Ordering::Release);
}

/// A power-of-two array of buckets. Immutable in shape once published; the
/// buckets mutate independently.
pub(crate) struct InternalTable<V> {
    buckets: Box<[Bucket<V>]>,
    log2_size: usize,
    size: usize,
    hash_mask: u64,
}

impl<V> InternalTable<V> {
    pub(crate) fn new(log2_size: usize) -> Self {
        assert!(
            (SIZE_SMALL_LOG2..=SIZE_BIG_LOG2).contains(&log2_size),
            "bad table size"
        );
        let size = 1usize << log2_size;
        let mut buckets = Vec::with_capacity(size);

        // A zeroed cell is a null head with no state bits set.
        unsafe {
            ptr::write_bytes(buckets.as_mut_ptr(), 0, size);
            buckets.set_len(size);
        }

        Self {
            buckets: buckets.into_boxed_slice(),
            log2_size,
            size,
            hash_mask: (size as u64) - 1,
        }
    }

    pub(crate) fn log2_size(&self) -> usize {
        self.log2_size
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn bucket(&self, index: usize) -> &Bucket<V> {
        &self.buckets[index]
    }

    pub(crate) fn bucket_index(&self, hash: u64) -> usize {
        (hash & self.hash_mask) as usize
    }

    pub(crate) fn bucket_for(&self, hash: u64) -> &Bucket<V> {
        self.bucket(self.bucket_index(hash))
    }
}

// Retired bucket heads are stamped with this in debug builds; dereferencing
// one means a reader reached a bucket past its redirect grace period.
#[cfg(debug_assertions)]
pub(crate) fn poison_node<V>() -> *mut Node<V> {
    // Two low bits clear, so the state bits stay representable.
    (usize::MAX << 2) as *mut Node<V>
}

/// Best-effort read prefetch, used by the bulk-delete probe.
#[inline]
pub(crate) fn prefetch_read<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(ptr.cast::<i8>());
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}
