//! The concurrent hash table and its policy traits.
//!
//! Point operations (get, insert, remove) run inside short reader critical
//! sections and touch a single bucket. Bulk operations (scan, bulk delete,
//! grow, shrink, node moving) serialize on the table's resize lock and walk
//! the bucket array. The two kinds coexist: a resize reroutes point
//! operations bucket by bucket through the redirect protocol described in
//! the crate documentation.

pub(crate) mod bucket;
pub(crate) mod stats;

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::{cmp, fmt, hint, thread};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

use crate::epoch::{self, ThreadToken, SPIN_PAUSES_PER_YIELD};
use self::bucket::{
    prefetch_read, release_assign_node_ptr, Bucket, InternalTable, Node, SIZE_BIG_LOG2,
    SIZE_SMALL_LOG2,
};
use self::stats::ChainSummary;

/// Upper bound on nodes unlinked per bucket lock acquisition during
/// cleaning and bulk deletion.
pub(crate) const BULK_DELETE_LIMIT: usize = 256;

const DEFAULT_START_SIZE_LOG2: usize = SIZE_SMALL_LOG2;
const DEFAULT_GROW_HINT: usize = 4;

/// Storage policy for a [`ConcurrentHashTable`].
///
/// The table never hashes or compares values itself; this trait supplies
/// the hash, the miss sentinel for [`ConcurrentHashTable::get_copy`], and
/// the node allocator. `get_hash` may report a value as dead (tombstoned),
/// in which case resizes drop the node and lookups schedule opportunistic
/// cleaning.
pub trait TableConfig {
    type Value;

    fn get_hash(value: &Self::Value, is_dead: &mut bool) -> u64;

    /// Sentinel returned by [`ConcurrentHashTable::get_copy`] on a miss.
    fn notfound() -> Self::Value;

    fn allocate_node(layout: Layout) -> *mut u8 {
        unsafe { std::alloc::alloc(layout) }
    }

    /// # Safety
    ///
    /// `memory` must have come from `allocate_node` with the same layout.
    unsafe fn free_node(memory: *mut u8, layout: Layout) {
        std::alloc::dealloc(memory, layout)
    }
}

/// A single lookup: the key's hash plus an equality predicate over stored
/// values.
///
/// `equals` may report a value as dead without matching it; dead values are
/// treated as misses and cleaned opportunistically.
pub trait Lookup<V> {
    fn hash(&self) -> u64;

    fn equals(&self, value: &V, is_dead: &mut bool) -> bool;
}

/// A concurrent, resizable, open-chaining hash table.
///
/// Readers never block. Writers take at most a per-bucket lock. Grow,
/// shrink, scans and bulk deletes serialize on an internal resize lock and
/// run concurrently with point operations. Deleted nodes are reclaimed
/// through the [`epoch`](crate::epoch) scheme: they are destroyed only
/// after every reader critical section open at unlink time has ended.
///
/// All operations take a [`ThreadToken`] attached by the calling thread.
pub struct ConcurrentHashTable<C: TableConfig> {
    table: AtomicPtr<InternalTable<C::Value>>,
    new_table: AtomicPtr<InternalTable<C::Value>>,
    log2_start_size: usize,
    log2_size_limit: usize,
    grow_hint: usize,
    size_limit_reached: AtomicBool,
    resize_lock: RawMutex,
    resize_lock_owner: AtomicU64,
    invisible_epoch: AtomicU64,
    _config: PhantomData<C>,
}

unsafe impl<C: TableConfig> Send for ConcurrentHashTable<C> where C::Value: Send {}
unsafe impl<C: TableConfig> Sync for ConcurrentHashTable<C> where C::Value: Send + Sync {}

/// Reader critical section bound to one table: entering publishes the
/// current version by clearing the table's invisible epoch.
struct ScopedCS<'a> {
    token: &'a ThreadToken,
}

impl<'a> ScopedCS<'a> {
    fn new<C: TableConfig>(token: &'a ThreadToken, cht: &ConcurrentHashTable<C>) -> Self {
        token.critical_section_begin();
        // This version is published now.
        if cht.invisible_epoch.load(Ordering::SeqCst) != 0 {
            cht.invisible_epoch.store(0, Ordering::SeqCst);
            fence(Ordering::SeqCst);
        }
        Self { token }
    }
}

impl Drop for ScopedCS<'_> {
    fn drop(&mut self) {
        self.token.critical_section_end();
    }
}

/// Scoped handle performing several `get` calls inside one reader critical
/// section. Returned references stay valid for the handle's lifetime.
pub struct MultiGetHandle<'a, C: TableConfig> {
    cht: &'a ConcurrentHashTable<C>,
    _cs: ScopedCS<'a>,
}

impl<'a, C: TableConfig> MultiGetHandle<'a, C> {
    pub fn get<L: Lookup<C::Value>>(
        &self,
        lookup: &L,
        grow_hint: Option<&mut bool>,
    ) -> Option<&C::Value> {
        self.cht.internal_get(lookup, grow_hint)
    }
}

impl<C: TableConfig> ConcurrentHashTable<C> {
    /// A table with the default start size (32 buckets), the maximum size
    /// limit and the default grow hint.
    pub fn new() -> Self {
        Self::with_sizes(DEFAULT_START_SIZE_LOG2, SIZE_BIG_LOG2, DEFAULT_GROW_HINT)
    }

    /// A table of `2^log2_start_size` buckets that will never grow beyond
    /// `2^log2_size_limit`. Lookups report a grow hint once a chain walk
    /// exceeds `grow_hint` nodes.
    ///
    /// # Panics
    ///
    /// Panics unless `5 <= log2_start_size <= log2_size_limit <= 30`.
    pub fn with_sizes(log2_start_size: usize, log2_size_limit: usize, grow_hint: usize) -> Self {
        assert!(
            log2_start_size >= SIZE_SMALL_LOG2
                && log2_size_limit <= SIZE_BIG_LOG2
                && log2_start_size <= log2_size_limit,
            "bad table size bounds"
        );
        let table = Box::into_raw(Box::new(InternalTable::new(log2_start_size)));
        Self {
            table: AtomicPtr::new(table),
            new_table: AtomicPtr::new(ptr::null_mut()),
            log2_start_size,
            log2_size_limit,
            grow_hint,
            size_limit_reached: AtomicBool::new(log2_start_size == log2_size_limit),
            resize_lock: RawMutex::INIT,
            resize_lock_owner: AtomicU64::new(0),
            invisible_epoch: AtomicU64::new(0),
            _config: PhantomData,
        }
    }

    /// The current log2 of the bucket count.
    pub fn get_size_log2(&self, token: &ThreadToken) -> usize {
        let _cs = ScopedCS::new(token, self);
        self.get_table().log2_size()
    }

    /// Looks up a value and hands a reference to `found_f`. Returns whether
    /// a live value was found. The reference is valid only inside the
    /// callback.
    ///
    /// `grow_hint`, when supplied, is set when the chain walk was longer
    /// than the configured threshold and the caller should consider
    /// [`grow`](Self::grow)ing the table.
    pub fn get<L, F>(
        &self,
        token: &ThreadToken,
        lookup: &L,
        found_f: F,
        grow_hint: Option<&mut bool>,
    ) -> bool
    where
        L: Lookup<C::Value>,
        F: FnOnce(&C::Value),
    {
        let _cs = ScopedCS::new(token, self);
        match self.internal_get(lookup, grow_hint) {
            Some(value) => {
                found_f(value);
                true
            }
            None => false,
        }
    }

    /// Looks up a value and returns a clone of it, or
    /// [`TableConfig::notfound`] on a miss.
    pub fn get_copy<L>(&self, token: &ThreadToken, lookup: &L, grow_hint: Option<&mut bool>) -> C::Value
    where
        L: Lookup<C::Value>,
        C::Value: Clone,
    {
        let _cs = ScopedCS::new(token, self);
        self.internal_get(lookup, grow_hint)
            .cloned()
            .unwrap_or_else(C::notfound)
    }

    /// Opens a handle for several lookups under one critical section.
    pub fn multi_get<'a>(&'a self, token: &'a ThreadToken) -> MultiGetHandle<'a, C> {
        MultiGetHandle {
            cht: self,
            _cs: ScopedCS::new(token, self),
        }
    }

    /// Inserts the value produced by `value_f` unless `lookup` already
    /// matches a live value. `callback` receives `(true, &new)` after a
    /// successful insert or `(false, &existing)` for a duplicate; the
    /// reference is valid only inside the callback. Returns whether the
    /// insert happened.
    ///
    /// The fast path is a single compare-and-swap on the bucket head. If
    /// the walk to the duplicate check saw a dead value and the fast path
    /// succeeded on the first try, the bucket is relocked afterwards and a
    /// batch of dead nodes is cleaned out.
    pub fn insert<L, VF, CB>(
        &self,
        token: &ThreadToken,
        lookup: &L,
        value_f: VF,
        callback: CB,
        grow_hint: Option<&mut bool>,
    ) -> bool
    where
        L: Lookup<C::Value>,
        VF: FnOnce() -> C::Value,
        CB: FnOnce(bool, &C::Value),
    {
        let mut ret = false;
        let mut clean = false;
        let mut loops = 0;
        let mut retries = 0;
        let mut new_node: *mut Node<C::Value> = ptr::null_mut();
        let mut value_f = Some(value_f);
        let mut callback = Some(callback);
        let hash = lookup.hash();

        loop {
            let mut locked = false;
            {
                let _cs = ScopedCS::new(token, self);
                let bucket = self.get_bucket(hash);

                let first_at_start = bucket.first();
                let old = Self::get_node(bucket, lookup, &mut clean, &mut loops);
                if old.is_null() {
                    // No duplicate found.
                    if new_node.is_null() {
                        let value = (value_f.take().expect("value factory reused"))();
                        new_node = Node::create::<C>(value, first_at_start);
                    } else {
                        unsafe { (*new_node).set_next(first_at_start) };
                    }
                    if bucket.cas_first(new_node, first_at_start) {
                        let cb = callback.take().expect("callback reused");
                        cb(true, unsafe { (*new_node).value() });
                        new_node = ptr::null_mut();
                        ret = true;
                        break;
                    }
                    // CAS failed; leave the critical section and retry.
                    locked = bucket.is_locked();
                } else {
                    // There is a duplicate.
                    let cb = callback.take().expect("callback reused");
                    cb(false, unsafe { (*old).value() });
                    break;
                }
            }
            retries += 1;
            if locked {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }

        if !new_node.is_null() {
            // The CAS failed and a duplicate raced in; the prepared node was
            // never published.
            unsafe { Node::destroy::<C>(new_node) };
        } else if retries == 0 && clean {
            // Cleaning is amortized onto smooth inserts only.
            let bucket = self.get_bucket_locked(token, hash);
            self.delete_in_bucket(bucket, lookup);
            bucket.unlock();
        }

        if let Some(grow_hint) = grow_hint {
            *grow_hint = loops > self.grow_hint;
        }

        ret
    }

    /// Removes the first value matching `lookup`. The delete functor runs
    /// after a grace period, immediately before the node is destroyed.
    /// Returns whether a value was removed.
    pub fn remove<L, D>(&self, token: &ThreadToken, lookup: &L, delete_f: D) -> bool
    where
        L: Lookup<C::Value>,
        D: FnOnce(&C::Value),
    {
        let bucket = self.get_bucket_locked(token, lookup.hash());
        let mut rem_prev = bucket.first_cell();
        let mut rem = bucket.first();
        let mut have_dead = false;
        while !rem.is_null() {
            if lookup.equals(unsafe { (*rem).value() }, &mut have_dead) {
                release_assign_node_ptr(rem_prev, unsafe { (*rem).next() });
                break;
            }
            unsafe {
                rem_prev = (*rem).next_cell();
                rem = (*rem).next();
            }
        }

        bucket.unlock();

        if rem.is_null() {
            return false;
        }
        // Publish the deletion before reclaiming.
        epoch::write_synchronize();
        delete_f(unsafe { (*rem).value() });
        unsafe { Node::destroy::<C>(rem) };
        true
    }

    /// Visits every value; the visitor returns `false` to stop. Fails
    /// without visiting anything if the resize lock cannot be taken.
    pub fn try_scan<F>(&self, token: &ThreadToken, mut scan_f: F) -> bool
    where
        F: FnMut(&C::Value) -> bool,
    {
        if !self.try_resize_lock(token) {
            return false;
        }
        self.do_scan_locked(token, &mut scan_f);
        self.unlock_resize_lock(token);
        true
    }

    /// Visits every value, blocking until the resize lock is available.
    pub fn do_scan<F>(&self, token: &ThreadToken, mut scan_f: F)
    where
        F: FnMut(&C::Value) -> bool,
    {
        debug_assert_ne!(
            self.resize_lock_owner.load(Ordering::Relaxed),
            token.id(),
            "already own the resize lock"
        );
        self.lock_resize_lock(token);
        self.do_scan_locked(token, &mut scan_f);
        self.unlock_resize_lock(token);
    }

    /// Deletes every value accepted by `eval_f`, invoking `del_f` on each
    /// before destruction. Fails without deleting anything if the resize
    /// lock cannot be taken.
    pub fn try_bulk_delete<E, D>(&self, token: &ThreadToken, mut eval_f: E, mut del_f: D) -> bool
    where
        E: FnMut(&C::Value) -> bool,
        D: FnMut(&C::Value),
    {
        if !self.try_resize_lock(token) {
            return false;
        }
        self.do_bulk_delete_locked(token, &mut eval_f, &mut del_f);
        self.unlock_resize_lock(token);
        true
    }

    /// Deletes every value accepted by `eval_f`, blocking until the resize
    /// lock is available.
    pub fn bulk_delete<E, D>(&self, token: &ThreadToken, mut eval_f: E, mut del_f: D)
    where
        E: FnMut(&C::Value) -> bool,
        D: FnMut(&C::Value),
    {
        self.lock_resize_lock(token);
        self.do_bulk_delete_locked(token, &mut eval_f, &mut del_f);
        self.unlock_resize_lock(token);
    }

    /// Doubles the table until it has `2^log2_size` buckets, or until the
    /// size limit is reached. `0` means "grow to the limit". Returns
    /// `false` if the target is already met, the limit was reached, or a
    /// concurrent bulk operation holds the resize lock.
    pub fn grow(&self, token: &ThreadToken, log2_size: usize) -> bool {
        let target = if log2_size == 0 {
            self.log2_size_limit
        } else {
            cmp::min(log2_size, self.log2_size_limit)
        };
        self.internal_grow(token, target)
    }

    /// Halves the table until it has `2^log2_size` buckets, never going
    /// below the start size. `0` means "shrink to the start size". Returns
    /// `false` if the target is already met or the resize lock is
    /// contended.
    pub fn shrink(&self, token: &ThreadToken, log2_size: usize) -> bool {
        self.internal_shrink(token, log2_size)
    }

    /// Single-threaded insert without locking or epoch protection: one
    /// compare-and-swap on the bucket head. Values with a dead hash are
    /// refused. Exclusive access (`&mut self`) is the quiescence the fast
    /// path relies on.
    pub fn unsafe_insert(&mut self, value: C::Value) -> bool {
        let mut dead_hash = false;
        let hash = C::get_hash(&value, &mut dead_hash);
        if dead_hash {
            return false;
        }
        let table = self.get_table();
        let bucket = table.bucket_for(hash);
        debug_assert!(
            !bucket.have_redirect() && !bucket.is_locked(),
            "table must be uncontended"
        );
        let first = bucket.first();
        let node = Node::create::<C>(value, first);
        let ok = bucket.cas_first(node, first);
        debug_assert!(ok, "uncontended cas must work");
        ok
    }

    /// Pops every node of this table and prepends it into `to_cht`,
    /// rehashing through the destination's table. Values with a dead hash
    /// are dropped. The destination must not be resizing concurrently.
    /// Returns `false` if this table's resize lock cannot be taken.
    pub fn try_move_nodes_to(&mut self, token: &ThreadToken, to_cht: &Self) -> bool {
        if !self.try_resize_lock(token) {
            return false;
        }
        debug_assert!(
            self.new_table.load(Ordering::Relaxed).is_null(),
            "resize in progress"
        );
        let table = self.get_table();
        for bucket_it in 0..table.size() {
            let bucket = table.bucket(bucket_it);
            debug_assert!(
                !bucket.have_redirect() && !bucket.is_locked(),
                "table must be uncontended"
            );
            loop {
                let move_node = bucket.first();
                if move_node.is_null() {
                    break;
                }
                if !bucket.cas_first(unsafe { (*move_node).next() }, move_node) {
                    continue;
                }
                let mut dead_hash = false;
                let insert_hash = C::get_hash(unsafe { (*move_node).value() }, &mut dead_hash);
                if dead_hash {
                    // Exclusive access; no grace period needed.
                    unsafe { Node::destroy::<C>(move_node) };
                    continue;
                }
                loop {
                    let insert_bucket = to_cht.get_bucket(insert_hash);
                    let first = insert_bucket.first();
                    unsafe { (*move_node).set_next(first) };
                    if insert_bucket.cas_first(move_node, first) {
                        break;
                    }
                }
            }
        }
        self.unlock_resize_lock(token);
        true
    }

    /// Writes chain-length statistics to `sink`. Buckets that are locked or
    /// redirected at visit time are skipped, so the numbers are advisory.
    /// Prints a placeholder line if the resize lock cannot be taken.
    pub fn statistics_to<F, W>(
        &self,
        token: &ThreadToken,
        mut value_size_f: F,
        sink: &mut W,
        table_name: &str,
    ) -> fmt::Result
    where
        F: FnMut(&C::Value) -> usize,
        W: fmt::Write,
    {
        if !self.try_resize_lock(token) {
            return writeln!(sink, "statistics unavailable at this moment");
        }

        let mut summary = ChainSummary::default();
        let mut literal_bytes: usize = 0;
        let table = self.get_table();
        for bucket_it in 0..table.size() {
            let _cs = ScopedCS::new(token, self);
            let bucket = table.bucket(bucket_it);
            if bucket.have_redirect() || bucket.is_locked() {
                continue;
            }
            let mut count = 0usize;
            let mut node = bucket.first();
            while !node.is_null() {
                count += 1;
                unsafe {
                    literal_bytes += value_size_f((*node).value());
                    node = (*node).next();
                }
            }
            summary.add(count as f64);
        }
        self.unlock_resize_lock(token);

        let num_buckets = summary.num();
        let num_entries = summary.sum() as usize;

        let bucket_bytes = num_buckets * mem::size_of::<Bucket<C::Value>>();
        let entry_bytes = num_entries * mem::size_of::<Node<C::Value>>();
        let total_bytes = literal_bytes + bucket_bytes + entry_bytes;

        let bucket_size = if num_buckets == 0 { 0 } else { bucket_bytes / num_buckets };
        let entry_size = if num_entries == 0 { 0 } else { entry_bytes / num_entries };

        writeln!(sink, "{table_name} statistics:")?;
        writeln!(
            sink,
            "Number of buckets       : {num_buckets:9} = {bucket_bytes:9} bytes, each {bucket_size}"
        )?;
        writeln!(
            sink,
            "Number of entries       : {num_entries:9} = {entry_bytes:9} bytes, each {entry_size}"
        )?;
        if literal_bytes != 0 {
            let literal_avg = if num_entries == 0 {
                0.0
            } else {
                literal_bytes as f64 / num_entries as f64
            };
            writeln!(
                sink,
                "Number of literals      : {num_entries:9} = {literal_bytes:9} bytes, avg {literal_avg:7.3}"
            )?;
        }
        writeln!(sink, "Total footprint         : {:9} = {total_bytes:9} bytes", "")?;
        writeln!(sink, "Average bucket size     : {:9.3}", summary.avg())?;
        writeln!(sink, "Variance of bucket size : {:9.3}", summary.variance())?;
        writeln!(sink, "Std. dev. of bucket size: {:9.3}", summary.sd())?;
        writeln!(sink, "Maximum bucket size     : {:9}", summary.maximum() as usize)
    }
}

// Internal machinery.
impl<C: TableConfig> ConcurrentHashTable<C> {
    fn get_table(&self) -> &InternalTable<C::Value> {
        unsafe { &*self.table.load(Ordering::Acquire) }
    }

    fn get_new_table(&self) -> &InternalTable<C::Value> {
        let new_table = self.new_table.load(Ordering::Acquire);
        debug_assert!(!new_table.is_null(), "no table under construction");
        unsafe { &*new_table }
    }

    fn is_max_size_reached(&self) -> bool {
        self.size_limit_reached.load(Ordering::Relaxed)
    }

    /// The bucket for `hash`, following a redirect into the table under
    /// construction. Must run inside a critical section.
    fn get_bucket(&self, hash: u64) -> &Bucket<C::Value> {
        let table = self.get_table();
        let bucket = table.bucket_for(hash);
        if bucket.have_redirect() {
            // The bucket's chain has moved to the new table.
            self.get_new_table().bucket_for(hash)
        } else {
            bucket
        }
    }

    /// Locks and returns the bucket for `hash`. Each attempt runs in its
    /// own critical section so a stalled resize cannot deadlock against us.
    fn get_bucket_locked(&self, token: &ThreadToken, hash: u64) -> &Bucket<C::Value> {
        let mut pauses: u32 = 0;
        loop {
            {
                let _cs = ScopedCS::new(token, self);
                let bucket = self.get_bucket(hash);
                if bucket.trylock() {
                    return bucket;
                }
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

    /// Chain walk. Reports whether any dead value was seen and how many
    /// nodes were visited. Always called within a critical section.
    fn get_node<L: Lookup<C::Value>>(
        bucket: &Bucket<C::Value>,
        lookup: &L,
        have_dead: &mut bool,
        loops: &mut usize,
    ) -> *mut Node<C::Value> {
        let mut loop_count = 0;
        let mut node = bucket.first();
        while !node.is_null() {
            let mut is_dead = false;
            loop_count += 1;
            if lookup.equals(unsafe { (*node).value() }, &mut is_dead) {
                break;
            }
            if is_dead {
                *have_dead = true;
            }
            node = unsafe { (*node).next() };
        }
        *loops = loop_count;
        node
    }

    fn internal_get<L: Lookup<C::Value>>(
        &self,
        lookup: &L,
        grow_hint: Option<&mut bool>,
    ) -> Option<&C::Value> {
        let mut clean = false;
        let mut loops = 0;
        let bucket = self.get_bucket(lookup.hash());
        let node = Self::get_node(bucket, lookup, &mut clean, &mut loops);
        if let Some(grow_hint) = grow_hint {
            *grow_hint = loops > self.grow_hint;
        }
        unsafe { node.as_ref() }.map(Node::value)
    }

    /// Grace period that a sole writer may elide: if no reader has entered
    /// a critical section since this writer's previous synchronize, nothing
    /// can reference the prior version and the wait is skipped.
    fn write_synchronize_on_visible_epoch(&self, token: &ThreadToken) {
        debug_assert_eq!(
            self.resize_lock_owner.load(Ordering::Relaxed),
            token.id(),
            "resize lock not held"
        );
        // Prevent the load below from floating above preceding writes.
        fence(Ordering::SeqCst);
        if self.invisible_epoch.load(Ordering::SeqCst) == token.id() {
            return;
        }
        debug_assert_eq!(
            self.invisible_epoch.load(Ordering::SeqCst),
            0,
            "two threads doing bulk operations"
        );
        // Mark this version unpublished; a reader entering a critical
        // section will zero the mark.
        self.invisible_epoch.store(token.id(), Ordering::SeqCst);
        epoch::write_synchronize();
    }

    fn try_resize_lock(&self, token: &ThreadToken) -> bool {
        if !self.resize_lock.try_lock() {
            return false;
        }
        debug_assert_eq!(
            self.resize_lock_owner.load(Ordering::Relaxed),
            0,
            "resize lock owner out of sync"
        );
        self.invisible_epoch.store(0, Ordering::SeqCst);
        self.resize_lock_owner.store(token.id(), Ordering::Relaxed);
        true
    }

    fn lock_resize_lock(&self, token: &ThreadToken) {
        debug_assert_ne!(
            self.resize_lock_owner.load(Ordering::Relaxed),
            token.id(),
            "already own the resize lock"
        );
        self.resize_lock.lock();
        self.invisible_epoch.store(0, Ordering::SeqCst);
        self.resize_lock_owner.store(token.id(), Ordering::Relaxed);
    }

    fn unlock_resize_lock(&self, token: &ThreadToken) {
        self.invisible_epoch.store(0, Ordering::SeqCst);
        debug_assert_eq!(
            self.resize_lock_owner.load(Ordering::Relaxed),
            token.id(),
            "not unlocked by the owner"
        );
        self.resize_lock_owner.store(0, Ordering::Relaxed);
        unsafe { self.resize_lock.unlock() };
    }

    /// Publishes the table under construction as current and retires the
    /// old one. Returns the old table, no longer visible to any reader.
    fn set_table_from_new(&self) -> *mut InternalTable<C::Value> {
        let old_table = self.table.load(Ordering::Relaxed);
        self.table
            .store(self.new_table.load(Ordering::Relaxed), Ordering::Release);
        // All readers must have moved on before the old table is retired.
        epoch::write_synchronize();
        self.new_table.store(ptr::null_mut(), Ordering::Relaxed);
        old_table
    }

    #[cfg(debug_assertions)]
    fn verify_poisoned(table: &InternalTable<C::Value>) {
        for i in 0..table.size() {
            debug_assert!(
                table.bucket(i).first() == bucket::poison_node::<C::Value>(),
                "no poison found"
            );
        }
    }

    fn internal_grow(&self, token: &ThreadToken, log2_size: usize) -> bool {
        // Rechecked under the lock; growing means the table is loaded, so
        // checking twice is cheap compared to taking the lock for nothing.
        if self.is_max_size_reached() {
            return false;
        }
        if !self.try_resize_lock(token) {
            // An ongoing resize or a bulk operation holds the lock.
            return false;
        }
        if self.is_max_size_reached() || self.get_table().log2_size() >= log2_size {
            self.unlock_resize_lock(token);
            return false;
        }

        while !self.is_max_size_reached() && self.get_table().log2_size() < log2_size {
            let old_log2 = self.get_table().log2_size();
            let new_table = Box::into_raw(Box::new(InternalTable::new(old_log2 + 1)));
            self.new_table.store(new_table, Ordering::Release);
            if old_log2 + 1 == self.log2_size_limit {
                self.size_limit_reached.store(true, Ordering::Relaxed);
                log::debug!(
                    "hash table reached its size limit of 2^{} buckets",
                    self.log2_size_limit
                );
            }
            log::trace!("growing hash table from 2^{old_log2} to 2^{} buckets", old_log2 + 1);

            self.internal_grow_range(token, 0, self.get_table().size());

            let old_table = self.set_table_from_new();
            #[cfg(debug_assertions)]
            Self::verify_poisoned(unsafe { &*old_table });
            // Not visible to any other thread any more.
            drop(unsafe { Box::from_raw(old_table) });
        }

        self.unlock_resize_lock(token);
        true
    }

    /// Splits every bucket in `[start, stop)` of the current table into its
    /// two siblings in the new table.
    fn internal_grow_range(&self, token: &ThreadToken, start: usize, stop: usize) {
        let table = self.get_table();
        let new_table = self.get_new_table();
        debug_assert!(stop <= table.size(), "outside backing array");
        // The head cells are copied with their state bits, so both new
        // siblings start out locked.
        for even_index in start..stop {
            let bucket = table.bucket(even_index);
            bucket.lock();

            let odd_index = even_index + table.size();
            new_table.bucket(even_index).copy_raw_from(bucket);
            new_table.bucket(odd_index).copy_raw_from(bucket);

            // Readers and lockers move to the new table, where they wait on
            // the sibling locks until the unlocks below.
            bucket.redirect();

            if !self.unzip_bucket(token, table, new_table, even_index, odd_index) {
                // Empty bucket, so unzip did nothing and synchronized
                // nothing; readers must be gone before the head is poisoned.
                #[cfg(debug_assertions)]
                epoch::write_synchronize();
            }

            new_table.bucket(even_index).unlock();
            new_table.bucket(odd_index).unlock();

            #[cfg(debug_assertions)]
            release_assign_node_ptr(bucket.first_cell(), bucket::poison_node());
        }
    }

    /// Distributes the chain shared by both sibling buckets so that each
    /// node ends up only in the sibling its hash selects. Returns `false`
    /// for an empty bucket.
    fn unzip_bucket(
        &self,
        token: &ThreadToken,
        old_table: &InternalTable<C::Value>,
        new_table: &InternalTable<C::Value>,
        even_index: usize,
        odd_index: usize,
    ) -> bool {
        let mut aux = old_table.bucket(even_index).first();
        if aux.is_null() {
            return false;
        }
        let mut even = new_table.bucket(even_index).first_cell();
        let mut odd = new_table.bucket(odd_index).first_cell();
        while !aux.is_null() {
            let aux_next = unsafe { (*aux).next() };
            let mut dead_hash = false;
            let aux_hash = C::get_hash(unsafe { (*aux).value() }, &mut dead_hash);
            let mut delete_me = ptr::null_mut();
            if dead_hash {
                // The value is dead; take it out of both chains.
                delete_me = aux;
                release_assign_node_ptr(odd, aux_next);
                release_assign_node_ptr(even, aux_next);
            } else {
                let aux_index = new_table.bucket_index(aux_hash);
                if aux_index == even_index {
                    // Even node: drop it from the odd chain, keep it here.
                    release_assign_node_ptr(odd, aux_next);
                    even = unsafe { (*aux).next_cell() };
                } else if aux_index == odd_index {
                    release_assign_node_ptr(even, aux_next);
                    odd = unsafe { (*aux).next_cell() };
                } else {
                    unreachable!("node hashed outside its sibling buckets");
                }
            }
            aux = aux_next;

            // Only one pointer may move per grace period; otherwise a
            // reader could be carried into the wrong sibling chain, e.g.
            // looking for an even hash but walking the odd chain.
            self.write_synchronize_on_visible_epoch(token);
            if !delete_me.is_null() {
                unsafe { Node::destroy::<C>(delete_me) };
            }
        }
        true
    }

    fn internal_shrink(&self, token: &ThreadToken, log2_size: usize) -> bool {
        if !self.try_resize_lock(token) {
            return false;
        }
        let floor = cmp::max(log2_size, self.log2_start_size);
        if self.get_table().log2_size() <= floor {
            self.unlock_resize_lock(token);
            return false;
        }

        while self.get_table().log2_size() > floor {
            let old_log2 = self.get_table().log2_size();
            let new_table = Box::into_raw(Box::new(InternalTable::new(old_log2 - 1)));
            self.new_table.store(new_table, Ordering::Release);
            log::trace!("shrinking hash table from 2^{old_log2} to 2^{} buckets", old_log2 - 1);

            self.internal_shrink_range(token, 0, unsafe { (*new_table).size() });

            let old_table = self.set_table_from_new();
            self.size_limit_reached.store(false, Ordering::Relaxed);
            #[cfg(debug_assertions)]
            Self::verify_poisoned(unsafe { &*old_table });
            // Not visible to any other thread any more.
            drop(unsafe { Box::from_raw(old_table) });
        }

        self.unlock_resize_lock(token);
        true
    }

    /// Merges each pair of sibling buckets of the current table into one
    /// bucket of the half-sized new table.
    fn internal_shrink_range(&self, token: &ThreadToken, start: usize, stop: usize) {
        let table = self.get_table();
        let new_table = self.get_new_table();
        // The even head cell is copied with its state bits, so the merged
        // bucket starts out locked.
        for bucket_it in start..stop {
            let even_index = bucket_it;
            let odd_index = bucket_it + new_table.size();

            let old_even = table.bucket(even_index);
            let old_odd = table.bucket(odd_index);

            old_even.lock();
            old_odd.lock();

            let new_bucket = new_table.bucket(bucket_it);
            new_bucket.copy_raw_from(old_even);

            // Put the chains together.
            new_bucket.release_assign_last_node_next(old_odd.first());

            old_even.redirect();
            old_odd.redirect();

            // One publication step moved both chains, so a single grace
            // period suffices for the whole pair.
            self.write_synchronize_on_visible_epoch(token);

            new_bucket.unlock();

            #[cfg(debug_assertions)]
            {
                release_assign_node_ptr(old_even.first_cell(), bucket::poison_node());
                release_assign_node_ptr(old_odd.first_cell(), bucket::poison_node());
            }
        }
    }

    /// Unlinks up to [`BULK_DELETE_LIMIT`] dead nodes from a locked bucket,
    /// then reclaims them after a grace period.
    fn delete_in_bucket<L: Lookup<C::Value>>(&self, bucket: &Bucket<C::Value>, lookup: &L) {
        debug_assert!(bucket.is_locked(), "must be locked");
        let mut ndel = [ptr::null_mut::<Node<C::Value>>(); BULK_DELETE_LIMIT];
        let mut dels = 0;
        let mut rem_prev = bucket.first_cell();
        let mut rem = bucket.first();
        while !rem.is_null() {
            let mut is_dead = false;
            lookup.equals(unsafe { (*rem).value() }, &mut is_dead);
            if is_dead {
                ndel[dels] = rem;
                dels += 1;
                release_assign_node_ptr(rem_prev, unsafe { (*rem).next() });
                rem = unsafe { (*rem).next() };
                if dels == BULK_DELETE_LIMIT {
                    break;
                }
            } else {
                unsafe {
                    rem_prev = (*rem).next_cell();
                    rem = (*rem).next();
                }
            }
        }
        if dels > 0 {
            epoch::write_synchronize();
            for node in &ndel[..dels] {
                unsafe { Node::destroy::<C>(*node) };
            }
        }
    }

    /// Unlinks up to `num_del` nodes accepted by `eval_f` from a locked
    /// bucket into `ndel`. The caller reclaims them after a grace period.
    fn delete_check_nodes<E>(
        bucket: &Bucket<C::Value>,
        eval_f: &mut E,
        num_del: usize,
        ndel: &mut [*mut Node<C::Value>],
    ) -> usize
    where
        E: FnMut(&C::Value) -> bool,
    {
        let mut dels = 0;
        let mut rem_prev = bucket.first_cell();
        let mut rem = bucket.first();
        while !rem.is_null() {
            if eval_f(unsafe { (*rem).value() }) {
                ndel[dels] = rem;
                dels += 1;
                release_assign_node_ptr(rem_prev, unsafe { (*rem).next() });
                rem = unsafe { (*rem).next() };
                if dels == num_del {
                    break;
                }
            } else {
                unsafe {
                    rem_prev = (*rem).next_cell();
                    rem = (*rem).next();
                }
            }
        }
        dels
    }

    /// Cheap probe for whether a bucket holds anything `eval_f` accepts,
    /// with read prefetch of the chain and of the next bucket's chain head.
    fn have_deletable<E>(
        bucket: &Bucket<C::Value>,
        eval_f: &mut E,
        prefetch_bucket: Option<&Bucket<C::Value>>,
    ) -> bool
    where
        E: FnMut(&C::Value) -> bool,
    {
        let mut pref = prefetch_bucket.map_or(ptr::null_mut(), Bucket::first);
        let mut next = bucket.first();
        while !next.is_null() {
            if !pref.is_null() {
                prefetch_read(pref);
                pref = unsafe { (*pref).next() };
            }
            let after = unsafe { (*next).next() };
            if !after.is_null() {
                prefetch_read(after);
            }
            if eval_f(unsafe { (*next).value() }) {
                return true;
            }
            next = after;
        }
        false
    }

    fn do_bulk_delete_locked<E, D>(&self, token: &ThreadToken, eval_f: &mut E, del_f: &mut D)
    where
        E: FnMut(&C::Value) -> bool,
        D: FnMut(&C::Value),
    {
        self.do_bulk_delete_locked_for(token, 0, self.get_table().size(), eval_f, del_f, false);
    }

    fn do_bulk_delete_locked_for<E, D>(
        &self,
        token: &ThreadToken,
        start_idx: usize,
        stop_idx: usize,
        eval_f: &mut E,
        del_f: &mut D,
        is_mt: bool,
    ) where
        E: FnMut(&C::Value) -> bool,
        D: FnMut(&C::Value),
    {
        debug_assert!(
            (is_mt && self.resize_lock_owner.load(Ordering::Relaxed) != 0)
                || (!is_mt && self.resize_lock_owner.load(Ordering::Relaxed) == token.id()),
            "resize lock not held"
        );
        // The resize lock is held, so the table is stable and there is no
        // table under construction.
        let table = self.get_table();
        debug_assert!(start_idx < stop_idx, "empty range");
        debug_assert!(stop_idx <= table.size(), "outside backing array");
        let mut ndel = [ptr::null_mut::<Node<C::Value>>(); BULK_DELETE_LIMIT];

        // A manual critical section: locking a bucket with nothing to
        // delete is not worth the cost, and concurrent single deletes must
        // stay safe. The invisible epoch belongs to the resize-lock owner,
        // so our own read side must not clear it.
        token.critical_section_begin();
        for bucket_it in start_idx..stop_idx {
            let bucket = table.bucket(bucket_it);
            let prefetch_bucket = if bucket_it + 1 < stop_idx {
                Some(table.bucket(bucket_it + 1))
            } else {
                None
            };

            if !Self::have_deletable(bucket, &mut *eval_f, prefetch_bucket) {
                // Nothing to remove in this bucket.
                continue;
            }

            token.critical_section_end();
            // The bucket cannot go away while we hold the resize lock.
            bucket.lock();
            let dels = Self::delete_check_nodes(bucket, &mut *eval_f, BULK_DELETE_LIMIT, &mut ndel);
            bucket.unlock();
            if is_mt {
                epoch::write_synchronize();
            } else {
                self.write_synchronize_on_visible_epoch(token);
            }
            for node in &ndel[..dels] {
                unsafe {
                    del_f((**node).value());
                    Node::destroy::<C>(*node);
                }
            }
            token.critical_section_begin();
        }
        token.critical_section_end();
    }

    fn visit_nodes<F>(bucket: &Bucket<C::Value>, visitor_f: &mut F) -> bool
    where
        F: FnMut(&C::Value) -> bool,
    {
        let mut node = bucket.first();
        while !node.is_null() {
            if !visitor_f(unsafe { (*node).value() }) {
                return false;
            }
            node = unsafe { (*node).next() };
        }
        true
    }

    fn do_scan_locked<F>(&self, token: &ThreadToken, scan_f: &mut F)
    where
        F: FnMut(&C::Value) -> bool,
    {
        debug_assert_eq!(
            self.resize_lock_owner.load(Ordering::Relaxed),
            token.id(),
            "resize lock not held"
        );
        // One critical section over the entire loop would block updates for
        // a long time; blocking resizes is enough.
        let table = self.get_table();
        for bucket_it in 0..table.size() {
            let _cs = ScopedCS::new(token, self);
            if !Self::visit_nodes(table.bucket(bucket_it), scan_f) {
                break;
            }
        }
    }
}

impl<C: TableConfig> Default for ConcurrentHashTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: TableConfig> Drop for ConcurrentHashTable<C> {
    fn drop(&mut self) {
        debug_assert!(
            self.new_table.load(Ordering::Relaxed).is_null(),
            "dropped mid-resize"
        );
        // Exclusive access; no other thread can be traversing.
        let table_ptr = *self.table.get_mut();
        let table = unsafe { &*table_ptr };
        for bucket_it in 0..table.size() {
            let mut node = table.bucket(bucket_it).first();
            while !node.is_null() {
                unsafe {
                    let next = (*node).next();
                    Node::destroy::<C>(node);
                    node = next;
                }
            }
        }
        drop(unsafe { Box::from_raw(table_ptr) });
    }
}
