use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::map::{Lookup, TableConfig};

/// Flags the first drop of an associated value; a second drop panics.
#[derive(Debug, Default)]
pub(crate) struct DropNotifier {
    dropped: AtomicBool,
}

impl DropNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn was_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub(crate) struct NoisyDropper<T> {
    parent: Arc<DropNotifier>,
    pub elem: T,
}

impl<T> NoisyDropper<T> {
    pub(crate) fn new(parent: Arc<DropNotifier>, elem: T) -> Self {
        Self { parent, elem }
    }
}

impl<T> Drop for NoisyDropper<T> {
    fn drop(&mut self) {
        assert!(!self.parent.dropped.swap(true, Ordering::SeqCst));
    }
}

/// Plain `u64` values hashed by identity, which makes bucket placement
/// deterministic in tests.
pub(crate) struct U64Config;

impl TableConfig for U64Config {
    type Value = u64;

    fn get_hash(value: &u64, _is_dead: &mut bool) -> u64 {
        *value
    }

    fn notfound() -> u64 {
        u64::MAX
    }
}

/// Lookup by value for identity-hashed configs.
pub(crate) struct ByValue(pub u64);

impl Lookup<u64> for ByValue {
    fn hash(&self) -> u64 {
        self.0
    }

    fn equals(&self, value: &u64, _is_dead: &mut bool) -> bool {
        *value == self.0
    }
}

impl Lookup<NoisyDropper<u64>> for ByValue {
    fn hash(&self) -> u64 {
        self.0
    }

    fn equals(&self, value: &NoisyDropper<u64>, _is_dead: &mut bool) -> bool {
        value.elem == self.0
    }
}

/// A keyed value carrying a tombstone flag, for exercising dead-node
/// cleaning and the dead-hash paths.
#[derive(Debug)]
pub(crate) struct Flagged {
    pub key: u64,
    pub dead: AtomicBool,
}

pub(crate) struct FlaggedConfig;

impl FlaggedConfig {
    pub(crate) fn live(key: u64) -> Flagged {
        Flagged {
            key,
            dead: AtomicBool::new(false),
        }
    }
}

impl TableConfig for FlaggedConfig {
    type Value = Flagged;

    fn get_hash(value: &Flagged, is_dead: &mut bool) -> u64 {
        if value.dead.load(Ordering::Relaxed) {
            *is_dead = true;
        }
        value.key
    }

    fn notfound() -> Flagged {
        Flagged {
            key: u64::MAX,
            dead: AtomicBool::new(false),
        }
    }
}

pub(crate) struct ByKey(pub u64);

impl Lookup<Flagged> for ByKey {
    fn hash(&self) -> u64 {
        self.0
    }

    fn equals(&self, value: &Flagged, is_dead: &mut bool) -> bool {
        if value.dead.load(Ordering::Relaxed) {
            *is_dead = true;
            return false;
        }
        value.key == self.0
    }
}

impl Lookup<NoisyDropper<Flagged>> for ByKey {
    fn hash(&self) -> u64 {
        self.0
    }

    fn equals(&self, value: &NoisyDropper<Flagged>, is_dead: &mut bool) -> bool {
        if value.elem.dead.load(Ordering::Relaxed) {
            *is_dead = true;
            return false;
        }
        value.elem.key == self.0
    }
}

/// Tombstone-able values that also assert on double drop, for checking that
/// dead values are destroyed rather than retained or transferred.
pub(crate) struct FlaggedDropConfig;

impl TableConfig for FlaggedDropConfig {
    type Value = NoisyDropper<Flagged>;

    fn get_hash(value: &NoisyDropper<Flagged>, is_dead: &mut bool) -> u64 {
        if value.elem.dead.load(Ordering::Relaxed) {
            *is_dead = true;
        }
        value.elem.key
    }

    fn notfound() -> NoisyDropper<Flagged> {
        NoisyDropper::new(
            Arc::new(DropNotifier::new()),
            Flagged {
                key: u64::MAX,
                dead: AtomicBool::new(false),
            },
        )
    }
}

/// Values that assert on double drop, for reclamation tests.
pub(crate) struct DropConfig;

impl TableConfig for DropConfig {
    type Value = NoisyDropper<u64>;

    fn get_hash(value: &NoisyDropper<u64>, _is_dead: &mut bool) -> u64 {
        value.elem
    }

    fn notfound() -> NoisyDropper<u64> {
        NoisyDropper::new(Arc::new(DropNotifier::new()), u64::MAX)
    }
}
