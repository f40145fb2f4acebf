//! Layered storage for essential and derived topology data.
//!
//! A [`TopologyStorage`] keeps three explicit tiers, read in this order:
//!
//! 1. **permanent**: the essential entries (`index_map(tdim)`,
//!    `index_map(0)`, `connectivity(tdim, 0)`, `connectivity(0, 0)`), fixed
//!    when the owning topology is built;
//! 2. **remanent**: derived data kept until [`TopologyStorage::discard`];
//! 3. **cache**: layers that live only while a [`CacheLock`] referencing
//!    them is alive. The newest live layer is read first.
//!
//! Scratch storages (see [`TopologyStorage::create_scratch`]) additionally
//! read through a snapshot of their parent's layers, held strongly for the
//! scratch's lifetime.
//!
//! Writes are insert-if-absent: the first value published under a key wins
//! and later writers get the winner back. A write never shadows a key held
//! by a more permanent tier. Published values are `Arc`-shared and never
//! mutated, so dropping a layer only stops it from *offering* a value; holders
//! of the `Arc` keep it.

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::TopologyError;
use crate::topology::adjacency::AdjacencyList;
use crate::topology::index_map::IndexMap;
use crate::topology::permutation::EntityPermutations;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Key of one stored item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageKey {
    IndexMap(usize),
    Connectivity(usize, usize),
    InteriorFacets,
    Permutations,
}

/// A published, immutable item.
#[derive(Clone, Debug)]
pub enum StorageValue {
    IndexMap(Arc<IndexMap>),
    Connectivity(Arc<AdjacencyList<i32>>),
    InteriorFacets(Arc<Vec<bool>>),
    Permutations(Arc<EntityPermutations>),
}

impl StorageValue {
    /// True when both values are the same published object.
    pub fn ptr_eq(&self, other: &StorageValue) -> bool {
        match (self, other) {
            (StorageValue::IndexMap(a), StorageValue::IndexMap(b)) => Arc::ptr_eq(a, b),
            (StorageValue::Connectivity(a), StorageValue::Connectivity(b)) => Arc::ptr_eq(a, b),
            (StorageValue::InteriorFacets(a), StorageValue::InteriorFacets(b)) => {
                Arc::ptr_eq(a, b)
            }
            (StorageValue::Permutations(a), StorageValue::Permutations(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn fits(&self, key: StorageKey) -> bool {
        matches!(
            (self, key),
            (StorageValue::IndexMap(_), StorageKey::IndexMap(_))
                | (StorageValue::Connectivity(_), StorageKey::Connectivity(_, _))
                | (StorageValue::InteriorFacets(_), StorageKey::InteriorFacets)
                | (StorageValue::Permutations(_), StorageKey::Permutations)
        )
    }
}

/// Types that can be stored, with their conversion to and from [`StorageValue`].
pub trait StorageItem: Sized {
    fn into_value(item: Arc<Self>) -> StorageValue;
    fn from_value(value: &StorageValue) -> Option<Arc<Self>>;
}

macro_rules! storage_item {
    ($ty:ty, $variant:ident) => {
        impl StorageItem for $ty {
            fn into_value(item: Arc<Self>) -> StorageValue {
                StorageValue::$variant(item)
            }
            fn from_value(value: &StorageValue) -> Option<Arc<Self>> {
                match value {
                    StorageValue::$variant(v) => Some(Arc::clone(v)),
                    _ => None,
                }
            }
        }
    };
}

storage_item!(IndexMap, IndexMap);
storage_item!(AdjacencyList<i32>, Connectivity);
storage_item!(Vec<bool>, InteriorFacets);
storage_item!(EntityPermutations, Permutations);

/// One tier (or one cache layer) of stored items.
#[derive(Debug, Default)]
pub struct StorageLayer {
    entries: RwLock<BTreeMap<StorageKey, StorageValue>>,
}

impl StorageLayer {
    pub fn get(&self, key: StorageKey) -> Option<StorageValue> {
        self.entries.read().get(&key).cloned()
    }

    pub fn contains(&self, key: StorageKey) -> bool {
        self.entries.read().contains_key(&key)
    }

    /// Record `value` unless `key` is already present; return the stored value.
    pub fn insert_if_absent(&self, key: StorageKey, value: StorageValue) -> StorageValue {
        self.entries.write().entry(key).or_insert(value).clone()
    }

    /// Insert-if-absent for a group of entries under a single write lock, so
    /// a group published by one writer is never interleaved with another's.
    pub fn insert_group(&self, group: Vec<(StorageKey, StorageValue)>) -> Vec<StorageValue> {
        let mut entries = self.entries.write();
        group
            .into_iter()
            .map(|(k, v)| entries.entry(k).or_insert(v).clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<StorageKey> {
        self.entries.read().keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<(StorageKey, StorageValue)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Keeps one cache layer alive while it (or any clone) exists.
#[derive(Clone, Debug)]
pub struct CacheLock {
    layer: Arc<StorageLayer>,
}

impl CacheLock {
    /// The layer this lock keeps alive; writes into it survive until the
    /// last lock referencing it is dropped.
    pub fn layer(&self) -> &Arc<StorageLayer> {
        &self.layer
    }
}

/// Write destination.
#[derive(Clone, Copy, Debug)]
pub enum Tier<'a> {
    Remanent,
    Cache(&'a CacheLock),
}

/// Permanent, remanent and lock-scoped cache tiers for one topology.
#[derive(Debug)]
pub struct TopologyStorage {
    tdim: usize,
    permanent: Arc<StorageLayer>,
    remanent: RwLock<Arc<StorageLayer>>,
    cache: Mutex<Vec<Weak<StorageLayer>>>,
    inherited: Vec<Arc<StorageLayer>>,
}

/// The four entries every topology of dimension `tdim` must carry.
pub fn essential_keys(tdim: usize) -> [StorageKey; 4] {
    [
        StorageKey::IndexMap(tdim),
        StorageKey::IndexMap(0),
        StorageKey::Connectivity(tdim, 0),
        StorageKey::Connectivity(0, 0),
    ]
}

impl TopologyStorage {
    /// Empty storage with no permanent data.
    pub fn new(tdim: usize) -> Self {
        Self {
            tdim,
            permanent: Arc::new(StorageLayer::default()),
            remanent: RwLock::new(Arc::new(StorageLayer::default())),
            cache: Mutex::new(Vec::new()),
            inherited: Vec::new(),
        }
    }

    pub fn tdim(&self) -> usize {
        self.tdim
    }

    /// Move the essential entries into the permanent tier; every other entry
    /// found in `self` becomes initial remanent data.
    ///
    /// Fails with [`TopologyError::MissingEssentialData`] if any essential
    /// entry is missing.
    pub fn into_essential(self) -> Result<Self, TopologyError> {
        let essentials = essential_keys(self.tdim);
        let missing = essentials
            .iter()
            .filter(|k| self.read_value(**k).is_none())
            .map(|k| format!("{k:?}"))
            .join(", ");
        if !missing.is_empty() {
            return Err(TopologyError::MissingEssentialData(missing));
        }

        let permanent = StorageLayer::default();
        for key in essentials {
            if let Some(v) = self.read_value(key) {
                permanent.insert_if_absent(key, v);
            }
        }
        let remanent = StorageLayer::default();
        for (k, v) in self.own_entries() {
            if !permanent.contains(k) {
                remanent.insert_if_absent(k, v);
            }
        }
        let storage = Self {
            tdim: self.tdim,
            permanent: Arc::new(permanent),
            remanent: RwLock::new(Arc::new(remanent)),
            cache: Mutex::new(Vec::new()),
            inherited: Vec::new(),
        };
        storage.debug_assert_invariants();
        Ok(storage)
    }

    /// Storage sharing this one's permanent tier, with an empty remanent tier
    /// and read access to a snapshot of this storage's remanent and live
    /// cache layers.
    pub fn create_scratch(&self) -> Self {
        let mut inherited = vec![Arc::clone(&self.remanent.read())];
        inherited.extend(self.live_layers());
        inherited.extend(self.inherited.iter().cloned());
        Self {
            tdim: self.tdim,
            permanent: Arc::clone(&self.permanent),
            remanent: RwLock::new(Arc::new(StorageLayer::default())),
            cache: Mutex::new(Vec::new()),
            inherited,
        }
    }

    /// Obtain a handle keeping a cache layer alive.
    ///
    /// Joins the newest live layer unless there is none or `force_new_layer`
    /// is set, in which case a fresh layer is created and shadows older ones.
    pub fn acquire_cache_lock(&self, force_new_layer: bool) -> CacheLock {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|w| w.strong_count() > 0);
        if cache.len() != before {
            log::trace!("dropped {} expired cache layers", before - cache.len());
        }
        if !force_new_layer {
            // a layer can still expire between retain and upgrade
            while let Some(last) = cache.last() {
                match last.upgrade() {
                    Some(layer) => return CacheLock { layer },
                    None => {
                        cache.pop();
                    }
                }
            }
        }
        let layer = Arc::new(StorageLayer::default());
        cache.push(Arc::downgrade(&layer));
        log::trace!("new cache layer ({} live)", cache.len());
        CacheLock { layer }
    }

    /// Live cache layers, newest first.
    fn live_layers(&self) -> Vec<Arc<StorageLayer>> {
        self.cache.lock().iter().rev().filter_map(Weak::upgrade).collect()
    }

    pub fn num_live_layers(&self) -> usize {
        self.cache
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Look `key` up, most authoritative tier first.
    pub fn read_value(&self, key: StorageKey) -> Option<StorageValue> {
        if let Some(v) = self.permanent.get(key) {
            return Some(v);
        }
        if let Some(v) = self.remanent.read().get(key) {
            return Some(v);
        }
        for layer in self.live_layers() {
            if let Some(v) = layer.get(key) {
                return Some(v);
            }
        }
        self.inherited.iter().find_map(|layer| layer.get(key))
    }

    /// Typed lookup; `None` on a miss.
    pub fn read<T: StorageItem>(&self, key: StorageKey) -> Option<Arc<T>> {
        self.read_value(key).as_ref().and_then(T::from_value)
    }

    pub fn index_map(&self, dim: usize) -> Option<Arc<IndexMap>> {
        self.read(StorageKey::IndexMap(dim))
    }

    pub fn connectivity(&self, d0: usize, d1: usize) -> Option<Arc<AdjacencyList<i32>>> {
        self.read(StorageKey::Connectivity(d0, d1))
    }

    pub fn interior_facets(&self) -> Option<Arc<Vec<bool>>> {
        self.read(StorageKey::InteriorFacets)
    }

    pub fn permutations(&self) -> Option<Arc<EntityPermutations>> {
        self.read(StorageKey::Permutations)
    }

    /// Existing value from a tier more permanent than `tier`.
    fn shadowing_value(&self, key: StorageKey, tier: Tier<'_>) -> Option<StorageValue> {
        if let Some(v) = self.permanent.get(key) {
            return Some(v);
        }
        match tier {
            Tier::Remanent => None,
            Tier::Cache(_) => self.remanent.read().get(key),
        }
    }

    /// Publish a group of entries into `tier`; returns the value that ends up
    /// visible for each key (an earlier writer's value if one exists).
    pub fn write_group(
        &self,
        tier: Tier<'_>,
        group: Vec<(StorageKey, StorageValue)>,
    ) -> Result<Vec<StorageValue>, TopologyError> {
        if let Some((k, _)) = group.iter().find(|(k, v)| !v.fits(*k)) {
            return Err(TopologyError::ComputationFailed(format!(
                "value kind does not match storage key {k:?}"
            )));
        }
        let mut out: Vec<Option<StorageValue>> = group
            .iter()
            .map(|(k, _)| self.shadowing_value(*k, tier))
            .collect();
        let pending: Vec<(usize, (StorageKey, StorageValue))> = group
            .into_iter()
            .enumerate()
            .filter(|(i, _)| out[*i].is_none())
            .collect();
        let (slots, entries): (Vec<usize>, Vec<_>) = pending.into_iter().unzip();
        let stored = match tier {
            Tier::Remanent => self.remanent.read().insert_group(entries),
            Tier::Cache(lock) => lock.layer.insert_group(entries),
        };
        for (slot, v) in slots.into_iter().zip(stored) {
            out[slot] = Some(v);
        }
        Ok(out.into_iter().flatten().collect())
    }

    /// First-writer-wins publish of one item into `tier`.
    pub fn write<T: StorageItem>(
        &self,
        tier: Tier<'_>,
        key: StorageKey,
        value: Arc<T>,
    ) -> Result<Arc<T>, TopologyError> {
        let stored = self.write_group(tier, vec![(key, T::into_value(value))])?;
        stored
            .first()
            .and_then(T::from_value)
            .ok_or_else(|| {
                TopologyError::ComputationFailed(format!("stored value for {key:?} has wrong kind"))
            })
    }

    /// Entries held by this storage's own remanent and cache tiers.
    pub fn own_entries(&self) -> Vec<(StorageKey, StorageValue)> {
        let mut out = self.remanent.read().snapshot();
        for layer in self.live_layers() {
            out.extend(layer.snapshot());
        }
        out
    }

    /// Copy into the remanent tier every entry of `other` absent here.
    pub fn merge_from(&self, other: &TopologyStorage) -> Result<(), TopologyError> {
        self.merge_into(Tier::Remanent, other, None)
    }

    /// Copy the entries of `other` absent here into `tier`, optionally only
    /// those whose key is in `only`.
    pub fn merge_into(
        &self,
        tier: Tier<'_>,
        other: &TopologyStorage,
        only: Option<&[StorageKey]>,
    ) -> Result<(), TopologyError> {
        let group: Vec<_> = other
            .own_entries()
            .into_iter()
            .filter(|(k, _)| only.is_none_or(|keys| keys.contains(k)))
            .filter(|(k, _)| self.read_value(*k).is_none())
            .collect();
        if !group.is_empty() {
            log::trace!("merging {} entries", group.len());
            self.write_group(tier, group)?;
        }
        Ok(())
    }

    /// Copy the entries held in `lock`'s layer into the remanent tier.
    pub fn promote(&self, lock: &CacheLock) -> Result<(), TopologyError> {
        let group = lock.layer.snapshot();
        if !group.is_empty() {
            self.write_group(Tier::Remanent, group)?;
        }
        Ok(())
    }

    /// Start a fresh remanent tier.
    ///
    /// With `keep_essential`, essential-key entries held by the old remanent
    /// tier (storages not yet frozen by [`Self::into_essential`]) are carried
    /// over. The permanent tier is never affected, and values already handed
    /// out stay valid for their holders.
    pub fn discard(&self, keep_essential: bool) {
        let fresh = StorageLayer::default();
        let mut remanent = self.remanent.write();
        if keep_essential {
            for key in essential_keys(self.tdim) {
                if let Some(v) = remanent.get(key) {
                    fresh.insert_if_absent(key, v);
                }
            }
        }
        log::trace!(
            "discarding remanent tier ({} entries, {} kept)",
            remanent.len(),
            fresh.len()
        );
        *remanent = Arc::new(fresh);
    }

    pub fn permanent_keys(&self) -> Vec<StorageKey> {
        self.permanent.keys()
    }

    pub fn remanent_keys(&self) -> Vec<StorageKey> {
        self.remanent.read().keys()
    }
}

impl DebugInvariants for TopologyStorage {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "TopologyStorage");
    }

    fn validate_invariants(&self) -> Result<(), TopologyError> {
        for key in self.remanent.read().keys() {
            if self.permanent.contains(key) {
                return Err(TopologyError::ComputationFailed(format!(
                    "remanent tier shadows permanent key {key:?}"
                )));
            }
        }
        Ok(())
    }
}
