//! The [`Topology`] façade: essential data plus lazily computed derived data.
//!
//! Every query follows the same steps:
//!
//! 1. look the value up in storage and return it on a hit;
//! 2. on a miss, take a cache lock, build a scratch topology reading through
//!    this one's storage, let the scratch compute the value, and merge the
//!    results back according to the requested [`Intermediates`] mode;
//! 3. read the value again; it is now present.
//!
//! Values that belong together (an entity index map with its cell and vertex
//! connectivity, or the facet and cell permutation tables) are always
//! published as one group.

use crate::algs::communicator::Communicator;
#[cfg(test)]
use crate::algs::communicator::NoComm;
use crate::mesh_error::TopologyError;
use crate::topology::adjacency::AdjacencyList;
use crate::topology::cell_type::CellType;
use crate::topology::computation::{LocalComputation, TopologyComputation};
use crate::topology::index_map::IndexMap;
use crate::topology::permutation::EntityPermutations;
use crate::topology::storage::{CacheLock, StorageItem, StorageKey, Tier, TopologyStorage};
#[cfg(test)]
use crate::topology::storage::StorageValue;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Which cells a rank holds as ghosts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GhostMode {
    #[default]
    None,
    SharedFacet,
    SharedVertex,
}

/// What happens to data computed on the way to a requested value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Intermediates {
    /// Keep it in the remanent tier.
    #[default]
    Keep,
    /// Only keep it in the active cache layer, so it lives as long as the
    /// caller's cache lock.
    Discard,
}

/// Distributed mesh topology of one cell type.
pub struct Topology<C: Communicator> {
    comm: C,
    cell_type: CellType,
    ghost_mode: GhostMode,
    storage: TopologyStorage,
    computation: Arc<dyn TopologyComputation<C>>,
}

impl<C: Communicator> std::fmt::Debug for Topology<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("rank", &self.comm.rank())
            .field("cell_type", &self.cell_type)
            .field("ghost_mode", &self.ghost_mode)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

/// Keys that must be published together with `key`.
fn dependent_group(key: StorageKey, tdim: usize) -> Vec<StorageKey> {
    let entity_group = |d: usize| {
        vec![
            StorageKey::IndexMap(d),
            StorageKey::Connectivity(tdim, d),
            StorageKey::Connectivity(d, 0),
        ]
    };
    match key {
        StorageKey::IndexMap(d) => entity_group(d),
        StorageKey::Connectivity(d0, d) if d0 == tdim => entity_group(d),
        StorageKey::Connectivity(d, 0) => entity_group(d),
        other => vec![other],
    }
}

impl<C: Communicator + Clone> Topology<C> {
    /// Wrap `storage`, which must provide `index_map(tdim)`, `index_map(0)`,
    /// `connectivity(tdim, 0)` and `connectivity(0, 0)`.
    ///
    /// The essential entries become permanent; anything else in `storage` is
    /// kept as initial remanent data.
    pub fn new(comm: C, cell_type: CellType, storage: TopologyStorage) -> Result<Self, TopologyError> {
        let storage = Self::check_storage(storage, cell_type.dimension())?;
        Ok(Self {
            comm,
            cell_type,
            ghost_mode: GhostMode::None,
            storage,
            computation: Arc::new(LocalComputation),
        })
    }

    /// Validate that `storage` carries the essential entries for `tdim` and
    /// freeze them into its permanent tier.
    pub fn check_storage(storage: TopologyStorage, tdim: usize) -> Result<TopologyStorage, TopologyError> {
        if storage.tdim() != tdim {
            return Err(TopologyError::InvalidDimension {
                dim: storage.tdim(),
                tdim,
            });
        }
        storage.into_essential()
    }

    pub fn with_ghost_mode(mut self, ghost_mode: GhostMode) -> Self {
        self.ghost_mode = ghost_mode;
        self
    }

    /// Replace the algorithms used to compute derived data.
    pub fn with_computation(mut self, computation: Arc<dyn TopologyComputation<C>>) -> Self {
        self.computation = computation;
        self
    }

    pub fn dim(&self) -> usize {
        self.cell_type.dimension()
    }

    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    pub fn ghost_mode(&self) -> GhostMode {
        self.ghost_mode
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn storage(&self) -> &TopologyStorage {
        &self.storage
    }

    /// Keep a cache layer alive while the returned handle exists; see
    /// [`TopologyStorage::acquire_cache_lock`].
    pub fn acquire_cache_lock(&self, force_new_layer: bool) -> CacheLock {
        self.storage.acquire_cache_lock(force_new_layer)
    }

    /// Drop all remanent derived data. Essential data is never affected.
    pub fn discard_remanent(&self) {
        self.storage.discard(true);
    }

    /// Topology sharing this one's permanent data and reading through a
    /// snapshot of its remanent and cache tiers.
    fn create_scratch(&self) -> Self {
        Self {
            comm: self.comm.clone(),
            cell_type: self.cell_type,
            ghost_mode: self.ghost_mode,
            storage: self.storage.create_scratch(),
            computation: Arc::clone(&self.computation),
        }
    }

    fn check_dim(&self, dim: usize) -> Result<(), TopologyError> {
        if dim > self.dim() {
            return Err(TopologyError::InvalidDimension {
                dim,
                tdim: self.dim(),
            });
        }
        Ok(())
    }

    /// Shared miss path of all queries.
    ///
    /// `build` runs on the scratch topology and returns the lock keeping the
    /// scratch's stepping-stone data alive until it has been merged here.
    fn query<T, F>(&self, key: StorageKey, mode: Intermediates, build: F) -> Result<Arc<T>, TopologyError>
    where
        T: StorageItem,
        F: FnOnce(&Self) -> Result<CacheLock, TopologyError>,
    {
        if let Some(v) = self.storage.read::<T>(key) {
            log::trace!("storage hit for {key:?}");
            return Ok(v);
        }
        let lock = self.storage.acquire_cache_lock(false);
        let scratch = self.create_scratch();
        let steps = build(&scratch)?;
        match mode {
            Intermediates::Keep => self.storage.merge_from(&scratch.storage)?,
            Intermediates::Discard => {
                let group = dependent_group(key, self.dim());
                self.storage
                    .merge_into(Tier::Remanent, &scratch.storage, Some(&group))?;
                self.storage
                    .merge_into(Tier::Cache(&lock), &scratch.storage, None)?;
            }
        }
        drop(steps);
        self.storage.read::<T>(key).ok_or_else(|| {
            TopologyError::ComputationFailed(format!("{key:?} missing after computation"))
        })
    }

    pub fn index_map(&self, dim: usize) -> Result<Arc<IndexMap>, TopologyError> {
        self.index_map_with(dim, Intermediates::Keep)
    }

    pub fn index_map_with(&self, dim: usize, mode: Intermediates) -> Result<Arc<IndexMap>, TopologyError> {
        self.check_dim(dim)?;
        self.query(StorageKey::IndexMap(dim), mode, |s| {
            s.build_entities(dim, mode).map(|(_, steps)| steps)
        })
    }

    pub fn connectivity(&self, d0: usize, d1: usize) -> Result<Arc<AdjacencyList<i32>>, TopologyError> {
        self.connectivity_with(d0, d1, Intermediates::Keep)
    }

    pub fn connectivity_with(
        &self,
        d0: usize,
        d1: usize,
        mode: Intermediates,
    ) -> Result<Arc<AdjacencyList<i32>>, TopologyError> {
        self.check_dim(d0)?;
        self.check_dim(d1)?;
        self.query(StorageKey::Connectivity(d0, d1), mode, |s| {
            s.build_connectivity(d0, d1, mode)
        })
    }

    pub fn interior_facets(&self) -> Result<Arc<Vec<bool>>, TopologyError> {
        self.interior_facets_with(Intermediates::Keep)
    }

    pub fn interior_facets_with(&self, mode: Intermediates) -> Result<Arc<Vec<bool>>, TopologyError> {
        self.query(StorageKey::InteriorFacets, mode, |s| {
            s.build_interior_facets(mode)
        })
    }

    /// Facet and cell permutation tables; always computed together.
    pub fn entity_permutations(&self) -> Result<Arc<EntityPermutations>, TopologyError> {
        self.entity_permutations_with(Intermediates::Keep)
    }

    pub fn entity_permutations_with(
        &self,
        mode: Intermediates,
    ) -> Result<Arc<EntityPermutations>, TopologyError> {
        self.query(StorageKey::Permutations, mode, |s| {
            s.build_entity_permutations(mode)
        })
    }

    /// Marker of the local entities of dimension `dim < tdim` lying on the
    /// domain boundary: facets not shared by two cells, and every entity of
    /// such a facet.
    pub fn on_boundary(&self, dim: usize) -> Result<Vec<bool>, TopologyError> {
        self.on_boundary_with(dim, Intermediates::Keep)
    }

    pub fn on_boundary_with(&self, dim: usize, mode: Intermediates) -> Result<Vec<bool>, TopologyError> {
        let tdim = self.dim();
        if dim >= tdim {
            return Err(TopologyError::InvalidDimension { dim, tdim });
        }
        let facet_dim = tdim - 1;
        let interior = self.interior_facets_with(mode)?;
        let num_facets = self
            .index_map_with(facet_dim, mode)?
            .size_with_ghosts()
            .min(interior.len());
        if dim == facet_dim {
            return Ok(interior[..num_facets].iter().map(|f| !f).collect());
        }

        let facet_entity = self.connectivity_with(facet_dim, dim, mode)?;
        let mut marker = vec![false; self.index_map_with(dim, mode)?.size_with_ghosts()];
        for f in (0..num_facets).filter(|&f| !interior[f]) {
            for &e in facet_entity.links(f) {
                let slot = marker.get_mut(e as usize).ok_or_else(|| {
                    TopologyError::InvalidAdjacency(format!("facet {f} links to unknown entity {e}"))
                })?;
                *slot = true;
            }
        }
        Ok(marker)
    }

    /// Hash of the cell-vertex connectivity.
    pub fn hash(&self) -> Result<u64, TopologyError> {
        let cells = self.storage.connectivity(self.dim(), 0).ok_or_else(|| {
            TopologyError::MissingEssentialData(format!("Connectivity({}, 0)", self.dim()))
        })?;
        let mut hasher = DefaultHasher::new();
        cells.hash(&mut hasher);
        Ok(hasher.finish())
    }

    /// Create the entities of dimension `dim`.
    ///
    /// Returns `None` if they already existed, otherwise the number of owned
    /// entities created.
    pub fn create_entities(&self, dim: usize) -> Result<Option<usize>, TopologyError> {
        self.check_dim(dim)?;
        self.build_entities(dim, Intermediates::Keep)
            .map(|(created, _)| created)
    }

    pub fn create_connectivity(&self, d0: usize, d1: usize) -> Result<(), TopologyError> {
        self.check_dim(d0)?;
        self.check_dim(d1)?;
        self.build_connectivity(d0, d1, Intermediates::Keep).map(drop)
    }

    /// Every connectivity `(d0, d1)` with `d0, d1 <= tdim`.
    pub fn create_connectivity_all(&self) -> Result<(), TopologyError> {
        for d0 in 0..=self.dim() {
            for d1 in 0..=self.dim() {
                self.create_connectivity(d0, d1)?;
            }
        }
        Ok(())
    }

    pub fn create_interior_facets(&self) -> Result<(), TopologyError> {
        self.build_interior_facets(Intermediates::Keep).map(drop)
    }

    pub fn create_entity_permutations(&self) -> Result<(), TopologyError> {
        self.build_entity_permutations(Intermediates::Keep).map(drop)
    }

    // The build_* steps write their result into this topology's remanent
    // tier. Data produced by nested queries lands in a fresh cache layer; the
    // returned lock keeps that layer alive for the caller to merge.

    fn build_entities(
        &self,
        dim: usize,
        mode: Intermediates,
    ) -> Result<(Option<usize>, CacheLock), TopologyError> {
        let steps = self.storage.acquire_cache_lock(true);
        if self.storage.connectivity(dim, 0).is_some() {
            return Ok((None, steps));
        }
        let set = self.computation.compute_entities(self, dim)?;
        let size_local = set.index_map.size_local();
        self.finish_build(&steps, mode)?;
        self.storage
            .write_group(Tier::Remanent, set.into_group(self.dim(), dim))?;
        Ok((Some(size_local), steps))
    }

    fn build_connectivity(
        &self,
        d0: usize,
        d1: usize,
        mode: Intermediates,
    ) -> Result<CacheLock, TopologyError> {
        let steps = self.storage.acquire_cache_lock(true);
        if self.storage.connectivity(d0, d1).is_some() {
            return Ok(steps);
        }
        self.index_map_with(d0, mode)?;
        self.index_map_with(d1, mode)?;
        // entity creation may already have produced it
        if self.storage.connectivity(d0, d1).is_none() {
            let conn = self.computation.compute_connectivity(self, d0, d1)?;
            self.storage
                .write(Tier::Remanent, StorageKey::Connectivity(d0, d1), Arc::new(conn))?;
        }
        self.finish_build(&steps, mode)?;
        Ok(steps)
    }

    fn build_interior_facets(&self, mode: Intermediates) -> Result<CacheLock, TopologyError> {
        let steps = self.storage.acquire_cache_lock(true);
        if self.storage.interior_facets().is_some() {
            return Ok(steps);
        }
        let tdim = self.dim();
        if tdim == 0 {
            return Err(TopologyError::InvalidDimension { dim: 0, tdim });
        }
        self.connectivity_with(tdim - 1, tdim, mode)?;
        let facets = self.computation.compute_interior_facets(self)?;
        self.finish_build(&steps, mode)?;
        self.storage
            .write(Tier::Remanent, StorageKey::InteriorFacets, Arc::new(facets))?;
        Ok(steps)
    }

    fn build_entity_permutations(&self, mode: Intermediates) -> Result<CacheLock, TopologyError> {
        let steps = self.storage.acquire_cache_lock(true);
        if self.storage.permutations().is_some() {
            return Ok(steps);
        }
        for d in 0..self.dim() {
            self.index_map_with(d, mode)?;
        }
        let perms = self.computation.compute_entity_permutations(self)?;
        self.finish_build(&steps, mode)?;
        self.storage
            .write(Tier::Remanent, StorageKey::Permutations, Arc::new(perms))?;
        Ok(steps)
    }

    fn finish_build(&self, steps: &CacheLock, mode: Intermediates) -> Result<(), TopologyError> {
        if mode == Intermediates::Keep {
            self.storage.promote(steps)?;
        }
        Ok(())
    }
}

/// Serial topology from cells given in local vertex numbering.
#[cfg(test)]
pub(crate) fn serial_topology(
    cell_type: CellType,
    cells: AdjacencyList<i32>,
    num_vertices: usize,
) -> Result<Topology<NoComm>, TopologyError> {
    let tdim = cell_type.dimension();
    let storage = TopologyStorage::new(tdim);
    let group = vec![
        (
            StorageKey::IndexMap(0),
            StorageValue::IndexMap(Arc::new(IndexMap::local(num_vertices))),
        ),
        (
            StorageKey::IndexMap(tdim),
            StorageValue::IndexMap(Arc::new(IndexMap::local(cells.num_nodes()))),
        ),
        (
            StorageKey::Connectivity(0, 0),
            StorageValue::Connectivity(Arc::new(AdjacencyList::identity(num_vertices))),
        ),
        (
            StorageKey::Connectivity(tdim, 0),
            StorageValue::Connectivity(Arc::new(cells)),
        ),
    ];
    storage.write_group(Tier::Remanent, group)?;
    Topology::new(NoComm, cell_type, storage)
}
