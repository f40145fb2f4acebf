#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-topology
//!
//! mesh-topology builds the distributed topology of a partitioned mesh for
//! parallel finite-element codes. Each rank hands in the cells it owns (plus,
//! optionally, a layer of ghost cells) as lists of global vertex indices; the
//! crate decides which rank owns every vertex, renumbers vertices contiguously
//! per rank and returns a [`Topology`](topology::Topology) that derives edges,
//! faces, connectivities, interior facets and entity permutations on demand.
//!
//! ## Features
//! - Vertex ownership resolution over a [`Communicator`](algs::communicator::Communicator)
//!   (threads for tests, MPI behind `mpi-support`)
//! - Layered storage: permanent and remanent tiers plus scoped cache layers
//!   whose lifetime is bound to [`CacheLock`](topology::storage::CacheLock) handles
//! - Thread-safe, idempotent queries; concurrent callers share one result
//! - Optional `rayon` parallelism for the cell renumbering pass
//!
//! ```toml
//! [dependencies]
//! mesh-topology = "0.1"
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! ## Determinism
//!
//! Ownership goes to the smallest claiming rank and local numbering follows
//! sorted global indices, so repeated runs on the same partition produce the
//! same numbering.

pub mod algs;
pub mod debug_invariants;
pub mod mesh_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, ThreadComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::create_topology::{TopologyOptions, create_topology, create_topology_with};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::mesh_error::TopologyError;
    pub use crate::topology::adjacency::AdjacencyList;
    pub use crate::topology::cell_type::CellType;
    pub use crate::topology::computation::{LocalComputation, TopologyComputation};
    pub use crate::topology::index_map::IndexMap;
    pub use crate::topology::storage::{CacheLock, StorageKey, TopologyStorage};
    pub use crate::topology::topology::{GhostMode, Intermediates, Topology};
}
