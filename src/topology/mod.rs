//! Mesh topology: index maps, adjacency lists, the layered storage and the
//! lazily computing [`Topology`](topology::Topology) façade.

pub mod adjacency;
pub mod cell_type;
pub mod computation;
pub mod index_map;
pub mod permutation;
pub mod storage;
#[allow(clippy::module_inception)]
pub mod topology;

pub use adjacency::AdjacencyList;
pub use cell_type::CellType;
pub use index_map::IndexMap;
pub use storage::{CacheLock, StorageKey, TopologyStorage};
pub use topology::{GhostMode, Intermediates, Topology};
