//! Distributed algorithms: message passing, collective exchanges, ownership
//! resolution and topology construction.

pub mod communicator;
pub mod create_topology;
pub mod exchange;
pub mod ghost_cells;
pub mod ownership;
pub mod wire;

pub use create_topology::{TopologyOptions, create_topology, create_topology_with};
pub use ownership::{VertexOwnership, index_owner, resolve_vertex_ownership};
