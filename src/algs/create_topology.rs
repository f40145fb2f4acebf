//! Construction of a distributed [`Topology`] from partitioned cells.
//!
//! The result carries only the essential data: the cell and vertex index
//! maps, `connectivity(tdim, 0)` in local vertex indices, and the identity
//! `connectivity(0, 0)`. Everything else is computed lazily by the topology.

use crate::algs::communicator::{Communicator, ExchangeTags, NoComm};
use crate::algs::exchange::{agree, all_reduce_sum_u64};
use crate::algs::ghost_cells::compute_ghost_indices;
use crate::algs::ownership::{ghost_boundary_vertices, resolve_vertex_ownership};
use crate::mesh_error::TopologyError;
use crate::topology::adjacency::AdjacencyList;
use crate::topology::cell_type::CellType;
use crate::topology::index_map::IndexMap;
use crate::topology::storage::{StorageKey, StorageValue, Tier, TopologyStorage};
use crate::topology::topology::{GhostMode, Topology};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Options of [`create_topology_with`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopologyOptions {
    /// Recorded on the topology; ghost cells themselves come from the input.
    pub ghost_mode: GhostMode,
    /// Base of the tag blocks used by the construction; each phase takes its
    /// own [`ExchangeTags::phase`] block, [`NUM_PHASES`] blocks in all.
    pub tags: ExchangeTags,
}

/// Tag blocks of the construction phases, in [`ExchangeTags::phase`] units.
mod phase {
    pub const INPUT: u16 = 0;
    pub const GHOST_CELLS: u16 = 1;
    pub const CELL_MAP: u16 = 2;
    pub const PATH: u16 = 3;
    pub const VERTEX_MAP: u16 = 4;
    /// Last block: the number of propagation rounds is not known upfront.
    pub const OWNERSHIP: u16 = 5;
}

/// Phase blocks taken by [`create_topology_with`].
pub const NUM_PHASES: u16 = phase::OWNERSHIP + 1;

/// Build a topology with default [`TopologyOptions`].
///
/// `cells` holds the global vertex indices of the owned cells followed by the
/// ghost cells; `original_cell_index` has one entry per cell and
/// `ghost_owners` one per ghost cell.
pub fn create_topology<C: Communicator + Clone>(
    comm: &C,
    cells: &AdjacencyList<i64>,
    original_cell_index: &[i64],
    ghost_owners: &[usize],
    cell_type: CellType,
) -> Result<Topology<C>, TopologyError> {
    create_topology_with(
        comm,
        cells,
        original_cell_index,
        ghost_owners,
        cell_type,
        TopologyOptions::default(),
    )
}

/// Validate the local input; no communication.
fn check_input(
    cells: &AdjacencyList<i64>,
    original_cell_index: &[i64],
    ghost_owners: &[usize],
    cell_type: CellType,
) -> Result<(), TopologyError> {
    let expected = cell_type.num_vertices();
    if let Some((cell, links)) = cells.iter().find(|(_, l)| l.len() != expected) {
        return Err(TopologyError::CellVertexCountMismatch {
            cell,
            got: links.len(),
            expected,
        });
    }
    if original_cell_index.len() != cells.num_nodes() {
        return Err(TopologyError::InvalidGhostCells(format!(
            "{} original cell indices for {} cells",
            original_cell_index.len(),
            cells.num_nodes()
        )));
    }
    if ghost_owners.len() > cells.num_nodes() {
        return Err(TopologyError::InvalidGhostCells(format!(
            "{} ghost owners for {} cells",
            ghost_owners.len(),
            cells.num_nodes()
        )));
    }
    if let Some(v) = cells.array().iter().find(|&&v| v < 0) {
        return Err(TopologyError::InvalidAdjacency(format!(
            "negative global vertex index {v}"
        )));
    }
    Ok(())
}

/// Vertices on facets referenced by exactly one of the given cells.
///
/// Works on a rank-local topology over [`NoComm`], so no communication takes
/// place.
fn exterior_vertices(
    cells: &AdjacencyList<i64>,
    cell_type: CellType,
) -> Result<BTreeSet<i64>, TopologyError> {
    let tdim = cell_type.dimension();
    if tdim == 0 {
        return Ok(cells.array().iter().copied().collect());
    }
    // number vertices in first-appearance order
    let mut local_of: BTreeMap<i64, i32> = BTreeMap::new();
    let mut globals = Vec::new();
    let local_cells = cells.map_links(|&g| {
        Ok(*local_of.entry(g).or_insert_with(|| {
            globals.push(g);
            globals.len() as i32 - 1
        }))
    })?;
    let n = globals.len();
    let storage = TopologyStorage::new(tdim);
    storage.write_group(
        Tier::Remanent,
        vec![
            (
                StorageKey::IndexMap(0),
                StorageValue::IndexMap(Arc::new(IndexMap::local(n))),
            ),
            (
                StorageKey::IndexMap(tdim),
                StorageValue::IndexMap(Arc::new(IndexMap::local(local_cells.num_nodes()))),
            ),
            (
                StorageKey::Connectivity(0, 0),
                StorageValue::Connectivity(Arc::new(AdjacencyList::identity(n))),
            ),
            (
                StorageKey::Connectivity(tdim, 0),
                StorageValue::Connectivity(Arc::new(local_cells)),
            ),
        ],
    )?;
    let local = Topology::new(NoComm, cell_type, storage)?;
    let marker = local.on_boundary(0)?;
    Ok(globals
        .into_iter()
        .zip(marker)
        .filter_map(|(g, on_boundary)| on_boundary.then_some(g))
        .collect())
}

/// Build a topology from partitioned cells.
///
/// Collective over `comm`, including on failure: a rank whose input is
/// invalid (for instance a cell not matching `cell_type`, reported as
/// [`TopologyError::CellVertexCountMismatch`]) returns that error and every
/// other rank returns [`TopologyError::RemoteFailure`]. The input check is
/// agreed on before any other exchange.
pub fn create_topology_with<C: Communicator + Clone>(
    comm: &C,
    cells: &AdjacencyList<i64>,
    original_cell_index: &[i64],
    ghost_owners: &[usize],
    cell_type: CellType,
    options: TopologyOptions,
) -> Result<Topology<C>, TopologyError> {
    let tags = options.tags;
    let checked = check_input(cells, original_cell_index, ghost_owners, cell_type);
    agree(comm, checked, tags.phase(phase::INPUT))?;
    let tdim = cell_type.dimension();

    let ghost_cells = compute_ghost_indices(
        comm,
        original_cell_index,
        ghost_owners,
        tags.phase(phase::GHOST_CELLS),
    )?;
    let num_owned_cells = cells.num_nodes() - ghost_owners.len();
    let cell_map = IndexMap::new(comm, num_owned_cells, ghost_cells, tags.phase(phase::CELL_MAP))?;

    // every rank must take the same path
    let path = tags.phase(phase::PATH);
    let total_ghost_cells = all_reduce_sum_u64(comm, ghost_owners.len() as u64, path)?;
    let candidates = if total_ghost_cells > 0 {
        Ok(ghost_boundary_vertices(cells, num_owned_cells))
    } else {
        exterior_vertices(cells, cell_type)
    };
    let candidates = agree(comm, candidates, path.next())?;
    log::debug!(
        "rank {}: building topology of {} owned and {} ghost {cell_type:?} cells",
        comm.rank(),
        num_owned_cells,
        ghost_owners.len()
    );

    let ownership = resolve_vertex_ownership(
        comm,
        cells,
        &cell_map,
        &candidates,
        tags.phase(phase::OWNERSHIP),
    )?;
    let num_vertices = ownership.size_local + ownership.ghosts.len();
    let vertex_map = IndexMap::new(
        comm,
        ownership.size_local,
        ownership.ghosts,
        tags.phase(phase::VERTEX_MAP),
    )?;
    debug_assert_eq!(vertex_map.local_range().0, ownership.global_offset);

    let storage = TopologyStorage::new(tdim);
    storage.write_group(
        Tier::Remanent,
        vec![
            (
                StorageKey::IndexMap(0),
                StorageValue::IndexMap(Arc::new(vertex_map)),
            ),
            (
                StorageKey::Connectivity(0, 0),
                StorageValue::Connectivity(Arc::new(AdjacencyList::identity(num_vertices))),
            ),
            (
                StorageKey::IndexMap(tdim),
                StorageValue::IndexMap(Arc::new(cell_map)),
            ),
            (
                StorageKey::Connectivity(tdim, 0),
                StorageValue::Connectivity(Arc::new(ownership.cells)),
            ),
        ],
    )?;
    Ok(Topology::new(comm.clone(), cell_type, storage)?.with_ghost_mode(options.ghost_mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_count_checked_first() {
        let cells = AdjacencyList::from_nested(vec![vec![0, 1, 2], vec![1, 2]]);
        let err = create_topology(&NoComm, &cells, &[0, 1], &[], CellType::Triangle).unwrap_err();
        assert!(matches!(
            err,
            TopologyError::CellVertexCountMismatch {
                cell: 1,
                got: 2,
                expected: 3
            }
        ));
    }

    #[test]
    fn original_index_count_checked() {
        let cells = AdjacencyList::from_nested(vec![vec![0, 1]]);
        let err = create_topology(&NoComm, &cells, &[], &[], CellType::Segment).unwrap_err();
        assert!(matches!(err, TopologyError::InvalidGhostCells(_)));
    }

    #[test]
    fn serial_square_of_triangles() {
        let cells = AdjacencyList::from_nested(vec![vec![10, 11, 12], vec![11, 13, 12]]);
        let topo = create_topology(&NoComm, &cells, &[0, 1], &[], CellType::Triangle).unwrap();
        let vertices = topo.index_map(0).unwrap();
        assert_eq!(vertices.size_local(), 4);
        assert_eq!(vertices.num_ghosts(), 0);
        assert_eq!(topo.index_map(2).unwrap().size_global(), 2);
        assert_eq!(topo.connectivity(0, 0).unwrap().num_nodes(), 4);
        assert_eq!(topo.index_map(1).unwrap().size_local(), 5);
        assert_eq!(topo.ghost_mode(), GhostMode::None);
    }

    #[test]
    fn exterior_vertices_of_a_strip() {
        // three quads in a row: every vertex is on the boundary
        let cells = AdjacencyList::from_nested(vec![
            vec![0, 1, 4, 5],
            vec![1, 2, 5, 6],
            vec![2, 3, 6, 7],
        ]);
        let ext = exterior_vertices(&cells, CellType::Quadrilateral).unwrap();
        assert_eq!(ext.len(), 8);
        let line = AdjacencyList::from_nested(vec![vec![3, 4], vec![4, 5], vec![5, 6]]);
        let ext = exterior_vertices(&line, CellType::Segment).unwrap();
        assert_eq!(ext, BTreeSet::from([3, 6]));
    }
}
