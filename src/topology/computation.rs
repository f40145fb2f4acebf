//! Derived-data computations invoked by [`Topology`] on a cache miss.
//!
//! A [`TopologyComputation`] is a pure function of a topology snapshot: it
//! reads what it needs through the topology's own queries (which may in turn
//! trigger nested computations) and returns new data without publishing it.
//! Publication is the caller's job.

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags};
use crate::algs::exchange::{agree, all_to_all};
use crate::algs::ownership::index_owner;
use crate::algs::wire::WireIndex;
use crate::mesh_error::TopologyError;
use crate::topology::adjacency::AdjacencyList;
use crate::topology::cell_type::CellType;
use crate::topology::index_map::IndexMap;
use crate::topology::permutation::{
    EntityPermutations, cell_permutation_info, facet_permutation_code,
};
use crate::topology::storage::{StorageKey, StorageValue};
use crate::topology::topology::Topology;
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Tags of the interior facet exchange, clear of the construction blocks.
const INTERIOR_FACET_TAGS: ExchangeTags = ExchangeTags::from_base(CommTag::new(0x6000));

/// Entities of one dimension, as produced by [`TopologyComputation::compute_entities`].
#[derive(Clone, Debug)]
pub struct EntitySet {
    pub index_map: IndexMap,
    /// `connectivity(tdim, dim)`
    pub cell_entity: AdjacencyList<i32>,
    /// `connectivity(dim, 0)`
    pub entity_vertex: AdjacencyList<i32>,
}

impl EntitySet {
    /// The storage entries making up this set; they are published together.
    pub fn into_group(self, tdim: usize, dim: usize) -> Vec<(StorageKey, StorageValue)> {
        vec![
            (
                StorageKey::IndexMap(dim),
                StorageValue::IndexMap(Arc::new(self.index_map)),
            ),
            (
                StorageKey::Connectivity(tdim, dim),
                StorageValue::Connectivity(Arc::new(self.cell_entity)),
            ),
            (
                StorageKey::Connectivity(dim, 0),
                StorageValue::Connectivity(Arc::new(self.entity_vertex)),
            ),
        ]
    }
}

/// Algorithms producing derived topology data.
pub trait TopologyComputation<C: Communicator>: Send + Sync {
    /// Entities of dimension `0 < dim < tdim`.
    fn compute_entities(&self, topology: &Topology<C>, dim: usize)
    -> Result<EntitySet, TopologyError>;

    fn compute_connectivity(
        &self,
        topology: &Topology<C>,
        d0: usize,
        d1: usize,
    ) -> Result<AdjacencyList<i32>, TopologyError>;

    /// One marker per local facet, true if two cells share the facet, on
    /// whichever ranks they live.
    fn compute_interior_facets(&self, topology: &Topology<C>) -> Result<Vec<bool>, TopologyError>;

    fn compute_entity_permutations(
        &self,
        topology: &Topology<C>,
    ) -> Result<EntityPermutations, TopologyError>;
}

/// Computations on the local cells.
///
/// Entities are identified by their vertex sets and numbered in order of
/// first appearance over the local cells (ghost cells included). Their index
/// maps are process-local: entities on a partition boundary are not
/// reconciled across ranks.
///
/// Interior facets are the exception: on more than one rank, facets whose
/// vertices are all shared are matched across ranks, so
/// `compute_interior_facets` is collective there.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalComputation;

fn vertex_globals<C: Communicator + Clone>(
    topology: &Topology<C>,
) -> Result<Vec<i64>, TopologyError> {
    Ok(topology.index_map(0)?.global_indices())
}

/// Quadrilateral vertices, given in reference (lexicographic) order, in face
/// order: the lowest global vertex, its neighbors by ascending global index,
/// then the opposite vertex.
fn quad_vertex_order(vertices: &[i32], globals: &[i64]) -> Vec<i32> {
    let global = |i: usize| globals[vertices[i] as usize];
    let m = (0..4).min_by_key(|&i| global(i)).unwrap_or(0);
    let (lo, hi) = if global(m ^ 1) < global(m ^ 2) {
        (m ^ 1, m ^ 2)
    } else {
        (m ^ 2, m ^ 1)
    };
    vec![vertices[m], vertices[lo], vertices[hi], vertices[m ^ 3]]
}

fn check_cell(
    cell: usize,
    vertices: &[i32],
    expected: usize,
    num_vertices: usize,
) -> Result<(), TopologyError> {
    if vertices.len() != expected {
        return Err(TopologyError::CellVertexCountMismatch {
            cell,
            got: vertices.len(),
            expected,
        });
    }
    if let Some(v) = vertices
        .iter()
        .find(|&&v| v < 0 || v as usize >= num_vertices)
    {
        return Err(TopologyError::InvalidAdjacency(format!(
            "cell {cell} references vertex {v} outside 0..{num_vertices}"
        )));
    }
    Ok(())
}

impl<C: Communicator + Clone> TopologyComputation<C> for LocalComputation {
    fn compute_entities(
        &self,
        topology: &Topology<C>,
        dim: usize,
    ) -> Result<EntitySet, TopologyError> {
        let tdim = topology.dim();
        if dim == 0 || dim >= tdim {
            return Err(TopologyError::InvalidDimension { dim, tdim });
        }
        let cell_type = topology.cell_type();
        let cells = topology.connectivity(tdim, 0)?;
        let globals = vertex_globals(topology)?;
        let references = cell_type.entity_vertices(dim);
        let quad = cell_type.entity_type(dim) == CellType::Quadrilateral;

        let mut lookup: HashMap<Vec<i32>, i32> = HashMap::new();
        let mut entity_vertex: Vec<Vec<i32>> = Vec::new();
        let mut cell_entity = Vec::with_capacity(cells.num_nodes() * references.len());
        for (c, vertices) in cells.iter() {
            check_cell(c, vertices, cell_type.num_vertices(), globals.len())?;
            for reference in &references {
                let ordered: Vec<i32> = reference.iter().map(|&i| vertices[i]).collect();
                let mut key = ordered.clone();
                key.sort_unstable_by_key(|&v| globals[v as usize]);
                let e = match lookup.get(&key) {
                    Some(&e) => e,
                    None => {
                        let e = entity_vertex.len() as i32;
                        entity_vertex.push(if quad {
                            quad_vertex_order(&ordered, &globals)
                        } else {
                            key.clone()
                        });
                        lookup.insert(key, e);
                        e
                    }
                };
                cell_entity.push(e);
            }
        }

        log::debug!(
            "created {} entities of dimension {dim} from {} cells",
            entity_vertex.len(),
            cells.num_nodes()
        );
        Ok(EntitySet {
            index_map: IndexMap::local(entity_vertex.len()),
            cell_entity: AdjacencyList::from_uniform(cell_entity, references.len())?,
            entity_vertex: AdjacencyList::from_nested(entity_vertex),
        })
    }

    fn compute_connectivity(
        &self,
        topology: &Topology<C>,
        d0: usize,
        d1: usize,
    ) -> Result<AdjacencyList<i32>, TopologyError> {
        let tdim = topology.dim();
        if d0 > tdim || d1 > tdim {
            return Err(TopologyError::InvalidDimension {
                dim: d0.max(d1),
                tdim,
            });
        }
        let n0 = topology.index_map(d0)?.size_with_ghosts();
        if d0 == d1 {
            return Ok(AdjacencyList::identity(n0));
        }
        if d0 < d1 {
            return topology.connectivity(d1, d0)?.transpose(n0);
        }

        // d0 > d1: walk every cell and map reference inclusions to entities
        let c0 = topology.connectivity(tdim, d0)?;
        let c1 = topology.connectivity(tdim, d1)?;
        let inclusion = topology.cell_type().sub_entity_inclusion(d0, d1);
        let mut links: Vec<Option<Vec<i32>>> = vec![None; n0];
        for c in 0..c0.num_nodes() {
            let e1s = c1.links(c);
            for (i, &e0) in c0.links(c).iter().enumerate() {
                let slot = links.get_mut(e0 as usize).ok_or_else(|| {
                    TopologyError::InvalidAdjacency(format!(
                        "entity {e0} of dimension {d0} outside 0..{n0}"
                    ))
                })?;
                if slot.is_some() {
                    continue;
                }
                let refs = inclusion.get(i).ok_or_else(|| {
                    TopologyError::InvalidAdjacency(format!(
                        "cell {c} has more than {} entities of dimension {d0}",
                        inclusion.len()
                    ))
                })?;
                let entities = refs
                    .iter()
                    .map(|&j| {
                        e1s.get(j).copied().ok_or_else(|| {
                            TopologyError::InvalidAdjacency(format!(
                                "cell {c} lacks entity {j} of dimension {d1}"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                *slot = Some(entities);
            }
        }
        Ok(AdjacencyList::from_nested(
            links.into_iter().map(Option::unwrap_or_default),
        ))
    }

    fn compute_interior_facets(&self, topology: &Topology<C>) -> Result<Vec<bool>, TopologyError> {
        let tdim = topology.dim();
        if tdim == 0 {
            return Err(TopologyError::InvalidDimension { dim: 0, tdim });
        }
        let facet_cell = topology.connectivity(tdim - 1, tdim)?;
        let mut marker: Vec<bool> = facet_cell.iter().map(|(_, cells)| cells.len() == 2).collect();
        let comm = topology.comm();
        if comm.size() == 1 {
            return Ok(marker);
        }

        let vertex_map = topology.index_map(0)?;
        let cell_map = topology.index_map(tdim)?;
        let facet_vertex = topology.connectivity(tdim - 1, 0)?;
        let mut tags = INTERIOR_FACET_TAGS;
        let shared = vertex_map.compute_shared_indices(comm, tags.reserve(IndexMap::TAG_PAIRS))?;
        let num_owned = vertex_map.size_local();
        let seen_elsewhere = |v: i32| v as usize >= num_owned || shared.contains_key(&v);

        // record per candidate facet: [k, sorted global vertices (k), cell, cell]
        let size = comm.size();
        let global_space = vertex_map.size_global() as i64;
        let mut send: Vec<Vec<WireIndex>> = vec![Vec::new(); size];
        let mut asked: Vec<Vec<usize>> = vec![Vec::new(); size];
        for (f, vertices) in facet_vertex.iter() {
            if !vertices.iter().all(|&v| seen_elsewhere(v)) {
                continue;
            }
            let mut key = vertices
                .iter()
                .map(|&v| {
                    vertex_map.local_to_global(v as usize).ok_or_else(|| {
                        TopologyError::InvalidAdjacency(format!("facet {f} vertex {v} has no global index"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            key.sort_unstable();
            let Some(&lowest) = key.first() else {
                continue;
            };
            let bucket = index_owner(size, lowest, global_space);
            let out = &mut send[bucket];
            out.push(WireIndex::of(key.len() as i64));
            out.extend(key.iter().map(|&g| WireIndex::of(g)));
            let mut cells = facet_cell.links(f).iter();
            for _ in 0..2 {
                let global = cells
                    .next()
                    .and_then(|&c| cell_map.local_to_global(c as usize))
                    .unwrap_or(-1);
                out.push(WireIndex::of(global));
            }
            asked[bucket].push(f);
        }
        let received = all_to_all(comm, &send, tags.advance())?;

        let replies = count_facet_cells(&received);
        let replies = agree(comm, replies, tags.advance())?;
        let answers = all_to_all(comm, &replies, tags.advance())?;

        let mut mismatch = Ok(());
        for (p, (facets, counts)) in asked.iter().zip(&answers).enumerate() {
            if facets.len() != counts.len() {
                mismatch = Err(TopologyError::comm(p, "interior facet reply length mismatch"));
                break;
            }
            for (&f, count) in facets.iter().zip(counts) {
                marker[f] |= count.get() >= 2;
            }
        }
        agree(comm, mismatch, tags.advance())?;
        Ok(marker)
    }

    fn compute_entity_permutations(
        &self,
        topology: &Topology<C>,
    ) -> Result<EntityPermutations, TopologyError> {
        let tdim = topology.dim();
        if tdim == 0 {
            return Err(TopologyError::InvalidDimension { dim: 0, tdim });
        }
        let cell_type = topology.cell_type();
        let cells = topology.connectivity(tdim, 0)?;
        let cell_facets = topology.connectivity(tdim, tdim - 1)?;
        let globals = vertex_globals(topology)?;
        let facet_refs = cell_type.entity_vertices(tdim - 1);
        let facet_shape = cell_type.facet_type();

        let mut facet_perms = Vec::with_capacity(cells.num_nodes() * facet_refs.len());
        let mut cell_perms = Vec::with_capacity(cells.num_nodes());
        for (c, vertices) in cells.iter() {
            check_cell(c, vertices, cell_type.num_vertices(), globals.len())?;
            if cell_facets.num_links(c) != facet_refs.len() {
                return Err(TopologyError::InvalidAdjacency(format!(
                    "cell {c} has {} facets, expected {}",
                    cell_facets.num_links(c),
                    facet_refs.len()
                )));
            }
            let cell_globals: Vec<i64> = vertices.iter().map(|&v| globals[v as usize]).collect();
            for facet in &facet_refs {
                let g: Vec<i64> = facet.iter().map(|&i| cell_globals[i]).collect();
                facet_perms.push(facet_permutation_code(facet_shape, &g));
            }
            cell_perms.push(cell_permutation_info(cell_type, &cell_globals));
        }
        EntityPermutations::new(facet_refs.len(), facet_perms, cell_perms)
    }
}

/// Bucket side of the interior facet match: the number of distinct cells
/// sharing each received facet, one reply per record.
fn count_facet_cells(received: &[Vec<WireIndex>]) -> Result<Vec<Vec<WireIndex>>, TopologyError> {
    let mut records: Vec<Vec<(Vec<i64>, [i64; 2])>> = Vec::with_capacity(received.len());
    for (p, words) in received.iter().enumerate() {
        let words: Vec<i64> = words.iter().map(WireIndex::get).collect();
        let mut rest = words.as_slice();
        let mut from_p = Vec::new();
        while let Some((&k, tail)) = rest.split_first() {
            let k = usize::try_from(k)
                .map_err(|_| TopologyError::comm(p, "negative interior facet record length"))?;
            if tail.len() < k + 2 {
                return Err(TopologyError::comm(p, "truncated interior facet record"));
            }
            let (key, tail) = tail.split_at(k);
            from_p.push((key.to_vec(), [tail[0], tail[1]]));
            rest = &tail[2..];
        }
        records.push(from_p);
    }

    let mut cells_of: BTreeMap<&[i64], BTreeSet<i64>> = BTreeMap::new();
    for (key, cells) in records.iter().flatten() {
        cells_of
            .entry(key.as_slice())
            .or_default()
            .extend(cells.iter().copied().filter(|&c| c >= 0));
    }
    Ok(records
        .iter()
        .map(|from_p| {
            from_p
                .iter()
                .map(|(key, _)| {
                    let count = cells_of.get(key.as_slice()).map_or(0, BTreeSet::len);
                    WireIndex::of(count as i64)
                })
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::topology::serial_topology;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn two_tets() -> Topology<NoComm> {
        // tets sharing face (1, 2, 3)
        let cells = AdjacencyList::from_nested(vec![vec![0, 1, 2, 3], vec![1, 2, 3, 4]]);
        serial_topology(CellType::Tetrahedron, cells, 5).unwrap()
    }

    #[test]
    fn tet_entities() {
        let topo = two_tets();
        assert_eq!(topo.index_map(1).unwrap().size_local(), 9);
        assert_eq!(topo.index_map(2).unwrap().size_local(), 7);
        let face_vertex = topo.connectivity(2, 0).unwrap();
        // face opposite vertex 0 of the first tet is the shared one
        let shared = topo.connectivity(3, 2).unwrap().links(0)[0];
        assert_eq!(face_vertex.links(shared as usize), &[1, 2, 3]);
    }

    #[test]
    fn face_edge_connectivity_through_cells() {
        let topo = two_tets();
        let face_edge = topo.connectivity(2, 1).unwrap();
        assert_eq!(face_edge.num_nodes(), 7);
        assert!(face_edge.iter().all(|(_, edges)| edges.len() == 3));
        let edge_vertex = topo.connectivity(1, 0).unwrap();
        let face_vertex = topo.connectivity(2, 0).unwrap();
        for (f, edges) in face_edge.iter() {
            for &e in edges {
                for v in edge_vertex.links(e as usize) {
                    assert!(face_vertex.links(f).contains(v));
                }
            }
        }
    }

    #[test]
    fn one_interior_face() {
        let topo = two_tets();
        let interior = topo.interior_facets().unwrap();
        assert_eq!(interior.len(), 7);
        assert_eq!(interior.iter().filter(|f| **f).count(), 1);
    }

    #[test]
    fn permutations_of_sorted_cells_are_trivial() {
        let topo = two_tets();
        let perms = topo.entity_permutations().unwrap();
        assert_eq!(perms.num_cells(), 2);
        assert_eq!(perms.facets_per_cell(), 4);
        assert!(perms.cell_permutations().iter().all(|&p| p == 0));
        assert!(perms.facet_permutations().iter().all(|&p| p == 0));
    }

    #[test]
    fn reflected_triangle_edges() {
        let cells = AdjacencyList::from_nested(vec![vec![2, 1, 0]]);
        let topo = serial_topology(CellType::Triangle, cells, 3).unwrap();
        let perms = topo.entity_permutations().unwrap();
        assert_eq!(perms.cell_permutation_info(0), 0b111);
        assert_eq!(perms.cell_facets(0), &[1, 1, 1]);
    }

    #[test]
    fn quad_entities() {
        // two quads sharing edge (1, 4)
        let cells = AdjacencyList::from_nested(vec![vec![0, 1, 3, 4], vec![1, 2, 4, 5]]);
        let topo = serial_topology(CellType::Quadrilateral, cells, 6).unwrap();
        assert_eq!(topo.index_map(1).unwrap().size_local(), 7);
        assert_eq!(topo.on_boundary(0).unwrap(), vec![true; 6]);
    }

    #[test]
    fn hex_faces_start_at_their_lowest_vertex() {
        let cells = AdjacencyList::from_nested(vec![vec![0, 1, 3, 2, 4, 5, 7, 6]]);
        let topo = serial_topology(CellType::Hexahedron, cells, 8).unwrap();
        let face_vertex = topo.connectivity(2, 0).unwrap();
        assert_eq!(face_vertex.num_nodes(), 6);
        let bottom = topo.connectivity(3, 2).unwrap().links(0)[0];
        assert_eq!(face_vertex.links(bottom as usize), &[0, 1, 3, 2]);
        for (_, face) in face_vertex.iter() {
            assert_eq!(face[0], *face.iter().min().unwrap());
            assert!(face[1] < face[2]);
        }
        // edges keep their sorted vertex order
        let edge_vertex = topo.connectivity(1, 0).unwrap();
        assert!(edge_vertex.iter().all(|(_, e)| e[0] < e[1]));
    }

    #[test]
    fn bad_dimension_for_entities() {
        let topo = two_tets();
        let err = LocalComputation.compute_entities(&topo, 3).unwrap_err();
        assert!(matches!(err, TopologyError::InvalidDimension { dim: 3, tdim: 3 }));
    }

    struct Counting {
        inner: LocalComputation,
        interior_calls: AtomicUsize,
    }

    impl TopologyComputation<NoComm> for Counting {
        fn compute_entities(
            &self,
            topology: &Topology<NoComm>,
            dim: usize,
        ) -> Result<EntitySet, TopologyError> {
            self.inner.compute_entities(topology, dim)
        }
        fn compute_connectivity(
            &self,
            topology: &Topology<NoComm>,
            d0: usize,
            d1: usize,
        ) -> Result<AdjacencyList<i32>, TopologyError> {
            self.inner.compute_connectivity(topology, d0, d1)
        }
        fn compute_interior_facets(
            &self,
            topology: &Topology<NoComm>,
        ) -> Result<Vec<bool>, TopologyError> {
            self.interior_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.compute_interior_facets(topology)
        }
        fn compute_entity_permutations(
            &self,
            topology: &Topology<NoComm>,
        ) -> Result<EntityPermutations, TopologyError> {
            self.inner.compute_entity_permutations(topology)
        }
    }

    #[test]
    fn custom_computation_runs_once_per_value() {
        let counting = Arc::new(Counting {
            inner: LocalComputation,
            interior_calls: AtomicUsize::new(0),
        });
        let topo = two_tets().with_computation(counting.clone());
        topo.interior_facets().unwrap();
        topo.interior_facets().unwrap();
        topo.on_boundary(2).unwrap();
        assert_eq!(counting.interior_calls.load(Ordering::SeqCst), 1);
        topo.discard_remanent();
        topo.interior_facets().unwrap();
        assert_eq!(counting.interior_calls.load(Ordering::SeqCst), 2);
    }
}
