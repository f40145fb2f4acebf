//! Distributed vertex ownership and renumbering.
//!
//! Input on every rank: cells as lists of *global* vertex indices (owned
//! cells first, then ghost cells) and the set of *boundary candidates*, the
//! vertices of owned cells that other ranks may also reference. Output: a
//! local vertex numbering with owned vertices first and ghosts last, the new
//! global index of every ghost, and the cells in local vertex indices.
//!
//! Phases:
//!
//! 1. **Index sharing.** Candidates are sent to a bucket rank chosen by
//!    [`index_owner`]; the bucket reports back the sorted list of claimant
//!    ranks. The smallest claimant owns the vertex.
//! 2. **Numbering.** Purely local vertices are numbered first, then owned
//!    candidates. The owned block starts at the exclusive prefix sum of the
//!    owned counts.
//! 3. **Round 1.** Owners push `(old global, new global)` pairs to the other
//!    claimants over the vertex-sharing neighbor graph. Receivers take ghost
//!    slots in arrival order.
//! 4. **Round 2+.** Ranks forward the pairs of every vertex of a cell they
//!    share, reaching ranks that only see a vertex through a ghost cell.
//!    Rounds repeat until no ghost slot is unresolved (bounded by the
//!    communicator size).
//!
//! Every local failure is agreed on before the next exchange, so all ranks
//! leave together: the detecting rank with its own error, the others with
//! [`TopologyError::RemoteFailure`].

use crate::algs::communicator::{Communicator, ExchangeTags};
use crate::algs::exchange::{
    agree, all_reduce_max_i64, all_reduce_sum_u64, all_to_all, exclusive_scan_sum_u64,
    neighbor_all_to_all,
};
use crate::algs::wire::{WireIndex, WireIndexPair};
use crate::mesh_error::TopologyError;
use crate::topology::adjacency::AdjacencyList;
use crate::topology::index_map::IndexMap;
use std::collections::{BTreeMap, BTreeSet};

/// Unassigned local index.
const UNRESOLVED: i32 = -1;

/// Tag pairs used by [`compute_index_sharing`].
pub const INDEX_SHARING_TAG_PAIRS: u16 = 4;

/// Tag pairs used by each propagation round; rounds run in sequence and
/// reuse them.
const ROUND_TAG_PAIRS: u16 = 4;

/// Result of [`resolve_vertex_ownership`] on one rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VertexOwnership {
    /// Number of owned vertices; local indices `0..size_local`.
    pub size_local: usize,
    /// Global index of local vertex 0.
    pub global_offset: i64,
    /// New global index of each ghost vertex, local index `size_local + k`.
    pub ghosts: Vec<i64>,
    /// Input global index of every local vertex.
    pub input_globals: Vec<i64>,
    /// The input cells in local vertex indices.
    pub cells: AdjacencyList<i32>,
}

/// Bucket rank responsible for `index` when `global_space` indices are
/// split into `size` contiguous blocks of near-equal length.
pub fn index_owner(size: usize, index: i64, global_space: i64) -> usize {
    let size_i = size.max(1) as i64;
    let n = global_space / size_i;
    let r = global_space % size_i;
    let owner = if index < r * (n + 1) {
        index / (n + 1)
    } else if n > 0 {
        r + (index - r * (n + 1)) / n
    } else {
        size_i - 1
    };
    owner.clamp(0, size_i - 1) as usize
}

/// For every index in `unknown`, the sorted list of ranks that passed it.
///
/// Collective: every rank calls it, with possibly empty `unknown`. Uses
/// [`INDEX_SHARING_TAG_PAIRS`] pairs from `tags`.
pub fn compute_index_sharing<C: Communicator>(
    comm: &C,
    unknown: &BTreeSet<i64>,
    tags: ExchangeTags,
) -> Result<BTreeMap<i64, Vec<usize>>, TopologyError> {
    let mut tags = tags;
    let size = comm.size();
    let max_index = unknown.last().copied().unwrap_or(-1);
    let global_space = all_reduce_max_i64(comm, max_index, tags.advance())? + 1;

    let mut send: Vec<Vec<WireIndex>> = vec![Vec::new(); size];
    for &g in unknown {
        send[index_owner(size, g, global_space)].push(WireIndex::of(g));
    }
    let received = all_to_all(comm, &send, tags.advance())?;

    // ranks are visited in ascending order, so claimant lists come out sorted
    let mut claimants: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (p, indices) in received.iter().enumerate() {
        for g in indices.iter().map(WireIndex::get) {
            claimants.entry(g).or_default().push(p);
        }
    }

    // reply per claim: [count, rank, rank, ...]
    let replies: Vec<Vec<WireIndex>> = received
        .iter()
        .map(|indices| {
            let mut out = Vec::new();
            for g in indices.iter().map(WireIndex::get) {
                let ranks = claimants.get(&g).map_or(&[][..], Vec::as_slice);
                out.push(WireIndex::of(ranks.len() as i64));
                out.extend(ranks.iter().map(|&r| WireIndex::of(r as i64)));
            }
            out
        })
        .collect();
    let answers = all_to_all(comm, &replies, tags.advance())?;

    let sharing = parse_sharing(&send, &answers);
    agree(comm, sharing, tags.advance())
}

/// Decode the `[count, rank, ...]` replies to the claims in `asked`.
fn parse_sharing(
    asked: &[Vec<WireIndex>],
    answers: &[Vec<WireIndex>],
) -> Result<BTreeMap<i64, Vec<usize>>, TopologyError> {
    let mut sharing = BTreeMap::new();
    for (p, (asked, answer)) in asked.iter().zip(answers).enumerate() {
        let mut cursor = answer.iter().map(WireIndex::get);
        let mut next = || {
            cursor
                .next()
                .ok_or_else(|| TopologyError::comm(p, "truncated index sharing reply"))
        };
        for g in asked.iter().map(WireIndex::get) {
            let count = next()?;
            if count <= 0 {
                return Err(TopologyError::UnclaimedIndex(g));
            }
            let ranks = (0..count)
                .map(|_| next().map(|r| r as usize))
                .collect::<Result<Vec<_>, _>>()?;
            sharing.insert(g, ranks);
        }
    }
    Ok(sharing)
}

/// Vertices of owned cells that also appear in a ghost cell.
pub fn ghost_boundary_vertices(cells: &AdjacencyList<i64>, num_owned_cells: usize) -> BTreeSet<i64> {
    let ghost_vertices: BTreeSet<i64> = (num_owned_cells..cells.num_nodes())
        .flat_map(|c| cells.links(c).iter().copied())
        .collect();
    (0..num_owned_cells)
        .flat_map(|c| cells.links(c).iter().copied())
        .filter(|v| ghost_vertices.contains(v))
        .collect()
}

/// Local numbering under construction.
struct Numbering {
    local: BTreeMap<i64, i32>,
    ghosts: Vec<i64>,
    size_local: usize,
    next: i32,
}

impl Numbering {
    fn global_of(&self, old: i64, offset: i64) -> Option<i64> {
        let l = *self.local.get(&old)?;
        if l == UNRESOLVED {
            None
        } else if (l as usize) < self.size_local {
            Some(offset + l as i64)
        } else {
            self.ghosts.get(l as usize - self.size_local).copied()
        }
    }

    /// Record a ghost; `Ok(true)` if the slot was newly filled.
    fn assign_ghost(&mut self, old: i64, new: i64) -> Result<bool, TopologyError> {
        let slot = self.local.get_mut(&old).ok_or_else(|| TopologyError::InvalidGhost {
            global: old,
            reason: "received for a vertex not referenced by any local cell".into(),
        })?;
        if *slot != UNRESOLVED {
            return Ok(false);
        }
        *slot = self.next;
        let k = self.next as usize - self.size_local;
        let ghost = self.ghosts.get_mut(k).ok_or_else(|| TopologyError::InvalidGhost {
            global: old,
            reason: "more ghosts received than slots available".into(),
        })?;
        *ghost = new;
        self.next += 1;
        Ok(true)
    }

    fn unresolved(&self) -> usize {
        self.local.values().filter(|&&l| l == UNRESOLVED).count()
    }
}

fn neighbor_slots(neighbors: &[usize]) -> BTreeMap<usize, usize> {
    neighbors.iter().enumerate().map(|(i, &p)| (p, i)).collect()
}

/// Resolve ownership of every vertex referenced by `cells`.
///
/// `cell_map` describes the cells (owned cells first, ghost cells last, with
/// ghost owners). `candidates` are the vertices of owned cells that other
/// ranks may also reference; all other vertices of owned cells are owned
/// here without communication.
///
/// Collective over `comm`, including on failure. Uses the tag pairs from
/// `tags` onwards; give it the last block of any sequence of phases.
pub fn resolve_vertex_ownership<C: Communicator>(
    comm: &C,
    cells: &AdjacencyList<i64>,
    cell_map: &IndexMap,
    candidates: &BTreeSet<i64>,
    tags: ExchangeTags,
) -> Result<VertexOwnership, TopologyError> {
    let mut tags = tags;
    let me = comm.rank();
    let num_owned_cells = cell_map.size_local();
    let consistent = if cell_map.size_with_ghosts() == cells.num_nodes() {
        Ok(())
    } else {
        Err(TopologyError::InvalidGhostCells(format!(
            "{} cells but cell index map covers {}",
            cells.num_nodes(),
            cell_map.size_with_ghosts()
        )))
    };
    agree(comm, consistent, tags.advance())?;

    // 1) classify
    let owned_cell_vertices: BTreeSet<i64> = (0..num_owned_cells)
        .flat_map(|c| cells.links(c).iter().copied())
        .collect();
    let unknown: BTreeSet<i64> = candidates
        .intersection(&owned_cell_vertices)
        .copied()
        .collect();
    let mut local: BTreeMap<i64, i32> = cells.array().iter().map(|&v| (v, UNRESOLVED)).collect();
    let sharing = compute_index_sharing(comm, &unknown, tags.reserve(INDEX_SHARING_TAG_PAIRS))?;

    // 2) number owned vertices: purely local first, then owned candidates
    let mut next = 0i32;
    for v in owned_cell_vertices.iter().filter(|v| !unknown.contains(v)) {
        local.insert(*v, next);
        next += 1;
    }
    let mut claimed = Ok(());
    for (g, procs) in &sharing {
        if procs.first() == Some(&me) {
            local.insert(*g, next);
            next += 1;
        } else if !procs.contains(&me) {
            claimed = Err(TopologyError::InvalidGhost {
                global: *g,
                reason: format!("claimants {procs:?} do not include rank {me}"),
            });
            break;
        }
    }
    agree(comm, claimed, tags.advance())?;
    let size_local = next as usize;
    let num_ghosts = local.len() - size_local;
    let global_offset = exclusive_scan_sum_u64(comm, size_local as u64, tags.advance())? as i64;
    let mut numbering = Numbering {
        local,
        ghosts: vec![-1; num_ghosts],
        size_local,
        next,
    };
    log::debug!(
        "rank {me}: {} boundary candidates, {size_local} owned vertices at offset {global_offset}, {num_ghosts} ghosts",
        unknown.len()
    );

    // 3) round 1: owners push new indices to the other claimants
    let vertex_neighbors: BTreeSet<usize> = sharing
        .values()
        .flatten()
        .copied()
        .filter(|&p| p != me)
        .collect();
    let neighbors: Vec<usize> = vertex_neighbors.iter().copied().collect();
    let slots = neighbor_slots(&neighbors);
    let send = sharing
        .iter()
        .filter(|(_, procs)| procs.first() == Some(&me))
        .try_fold(vec![Vec::new(); neighbors.len()], |mut send, (g, procs)| {
            let new = numbering
                .global_of(*g, global_offset)
                .ok_or(TopologyError::UnclaimedIndex(*g))?;
            for p in &procs[1..] {
                send[slots[p]].push(WireIndexPair::new(*g, new));
            }
            Ok::<_, TopologyError>(send)
        });
    let send: Vec<Vec<WireIndexPair>> = agree(comm, send, tags.advance())?;
    log::debug!("rank {me}: round 1 with {} vertex neighbors", neighbors.len());
    let received = neighbor_all_to_all(comm, &neighbors, &send, tags.advance())?;
    let assigned = received.iter().flatten().try_for_each(|pair| {
        if numbering.assign_ghost(pair.key(), pair.value())? {
            Ok(())
        } else {
            Err(TopologyError::InvalidGhost {
                global: pair.key(),
                reason: "received ownership for an already numbered vertex".into(),
            })
        }
    });
    agree(comm, assigned, tags.advance())?;

    // 4) rounds 2+: forward vertices of shared cells until every ghost is filled
    let shared_cells = cell_map.compute_shared_indices(comm, tags.reserve(IndexMap::TAG_PAIRS))?;
    let mut cell_sharers: Vec<(usize, BTreeSet<usize>)> = shared_cells
        .into_iter()
        .map(|(c, ranks)| (c as usize, ranks))
        .collect();
    cell_sharers.extend(
        cell_map
            .ghost_owners()
            .iter()
            .enumerate()
            .map(|(k, &owner)| (num_owned_cells + k, BTreeSet::from([owner]))),
    );
    let mut round_neighbors = vertex_neighbors;
    round_neighbors.extend(cell_sharers.iter().flat_map(|(_, r)| r.iter().copied()));
    round_neighbors.remove(&me);
    let neighbors: Vec<usize> = round_neighbors.into_iter().collect();
    let slots = neighbor_slots(&neighbors);

    let round_tags = tags.reserve(ROUND_TAG_PAIRS);
    let mut fresh: Option<BTreeSet<i64>> = None;
    let mut round = 2usize;
    loop {
        let mut tags = round_tags;
        // per neighbor, the vertices to forward, deduplicated and ordered
        let mut forward: Vec<BTreeSet<i64>> = vec![BTreeSet::new(); neighbors.len()];
        for (c, ranks) in &cell_sharers {
            for v in cells.links(*c) {
                if fresh.as_ref().is_some_and(|f| !f.contains(v)) {
                    continue;
                }
                for p in ranks {
                    if let Some(&s) = slots.get(p) {
                        forward[s].insert(*v);
                    }
                }
            }
        }
        let send: Vec<Vec<WireIndexPair>> = forward
            .iter()
            .map(|vs| {
                vs.iter()
                    .filter_map(|&v| {
                        numbering
                            .global_of(v, global_offset)
                            .map(|new| WireIndexPair::new(v, new))
                    })
                    .collect()
            })
            .collect();
        let received = neighbor_all_to_all(comm, &neighbors, &send, tags.advance())?;
        let resolved = received.iter().flatten().try_fold(BTreeSet::new(), |mut resolved, pair| {
            if numbering.assign_ghost(pair.key(), pair.value())? {
                resolved.insert(pair.key());
            }
            Ok::<_, TopologyError>(resolved)
        });
        let resolved = agree(comm, resolved, tags.advance())?;

        let remaining = numbering.unresolved();
        let total_remaining = all_reduce_sum_u64(comm, remaining as u64, tags.advance())?;
        if total_remaining == 0 {
            break;
        }
        let progress = all_reduce_sum_u64(comm, resolved.len() as u64, tags.advance())?;
        if progress == 0 || round > comm.size() {
            return Err(TopologyError::UnresolvedGhosts { count: remaining });
        }
        round += 1;
        if round == 3 {
            log::warn!("ghost vertex propagation needs more than two rounds");
        }
        log::debug!("rank {me}: propagation round {round}, {remaining} ghosts unresolved");
        fresh = Some(resolved);
    }

    // 5) translate cells
    let Numbering { local, ghosts, .. } = numbering;
    let mut input_globals = vec![0i64; local.len()];
    for (&g, &l) in &local {
        input_globals[l as usize] = g;
    }
    let cells_local = agree(comm, translate_cells(cells, &local), tags.advance())?;
    Ok(VertexOwnership {
        size_local,
        global_offset,
        ghosts,
        input_globals,
        cells: cells_local,
    })
}

fn lookup(local: &BTreeMap<i64, i32>, v: i64) -> Result<i32, TopologyError> {
    local.get(&v).copied().ok_or_else(|| TopologyError::InvalidGhost {
        global: v,
        reason: "vertex missing from local numbering".into(),
    })
}

#[cfg(not(feature = "rayon"))]
fn translate_cells(
    cells: &AdjacencyList<i64>,
    local: &BTreeMap<i64, i32>,
) -> Result<AdjacencyList<i32>, TopologyError> {
    cells.map_links(|&v| lookup(local, v))
}

#[cfg(feature = "rayon")]
fn translate_cells(
    cells: &AdjacencyList<i64>,
    local: &BTreeMap<i64, i32>,
) -> Result<AdjacencyList<i32>, TopologyError> {
    use rayon::prelude::*;
    let array = cells
        .array()
        .par_iter()
        .map(|&v| lookup(local, v))
        .collect::<Result<Vec<_>, _>>()?;
    AdjacencyList::new(array, cells.offsets().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadComm};

    #[test]
    fn index_owner_splits_evenly() {
        // 10 indices over 3 ranks: blocks of 4, 3, 3
        let owners: Vec<usize> = (0..10).map(|i| index_owner(3, i, 10)).collect();
        assert_eq!(owners, vec![0, 0, 0, 0, 1, 1, 1, 2, 2, 2]);
        // fewer indices than ranks
        assert_eq!(index_owner(4, 1, 2), 1);
        assert_eq!(index_owner(1, 7, 8), 0);
    }

    #[test]
    fn ghost_boundary_from_cells() {
        let cells = AdjacencyList::from_nested(vec![vec![0, 1], vec![1, 2], vec![2, 3]]);
        assert_eq!(ghost_boundary_vertices(&cells, 2), BTreeSet::from([2]));
        assert!(ghost_boundary_vertices(&cells, 3).is_empty());
    }

    #[test]
    fn serial_numbering_is_sorted() {
        let cells = AdjacencyList::from_nested(vec![vec![40, 10], vec![10, 20]]);
        let map = IndexMap::local(2);
        let own = resolve_vertex_ownership(
            &NoComm,
            &cells,
            &map,
            &BTreeSet::from([40]),
            ExchangeTags::default(),
        )
        .unwrap();
        assert_eq!(own.size_local, 3);
        assert!(own.ghosts.is_empty());
        // purely local 10, 20 first, then the owned candidate 40
        assert_eq!(own.input_globals, vec![10, 20, 40]);
        assert_eq!(own.cells.links(0), &[2, 0]);
    }

    #[test]
    fn sharing_lists_every_claimant() {
        let comms = ThreadComm::universe(3);
        let out: Vec<_> = std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let mine = match comm.rank() {
                            0 => BTreeSet::from([5, 9]),
                            1 => BTreeSet::from([5]),
                            _ => BTreeSet::from([0, 5, 9]),
                        };
                        compute_index_sharing(&comm, &mine, ExchangeTags::default()).unwrap()
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(out[0][&5], vec![0, 1, 2]);
        assert_eq!(out[0][&9], vec![0, 2]);
        assert_eq!(out[1][&5], vec![0, 1, 2]);
        assert_eq!(out[2][&0], vec![2]);
    }

    /// Runs `resolve_vertex_ownership` on `cells.len()` thread ranks; rank
    /// `r` owns `owned[r]` of its cells and ghosts the rest from `ghosts[r]`
    /// (global cell index, owner).
    fn resolve_on_ranks(
        cells: Vec<Vec<Vec<i64>>>,
        owned: Vec<usize>,
        ghosts: Vec<Vec<i64>>,
        candidates: Vec<BTreeSet<i64>>,
    ) -> Vec<Result<VertexOwnership, TopologyError>> {
        let comms = ThreadComm::universe(cells.len());
        std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let r = comm.rank();
                    let cells = AdjacencyList::from_nested(cells[r].clone());
                    let (owned, ghosts, candidates) =
                        (owned[r], ghosts[r].clone(), candidates[r].clone());
                    s.spawn(move || -> Result<VertexOwnership, TopologyError> {
                        let tags = ExchangeTags::default();
                        let cell_map = IndexMap::new(&comm, owned, ghosts, tags)?;
                        resolve_vertex_ownership(&comm, &cells, &cell_map, &candidates, tags.phase(1))
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn inconsistent_ghost_cells_fail_on_every_rank() {
        // rank 0 ghosts cell 1 as [1, 2]; its owner, rank 1, stores it as
        // [0, 1] and never learns of vertex 2
        let out = resolve_on_ranks(
            vec![vec![vec![0, 1], vec![1, 2]], vec![vec![0, 1]]],
            vec![1, 1],
            vec![vec![1], vec![]],
            vec![BTreeSet::from([1]), BTreeSet::new()],
        );
        assert!(matches!(out[0], Err(TopologyError::UnresolvedGhosts { count: 1 })));
        assert!(matches!(out[1], Err(TopologyError::UnresolvedGhosts { count: 0 })));
    }

    #[test]
    fn third_round_reaches_a_ghost_of_a_ghost() {
        // rank 0 owns cells 0 = [100, 101] and 1 = [102, 103]; rank 1 ghosts
        // cell 0 and cell 3 as [100, 300, 301]; rank 2 owns cell 3 as
        // [300, 301] and ghosts cell 1 as [100, 102, 103]. Rank 2 hears of
        // 100 only from rank 1, one round after rank 1 hears of it.
        let out = resolve_on_ranks(
            vec![
                vec![vec![100, 101], vec![102, 103]],
                vec![vec![200, 201], vec![100, 101], vec![100, 300, 301]],
                vec![vec![300, 301], vec![100, 102, 103]],
            ],
            vec![2, 1, 1],
            vec![vec![], vec![0, 3], vec![1]],
            vec![BTreeSet::new(); 3],
        );
        let out: Vec<VertexOwnership> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(out[0].size_local, 4);
        assert!(out[0].ghosts.is_empty());
        assert_eq!(out[1].global_offset, 4);
        assert_eq!(out[1].ghosts, vec![0, 1, 6, 7]);
        assert_eq!(out[2].global_offset, 6);
        assert_eq!(out[2].ghosts, vec![2, 3, 0]);
        assert_eq!(out[2].input_globals, vec![300, 301, 102, 103, 100]);
    }
}
