//! Parallel layout of the entities of one topological dimension.
//!
//! An [`IndexMap`] tells a rank which contiguous block of the global index
//! space it owns (`[offset, offset + size_local)`), and for every ghost entry
//! appended after the owned block, its global index and owning rank. Offsets
//! are the exclusive prefix sum of `size_local` in rank order.

use crate::algs::communicator::{Communicator, ExchangeTags};
use crate::algs::exchange::{agree, all_gather_u64, all_to_all};
use crate::algs::wire::WireIndex;
use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::TopologyError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Owned range plus ghost bookkeeping for one entity dimension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMap {
    local_range: (i64, i64),
    size_global: i64,
    ghosts: Vec<i64>,
    ghost_owners: Vec<usize>,
}

impl IndexMap {
    /// Tag pairs used by [`IndexMap::new`] and by
    /// [`IndexMap::compute_shared_indices`].
    pub const TAG_PAIRS: u16 = 2;

    /// Collective constructor: computes the offset, the global size and the
    /// owner of each ghost from every rank's `size_local`.
    ///
    /// Uses the tag pairs `tags` and `tags.next()`. An invalid ghost on any
    /// rank fails the construction on every rank.
    pub fn new<C: Communicator>(
        comm: &C,
        size_local: usize,
        ghosts: Vec<i64>,
        tags: ExchangeTags,
    ) -> Result<Self, TopologyError> {
        let sizes = all_gather_u64(comm, size_local as u64, tags)?;
        let mut starts = Vec::with_capacity(sizes.len() + 1);
        let mut acc = 0i64;
        starts.push(0i64);
        for s in &sizes {
            acc += *s as i64;
            starts.push(acc);
        }
        let me = comm.rank();
        let local_range = (starts[me], starts[me + 1]);
        let size_global = acc;

        let owners = ghosts
            .iter()
            .map(|&g| {
                if g < 0 || g >= size_global {
                    return Err(TopologyError::InvalidGhost {
                        global: g,
                        reason: format!("outside global range 0..{size_global}"),
                    });
                }
                if g >= local_range.0 && g < local_range.1 {
                    return Err(TopologyError::InvalidGhost {
                        global: g,
                        reason: format!("owned by the calling rank {me}"),
                    });
                }
                // last rank whose range starts at or before g; empty ranges skipped
                Ok(starts.partition_point(|&s| s <= g) - 1)
            })
            .collect::<Result<Vec<_>, _>>();
        let ghost_owners = agree(comm, owners, tags.next())?;

        let map = Self {
            local_range,
            size_global,
            ghosts,
            ghost_owners,
        };
        map.debug_assert_invariants();
        Ok(map)
    }

    /// Rank-local map without ghosts; no communication.
    pub fn local(size_local: usize) -> Self {
        Self {
            local_range: (0, size_local as i64),
            size_global: size_local as i64,
            ghosts: Vec::new(),
            ghost_owners: Vec::new(),
        }
    }

    /// Assemble from already-known parts, validating them.
    pub fn from_parts(
        local_range: (i64, i64),
        size_global: i64,
        ghosts: Vec<i64>,
        ghost_owners: Vec<usize>,
    ) -> Result<Self, TopologyError> {
        let map = Self {
            local_range,
            size_global,
            ghosts,
            ghost_owners,
        };
        map.validate_invariants()?;
        Ok(map)
    }

    pub fn size_local(&self) -> usize {
        (self.local_range.1 - self.local_range.0) as usize
    }

    pub fn num_ghosts(&self) -> usize {
        self.ghosts.len()
    }

    /// Owned plus ghost entries.
    pub fn size_with_ghosts(&self) -> usize {
        self.size_local() + self.num_ghosts()
    }

    pub fn size_global(&self) -> usize {
        self.size_global as usize
    }

    /// `[offset, offset + size_local)` in the global index space.
    pub fn local_range(&self) -> (i64, i64) {
        self.local_range
    }

    pub fn ghosts(&self) -> &[i64] {
        &self.ghosts
    }

    pub fn ghost_owners(&self) -> &[usize] {
        &self.ghost_owners
    }

    /// Global index of a local (owned or ghost) index.
    pub fn local_to_global(&self, local: usize) -> Option<i64> {
        let n = self.size_local();
        if local < n {
            Some(self.local_range.0 + local as i64)
        } else {
            self.ghosts.get(local - n).copied()
        }
    }

    /// Global indices of all local entries, owned first.
    pub fn global_indices(&self) -> Vec<i64> {
        (self.local_range.0..self.local_range.1)
            .chain(self.ghosts.iter().copied())
            .collect()
    }

    /// Local index of a global index, if present on this rank.
    ///
    /// Ghost lookups are linear in the number of ghosts.
    pub fn global_to_local(&self, global: i64) -> Option<usize> {
        if global >= self.local_range.0 && global < self.local_range.1 {
            return Some((global - self.local_range.0) as usize);
        }
        self.ghosts
            .iter()
            .position(|&g| g == global)
            .map(|p| self.size_local() + p)
    }

    /// Owning rank of a local index (`my_rank` for owned entries).
    pub fn owner(&self, local: usize, my_rank: usize) -> Option<usize> {
        let n = self.size_local();
        if local < n {
            Some(my_rank)
        } else {
            self.ghost_owners.get(local - n).copied()
        }
    }

    /// For each owned local index ghosted elsewhere, the ranks ghosting it.
    ///
    /// Collective: every rank reports its ghosts to their owners. Uses the
    /// tag pairs `tags` and `tags.next()`.
    pub fn compute_shared_indices<C: Communicator>(
        &self,
        comm: &C,
        tags: ExchangeTags,
    ) -> Result<BTreeMap<i32, BTreeSet<usize>>, TopologyError> {
        let mut send = vec![Vec::new(); comm.size()];
        for (&g, &owner) in self.ghosts.iter().zip(&self.ghost_owners) {
            send[owner].push(WireIndex::of(g));
        }
        let recv = all_to_all(comm, &send, tags)?;

        let mut shared: BTreeMap<i32, BTreeSet<usize>> = BTreeMap::new();
        let mut unknown = None;
        'ranks: for (rank, globals) in recv.iter().enumerate() {
            for g in globals.iter().map(WireIndex::get) {
                match self.global_to_local(g).filter(|&l| l < self.size_local()) {
                    Some(local) => {
                        shared.entry(local as i32).or_default().insert(rank);
                    }
                    None => {
                        unknown = Some(TopologyError::InvalidGhost {
                            global: g,
                            reason: format!("rank {rank} ghosts an index not owned here"),
                        });
                        break 'ranks;
                    }
                }
            }
        }
        agree(comm, unknown.map_or(Ok(shared), Err), tags.next())
    }
}

impl DebugInvariants for IndexMap {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "IndexMap");
    }

    fn validate_invariants(&self) -> Result<(), TopologyError> {
        let (lo, hi) = self.local_range;
        if lo < 0 || hi < lo || hi > self.size_global {
            return Err(TopologyError::InvalidGhost {
                global: lo,
                reason: format!("local range [{lo}, {hi}) not within 0..{}", self.size_global),
            });
        }
        if self.ghosts.len() != self.ghost_owners.len() {
            return Err(TopologyError::InvalidGhost {
                global: -1,
                reason: format!(
                    "{} ghosts but {} ghost owners",
                    self.ghosts.len(),
                    self.ghost_owners.len()
                ),
            });
        }
        let mut seen = BTreeSet::new();
        for &g in &self.ghosts {
            if g < 0 || g >= self.size_global || (g >= lo && g < hi) || !seen.insert(g) {
                return Err(TopologyError::InvalidGhost {
                    global: g,
                    reason: "ghost must be a unique index owned by another rank".into(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadComm};

    #[test]
    fn serial_map_has_no_ghosts() {
        let m = IndexMap::new(&NoComm, 4, vec![], ExchangeTags::default()).unwrap();
        assert_eq!(m.local_range(), (0, 4));
        assert_eq!(m.size_global(), 4);
        assert_eq!(m, IndexMap::local(4));
    }

    #[test]
    fn ghost_in_own_range_rejected() {
        let err = IndexMap::new(&NoComm, 4, vec![2], ExchangeTags::default()).unwrap_err();
        assert!(matches!(err, TopologyError::InvalidGhost { global: 2, .. }));
    }

    #[test]
    fn owners_and_shared_indices_three_ranks() {
        // sizes 2, 0, 3 -> ranges [0,2), [2,2), [2,5)
        let comms = ThreadComm::universe(3);
        let maps: Vec<_> = std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let tags = ExchangeTags::default();
                        let (n, ghosts) = match comm.rank() {
                            0 => (2, vec![4]),
                            1 => (0, vec![1, 2]),
                            _ => (3, vec![0]),
                        };
                        let m = IndexMap::new(&comm, n, ghosts, tags).unwrap();
                        let shared = m.compute_shared_indices(&comm, tags.next().next()).unwrap();
                        (m, shared)
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(maps[0].0.ghost_owners(), &[2]);
        assert_eq!(maps[1].0.ghost_owners(), &[0, 2]);
        assert_eq!(maps[1].0.local_range(), (2, 2));
        assert_eq!(maps[2].0.ghost_owners(), &[0]);

        // rank 0 owns global 0 (ghosted by 2) and 1 (ghosted by 1)
        let s0 = &maps[0].1;
        assert_eq!(s0[&0], BTreeSet::from([2]));
        assert_eq!(s0[&1], BTreeSet::from([1]));
        // rank 2 owns global 2 (local 0, ghosted by 1) and 4 (local 2, ghosted by 0)
        let s2 = &maps[2].1;
        assert_eq!(s2[&0], BTreeSet::from([1]));
        assert_eq!(s2[&2], BTreeSet::from([0]));
        assert!(maps[1].1.is_empty());
    }

    #[test]
    fn local_global_lookup() {
        let m = IndexMap::from_parts((3, 5), 8, vec![7, 0], vec![2, 0]).unwrap();
        assert_eq!(m.local_to_global(1), Some(4));
        assert_eq!(m.local_to_global(2), Some(7));
        assert_eq!(m.global_to_local(0), Some(3));
        assert_eq!(m.global_to_local(6), None);
        assert_eq!(m.owner(3, 1), Some(0));
        assert_eq!(m.global_indices(), vec![3, 4, 7, 0]);
    }

    #[test]
    fn json_snapshot() {
        let m = IndexMap::from_parts((0, 2), 3, vec![2], vec![1]).unwrap();
        let s = serde_json::to_string(&m).unwrap();
        let back: IndexMap = serde_json::from_str(&s).unwrap();
        assert_eq!(back, m);
    }
}
