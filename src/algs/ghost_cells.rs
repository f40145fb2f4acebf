//! Global indices of ghost cells.
//!
//! Cells are numbered globally by rank: rank `p` owns
//! `[offset_p, offset_p + num_local_p)`. A ghost cell is known to the ghosting
//! rank only by its original (input) index and its owner, so each rank asks
//! the owners for the new global index of its ghosts.

use crate::algs::communicator::{Communicator, ExchangeTags};
use crate::algs::exchange::{agree, all_to_all, exclusive_scan_sum_u64};
use crate::algs::wire::WireIndex;
use crate::mesh_error::TopologyError;
use hashbrown::HashMap;

/// Global index of every ghost cell, in the order of `ghost_owners`.
///
/// `original_cell_index` lists one original index per local cell, owned
/// cells first, followed by one per ghost cell; `ghost_owners[k]` owns the
/// `k`-th ghost cell.
///
/// Collective, including on failure: owners answer unknown requests with
/// `-1`, the requester reports [`TopologyError::GhostCellOwnerMismatch`] and
/// every other rank gets [`TopologyError::RemoteFailure`].
pub fn compute_ghost_indices<C: Communicator>(
    comm: &C,
    original_cell_index: &[i64],
    ghost_owners: &[usize],
    tags: ExchangeTags,
) -> Result<Vec<i64>, TopologyError> {
    let mut tags = tags;
    let me = comm.rank();
    let size = comm.size();
    let checked = original_cell_index
        .len()
        .checked_sub(ghost_owners.len())
        .ok_or_else(|| {
            TopologyError::InvalidGhostCells(format!(
                "{} ghost owners for {} cells",
                ghost_owners.len(),
                original_cell_index.len()
            ))
        })
        .and_then(|n| match ghost_owners.iter().find(|&&p| p >= size || p == me) {
            Some(&bad) => Err(TopologyError::InvalidGhostCells(format!(
                "ghost cell owner {bad} is not a remote rank of 0..{size}"
            ))),
            None => Ok(n),
        });
    let num_local = agree(comm, checked, tags.advance())?;

    let offset = exclusive_scan_sum_u64(comm, num_local as u64, tags.advance())? as i64;

    let mut requests: Vec<Vec<WireIndex>> = vec![Vec::new(); size];
    for (&original, &owner) in original_cell_index[num_local..].iter().zip(ghost_owners) {
        requests[owner].push(WireIndex::of(original));
    }
    let received = all_to_all(comm, &requests, tags.advance())?;

    let local_of: HashMap<i64, usize> = original_cell_index[..num_local]
        .iter()
        .enumerate()
        .map(|(i, &g)| (g, i))
        .collect();
    let replies: Vec<Vec<WireIndex>> = received
        .iter()
        .map(|asked| {
            asked
                .iter()
                .map(|w| {
                    let global = local_of
                        .get(&w.get())
                        .map_or(-1, |&i| offset + i as i64);
                    WireIndex::of(global)
                })
                .collect()
        })
        .collect();
    let answers = all_to_all(comm, &replies, tags.advance())?;

    // answers from each owner arrive in request order
    let mut cursors: Vec<_> = answers.iter().map(|a| a.iter()).collect();
    let resolved = original_cell_index[num_local..]
        .iter()
        .zip(ghost_owners)
        .map(|(&original, &owner)| match cursors[owner].next().map(WireIndex::get) {
            Some(g) if g >= 0 => Ok(g),
            _ => Err(TopologyError::GhostCellOwnerMismatch { original, owner }),
        })
        .collect::<Result<Vec<_>, _>>();
    let ghosts = agree(comm, resolved, tags.advance())?;
    log::debug!(
        "rank {me}: {num_local} owned cells at offset {offset}, {} ghost cells",
        ghosts.len()
    );
    Ok(ghosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadComm};

    #[test]
    fn serial_without_ghosts() {
        let g = compute_ghost_indices(&NoComm, &[7, 3], &[], ExchangeTags::default()).unwrap();
        assert!(g.is_empty());
    }

    #[test]
    fn too_many_owners_rejected() {
        let err = compute_ghost_indices(&NoComm, &[1], &[0, 0], ExchangeTags::default())
            .unwrap_err();
        assert!(matches!(err, TopologyError::InvalidGhostCells(_)));
    }

    #[test]
    fn self_owned_ghost_rejected() {
        let err =
            compute_ghost_indices(&NoComm, &[1, 2], &[0], ExchangeTags::default()).unwrap_err();
        assert!(matches!(err, TopologyError::InvalidGhostCells(_)));
    }

    #[test]
    fn bad_owner_on_one_rank_fails_on_every_rank() {
        let comms = ThreadComm::universe(2);
        let out: Vec<_> = std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let (orig, owners): (Vec<i64>, Vec<usize>) = match comm.rank() {
                            0 => (vec![0, 1], vec![5]),
                            _ => (vec![1], vec![]),
                        };
                        compute_ghost_indices(&comm, &orig, &owners, ExchangeTags::default())
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(matches!(out[0], Err(TopologyError::InvalidGhostCells(_))));
        assert!(matches!(out[1], Err(TopologyError::RemoteFailure { .. })));
    }

    #[test]
    fn two_ranks_swap_one_ghost() {
        // rank 0 owns original cells 10, 11; rank 1 owns 12, 13, 14
        let comms = ThreadComm::universe(2);
        let out: Vec<_> = std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let (orig, owners): (Vec<i64>, Vec<usize>) = match comm.rank() {
                            0 => (vec![10, 11, 12], vec![1]),
                            _ => (vec![12, 13, 14, 11], vec![0]),
                        };
                        compute_ghost_indices(&comm, &orig, &owners, ExchangeTags::default())
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(out[0].as_ref().unwrap(), &vec![2]);
        assert_eq!(out[1].as_ref().unwrap(), &vec![1]);
    }

    #[test]
    fn unknown_original_index_fails_on_every_rank() {
        let comms = ThreadComm::universe(2);
        let out: Vec<_> = std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let (orig, owners): (Vec<i64>, Vec<usize>) = match comm.rank() {
                            0 => (vec![0, 99], vec![1]),
                            _ => (vec![1], vec![]),
                        };
                        compute_ghost_indices(&comm, &orig, &owners, ExchangeTags::default())
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(matches!(
            out[0],
            Err(TopologyError::GhostCellOwnerMismatch { original: 99, owner: 1 })
        ));
        assert!(matches!(
            out[1],
            Err(TopologyError::RemoteFailure { failed_ranks: 1 })
        ));
    }
}
