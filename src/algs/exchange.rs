//! Collective and neighborhood exchanges built on point-to-point messages.
//!
//! Every exchange runs the same two-stage protocol:
//!  1. each pair of participating ranks trades a [`WireCount`] header,
//!  2. non-empty payloads are posted and received with the now-known sizes.
//!
//! All send handles are drained before returning, even on error. The local
//! rank's own payload is moved across without touching the communicator.
//! Every call is blocking: no rank leaves an exchange before its own
//! receives have completed.

use crate::algs::communicator::{Communicator, ExchangeTags, Wait};
use crate::algs::wire::{WireCount, WireIndex, cast_slice, decode_records, expect_exact_len};
use crate::mesh_error::TopologyError;
use bytemuck::Pod;

/// Exchange variable-length buffers with an explicit list of peers.
///
/// `outgoing[i]` is delivered to `peers[i]`; the returned vector holds, at
/// position `i`, what `peers[i]` sent to this rank. The peer graph must be
/// symmetric: if `a` lists `b`, then `b` lists `a`.
pub fn exchange_with_peers<C, T>(
    comm: &C,
    peers: &[usize],
    outgoing: &[Vec<T>],
    tags: ExchangeTags,
) -> Result<Vec<Vec<T>>, TopologyError>
where
    C: Communicator,
    T: Pod,
{
    let me = comm.rank();
    if peers.len() != outgoing.len() {
        return Err(TopologyError::comm(
            me,
            format!(
                "{} outgoing buffers for {} peers",
                outgoing.len(),
                peers.len()
            ),
        ));
    }

    // 1) post count receives
    let mut count_recvs = Vec::with_capacity(peers.len());
    for &peer in peers.iter().filter(|&&p| p != me) {
        let h = comm.irecv(peer, tags.sizes.as_u16(), std::mem::size_of::<WireCount>());
        count_recvs.push((peer, h));
    }

    // 2) post count sends
    let mut pending_sends = Vec::with_capacity(2 * peers.len());
    for (&peer, items) in peers.iter().zip(outgoing) {
        if peer == me {
            continue;
        }
        let count = WireCount::new(items.len());
        pending_sends.push(comm.isend(
            peer,
            tags.sizes.as_u16(),
            cast_slice(std::slice::from_ref(&count)),
        ));
    }

    // 3) wait for all counts (but do not early-return)
    let mut counts = vec![0usize; peers.len()];
    let mut maybe_err = None;
    for (peer, h) in count_recvs {
        match h.wait() {
            Some(data) if maybe_err.is_none() => {
                match expect_exact_len(data.len(), std::mem::size_of::<WireCount>())
                    .and_then(|_| decode_records::<WireCount>(&data))
                {
                    Ok(c) => {
                        for (slot, &p) in counts.iter_mut().zip(peers) {
                            if p == peer {
                                *slot = c[0].get();
                            }
                        }
                    }
                    Err(msg) => maybe_err = Some(TopologyError::comm(peer, msg)),
                }
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(TopologyError::comm(
                    peer,
                    format!("failed to receive size from rank {peer}"),
                ));
            }
            _ => {} // already have an error; just drain
        }
    }
    if let Some(err) = maybe_err {
        for send in pending_sends {
            let _ = send.wait();
        }
        return Err(err);
    }

    // 4) post payload receives for non-empty messages
    let rec = std::mem::size_of::<T>();
    let mut data_recvs = Vec::new();
    for (i, &peer) in peers.iter().enumerate() {
        if peer != me && counts[i] > 0 {
            data_recvs.push((i, comm.irecv(peer, tags.data.as_u16(), counts[i] * rec)));
        }
    }

    // 5) post payload sends
    for (&peer, items) in peers.iter().zip(outgoing) {
        if peer != me && !items.is_empty() {
            pending_sends.push(comm.isend(peer, tags.data.as_u16(), cast_slice(items)));
        }
    }

    // 6) collect payloads
    let mut incoming: Vec<Vec<T>> = vec![Vec::new(); peers.len()];
    for (i, &peer) in peers.iter().enumerate() {
        if peer == me {
            incoming[i] = outgoing[i].clone();
        }
    }
    for (i, h) in data_recvs {
        let peer = peers[i];
        match h.wait() {
            Some(data) if maybe_err.is_none() => {
                match expect_exact_len(data.len(), counts[i] * rec)
                    .and_then(|_| decode_records::<T>(&data))
                {
                    Ok(records) => incoming[i] = records,
                    Err(msg) => maybe_err = Some(TopologyError::comm(peer, msg)),
                }
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(TopologyError::comm(
                    peer,
                    format!("failed to receive payload from rank {peer}"),
                ));
            }
            _ => {}
        }
    }

    // 7) always drain all send handles before returning
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

/// Personalized all-to-all: `send[p]` goes to rank `p`.
pub fn all_to_all<C, T>(
    comm: &C,
    send: &[Vec<T>],
    tags: ExchangeTags,
) -> Result<Vec<Vec<T>>, TopologyError>
where
    C: Communicator,
    T: Pod,
{
    let peers: Vec<usize> = (0..comm.size()).collect();
    exchange_with_peers(comm, &peers, send, tags)
}

/// All-to-all restricted to the (symmetric) neighbor graph `neighbors`.
pub fn neighbor_all_to_all<C, T>(
    comm: &C,
    neighbors: &[usize],
    send: &[Vec<T>],
    tags: ExchangeTags,
) -> Result<Vec<Vec<T>>, TopologyError>
where
    C: Communicator,
    T: Pod,
{
    exchange_with_peers(comm, neighbors, send, tags)
}

/// Gather one value from every rank, in rank order.
pub fn all_gather_i64<C: Communicator>(
    comm: &C,
    value: i64,
    tags: ExchangeTags,
) -> Result<Vec<i64>, TopologyError> {
    let send = vec![vec![WireIndex::of(value)]; comm.size()];
    let recv = all_to_all(comm, &send, tags)?;
    recv.into_iter()
        .enumerate()
        .map(|(p, v)| {
            v.first()
                .map(WireIndex::get)
                .ok_or_else(|| TopologyError::comm(p, "empty all-gather contribution"))
        })
        .collect()
}

pub fn all_gather_u64<C: Communicator>(
    comm: &C,
    value: u64,
    tags: ExchangeTags,
) -> Result<Vec<u64>, TopologyError> {
    Ok(all_gather_i64(comm, value as i64, tags)?
        .into_iter()
        .map(|v| v as u64)
        .collect())
}

pub fn all_reduce_max_i64<C: Communicator>(
    comm: &C,
    value: i64,
    tags: ExchangeTags,
) -> Result<i64, TopologyError> {
    Ok(all_gather_i64(comm, value, tags)?
        .into_iter()
        .max()
        .unwrap_or(value))
}

pub fn all_reduce_sum_u64<C: Communicator>(
    comm: &C,
    value: u64,
    tags: ExchangeTags,
) -> Result<u64, TopologyError> {
    Ok(all_gather_u64(comm, value, tags)?.into_iter().sum())
}

/// Exclusive prefix sum over rank order (rank 0 receives 0).
pub fn exclusive_scan_sum_u64<C: Communicator>(
    comm: &C,
    value: u64,
    tags: ExchangeTags,
) -> Result<u64, TopologyError> {
    let all = all_gather_u64(comm, value, tags)?;
    Ok(all[..comm.rank()].iter().sum())
}

/// Make a locally computed outcome collective.
///
/// Every rank must call this at the same point. If any rank holds an error,
/// every rank returns one: the failing ranks their own, the others
/// [`TopologyError::RemoteFailure`]. Prevents a rank that bails out from
/// leaving its peers blocked in the next exchange.
pub fn agree<C, T>(
    comm: &C,
    local: Result<T, TopologyError>,
    tags: ExchangeTags,
) -> Result<T, TopologyError>
where
    C: Communicator,
{
    let failed = all_reduce_sum_u64(comm, u64::from(local.is_err()), tags)? as usize;
    match local {
        Ok(_) if failed > 0 => Err(TopologyError::RemoteFailure {
            failed_ranks: failed,
        }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadComm};

    fn run_ranks<F, R>(n: usize, f: F) -> Vec<R>
    where
        F: Fn(ThreadComm) -> R + Sync,
        R: Send,
    {
        let comms = ThreadComm::universe(n);
        std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|c| {
                    let f = &f;
                    s.spawn(move || f(c))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn serial_all_to_all_is_identity() {
        let send = vec![vec![WireIndex::of(5), WireIndex::of(6)]];
        let recv = all_to_all(&NoComm, &send, ExchangeTags::default()).unwrap();
        assert_eq!(recv, send);
    }

    #[test]
    fn all_to_all_three_ranks() {
        let out = run_ranks(3, |comm| {
            let me = comm.rank() as i64;
            // rank r sends r+1 copies of (10*r + p) to p, nothing to itself
            let send: Vec<Vec<WireIndex>> = (0..3)
                .map(|p| {
                    if p as i64 == me {
                        Vec::new()
                    } else {
                        vec![WireIndex::of(10 * me + p as i64); me as usize + 1]
                    }
                })
                .collect();
            all_to_all(&comm, &send, ExchangeTags::default()).unwrap()
        });
        for (me, recv) in out.iter().enumerate() {
            for (p, msg) in recv.iter().enumerate() {
                if p == me {
                    assert!(msg.is_empty());
                } else {
                    assert_eq!(msg.len(), p + 1);
                    assert!(msg.iter().all(|w| w.get() == (10 * p + me) as i64));
                }
            }
        }
    }

    #[test]
    fn neighbor_exchange_on_a_ring_subset() {
        // ranks 0-1-2-3 in a line: neighbors are adjacent ranks only
        let out = run_ranks(4, |comm| {
            let me = comm.rank();
            let nbrs: Vec<usize> = [me.checked_sub(1), Some(me + 1).filter(|&r| r < 4)]
                .into_iter()
                .flatten()
                .collect();
            let send: Vec<Vec<WireIndex>> = nbrs
                .iter()
                .map(|_| vec![WireIndex::of(me as i64)])
                .collect();
            let recv = neighbor_all_to_all(&comm, &nbrs, &send, ExchangeTags::default()).unwrap();
            nbrs.into_iter()
                .zip(recv)
                .map(|(n, v)| (n, v[0].get()))
                .collect::<Vec<_>>()
        });
        for pairs in out {
            for (n, v) in pairs {
                assert_eq!(n as i64, v);
            }
        }
    }

    #[test]
    fn scan_and_reductions() {
        let out = run_ranks(4, |comm| {
            let tags = ExchangeTags::default();
            let v = comm.rank() as u64 + 1;
            let scan = exclusive_scan_sum_u64(&comm, v, tags).unwrap();
            let sum = all_reduce_sum_u64(&comm, v, tags.next()).unwrap();
            let max = all_reduce_max_i64(&comm, -(v as i64), tags.next().next()).unwrap();
            (scan, sum, max)
        });
        let scans: Vec<u64> = out.iter().map(|o| o.0).collect();
        assert_eq!(scans, vec![0, 1, 3, 6]);
        assert!(out.iter().all(|o| o.1 == 10 && o.2 == -1));
    }

    #[test]
    fn agree_spreads_one_failure_to_every_rank() {
        let out = run_ranks(3, |comm| {
            let local = if comm.rank() == 1 {
                Err(TopologyError::UnclaimedIndex(7))
            } else {
                Ok(comm.rank())
            };
            agree(&comm, local, ExchangeTags::default())
        });
        assert!(matches!(out[0], Err(TopologyError::RemoteFailure { failed_ranks: 1 })));
        assert!(matches!(out[1], Err(TopologyError::UnclaimedIndex(7))));
        assert!(matches!(out[2], Err(TopologyError::RemoteFailure { failed_ranks: 1 })));

        let ok = run_ranks(2, |comm| agree(&comm, Ok(comm.rank()), ExchangeTags::default()));
        assert_eq!(ok[1].as_ref().unwrap(), &1);
    }

    #[test]
    fn mismatched_buffers_rejected() {
        let err = exchange_with_peers::<_, WireIndex>(&NoComm, &[0], &[], ExchangeTags::default())
            .unwrap_err();
        assert!(matches!(err, TopologyError::CommError { .. }));
    }
}
