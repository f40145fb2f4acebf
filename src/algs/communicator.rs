//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable**: posting never blocks, `.wait()` does.
//! Messages sharing one `(source, destination, tag)` triple are delivered in
//! the order they were posted, mirroring MPI's non-overtaking rule, so the
//! collectives in [`crate::algs::exchange`] can reuse a tag pair across
//! independent rounds without confusing payloads.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Non-blocking point-to-point communication interface.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Rank of the calling process within the group.
    fn rank(&self) -> usize;
    /// Number of processes in the group.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive for a message of `len` bytes from `peer`.
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(u16);

impl CommTag {
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    pub const fn offset(self, by: u16) -> Self {
        Self(self.0.wrapping_add(by))
    }
}

/// Tag pair for a two-phase (count, then payload) exchange.
///
/// Nested collectives never share a pair: a caller hands each callee a
/// disjoint range, either with [`ExchangeTags::reserve`] (sized by the pair
/// count the callee documents) or with a [`ExchangeTags::phase`] block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExchangeTags {
    pub sizes: CommTag,
    pub data: CommTag,
}

/// Tag pairs per [`ExchangeTags::phase`] block.
pub const PHASE_PAIRS: u16 = 0x200;

impl ExchangeTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }

    /// The tag pair following this one.
    pub const fn next(self) -> Self {
        Self::from_base(self.sizes.offset(2))
    }

    /// Hand out the current pair and step to the next.
    pub fn advance(&mut self) -> Self {
        self.reserve(1)
    }

    /// Hand out the current pair as the start of a range of `pairs` pairs and
    /// step past the range.
    pub fn reserve(&mut self, pairs: u16) -> Self {
        let current = *self;
        *self = Self::from_base(current.sizes.offset(2 * pairs));
        current
    }

    /// First pair of the `n`-th block of [`PHASE_PAIRS`] pairs from here.
    pub const fn phase(self, n: u16) -> Self {
        Self::from_base(self.sizes.offset(2 * PHASE_PAIRS * n))
    }
}

impl Default for ExchangeTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(0x1000))
    }
}

/// Single-rank communicator for serial runs.
///
/// The exchange layer never posts messages to the calling rank, so the
/// handles here are never actually waited on for data.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _len: usize) {}
}

// --- ThreadComm: one rank per thread, shared in-process mailbox ---
type Key = (usize, usize, u16); // (src, dst, tag)
type Mailbox = DashMap<Key, VecDeque<Bytes>>;

/// In-process communicator where every rank is a thread.
///
/// Ranks created by the same [`ThreadComm::universe`] call share one
/// mailbox; separate universes are fully isolated from each other.
#[derive(Clone, Debug)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl ThreadComm {
    /// Create the `size` rank handles of a fresh process group.
    pub fn universe(size: usize) -> Vec<ThreadComm> {
        let mailbox = Arc::new(Mailbox::new());
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }
}

/// Receive handle for [`ThreadComm`]; `wait` polls the mailbox.
pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
    len: usize,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            // guard must be released before yielding
            let popped = self
                .mailbox
                .get_mut(&self.key)
                .and_then(|mut queue| queue.pop_front());
            if let Some(bytes) = popped {
                if bytes.len() != self.len {
                    log::trace!(
                        "rank {} expected {} bytes from rank {}, got {}",
                        self.key.1,
                        self.len,
                        self.key.0,
                        bytes.len()
                    );
                }
                return Some(bytes.to_vec());
            }
            std::thread::yield_now();
        }
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        self.mailbox
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle {
        LocalHandle {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
            len,
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use crate::mesh_error::TopologyError;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// World communicator of an initialized MPI environment.
    ///
    /// Clones share the environment; MPI is finalized when the last clone
    /// is dropped.
    #[derive(Clone)]
    pub struct MpiComm {
        world: Arc<SimpleCommunicator>,
        rank: usize,
        size: usize,
        _universe: Arc<Universe>,
    }

    // All calls go through the thread that drives the topology construction
    // (MPI_THREAD_FUNNELED usage); the handle itself is only moved, never
    // used concurrently.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        pub fn new() -> Result<Self, TopologyError> {
            let universe = mpi::initialize()
                .ok_or_else(|| TopologyError::Mpi("MPI was already initialized".into()))?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                world: Arc::new(world),
                rank,
                size,
                _universe: Arc::new(universe),
            })
        }
    }

    /// Outstanding immediate send; owns its leaked buffer until completion.
    pub struct MpiSendHandle {
        req: Request<'static, [u8], StaticScope>,
        buf: *mut [u8],
    }

    impl Wait for MpiSendHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            // SAFETY: `buf` came from `Box::leak` in `isend` and the request
            // referencing it has completed.
            unsafe { drop(Box::from_raw(self.buf)) };
            None
        }
    }

    pub struct MpiRecvHandle {
        world: Arc<SimpleCommunicator>,
        peer: usize,
        tag: u16,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let (data, _status) = self
                .world
                .process_at_rank(self.peer as i32)
                .receive_vec_with_tag::<u8>(self.tag as i32);
            Some(data)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let leaked: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let ptr: *mut [u8] = leaked;
            // SAFETY: the pointee lives until `MpiSendHandle::wait` reclaims it.
            let data: &'static [u8] = unsafe { &*ptr };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, tag as i32);
            MpiSendHandle { req, buf: ptr }
        }

        fn irecv(&self, peer: usize, tag: u16, _len: usize) -> MpiRecvHandle {
            MpiRecvHandle {
                world: Arc::clone(&self.world),
                peer,
                tag,
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_roundtrip_two_ranks() {
        let comms = ThreadComm::universe(2);
        let (comm0, comm1) = (&comms[0], &comms[1]);

        // On rank 1: post the receive for data from peer 0 with tag 7
        let recv_handle = comm1.irecv(0, 7, 4);
        // On rank 0: send the 4 bytes [1,2,3,4] to peer 1 with tag 7
        comm0.isend(1, 7, &[1, 2, 3, 4]).wait();

        let data = recv_handle
            .wait()
            .expect("Expected to receive data from rank 0");
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn same_tag_messages_keep_posting_order() {
        let comms = ThreadComm::universe(2);
        comms[0].isend(1, 3, &[1]);
        comms[0].isend(1, 3, &[2, 2]);
        assert_eq!(comms[1].irecv(0, 3, 1).wait(), Some(vec![1]));
        assert_eq!(comms[1].irecv(0, 3, 2).wait(), Some(vec![2, 2]));
    }

    #[test]
    fn universes_are_isolated() {
        let a = ThreadComm::universe(2);
        let b = ThreadComm::universe(2);
        a[0].isend(1, 9, &[10]);
        b[0].isend(1, 9, &[20]);
        assert_eq!(b[1].irecv(0, 9, 1).wait(), Some(vec![20]));
        assert_eq!(a[1].irecv(0, 9, 1).wait(), Some(vec![10]));
    }

    #[test]
    fn exchange_tags_do_not_overlap() {
        let t = ExchangeTags::default();
        let n = t.next();
        assert_eq!(t.data, t.sizes.offset(1));
        assert_eq!(n.sizes, t.sizes.offset(2));
        assert_ne!(n.sizes, t.data);

        let mut seq = t;
        assert_eq!(seq.advance(), t);
        assert_eq!(seq.advance(), n);
        assert_eq!(seq, n.next());
    }

    #[test]
    fn reserved_ranges_and_phases_are_disjoint() {
        let base = ExchangeTags::default();
        let mut seq = base;
        let first = seq.reserve(4);
        let second = seq.advance();
        assert_eq!(first, base);
        assert_eq!(second.sizes, base.sizes.offset(8));

        // every pair of a phase block stays below the next block
        let p1 = base.phase(1);
        let mut last = base;
        for _ in 0..PHASE_PAIRS {
            last = last.next();
        }
        assert_eq!(last, p1);
        assert!(base.phase(6).data.as_u16() < 0x7FFF);
    }

    #[test]
    fn no_comm_is_single_rank() {
        assert_eq!(NoComm.rank(), 0);
        assert_eq!(NoComm.size(), 1);
    }
}
