//! TopologyError: Unified error type for mesh-topology public APIs
//!
//! Every fallible operation in this crate (construction, communication,
//! lazy derived-data queries) reports through [`TopologyError`]. None of the
//! variants are retryable: a failed construction or query must be redone from
//! scratch by the caller.

use thiserror::Error;

/// Plain-text communication failure used as the `source` of
/// [`TopologyError::CommError`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CommError(pub String);

/// Unified error type for mesh-topology operations.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// A cell carries a different number of vertices than its shape requires.
    #[error("Inconsistent number of cell vertices in cell {cell}: got {got}, expected {expected}")]
    CellVertexCountMismatch {
        cell: usize,
        got: usize,
        expected: usize,
    },
    /// Storage handed to a topology lacks one of the essential entries.
    #[error("Storage does not provide all required data: {0}")]
    MissingEssentialData(String),
    /// An entity dimension outside the range accepted by the query.
    #[error("Invalid entity dimension {dim} (topological dimension is {tdim})")]
    InvalidDimension { dim: usize, tdim: usize },
    /// Offsets/array pair of an adjacency list are inconsistent.
    #[error("Invalid adjacency list: {0}")]
    InvalidAdjacency(String),
    /// A ghost global index that no rank range can own.
    #[error("Invalid ghost index {global}: {reason}")]
    InvalidGhost { global: i64, reason: String },
    /// An index that the sharing exchange returned with no claimant.
    #[error("Index {0} was not claimed by any process")]
    UnclaimedIndex(i64),
    /// Ghost slots still without a global index after all exchange rounds.
    #[error("{count} ghost vertices remain unresolved after ownership exchange")]
    UnresolvedGhosts { count: usize },
    /// A ghost cell whose owner does not know its original index.
    #[error("Ghost cell with original index {original} is not owned by rank {owner}")]
    GhostCellOwnerMismatch { original: i64, owner: usize },
    /// Ghost metadata inconsistent with the cell list.
    #[error("Invalid ghost cell data: {0}")]
    InvalidGhostCells(String),
    /// Point-to-point communication failure.
    #[error("Communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Another rank failed a collective step; its own error names the cause.
    #[error("Collective operation failed on {failed_ranks} other rank(s)")]
    RemoteFailure { failed_ranks: usize },
    /// An external topology computation reported failure.
    #[error("Topology computation failed: {0}")]
    ComputationFailed(String),
    /// Error raised by the MPI backend.
    #[cfg(feature = "mpi-support")]
    #[error("MPI error: {0}")]
    Mpi(String),
}

impl TopologyError {
    /// Shorthand for a [`TopologyError::CommError`] with a text source.
    pub fn comm(neighbor: usize, msg: impl Into<String>) -> Self {
        TopologyError::CommError {
            neighbor,
            source: Box::new(CommError(msg.into())),
        }
    }
}
