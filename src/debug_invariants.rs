use crate::mesh_error::TopologyError;

/// Structural self-checks for published topology data (adjacency lists,
/// index maps, storage layers).
pub trait DebugInvariants {
    /// Panic on a broken invariant in debug builds or when the
    /// `check-invariants` feature is enabled; no-op otherwise.
    fn debug_assert_invariants(&self);
    /// Validate invariants and return the first error encountered.
    fn validate_invariants(&self) -> Result<(), TopologyError>;
}

/// Run a fallible check and panic on error when invariant checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}
