//! The call contract with the external fusion optimizer.
//!
//! The optimizer is an opaque collaborator: it receives an interchange
//! subgraph, returns an optimized one plus a status code, can explain how a
//! composite node was built, and must be asked exactly once to release every
//! optimized subgraph it produced. It is not assumed re-entrant or
//! thread-safe; the pass calls it from a single thread.

use super::ir::{IrGraph, IrNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FuserStatus {
    Success = 0,
    Failed = 1,
    UnsupportedGraph = 2,
}

impl FuserStatus {
    pub fn from_raw(raw: i32) -> FuserStatus {
        match raw {
            0 => FuserStatus::Success,
            2 => FuserStatus::UnsupportedGraph,
            _ => FuserStatus::Failed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("fusion library `{0}` could not be loaded: {1}")]
    LibraryLoad(String, String),
    #[error("fusion library entry point `{0}` is missing")]
    MissingEntryPoint(&'static str),
    #[error("fusion runtime is not initialized")]
    NotInitialized,
    #[error("optimizer returned status {0:?}")]
    OptimizeFailed(FuserStatus),
    #[error("pre-fusion subgraph query failed for node {0} with status {1:?}")]
    PreGraphFailed(u64, FuserStatus),
    #[error("release of an optimized subgraph failed with status {0:?}")]
    ReleaseFailed(FuserStatus),
}

/// The optimizer boundary. Ownership of every returned [`IrGraph`] passes to
/// the caller, who must hand optimize results back through [`release`]
/// exactly once before dropping them.
///
/// [`release`]: FusionBackend::release
pub trait FusionBackend {
    /// Optimize one interchange subgraph. The returned subgraph references
    /// the input's tensors by unique id; validation happens on the caller's
    /// side before any graph mutation.
    fn optimize(
        &self,
        graph: &IrGraph,
        supports_dynamic_shapes: bool,
    ) -> Result<IrGraph, BackendError>;

    /// The pre-fusion subgraph explaining how `node` was composed.
    fn pre_graph(&self, node: &IrNode) -> Result<IrGraph, BackendError>;

    /// Release an optimized subgraph. On success every node's parameter
    /// payload must be left empty; the caller asserts this.
    fn release(&self, graph: &mut IrGraph) -> Result<(), BackendError>;
}
