//! The external optimizer boundary.
//!
//! [`ir`] defines the interchange format a cluster is serialized into;
//! [`backend`] is the call contract; [`shared_object`] resolves the real,
//! independently-versioned entry points from a dynamic library and owns the
//! process-wide runtime handle.

pub mod backend;
pub mod ir;
pub mod shared_object;

pub use backend::{BackendError, FuserStatus, FusionBackend};
pub use ir::{
    is_fused_op, IrEdge, IrGeometry, IrGraph, IrNode, IrSection, IrSectionKind, IrTensor,
    TransposeParams, FUSED_OP_PREFIX,
};
pub use shared_object::{FuserRuntime, SharedObjectBackend};
