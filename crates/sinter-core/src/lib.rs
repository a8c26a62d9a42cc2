//! Sinter core: the kernel-fusion subsystem of the sinter graph compiler.
//!
//! The crate lowers a dataflow graph of accelerator operations into larger
//! fused kernels before code generation:
//!
//! - [`graph`] - the operation graph arena and its edit facade
//! - [`fuse`] - clustering, cycle repair, and fusion-result integration
//! - [`interop`] - the interchange format and the external optimizer boundary
//! - [`config`] - per-pass toggles and bounds
//!
//! The whole pass is single-threaded and synchronous; one invocation of
//! [`fuse::run`] owns the graph for its duration and never retains any
//! bookkeeping afterwards.

pub mod config;
pub mod fuse;
pub mod graph;
pub mod interop;

pub use config::FusionConfig;
pub use fuse::{ClusterBuilder, FuseError, SifEntry, SifRegistry};
pub use graph::{
    DType, EngineClass, Graph, GraphError, MemoryClass, Node, NodeId, Quant, Tensor, TensorId,
};
pub use interop::{BackendError, FuserStatus, FusionBackend, IrGraph, IrNode, IrTensor};

/// Maximum tensor rank understood by the accelerator and the interchange
/// format.
pub const MAX_DIMS: usize = 5;

/// Maximum node-name length accepted by the external optimizer.
pub const MAX_NODE_NAME: usize = 64;

pub type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;
pub type HashSet<T> = rustc_hash::FxHashSet<T>;

/// Inline vector for operand lists; nearly all nodes have <= 4 operands.
pub type RVec<T> = smallvec::SmallVec<[T; 4]>;

#[macro_export]
macro_rules! rvec {
    () => { $crate::RVec::new() };
    ($elem:expr; $n:expr) => { $crate::RVec::from_elem($elem, $n) };
    ($($x:expr),+ $(,)?) => {{
        let mut v = $crate::RVec::new();
        $(v.push($x);)+
        v
    }};
}
