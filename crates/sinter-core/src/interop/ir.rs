//! Interchange subgraph: the external-optimizer-facing mirror of a cluster.
//!
//! Constructed fresh per adapter invocation and destroyed after result
//! integration, with an explicit release call to the external side. Nodes
//! and tensors reference each other by index and unique id rather than by
//! pointer, so the structure has no interior sharing.

use crate::graph::{DType, Quant};
use crate::MAX_DIMS;

/// Op-name prefix the optimizer uses to mark a composite fused kernel.
pub const FUSED_OP_PREFIX: &str = "fused_";

pub fn is_fused_op(op: &str) -> bool {
    op.starts_with(FUSED_OP_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrSectionKind {
    Persistent,
    Rmw,
    Workspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrSection {
    pub kind: IrSectionKind,
    pub id: u64,
    pub offset: u64,
}

impl IrSection {
    pub fn workspace() -> Self {
        Self {
            kind: IrSectionKind::Workspace,
            id: 0,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrGeometry {
    pub dims: u32,
    pub max_sizes: [u64; MAX_DIMS],
    pub min_sizes: [u64; MAX_DIMS],
    pub strides: [u64; MAX_DIMS],
    /// Access permutation; `None` means identity.
    pub permutation: Option<[u32; MAX_DIMS]>,
}

impl IrGeometry {
    pub fn is_dynamic(&self) -> bool {
        self.max_sizes != self.min_sizes
    }
}

/// Dense strides derived from sizes, innermost dimension first.
pub fn dense_strides(dims: u32, sizes: &[u64; MAX_DIMS]) -> [u64; MAX_DIMS] {
    let mut strides = [0u64; MAX_DIMS];
    let mut acc = 1u64;
    for d in 0..dims as usize {
        strides[d] = acc;
        acc *= sizes[d].max(1);
    }
    strides
}

#[derive(Debug, Clone)]
pub struct IrTensor {
    pub unique_id: u64,
    pub name: String,
    pub dtype: DType,
    pub geometry: IrGeometry,
    pub quant: Quant,
    pub reduction: bool,
    pub section: IrSection,
    /// Copy of statically-bound host data. Always a copy; the external side
    /// may deallocate its view independently of the graph.
    pub data: Option<Vec<u8>>,
}

impl IrTensor {
    pub fn byte_size(&self) -> u64 {
        self.geometry.max_sizes[..self.geometry.dims as usize]
            .iter()
            .product::<u64>()
            * self.dtype.size_bytes()
    }
}

/// One tensor slot of a node. `tensor` is `None` for an optional operand
/// left unset; `peer` is `None` when the edge crosses the cluster boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrEdge {
    pub tensor: Option<usize>,
    pub peer: Option<u64>,
}

impl IrEdge {
    pub fn null() -> Self {
        Self {
            tensor: None,
            peer: None,
        }
    }

    pub fn boundary(tensor: usize) -> Self {
        Self {
            tensor: Some(tensor),
            peer: None,
        }
    }

    pub fn internal(tensor: usize, peer: u64) -> Self {
        Self {
            tensor: Some(tensor),
            peer: Some(peer),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IrNode {
    pub unique_id: u64,
    pub op: String,
    pub name: String,
    /// Typed parameter payload, copied verbatim. Emptied by the release
    /// entry point; the integrator asserts this afterwards.
    pub params: Vec<u8>,
    pub input_edges: Vec<IrEdge>,
    pub output_edges: Vec<IrEdge>,
    /// Original node identities subsumed by a fused kernel.
    pub fused_ids: Vec<u64>,
    /// Optimizer-assigned ids of brand-new nodes attached to this fused
    /// node; they must enter the graph in the same atomic replacement.
    pub new_ids: Vec<u64>,
    /// Id of the externally-pre-extracted cluster this node originated
    /// from, when it did.
    pub origin_cluster: Option<u64>,
    /// Unique ids of nodes that must execute before this one.
    pub control_edges: Vec<u64>,
}

impl IrNode {
    pub fn is_fused(&self) -> bool {
        is_fused_op(&self.op)
    }
}

#[derive(Debug, Clone, Default)]
pub struct IrGraph {
    pub inference: bool,
    pub nodes: Vec<IrNode>,
    pub tensors: Vec<IrTensor>,
}

impl IrGraph {
    pub fn tensor(&self, idx: usize) -> &IrTensor {
        &self.tensors[idx]
    }

    pub fn find_tensor(&self, unique_id: u64) -> Option<&IrTensor> {
        self.tensors.iter().find(|t| t.unique_id == unique_id)
    }

    /// Every tensor id referenced by any edge of any node.
    pub fn referenced_tensor_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.iter().flat_map(move |n| {
            n.input_edges
                .iter()
                .chain(n.output_edges.iter())
                .filter_map(move |e| e.tensor.map(|i| self.tensors[i].unique_id))
        })
    }
}

/// The fixed-size parameter record the external optimizer expects for an
/// internal transpose node, in place of the graph-side permutation
/// annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransposeParams {
    pub permutation: [u32; MAX_DIMS],
}

impl TransposeParams {
    pub const SIZE: usize = MAX_DIMS * 4;

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        for v in self.permutation {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn unpack(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut permutation = [0u32; MAX_DIMS];
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            permutation[i] = u32::from_le_bytes(chunk.try_into().ok()?);
        }
        Some(Self { permutation })
    }
}

/// The identity permutation for the accelerator's maximum rank.
pub fn identity_permutation() -> [u32; MAX_DIMS] {
    let mut p = [0u32; MAX_DIMS];
    for (i, v) in p.iter_mut().enumerate() {
        *v = i as u32;
    }
    p
}
