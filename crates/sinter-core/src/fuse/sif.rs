//! Shape-inference metadata for fused nodes.
//!
//! A fused kernel whose output shape is computed at execution time still
//! needs per-subsumed-node shape-inference data, because the original nodes
//! are gone after fusion. The metadata is reconstructed either from
//! parameters the optimizer already attached to the fused node (the split
//! shape-inference fast path), or by walking the optimizer's pre-fusion
//! subgraph for that node.

use super::FuseError;
use crate::interop::ir::{identity_permutation, IrEdge, IrGraph, IrNode};
use crate::{HashMap, MAX_DIMS};

/// Registered shape-inference function for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SifEntry {
    pub func: u64,
    pub version: u64,
}

/// Reserved function id for the split shape-inference fast path.
pub const SPLIT_FUSED_SIF: SifEntry = SifEntry {
    func: u64::MAX - 1,
    version: 1,
};

/// Operation name -> shape-inference function. Ops absent from the registry
/// compute their shapes statically.
#[derive(Default)]
pub struct SifRegistry {
    entries: HashMap<String, SifEntry>,
}

impl SifRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, op: impl Into<String>, entry: SifEntry) {
        self.entries.insert(op.into(), entry);
    }

    pub fn lookup(&self, op: &str) -> Option<SifEntry> {
        self.entries.get(op).copied()
    }
}

/// Which index space an operand of a reconstructed node lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSource {
    /// Consumed only inside the pre-fusion subgraph; indexed in the fused
    /// node's internal-tensor space.
    Internal,
    /// Crosses into the fused node's own boundary; indexed by position in
    /// the fused node's operand list.
    External,
    /// An input that is secretly an alias of one of the fused node's own
    /// outputs; indexed in the fused node's output list.
    FromOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SifOperand {
    pub dims: u32,
    pub max_sizes: [u64; MAX_DIMS],
    pub min_sizes: [u64; MAX_DIMS],
    pub index: usize,
    pub source: OperandSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SifNode {
    pub name: String,
    pub op: String,
    /// `None` for nodes whose shape is static.
    pub sif: Option<SifEntry>,
    pub params: Vec<u8>,
    pub inputs: Vec<SifOperand>,
    pub outputs: Vec<SifOperand>,
    /// Empty when every permutation is the identity.
    pub input_permutations: Vec<[u32; MAX_DIMS]>,
    pub output_permutations: Vec<[u32; MAX_DIMS]>,
}

/// Per-subsumed-node shape data attached to a fused node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiSifInfo {
    pub nodes: Vec<SifNode>,
    pub internal_tensor_count: usize,
}

/// Fast path: the optimizer attached split shape-inference parameters to
/// the fused node itself, so one reconstructed entry covers the whole
/// kernel.
pub fn split_fused_info(fused: &IrNode, ir: &IrGraph) -> MultiSifInfo {
    let mut node = SifNode {
        name: format!("{}_fused_{}", fused.name, fused.unique_id),
        op: fused.op.clone(),
        sif: Some(SPLIT_FUSED_SIF),
        params: fused.params.clone(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        input_permutations: Vec::new(),
        output_permutations: Vec::new(),
    };

    for (index, edge) in fused.input_edges.iter().enumerate() {
        let Some(idx) = edge.tensor else { continue };
        let tensor = ir.tensor(idx);
        node.inputs.push(SifOperand {
            dims: tensor.geometry.dims,
            max_sizes: tensor.geometry.max_sizes,
            min_sizes: tensor.geometry.min_sizes,
            index,
            source: OperandSource::External,
        });
        node.input_permutations
            .push(tensor.geometry.permutation.unwrap_or_else(identity_permutation));
    }

    for (index, idx) in unique_output_tensors(&fused.output_edges).into_iter().enumerate() {
        let tensor = ir.tensor(idx);
        node.outputs.push(SifOperand {
            dims: tensor.geometry.dims,
            max_sizes: tensor.geometry.max_sizes,
            min_sizes: tensor.geometry.min_sizes,
            index,
            source: OperandSource::External,
        });
        node.output_permutations
            .push(tensor.geometry.permutation.unwrap_or_else(identity_permutation));
    }

    drop_identity_permutations(&mut node.input_permutations);
    drop_identity_permutations(&mut node.output_permutations);

    MultiSifInfo {
        nodes: vec![node],
        internal_tensor_count: 0,
    }
}

/// Walk the optimizer's pre-fusion subgraph of `fused` and reconstruct one
/// entry per original node.
pub fn from_pre_graph(
    fused: &IrNode,
    fused_name: &str,
    pre: &IrGraph,
    registry: &SifRegistry,
) -> Result<MultiSifInfo, FuseError> {
    let mut info = MultiSifInfo::default();
    let mut internal_index: HashMap<u64, usize> = HashMap::default();

    for node in &pre.nodes {
        let dynamic = node_is_dynamic(node, pre);
        let sif = match registry.lookup(&node.op) {
            Some(entry) => Some(entry),
            None if dynamic => {
                return Err(FuseError::Invariant(format!(
                    "no shape-inference function registered for dynamic-shape op `{}`",
                    node.op
                )));
            }
            None => None,
        };

        let mut sif_node = SifNode {
            name: format!("{}_fused_{}", fused_name, node.unique_id),
            op: node.op.clone(),
            sif,
            params: node.params.clone(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_permutations: Vec::new(),
            output_permutations: Vec::new(),
        };

        reconstruct_inputs(fused, pre, node, &mut sif_node, &mut internal_index)?;
        reconstruct_outputs(fused, pre, node, &mut sif_node, &mut internal_index)?;

        drop_identity_permutations(&mut sif_node.input_permutations);
        drop_identity_permutations(&mut sif_node.output_permutations);
        info.nodes.push(sif_node);
    }

    info.internal_tensor_count = internal_index.len();
    Ok(info)
}

fn reconstruct_inputs(
    fused: &IrNode,
    pre: &IrGraph,
    node: &IrNode,
    out: &mut SifNode,
    internal_index: &mut HashMap<u64, usize>,
) -> Result<(), FuseError> {
    for edge in &node.input_edges {
        let Some(idx) = edge.tensor else { continue };
        let tensor = pre.tensor(idx);
        let mut internal = edge.peer.is_some()
            && tensor.section.kind != crate::interop::ir::IrSectionKind::Persistent;
        // A producer-side tensor that also exits the pre-fusion subgraph is
        // external even though this edge has a peer.
        if internal {
            if let Some(peer) = edge.peer {
                if let Some(producer) = pre.nodes.iter().find(|n| n.unique_id == peer) {
                    let exits = producer.output_edges.iter().any(|e| {
                        e.peer.is_none()
                            && e.tensor
                                .is_some_and(|i| pre.tensor(i).unique_id == tensor.unique_id)
                    });
                    if exits {
                        internal = false;
                    }
                }
            }
        }

        let (index, source) = if internal {
            let next = internal_index.len();
            let index = *internal_index.entry(tensor.unique_id).or_insert(next);
            (index, OperandSource::Internal)
        } else if let Some(pos) = position_in_edges(&fused.input_edges, pre, tensor.unique_id) {
            (pos, OperandSource::External)
        } else if let Some(pos) =
            unique_position_in_outputs(&fused.output_edges, pre, tensor.unique_id)
        {
            // The input aliases one of the fused node's own outputs.
            (pos, OperandSource::FromOutput)
        } else {
            return Err(FuseError::Invariant(format!(
                "tensor {} of the pre-fusion subgraph is not an operand of the fused node",
                tensor.unique_id
            )));
        };

        out.inputs.push(SifOperand {
            dims: tensor.geometry.dims,
            max_sizes: tensor.geometry.max_sizes,
            min_sizes: tensor.geometry.min_sizes,
            index,
            source,
        });
        out.input_permutations
            .push(tensor.geometry.permutation.unwrap_or_else(identity_permutation));
    }
    Ok(())
}

fn reconstruct_outputs(
    fused: &IrNode,
    pre: &IrGraph,
    node: &IrNode,
    out: &mut SifNode,
    internal_index: &mut HashMap<u64, usize>,
) -> Result<(), FuseError> {
    // Output edges repeat once per consumer; walk each run of edges that
    // share a tensor, and treat the tensor as internal only if every edge of
    // the run stays inside the pre-fusion subgraph.
    let mut i = 0;
    while i < node.output_edges.len() {
        let Some(idx) = node.output_edges[i].tensor else {
            i += 1;
            continue;
        };
        let tensor = pre.tensor(idx);
        let mut internal =
            tensor.section.kind != crate::interop::ir::IrSectionKind::Persistent;
        let uid = tensor.unique_id;
        while i < node.output_edges.len()
            && node.output_edges[i]
                .tensor
                .is_some_and(|t| pre.tensor(t).unique_id == uid)
        {
            if node.output_edges[i].peer.is_none() {
                internal = false;
            }
            i += 1;
        }

        let (index, source) = if internal {
            let next = internal_index.len();
            let index = *internal_index.entry(uid).or_insert(next);
            (index, OperandSource::Internal)
        } else if let Some(pos) = unique_position_in_outputs(&fused.output_edges, pre, uid) {
            (pos, OperandSource::External)
        } else {
            return Err(FuseError::Invariant(format!(
                "tensor {uid} of the pre-fusion subgraph is not an output of the fused node"
            )));
        };

        out.outputs.push(SifOperand {
            dims: tensor.geometry.dims,
            max_sizes: tensor.geometry.max_sizes,
            min_sizes: tensor.geometry.min_sizes,
            index,
            source,
        });
        out.output_permutations
            .push(tensor.geometry.permutation.unwrap_or_else(identity_permutation));
    }
    Ok(())
}

fn node_is_dynamic(node: &IrNode, graph: &IrGraph) -> bool {
    node.input_edges
        .iter()
        .chain(node.output_edges.iter())
        .filter_map(|e| e.tensor)
        .any(|i| graph.tensor(i).geometry.is_dynamic())
}

/// Position of a tensor among a node's input edges.
fn position_in_edges(edges: &[IrEdge], graph: &IrGraph, uid: u64) -> Option<usize> {
    edges
        .iter()
        .position(|e| e.tensor.is_some_and(|i| graph.tensor(i).unique_id == uid))
}

/// Position of a tensor among a node's output edges, counting each tensor
/// once (duplicated consumer edges collapse to one operand slot).
fn unique_position_in_outputs(edges: &[IrEdge], graph: &IrGraph, uid: u64) -> Option<usize> {
    let mut index = 0usize;
    let mut prev: Option<u64> = None;
    for edge in edges {
        let Some(i) = edge.tensor else { continue };
        let id = graph.tensor(i).unique_id;
        if id == uid {
            return Some(index);
        }
        if prev != Some(id) {
            index += 1;
            prev = Some(id);
        }
    }
    None
}

/// Tensor indices of a node's outputs with duplicated consumer edges
/// collapsed, in order of first appearance.
pub fn unique_output_tensors(edges: &[IrEdge]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut prev: Option<usize> = None;
    for edge in edges {
        let Some(i) = edge.tensor else { continue };
        if prev != Some(i) {
            out.push(i);
            prev = Some(i);
        }
    }
    out
}

/// Permutations that all equal the identity carry no information and are
/// dropped to save space.
fn drop_identity_permutations(perms: &mut Vec<[u32; MAX_DIMS]>) {
    let identity = identity_permutation();
    if perms.iter().all(|p| *p == identity) {
        perms.clear();
    }
}
