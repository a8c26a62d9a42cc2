//! Validation of an optimized subgraph before any graph mutation.
//!
//! The check is deterministic and side-effect free; re-running it on an
//! already-accepted subgraph never rejects it. A rejection leaves the graph
//! untouched and the cluster unfused, which is an expected outcome, not a
//! pass failure.

use super::adapter::{required_external_tensors, ClusterContext};
use crate::graph::{Graph, MemoryClass, TensorId};
use crate::interop::ir::{IrGraph, IrSectionKind, IrTensor};
use crate::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationReject {
    #[error("required external tensor {0} is missing from the optimized subgraph")]
    MissingExternal(u64),
    #[error("node {0} in the optimized subgraph has no outputs")]
    NodeWithoutOutputs(String),
    #[error("new output tensor {0} does not alias any original external output")]
    UnanchoredNewOutput(u64),
    #[error("new persistent sections are not allowed for tensor {0}")]
    NewPersistentSection(u64),
    #[error("new input tensor {0} carries no statically-bound data")]
    NewInputWithoutData(u64),
}

/// Check the optimizer's answer against the cluster that was sent out.
pub fn validate_optimized(
    graph: &Graph,
    ctx: &ClusterContext,
    optimized: &IrGraph,
) -> Result<(), ValidationReject> {
    let echoed: HashSet<u64> = optimized.referenced_tensor_ids().collect();

    // Every external tensor the cluster needed must reappear.
    for uid in required_external_tensors(graph, ctx) {
        if !echoed.contains(&uid) {
            return Err(ValidationReject::MissingExternal(uid));
        }
    }

    for node in &optimized.nodes {
        if node.output_edges.iter().all(|e| e.tensor.is_none()) {
            return Err(ValidationReject::NodeWithoutOutputs(node.name.clone()));
        }
    }

    // Brand-new tensors: outputs must be subset-aliases of original
    // external outputs; inputs must carry statically-bound data.
    let mut produced: HashSet<u64> = HashSet::default();
    for node in &optimized.nodes {
        for edge in &node.output_edges {
            if let Some(idx) = edge.tensor {
                produced.insert(optimized.tensors[idx].unique_id);
            }
        }
    }
    for tensor in &optimized.tensors {
        if ctx.resolve_tensor(tensor.unique_id).is_some() {
            continue;
        }
        if produced.contains(&tensor.unique_id) {
            validate_new_output(graph, ctx, tensor)?;
        } else if tensor.data.is_none() {
            return Err(ValidationReject::NewInputWithoutData(tensor.unique_id));
        }
    }
    Ok(())
}

/// A new external output is only acceptable as a subset-alias of memory the
/// cluster already owned: a read-modify-write range inside an original
/// external RMW tensor, or a persistent range inside an original persistent
/// output, at the same section.
fn validate_new_output(
    graph: &Graph,
    ctx: &ClusterContext,
    tensor: &IrTensor,
) -> Result<(), ValidationReject> {
    match tensor.section.kind {
        IrSectionKind::Workspace => Ok(()),
        IrSectionKind::Rmw => {
            if aliases_original(graph, ctx, tensor, false) {
                Ok(())
            } else {
                Err(ValidationReject::UnanchoredNewOutput(tensor.unique_id))
            }
        }
        IrSectionKind::Persistent => {
            // The optimizer may not invent persistent sections; it may only
            // sub-alias an existing persistent output.
            if aliases_original(graph, ctx, tensor, true) {
                Ok(())
            } else if original_section_ids(graph, ctx, true).contains(&tensor.section.id) {
                Err(ValidationReject::UnanchoredNewOutput(tensor.unique_id))
            } else {
                Err(ValidationReject::NewPersistentSection(tensor.unique_id))
            }
        }
    }
}

fn original_section_ids(graph: &Graph, ctx: &ClusterContext, persistent: bool) -> HashSet<u64> {
    ctx.external
        .values()
        .filter_map(|&t| section_of(graph, t, persistent).map(|(s, _, _)| s))
        .collect()
}

fn aliases_original(
    graph: &Graph,
    ctx: &ClusterContext,
    tensor: &IrTensor,
    persistent: bool,
) -> bool {
    let start = tensor.section.offset;
    let end = start + tensor.byte_size();
    ctx.external.values().any(|&orig| {
        let Some((section, o_start, o_end)) = section_of(graph, orig, persistent) else {
            return false;
        };
        section == tensor.section.id && start >= o_start && end <= o_end
    })
}

fn section_of(graph: &Graph, tensor: TensorId, persistent: bool) -> Option<(u64, u64, u64)> {
    let t = graph.tensor(tensor);
    match t.memory {
        MemoryClass::Persistent { section, offset } if persistent => {
            Some((section, offset, offset + t.byte_size()))
        }
        MemoryClass::RmwAliased { section, offset } if !persistent => {
            Some((section, offset, offset + t.byte_size()))
        }
        _ => None,
    }
}
