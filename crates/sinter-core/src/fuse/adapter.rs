//! Translation of a cluster into the optimizer's interchange format.
//!
//! Each tensor the cluster touches becomes exactly one interchange tensor,
//! deduplicated by identity. Every tensor is classified as *internal*
//! (produced and consumed entirely inside the cluster) or *external*
//! (graph-level input/output, crossing the cluster boundary, or persistent);
//! the optimizer's post-condition contract is stated in terms of this
//! classification.

use super::FuseError;
use crate::graph::{
    node_uid, tensor_uid, EngineClass, Graph, MemoryClass, Node, NodeId, TensorId,
};
use crate::interop::ir::{dense_strides, IrEdge, IrGraph, IrNode, IrSection, IrSectionKind, IrTensor};
use crate::interop::{BackendError, FuserStatus, FusionBackend};
use crate::HashMap;

/// Everything the result integrator needs to reconcile the optimizer's
/// answer against the original cluster. Owns no graph borrows.
pub struct ClusterContext {
    /// The subgraph that was sent out.
    pub ir: IrGraph,
    /// unique id -> original node.
    pub nodes: HashMap<u64, NodeId>,
    /// unique id -> tensor, for tensors classified external.
    pub external: HashMap<u64, TensorId>,
    /// unique id -> tensor, for tensors internal to the cluster.
    pub internal: HashMap<u64, TensorId>,
}

impl ClusterContext {
    pub fn resolve_tensor(&self, unique_id: u64) -> Option<TensorId> {
        self.external
            .get(&unique_id)
            .or_else(|| self.internal.get(&unique_id))
            .copied()
    }
}

/// Send a cluster to the external optimizer.
///
/// Returns `Ok(None)` for the expected non-fusion cases: a cluster of size
/// <= 1, or one with no node of the fusable engine kind. A failure status
/// from the optimizer is an external-boundary failure and aborts the pass.
pub fn optimize_cluster(
    graph: &Graph,
    members: &[NodeId],
    backend: &dyn FusionBackend,
    supports_dynamic_shapes: bool,
) -> Result<Option<(ClusterContext, IrGraph)>, FuseError> {
    if members.len() <= 1 {
        log::debug!("cluster size is not larger than 1, not optimizing");
        return Ok(None);
    }
    if !members
        .iter()
        .any(|&n| graph.node(n).engine == EngineClass::Vector)
    {
        log::warn!("cluster has no vector-engine nodes, not optimizing");
        return Ok(None);
    }

    let ctx = build_cluster_context(graph, members);
    log::debug!(
        "calling the fusion optimizer with {} nodes and {} tensors",
        ctx.ir.nodes.len(),
        ctx.ir.tensors.len()
    );
    match backend.optimize(&ctx.ir, supports_dynamic_shapes) {
        Ok(optimized) => Ok(Some((ctx, optimized))),
        Err(BackendError::OptimizeFailed(FuserStatus::UnsupportedGraph)) => {
            log::warn!("optimizer does not support this subgraph, leaving it unfused");
            Ok(None)
        }
        Err(e) => {
            log::warn!("fusion optimizer failed: {e}");
            Err(FuseError::Backend(e))
        }
    }
}

/// Build the interchange mirror of `members` without calling out.
pub fn build_cluster_context(graph: &Graph, members: &[NodeId]) -> ClusterContext {
    Translator::new(graph, members).run()
}

struct Translator<'g> {
    graph: &'g Graph,
    members: HashMap<NodeId, ()>,
    ir: IrGraph,
    nodes: HashMap<u64, NodeId>,
    external: HashMap<u64, TensorId>,
    internal: HashMap<u64, TensorId>,
    tensor_index: HashMap<TensorId, usize>,
}

impl<'g> Translator<'g> {
    fn new(graph: &'g Graph, members: &[NodeId]) -> Self {
        Self {
            graph,
            members: members.iter().map(|&n| (n, ())).collect(),
            ir: IrGraph {
                inference: graph.inference_mode(),
                ..Default::default()
            },
            nodes: HashMap::default(),
            external: HashMap::default(),
            internal: HashMap::default(),
            tensor_index: HashMap::default(),
        }
    }

    fn run(mut self) -> ClusterContext {
        // Cluster members in topological order, so the optimizer sees the
        // subgraph in execution order.
        for id in self.graph.topo_sorted() {
            if !self.members.contains_key(&id) {
                continue;
            }
            let mut ir_node = self.make_node(id);
            self.reduce_and_classify_inputs(id, &mut ir_node);
            self.reduce_and_classify_outputs(id, &mut ir_node);
            self.nodes.insert(ir_node.unique_id, id);
            self.ir.nodes.push(ir_node);
        }
        ClusterContext {
            ir: self.ir,
            nodes: self.nodes,
            external: self.external,
            internal: self.internal,
        }
    }

    fn make_node(&self, id: NodeId) -> IrNode {
        let node = self.graph.node(id);
        // Legacy quirk of the boundary: an internal transpose node ships its
        // permutation as a fixed-size parameter record, not as the graph
        // annotation.
        let params = if node.op == "transpose" {
            match node.permutation {
                Some(permutation) => {
                    crate::interop::ir::TransposeParams { permutation }.pack()
                }
                None => node.params.clone(),
            }
        } else {
            node.params.clone()
        };
        IrNode {
            unique_id: node_uid(id),
            op: node.op.clone(),
            name: node.name.clone(),
            params,
            control_edges: self.graph.blocking_nodes(id).map(node_uid).collect(),
            ..Default::default()
        }
    }

    /// The interchange tensor for a graph tensor, created on first sight.
    fn intern_tensor(&mut self, id: TensorId) -> usize {
        if let Some(&idx) = self.tensor_index.get(&id) {
            return idx;
        }
        let t = self.graph.tensor(id);
        let section = match t.memory {
            MemoryClass::Persistent { section, offset } => IrSection {
                kind: IrSectionKind::Persistent,
                id: section,
                offset,
            },
            MemoryClass::RmwAliased { section, offset } => IrSection {
                kind: IrSectionKind::Rmw,
                id: section,
                offset,
            },
            MemoryClass::Workspace { section, offset } => IrSection {
                kind: IrSectionKind::Workspace,
                id: section,
                offset,
            },
            MemoryClass::Transient => IrSection::workspace(),
        };
        let ir_tensor = IrTensor {
            unique_id: tensor_uid(id),
            name: t.name.clone(),
            dtype: t.dtype,
            geometry: crate::interop::ir::IrGeometry {
                dims: t.dims,
                max_sizes: t.max_sizes,
                min_sizes: t.min_sizes,
                strides: t
                    .strides
                    .unwrap_or_else(|| dense_strides(t.dims, &t.max_sizes)),
                permutation: None,
            },
            quant: t.quant,
            reduction: t.reduction,
            section,
            // Always a copy: the external side may free its view while the
            // graph still owns the original.
            data: t.host_data.as_ref().map(|d| d.to_vec()),
        };
        let idx = self.ir.tensors.len();
        self.ir.tensors.push(ir_tensor);
        self.tensor_index.insert(id, idx);
        idx
    }

    fn reduce_and_classify_inputs(&mut self, id: NodeId, ir_node: &mut IrNode) {
        let graph = self.graph;
        let node = graph.node(id);
        for (slot, input) in node.inputs.iter().copied().enumerate() {
            let Some(tensor) = input else {
                // Optional operand left unset keeps its slot.
                ir_node.input_edges.push(IrEdge::null());
                continue;
            };
            let idx = self.intern_tensor(tensor);
            if let Some(perm) = node.input_permutations.get(slot) {
                if !graph.tensor(tensor).aux {
                    self.ir.tensors[idx].geometry.permutation = Some(*perm);
                }
            }
            let producer = graph.producer(tensor);
            let in_cluster = producer.is_some_and(|p| self.members.contains_key(&p));
            if !in_cluster || graph.is_graph_input(tensor) {
                ir_node.input_edges.push(IrEdge::boundary(idx));
                self.external.insert(tensor_uid(tensor), tensor);
            } else {
                let producer = producer.expect("in-cluster producer");
                ir_node
                    .input_edges
                    .push(IrEdge::internal(idx, node_uid(producer)));
                if graph.tensor(tensor).memory.is_persistent() {
                    self.external.insert(tensor_uid(tensor), tensor);
                } else {
                    self.internal.insert(tensor_uid(tensor), tensor);
                }
            }
        }
    }

    fn reduce_and_classify_outputs(&mut self, id: NodeId, ir_node: &mut IrNode) {
        let graph = self.graph;
        let node = graph.node(id);
        for output in node.outputs.iter().copied() {
            let Some(tensor) = output else {
                ir_node.output_edges.push(IrEdge::null());
                continue;
            };
            let idx = self.intern_tensor(tensor);
            let mut external = false;
            if graph.is_graph_output(tensor) {
                external = true;
            } else {
                let consumers = graph.consumers(tensor);
                if consumers.is_empty() {
                    external = true;
                }
                for &consumer in consumers {
                    if self.members.contains_key(&consumer) {
                        // One edge per in-cluster consuming slot.
                        ir_node
                            .output_edges
                            .push(IrEdge::internal(idx, node_uid(consumer)));
                    } else {
                        external = true;
                    }
                }
            }
            if external {
                ir_node.output_edges.push(IrEdge::boundary(idx));
            }
            if external || graph.tensor(tensor).memory.is_persistent() {
                self.external.insert(tensor_uid(tensor), tensor);
            } else {
                self.internal.insert(tensor_uid(tensor), tensor);
            }
        }
    }
}

/// The external tensors the optimizer must echo back: inputs the cluster
/// consumes, and outputs that are persistent, graph outputs, or consumed
/// outside the cluster. A dangling non-persistent output is the only
/// omissible external.
pub fn required_external_tensors(graph: &Graph, ctx: &ClusterContext) -> Vec<u64> {
    let members: crate::HashSet<NodeId> = ctx.nodes.values().copied().collect();
    let mut required = Vec::new();
    for (&uid, &tensor) in &ctx.external {
        let consumed_by_cluster = graph
            .consumers(tensor)
            .iter()
            .any(|c| members.contains(c));
        let produced_by_cluster = graph.producer(tensor).is_some_and(|p| members.contains(&p));
        let needed_output = produced_by_cluster
            && (graph.tensor(tensor).memory.is_persistent()
                || graph.is_graph_output(tensor)
                || graph.consumers(tensor).iter().any(|c| !members.contains(c)));
        if consumed_by_cluster || needed_output {
            required.push(uid);
        }
    }
    required
}

/// Detached node materialized from an optimizer-returned interchange node.
pub fn materialize_node(ir_node: &IrNode, name: String) -> Node {
    Node::new(ir_node.op.clone(), name, EngineClass::for_op(&ir_node.op))
        .with_params(ir_node.params.clone())
}
