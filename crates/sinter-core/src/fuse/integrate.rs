//! Result integration: turn a validated optimized subgraph into concrete
//! graph edits.
//!
//! Every optimizer-returned node is one of three things: an *existing* node
//! echoed back by its unique id, a *new* node the optimizer introduced, or a
//! *fused* composite kernel subsuming original nodes. Replacement is
//! transactional per fused node, and atomic across a whole foreign
//! sub-cluster: a partial replacement of one would leave its internal
//! tensors dangling.

use super::adapter::{materialize_node, ClusterContext};
use super::sif::{from_pre_graph, split_fused_info, SifRegistry};
use super::FuseError;
use crate::graph::{
    operands_dynamic, EngineClass, Graph, MemoryClass, Node, NodeId, Tensor, TensorId,
};
use crate::interop::ir::{IrGraph, IrNode, IrSectionKind, IrTensor};
use crate::interop::FusionBackend;
use crate::{HashMap, HashSet, RVec, MAX_NODE_NAME};

/// Outcome of one integration. A rejection is an expected non-fusion: the
/// graph is left exactly as it was and the pass continues.
#[derive(Debug)]
pub enum ApplyOutcome {
    Applied {
        fused: usize,
        new: usize,
        skipped: usize,
    },
    Rejected(String),
}

pub struct ResultIntegrator<'a> {
    backend: &'a dyn FusionBackend,
    sifs: &'a SifRegistry,
    /// Explicit naming counter; one integrator lives for one pass.
    cluster_counter: u32,
}

/// A fused node waiting for its replacement, with everything resolved.
struct FusedEntry {
    node: Node,
    originals: Vec<NodeId>,
    new_ids: Vec<u64>,
    origin_cluster: Option<u64>,
}

/// Accumulates the fused nodes of one foreign sub-cluster so the whole
/// sub-cluster is replaced in a single atomic edit once its last node has
/// arrived. Owned by one `apply` invocation; never outlives it.
#[derive(Default)]
struct SubgraphAccumulator {
    originals: HashSet<NodeId>,
    adds: Vec<Node>,
    /// Index into `adds` of each fused node, with its provenance.
    fused_meta: Vec<(usize, Vec<NodeId>)>,
    arrived: usize,
}

/// Tensors and section mappings materialized from optimizer output.
#[derive(Default)]
struct Materialized {
    new_tensors: HashMap<u64, TensorId>,
    /// Optimizer section id -> freshly allocated graph section id.
    rmw_sections: HashMap<u64, u64>,
}

impl<'a> ResultIntegrator<'a> {
    pub fn new(backend: &'a dyn FusionBackend, sifs: &'a SifRegistry) -> Self {
        Self {
            backend,
            sifs,
            cluster_counter: 0,
        }
    }

    pub fn apply(
        &mut self,
        graph: &mut Graph,
        ctx: &ClusterContext,
        optimized: &IrGraph,
    ) -> Result<ApplyOutcome, FuseError> {
        let cluster_no = self.cluster_counter;
        self.cluster_counter += 1;
        log::debug!("integrating optimized subgraph {cluster_no}");

        let mut state = Materialized::default();
        let mut new_nodes: HashMap<u64, Node> = HashMap::default();
        let mut fused_entries: Vec<FusedEntry> = Vec::new();
        let mut claimed: HashSet<NodeId> = HashSet::default();
        let mut fused_counter = 0usize;
        let mut new_counter = 0usize;

        for ir_node in &optimized.nodes {
            let inputs = match self.input_tensors(graph, ctx, optimized, ir_node, &mut state) {
                Ok(v) => v,
                Err(reason) => return Ok(ApplyOutcome::Rejected(reason)),
            };
            let outputs = match self.output_tensors(graph, ctx, optimized, ir_node, &mut state) {
                Ok(v) => v,
                Err(reason) => return Ok(ApplyOutcome::Rejected(reason)),
            };

            if !ir_node.is_fused() {
                if ctx.nodes.contains_key(&ir_node.unique_id) {
                    // Existing node echoed back; reused unchanged.
                    log::debug!("optimized subgraph reuses existing node {}", ir_node.name);
                    continue;
                }
                log::debug!(
                    "optimized subgraph contains a new node {} (id {})",
                    ir_node.name,
                    ir_node.unique_id
                );
                let name = format!("{}_{}", ir_node.name, ir_node.unique_id);
                let node = materialize_node(ir_node, name)
                    .with_inputs(inputs)
                    .with_outputs(outputs);
                if let Err(reason) = validate_operand_dims(graph, &node) {
                    return Ok(ApplyOutcome::Rejected(reason));
                }
                new_nodes.insert(ir_node.unique_id, node);
                new_counter += 1;
                continue;
            }

            log::debug!(
                "optimized subgraph contains fused kernel {} (id {})",
                ir_node.name,
                ir_node.unique_id
            );
            let mut name = format!("fused_kernel_{cluster_no}_{fused_counter}");
            name.truncate(MAX_NODE_NAME);
            let mut node = Node::new(ir_node.op.clone(), name, EngineClass::Vector)
                .with_params(ir_node.params.clone())
                .with_inputs(inputs)
                .with_outputs(outputs);

            let originals = self.find_original_nodes(ctx, ir_node)?;
            for &orig in &originals {
                if !claimed.insert(orig) {
                    return Err(FuseError::Invariant(format!(
                        "original node {:?} is claimed by more than one fused node",
                        orig
                    )));
                }
            }
            node.stitchable = originals.iter().all(|&o| graph.node(o).stitchable);

            if operands_dynamic(graph, &node) {
                node.multi_sif = Some(if !ir_node.params.is_empty() {
                    // Split shape-inference fast path.
                    split_fused_info(ir_node, optimized)
                } else {
                    let pre = self
                        .backend
                        .pre_graph(ir_node)
                        .map_err(FuseError::Backend)?;
                    from_pre_graph(ir_node, &node.name, &pre, self.sifs)?
                });
            }

            fused_entries.push(FusedEntry {
                node,
                originals,
                new_ids: ir_node.new_ids.clone(),
                origin_cluster: ir_node.origin_cluster,
            });
            fused_counter += 1;
        }

        log::debug!(
            "optimized subgraph {cluster_no} yielded {fused_counter} fusions and {new_counter} new nodes"
        );
        if fused_counter == 0 && new_counter == 0 {
            return Ok(ApplyOutcome::Applied {
                fused: 0,
                new: 0,
                skipped: 0,
            });
        }

        let skipped = self.replace_all(graph, fused_entries, &mut new_nodes)?;
        if !new_nodes.is_empty() {
            log::warn!(
                "{} new nodes were not attached to any fused node and were dropped",
                new_nodes.len()
            );
        }
        Ok(ApplyOutcome::Applied {
            fused: fused_counter,
            new: new_counter,
            skipped,
        })
    }

    // ---- replacement ---------------------------------------------------

    /// Replace originals with fused nodes, accumulating foreign sub-cluster
    /// members until the last one arrives. Returns how many replacements the
    /// facade rejected (each rejection is localized, never partial).
    fn replace_all(
        &mut self,
        graph: &mut Graph,
        entries: Vec<FusedEntry>,
        new_nodes: &mut HashMap<u64, Node>,
    ) -> Result<usize, FuseError> {
        let mut group_sizes: HashMap<u64, usize> = HashMap::default();
        for entry in &entries {
            if let Some(gid) = entry.origin_cluster {
                *group_sizes.entry(gid).or_default() += 1;
            }
        }
        let mut groups: HashMap<u64, SubgraphAccumulator> = HashMap::default();
        let mut skipped = 0usize;

        for entry in entries {
            let adds = self.collect_adds(&entry, new_nodes)?;
            match entry.origin_cluster {
                None => {
                    let meta = vec![(0usize, entry.originals.clone())];
                    skipped +=
                        replace_into_graph(graph, entry.originals, adds, meta) as usize;
                }
                Some(gid) => {
                    let acc = groups.entry(gid).or_default();
                    let base = acc.adds.len();
                    acc.fused_meta.push((base, entry.originals.clone()));
                    acc.adds.extend(adds);
                    acc.originals.extend(entry.originals);
                    acc.arrived += 1;
                    if acc.arrived == group_sizes[&gid] {
                        // Last node of the sub-cluster: one atomic edit for
                        // the accumulated union.
                        let acc = groups.remove(&gid).expect("accumulator present");
                        log::debug!(
                            "replacing foreign sub-cluster {gid} with {} fused nodes",
                            acc.fused_meta.len()
                        );
                        let originals: Vec<NodeId> = acc.originals.into_iter().collect();
                        skipped +=
                            replace_into_graph(graph, originals, acc.adds, acc.fused_meta)
                                as usize;
                    }
                }
            }
        }
        Ok(skipped)
    }

    /// The fused node plus the new nodes attached to it, in insertion order.
    fn collect_adds(
        &self,
        entry: &FusedEntry,
        new_nodes: &mut HashMap<u64, Node>,
    ) -> Result<Vec<Node>, FuseError> {
        let mut adds = vec![entry.node.clone()];
        for new_id in &entry.new_ids {
            let Some(node) = new_nodes.remove(new_id) else {
                return Err(FuseError::Invariant(format!(
                    "fused node {} claims new node id {new_id}, which does not exist or was \
                     already attached to another fused node",
                    entry.node.name
                )));
            };
            log::trace!("fused node {} carries new node {}", entry.node.name, node.name);
            adds.push(node);
        }
        Ok(adds)
    }

    // ---- per-node resolution -------------------------------------------

    fn find_original_nodes(
        &self,
        ctx: &ClusterContext,
        ir_node: &IrNode,
    ) -> Result<Vec<NodeId>, FuseError> {
        if ir_node.fused_ids.is_empty() {
            return Err(FuseError::Invariant(format!(
                "fused node {} has no subsumed-node identifiers",
                ir_node.name
            )));
        }
        let mut originals = Vec::with_capacity(ir_node.fused_ids.len());
        for &uid in &ir_node.fused_ids {
            let Some(&orig) = ctx.nodes.get(&uid) else {
                return Err(FuseError::Invariant(format!(
                    "node id {uid} subsumed by fused node {} does not exist in the original \
                     cluster",
                    ir_node.name
                )));
            };
            originals.push(orig);
        }
        Ok(originals)
    }

    fn input_tensors(
        &self,
        graph: &mut Graph,
        ctx: &ClusterContext,
        ir: &IrGraph,
        ir_node: &IrNode,
        state: &mut Materialized,
    ) -> Result<RVec<Option<TensorId>>, String> {
        let mut out = RVec::new();
        for edge in &ir_node.input_edges {
            match edge.tensor {
                None => out.push(None),
                Some(idx) => {
                    out.push(Some(self.resolve_or_create(graph, ctx, ir.tensor(idx), state)?))
                }
            }
        }
        Ok(out)
    }

    /// Output operands with duplicated consumer edges collapsed to one slot.
    fn output_tensors(
        &self,
        graph: &mut Graph,
        ctx: &ClusterContext,
        ir: &IrGraph,
        ir_node: &IrNode,
        state: &mut Materialized,
    ) -> Result<RVec<Option<TensorId>>, String> {
        let mut out = RVec::new();
        let mut handled: HashSet<u64> = HashSet::default();
        for edge in &ir_node.output_edges {
            let Some(idx) = edge.tensor else { continue };
            let tensor = ir.tensor(idx);
            if handled.insert(tensor.unique_id) {
                out.push(Some(self.resolve_or_create(graph, ctx, tensor, state)?));
            }
        }
        Ok(out)
    }

    fn resolve_or_create(
        &self,
        graph: &mut Graph,
        ctx: &ClusterContext,
        ir_tensor: &IrTensor,
        state: &mut Materialized,
    ) -> Result<TensorId, String> {
        if let Some(t) = ctx.resolve_tensor(ir_tensor.unique_id) {
            return Ok(t);
        }
        if let Some(&t) = state.new_tensors.get(&ir_tensor.unique_id) {
            return Ok(t);
        }
        log::trace!("creating graph tensor for new tensor {}", ir_tensor.unique_id);

        let memory = match ir_tensor.section.kind {
            IrSectionKind::Persistent => MemoryClass::Persistent {
                section: ir_tensor.section.id,
                offset: ir_tensor.section.offset,
            },
            IrSectionKind::Rmw => {
                let section = match state.rmw_sections.get(&ir_tensor.section.id) {
                    Some(&s) => s,
                    None => {
                        let s = graph.alloc_section_id();
                        state.rmw_sections.insert(ir_tensor.section.id, s);
                        s
                    }
                };
                MemoryClass::RmwAliased {
                    section,
                    offset: ir_tensor.section.offset,
                }
            }
            IrSectionKind::Workspace => MemoryClass::Transient,
        };

        let tensor = Tensor {
            name: ir_tensor.name.clone(),
            dtype: ir_tensor.dtype,
            dims: ir_tensor.geometry.dims,
            max_sizes: ir_tensor.geometry.max_sizes,
            min_sizes: ir_tensor.geometry.min_sizes,
            strides: Some(ir_tensor.geometry.strides),
            quant: ir_tensor.quant,
            reduction: ir_tensor.reduction,
            aux: false,
            memory,
            host_data: ir_tensor.data.clone().map(Into::into),
        };
        if !tensor.props_valid() {
            return Err(format!(
                "new tensor {} has invalid properties",
                ir_tensor.unique_id
            ));
        }
        let id = graph.add_tensor(tensor);
        state.new_tensors.insert(ir_tensor.unique_id, id);
        Ok(id)
    }
}

/// Execute one atomic replacement; a facade rejection skips this fused node
/// (or whole sub-cluster) and never partially mutates the graph.
/// Returns whether the replacement was skipped.
fn replace_into_graph(
    graph: &mut Graph,
    originals: Vec<NodeId>,
    adds: Vec<Node>,
    fused_meta: Vec<(usize, Vec<NodeId>)>,
) -> bool {
    let names: Vec<String> = adds.iter().map(|n| n.name.clone()).collect();
    match graph.replace_nodes(&originals, adds) {
        Ok(ids) => {
            for (idx, provenance) in fused_meta {
                graph.node_mut(ids[idx]).origin_nodes = provenance;
            }
            false
        }
        Err(e) => {
            log::warn!(
                "fusion could not be completed for {:?}, skipping it: {e}",
                names
            );
            true
        }
    }
}

fn validate_operand_dims(graph: &Graph, node: &Node) -> Result<(), String> {
    for tensor in node.operands().flatten() {
        if !graph.tensor(tensor).props_valid() {
            return Err(format!(
                "tensor {} of node {} failed dimension validation",
                graph.tensor(tensor).name,
                node.name
            ));
        }
    }
    Ok(())
}
