//! The operation graph: arena storage for nodes and tensors plus the query
//! facade the fusion engine is written against.
//!
//! Nodes and tensors live in slotmaps so that their identities stay stable
//! across edits; the union-find partition in [`crate::fuse`] is keyed by the
//! same ids and has an independent lifetime.

mod editor;

pub use editor::GraphError;

use crate::fuse::sif::MultiSifInfo;
use crate::{HashMap, HashSet, RVec, MAX_DIMS};
use slotmap::{new_key_type, Key, KeyData, SecondaryMap, SlotMap};
use std::sync::Arc;

new_key_type! {
    /// Stable identity of an operation in the graph.
    pub struct NodeId;
}

new_key_type! {
    /// Stable identity of a tensor in the graph.
    pub struct TensorId;
}

/// The id as it crosses the external optimizer boundary.
pub fn node_uid(id: NodeId) -> u64 {
    id.data().as_ffi()
}

pub fn node_from_uid(uid: u64) -> NodeId {
    KeyData::from_ffi(uid).into()
}

pub fn tensor_uid(id: TensorId) -> u64 {
    id.data().as_ffi()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
    I32,
    U32,
    I16,
    I8,
    U8,
    I64,
    U64,
}

impl DType {
    pub fn size_bytes(&self) -> u64 {
        match self {
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 => 1,
            DType::I64 | DType::U64 => 8,
        }
    }

    /// 64-bit operand kinds are not supported by the fusable engine.
    pub fn is_wide(&self) -> bool {
        matches!(self, DType::I64 | DType::U64)
    }
}

/// Which device engine executes a node. Only `Vector` nodes can be fused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineClass {
    Vector,
    Matrix,
    Dma,
}

impl EngineClass {
    /// Engine classification for nodes materialized from optimizer output.
    pub fn for_op(op: &str) -> EngineClass {
        match op {
            "matmul" | "conv" | "batch_gemm" => EngineClass::Matrix,
            "memcpy" | "memset" => EngineClass::Dma,
            _ => EngineClass::Vector,
        }
    }
}

/// Memory classification of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    /// Ordinary intermediate value, placed by the allocator later.
    Transient,
    /// Bound to a user-visible memory section at a fixed byte range.
    Persistent { section: u64, offset: u64 },
    /// Read-modify-write alias inside a shared scratch section.
    RmwAliased { section: u64, offset: u64 },
    /// Explicitly placed in a workspace section; consumers may alias it, so
    /// clusters never grow across such a tensor.
    Workspace { section: u64, offset: u64 },
}

impl MemoryClass {
    pub fn is_persistent(&self) -> bool {
        matches!(self, MemoryClass::Persistent { .. })
    }

    pub fn is_workspace(&self) -> bool {
        matches!(self, MemoryClass::Workspace { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quant {
    pub scale: f64,
    pub zero_point: f64,
}

impl Default for Quant {
    fn default() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tensor {
    pub name: String,
    pub dtype: DType,
    pub dims: u32,
    pub max_sizes: [u64; MAX_DIMS],
    pub min_sizes: [u64; MAX_DIMS],
    /// `None` means dense layout; derived from sizes when exported.
    pub strides: Option<[u64; MAX_DIMS]>,
    pub quant: Quant,
    pub reduction: bool,
    /// Auxiliary / shape-output style input; never carries a permutation.
    pub aux: bool,
    pub memory: MemoryClass,
    /// Statically-bound host data, shared with the graph owner.
    pub host_data: Option<Arc<[u8]>>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, dtype: DType, sizes: &[u64]) -> Self {
        assert!(
            !sizes.is_empty() && sizes.len() <= MAX_DIMS,
            "tensor rank must be 1..={MAX_DIMS}"
        );
        let mut max_sizes = [1u64; MAX_DIMS];
        max_sizes[..sizes.len()].copy_from_slice(sizes);
        Self {
            name: name.into(),
            dtype,
            dims: sizes.len() as u32,
            max_sizes,
            min_sizes: max_sizes,
            strides: None,
            quant: Quant::default(),
            reduction: false,
            aux: false,
            memory: MemoryClass::Transient,
            host_data: None,
        }
    }

    pub fn with_memory(mut self, memory: MemoryClass) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_min_sizes(mut self, sizes: &[u64]) -> Self {
        assert_eq!(sizes.len() as u32, self.dims);
        self.min_sizes = [1u64; MAX_DIMS];
        self.min_sizes[..sizes.len()].copy_from_slice(sizes);
        self
    }

    pub fn with_host_data(mut self, data: Arc<[u8]>) -> Self {
        self.host_data = Some(data);
        self
    }

    pub fn byte_size(&self) -> u64 {
        self.max_sizes[..self.dims as usize]
            .iter()
            .product::<u64>()
            * self.dtype.size_bytes()
    }

    /// Shape is computed at execution time when min and max diverge.
    pub fn is_dynamic(&self) -> bool {
        self.min_sizes != self.max_sizes
    }

    /// Basic well-formedness of a tensor materialized from optimizer output.
    pub fn props_valid(&self) -> bool {
        let d = self.dims as usize;
        d >= 1
            && d <= MAX_DIMS
            && self.max_sizes[..d].iter().all(|&s| s > 0)
            && self.min_sizes[..d]
                .iter()
                .zip(&self.max_sizes[..d])
                .all(|(lo, hi)| lo <= hi)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: String,
    pub name: String,
    pub engine: EngineClass,
    /// Typed parameter payload, copied verbatim across the boundary.
    pub params: Vec<u8>,
    /// Ordered operand slots; `None` marks an optional operand left unset.
    pub inputs: RVec<Option<TensorId>>,
    pub outputs: RVec<Option<TensorId>>,
    /// Transpose nodes carry their permutation here; it is repacked into the
    /// optimizer's fixed-size parameter record when exported.
    pub permutation: Option<[u32; MAX_DIMS]>,
    /// Per-input access permutations, empty when none apply.
    pub input_permutations: Vec<[u32; MAX_DIMS]>,
    /// Whether downstream stitching passes may pick this node up.
    pub stitchable: bool,
    /// Per-subsumed-node shape inference data, present on fused nodes whose
    /// output shape is computed dynamically.
    pub multi_sif: Option<MultiSifInfo>,
    /// Original node identities a fused node replaces.
    pub origin_nodes: Vec<NodeId>,
}

impl Node {
    pub fn new(op: impl Into<String>, name: impl Into<String>, engine: EngineClass) -> Self {
        Self {
            op: op.into(),
            name: name.into(),
            engine,
            params: Vec::new(),
            inputs: RVec::new(),
            outputs: RVec::new(),
            permutation: None,
            input_permutations: Vec::new(),
            stitchable: true,
            multi_sif: None,
            origin_nodes: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = Option<TensorId>>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = Option<TensorId>>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }

    pub fn with_params(mut self, params: Vec<u8>) -> Self {
        self.params = params;
        self
    }

    /// Operand slots in order, inputs first, `None` slots included.
    pub fn operands(&self) -> impl Iterator<Item = Option<TensorId>> + '_ {
        self.inputs.iter().chain(self.outputs.iter()).copied()
    }

    /// The first output slot; growth always follows this tensor.
    pub fn primary_output(&self) -> Option<TensorId> {
        self.outputs.first().copied().flatten()
    }
}

/// The operation graph. Exclusively owned and mutated by the single calling
/// thread for the duration of one compiler pass.
#[derive(Default)]
pub struct Graph {
    nodes: SlotMap<NodeId, Node>,
    tensors: SlotMap<TensorId, Tensor>,
    producer: SecondaryMap<TensorId, NodeId>,
    consumers: SecondaryMap<TensorId, Vec<NodeId>>,
    /// node -> nodes it blocks (control dependencies).
    blocks: HashMap<NodeId, HashSet<NodeId>>,
    /// node -> nodes it is blocked by.
    blocked_by: HashMap<NodeId, HashSet<NodeId>>,
    graph_inputs: HashSet<TensorId>,
    graph_outputs: HashSet<TensorId>,
    /// Ready-made node lists from the complex-operation expansion, keyed by
    /// the id of the operation they were extracted from.
    prebuilt_clusters: Vec<(u64, Vec<NodeId>)>,
    next_section_id: u64,
    inference: bool,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            next_section_id: 1,
            ..Default::default()
        }
    }

    pub fn set_inference_mode(&mut self, inference: bool) {
        self.inference = inference;
    }

    pub fn inference_mode(&self) -> bool {
        self.inference
    }

    // ---- tensors -------------------------------------------------------

    pub fn add_tensor(&mut self, tensor: Tensor) -> TensorId {
        match tensor.memory {
            MemoryClass::Persistent { section, .. }
            | MemoryClass::RmwAliased { section, .. }
            | MemoryClass::Workspace { section, .. } => {
                self.next_section_id = self.next_section_id.max(section + 1);
            }
            MemoryClass::Transient => {}
        }
        self.tensors.insert(tensor)
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id]
    }

    /// A fresh memory-section id, past everything already bound.
    pub fn alloc_section_id(&mut self) -> u64 {
        let id = self.next_section_id;
        self.next_section_id += 1;
        id
    }

    pub fn mark_graph_input(&mut self, id: TensorId) {
        self.graph_inputs.insert(id);
    }

    pub fn mark_graph_output(&mut self, id: TensorId) {
        self.graph_outputs.insert(id);
    }

    pub fn is_graph_input(&self, id: TensorId) -> bool {
        self.graph_inputs.contains(&id)
    }

    pub fn is_graph_output(&self, id: TensorId) -> bool {
        self.graph_outputs.contains(&id)
    }

    // ---- nodes ---------------------------------------------------------

    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = self.nodes.insert(node);
        self.wire(id);
        id
    }

    /// Detach a node from the graph, returning its value for a possible
    /// later re-insert by the caller.
    pub fn remove_node(&mut self, id: NodeId) -> Node {
        self.unwire(id);
        self.drop_control_edges(id);
        self.nodes.remove(id).expect("removing unknown node")
    }

    fn wire(&mut self, id: NodeId) {
        let (inputs, outputs) = {
            let node = &self.nodes[id];
            (node.inputs.clone(), node.outputs.clone())
        };
        for t in outputs.into_iter().flatten() {
            debug_assert!(
                !self.producer.contains_key(t),
                "tensor produced by more than one node"
            );
            self.producer.insert(t, id);
        }
        for t in inputs.into_iter().flatten() {
            self.consumers
                .entry(t)
                .expect("input tensor was removed")
                .or_insert_with(Vec::new)
                .push(id);
        }
    }

    fn unwire(&mut self, id: NodeId) {
        let (inputs, outputs) = {
            let node = &self.nodes[id];
            (node.inputs.clone(), node.outputs.clone())
        };
        for t in outputs.into_iter().flatten() {
            self.producer.remove(t);
        }
        for t in inputs.into_iter().flatten() {
            if let Some(list) = self.consumers.get_mut(t) {
                list.retain(|&n| n != id);
            }
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys()
    }

    // ---- data edges ----------------------------------------------------

    pub fn producer(&self, t: TensorId) -> Option<NodeId> {
        self.producer.get(t).copied()
    }

    /// Consumers in wiring order; a node appears once per consuming slot.
    pub fn consumers(&self, t: TensorId) -> &[NodeId] {
        self.consumers.get(t).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn distinct_consumer_count(&self, t: TensorId) -> usize {
        let mut seen: HashSet<NodeId> = HashSet::default();
        for &n in self.consumers(t) {
            seen.insert(n);
        }
        seen.len()
    }

    // ---- control dependencies -----------------------------------------

    /// Record that `blocking` must execute before `blocked`.
    pub fn add_control_edge(&mut self, blocking: NodeId, blocked: NodeId) {
        self.blocks.entry(blocking).or_default().insert(blocked);
        self.blocked_by.entry(blocked).or_default().insert(blocking);
    }

    pub fn remove_control_edge(&mut self, blocking: NodeId, blocked: NodeId) {
        if let Some(set) = self.blocks.get_mut(&blocking) {
            set.remove(&blocked);
        }
        if let Some(set) = self.blocked_by.get_mut(&blocked) {
            set.remove(&blocking);
        }
    }

    fn drop_control_edges(&mut self, id: NodeId) {
        if let Some(blocked) = self.blocks.remove(&id) {
            for b in blocked {
                if let Some(set) = self.blocked_by.get_mut(&b) {
                    set.remove(&id);
                }
            }
        }
        if let Some(blocking) = self.blocked_by.remove(&id) {
            for b in blocking {
                if let Some(set) = self.blocks.get_mut(&b) {
                    set.remove(&id);
                }
            }
        }
    }

    /// Nodes blocked by `id`.
    pub fn blocked_nodes(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.blocks.get(&id).into_iter().flatten().copied()
    }

    /// Nodes blocking `id`.
    pub fn blocking_nodes(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.blocked_by.get(&id).into_iter().flatten().copied()
    }

    pub fn has_control_deps(&self, id: NodeId) -> bool {
        self.blocks.get(&id).is_some_and(|s| !s.is_empty())
            || self.blocked_by.get(&id).is_some_and(|s| !s.is_empty())
    }

    /// Whether control dependencies were configured at all; lets the
    /// clustering skip its cycle-risk checks entirely when they never were.
    pub fn control_deps_configured(&self) -> bool {
        self.blocks.values().any(|s| !s.is_empty())
    }

    // ---- pre-extracted clusters ---------------------------------------

    pub fn set_prebuilt_clusters(&mut self, clusters: Vec<(u64, Vec<NodeId>)>) {
        self.prebuilt_clusters = clusters;
    }

    pub fn prebuilt_clusters(&self) -> &[(u64, Vec<NodeId>)] {
        &self.prebuilt_clusters
    }

    // ---- traversal -----------------------------------------------------

    fn successors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        for t in self.nodes[id].outputs.iter().copied().flatten() {
            out.extend_from_slice(self.consumers(t));
        }
        out.extend(self.blocked_nodes(id));
        out
    }

    fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        for t in self.nodes[id].inputs.iter().copied().flatten() {
            if let Some(p) = self.producer(t) {
                out.push(p);
            }
        }
        out.extend(self.blocking_nodes(id));
        out
    }

    /// Nodes in topological order over data and control edges.
    ///
    /// Panics on a cyclic graph; callers mutate the graph only through edits
    /// that preserve acyclicity.
    pub fn topo_sorted(&self) -> Vec<NodeId> {
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut visited: HashMap<NodeId, bool> = HashMap::default();
        for id in self.nodes.keys() {
            self.topo_visit(id, &mut visited, &mut result);
        }
        result
    }

    fn topo_visit(
        &self,
        id: NodeId,
        visited: &mut HashMap<NodeId, bool>,
        result: &mut Vec<NodeId>,
    ) {
        if let Some(&done) = visited.get(&id) {
            if !done {
                panic!("Cycle detected in operation graph");
            }
            return;
        }
        visited.insert(id, false);
        for pred in self.predecessors(id) {
            self.topo_visit(pred, visited, result);
        }
        visited.insert(id, true);
        result.push(id);
    }

    pub fn is_acyclic(&self) -> bool {
        // Kahn over data + control edges.
        let mut indegree: HashMap<NodeId, usize> = HashMap::default();
        for id in self.nodes.keys() {
            indegree.insert(id, self.predecessors(id).len());
        }
        let mut queue: Vec<NodeId> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut seen = 0usize;
        while let Some(id) = queue.pop() {
            seen += 1;
            for succ in self.successors(id) {
                let d = indegree.get_mut(&succ).expect("edge to unknown node");
                *d -= 1;
                if *d == 0 {
                    queue.push(succ);
                }
            }
        }
        seen == self.nodes.len()
    }
}

/// Whether any operand of `node` uses a 64-bit kind.
pub fn has_wide_operands(graph: &Graph, node: &Node) -> bool {
    node.operands()
        .flatten()
        .any(|t| graph.tensor(t).dtype.is_wide())
}

/// Whether a fused node built over these operand tensors is shape-dynamic.
pub fn operands_dynamic(graph: &Graph, node: &Node) -> bool {
    node.operands()
        .flatten()
        .any(|t| graph.tensor(t).is_dynamic())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(graph: &mut Graph, name: &str) -> TensorId {
        graph.add_tensor(Tensor::new(name, DType::F32, &[4, 4]))
    }

    fn chain(graph: &mut Graph, n: usize) -> Vec<NodeId> {
        let mut prev = t(graph, "in");
        graph.mark_graph_input(prev);
        let mut ids = Vec::new();
        for i in 0..n {
            let out = t(graph, &format!("t{i}"));
            ids.push(graph.add_node(
                Node::new("relu", format!("n{i}"), EngineClass::Vector)
                    .with_inputs([Some(prev)])
                    .with_outputs([Some(out)]),
            ));
            prev = out;
        }
        ids
    }

    #[test]
    fn topo_order_follows_data_edges() {
        let mut g = Graph::new();
        let ids = chain(&mut g, 3);
        let order = g.topo_sorted();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(ids[0]) < pos(ids[1]));
        assert!(pos(ids[1]) < pos(ids[2]));
    }

    #[test]
    fn control_edges_order_topo() {
        let mut g = Graph::new();
        let ids = chain(&mut g, 2);
        let lone_out = t(&mut g, "lone");
        let lone = g.add_node(
            Node::new("relu", "lone", EngineClass::Vector).with_outputs([Some(lone_out)]),
        );
        g.add_control_edge(ids[1], lone);
        let order = g.topo_sorted();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(ids[1]) < pos(lone));
        assert!(g.control_deps_configured());
    }

    #[test]
    fn consumers_track_removal() {
        let mut g = Graph::new();
        let ids = chain(&mut g, 2);
        let shared = g.node(ids[1]).inputs[0].unwrap();
        assert_eq!(g.consumers(shared), &[ids[1]]);
        g.remove_node(ids[1]);
        assert!(g.consumers(shared).is_empty());
    }

    #[test]
    fn dynamic_tensor_detection() {
        let tensor = Tensor::new("x", DType::F32, &[8, 8]).with_min_sizes(&[1, 8]);
        assert!(tensor.is_dynamic());
        assert!(tensor.props_valid());
    }
}
