//! End-to-end fusion scenarios against a mock optimizer backend.

use sinter_core::fuse::{self, ClusterBuilder, FuseError};
use sinter_core::graph::{
    node_uid, DType, EngineClass, Graph, MemoryClass, Node, NodeId, Tensor, TensorId,
};
use sinter_core::interop::ir::{IrEdge, IrSection, IrSectionKind};
use sinter_core::interop::{BackendError, FuserStatus, FusionBackend, IrGraph, IrNode};
use sinter_core::{FusionConfig, SifRegistry};

use std::collections::BTreeMap;

// ---- helpers -----------------------------------------------------------

fn tensor(g: &mut Graph, name: &str) -> TensorId {
    g.add_tensor(Tensor::new(name, DType::F32, &[4, 4]))
}

fn persistent(g: &mut Graph, name: &str, section: u64, offset: u64) -> TensorId {
    g.add_tensor(
        Tensor::new(name, DType::F32, &[4, 4])
            .with_memory(MemoryClass::Persistent { section, offset }),
    )
}

fn vnode(g: &mut Graph, op: &str, name: &str, ins: &[TensorId], outs: &[TensorId]) -> NodeId {
    g.add_node(
        Node::new(op, name, EngineClass::Vector)
            .with_inputs(ins.iter().copied().map(Some))
            .with_outputs(outs.iter().copied().map(Some)),
    )
}

fn clusters_as_sets(partition: &BTreeMap<NodeId, Vec<NodeId>>) -> Vec<Vec<NodeId>> {
    let mut out: Vec<Vec<NodeId>> = partition
        .values()
        .map(|v| {
            let mut v = v.clone();
            v.sort();
            v
        })
        .collect();
    out.sort();
    out
}

fn cluster_containing(partition: &BTreeMap<NodeId, Vec<NodeId>>, node: NodeId) -> Vec<NodeId> {
    partition
        .values()
        .find(|members| members.contains(&node))
        .cloned()
        .expect("node is in some cluster")
}

/// Persistent byte ranges inside one cluster are pairwise disjoint or
/// identical, never partially overlapping.
fn assert_no_partial_overlap(g: &Graph, partition: &BTreeMap<NodeId, Vec<NodeId>>) {
    for members in partition.values() {
        let mut ranges: Vec<(u64, u64, u64)> = Vec::new();
        for &id in members {
            for t in g.node(id).operands().flatten() {
                if let MemoryClass::Persistent { section, offset } = g.tensor(t).memory {
                    ranges.push((section, offset, offset + g.tensor(t).byte_size()));
                }
            }
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.0 == b.0 && a != b {
                    assert!(
                        a.2 <= b.1 || b.2 <= a.1,
                        "partially overlapping persistent ranges in one cluster"
                    );
                }
            }
        }
    }
}

fn assert_budget_respected(g: &Graph, partition: &BTreeMap<NodeId, Vec<NodeId>>, budget: usize) {
    for members in partition.values() {
        let multi = members
            .iter()
            .filter(|&&id| {
                let node = g.node(id);
                node.outputs.iter().flatten().count() > 1
                    || node
                        .primary_output()
                        .map(|t| g.distinct_consumer_count(t) > 1)
                        .unwrap_or(false)
            })
            .count();
        assert!(multi <= budget.max(1), "cluster multi-consumer count over budget");
    }
}

struct MockBackend<F>
where
    F: Fn(&IrGraph) -> Result<IrGraph, BackendError>,
{
    optimize: F,
}

impl<F> FusionBackend for MockBackend<F>
where
    F: Fn(&IrGraph) -> Result<IrGraph, BackendError>,
{
    fn optimize(&self, graph: &IrGraph, _dynamic: bool) -> Result<IrGraph, BackendError> {
        (self.optimize)(graph)
    }

    fn pre_graph(&self, node: &IrNode) -> Result<IrGraph, BackendError> {
        Err(BackendError::PreGraphFailed(
            node.unique_id,
            FuserStatus::Failed,
        ))
    }

    fn release(&self, graph: &mut IrGraph) -> Result<(), BackendError> {
        for node in &mut graph.nodes {
            node.params.clear();
        }
        Ok(())
    }
}

fn mock<F>(optimize: F) -> MockBackend<F>
where
    F: Fn(&IrGraph) -> Result<IrGraph, BackendError>,
{
    MockBackend { optimize }
}

fn ir_tensor_index(ir: &IrGraph, name: &str) -> usize {
    ir.tensors
        .iter()
        .position(|t| t.name == name)
        .unwrap_or_else(|| panic!("tensor {name} not in interchange graph"))
}

/// in -> relu(a) -> exp(b) -> sqrt(c) -> out
fn chain3(g: &mut Graph) -> [NodeId; 3] {
    let t_in = tensor(g, "in");
    let t1 = tensor(g, "t1");
    let t2 = tensor(g, "t2");
    let t_out = tensor(g, "out");
    g.mark_graph_input(t_in);
    g.mark_graph_output(t_out);
    let a = vnode(g, "relu", "a", &[t_in], &[t1]);
    let b = vnode(g, "exp", "b", &[t1], &[t2]);
    let c = vnode(g, "sqrt", "c", &[t2], &[t_out]);
    [a, b, c]
}

/// A mock answer fusing the whole chain into one kernel.
fn fuse_everything(ir: &IrGraph) -> Result<IrGraph, BackendError> {
    let idx_in = ir_tensor_index(ir, "in");
    let idx_out = ir_tensor_index(ir, "out");
    Ok(IrGraph {
        inference: ir.inference,
        tensors: vec![ir.tensors[idx_in].clone(), ir.tensors[idx_out].clone()],
        nodes: vec![IrNode {
            unique_id: 1000,
            op: "fused_eltwise".into(),
            name: "fused".into(),
            input_edges: vec![IrEdge::boundary(0)],
            output_edges: vec![IrEdge::boundary(1)],
            fused_ids: ir.nodes.iter().map(|n| n.unique_id).collect(),
            ..Default::default()
        }],
    })
}

// ---- clustering scenarios ----------------------------------------------

#[test]
fn adjacent_nodes_with_persistent_producer_cluster_together() {
    // A writes a persistent tensor, B reads only that and writes a
    // transient output: no overlap, no control dependency, one cluster.
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let t_mid = persistent(&mut g, "mid", 1, 0);
    let t_out = tensor(&mut g, "out");
    let a = vnode(&mut g, "relu", "a", &[t_in], &[t_mid]);
    let b = vnode(&mut g, "exp", "b", &[t_mid], &[t_out]);

    let cfg = FusionConfig::default();
    let partition = ClusterBuilder::new(&g, &cfg).compute().unwrap();
    assert_eq!(clusters_as_sets(&partition), vec![{
        let mut v = vec![a, b];
        v.sort();
        v
    }]);
}

#[test]
fn partial_persistent_overlap_rejects_clustering() {
    // A's output sits at (section 1, bytes 0..64); B additionally reads an
    // unrelated persistent tensor at (section 1, bytes 32..96). Partial
    // overlap, so A and B must not share a cluster.
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let t_mid = persistent(&mut g, "mid", 1, 0);
    let t_alias = persistent(&mut g, "alias", 1, 32);
    let t_out = tensor(&mut g, "out");
    let a = vnode(&mut g, "relu", "a", &[t_in], &[t_mid]);
    let b = vnode(&mut g, "add", "b", &[t_mid, t_alias], &[t_out]);

    let cfg = FusionConfig::default();
    let partition = ClusterBuilder::new(&g, &cfg).compute().unwrap();
    assert_eq!(cluster_containing(&partition, a), vec![a]);
    assert_eq!(cluster_containing(&partition, b), vec![b]);
    assert_no_partial_overlap(&g, &partition);
}

#[test]
fn exact_persistent_alias_is_tolerated() {
    // Same section, same byte range on both sides: a perfect alias, fusable.
    let mut g = Graph::new();
    let t_in = persistent(&mut g, "in", 2, 0);
    let t_mid = persistent(&mut g, "mid", 1, 0);
    let t_alias = persistent(&mut g, "alias", 2, 0);
    let t_out = tensor(&mut g, "out");
    let a = vnode(&mut g, "relu", "a", &[t_in], &[t_mid]);
    let b = vnode(&mut g, "add", "b", &[t_mid, t_alias], &[t_out]);

    let cfg = FusionConfig::default();
    let partition = ClusterBuilder::new(&g, &cfg).compute().unwrap();
    assert_eq!(cluster_containing(&partition, a).len(), 2);
    assert_eq!(cluster_containing(&partition, b).len(), 2);
    assert_no_partial_overlap(&g, &partition);
}

#[test]
fn multi_consumer_budget_admits_one_sibling() {
    // One 3-way multi-consumer node with budget 1: exactly one consumer
    // union is accepted, the other two stay outside.
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let t_fan = tensor(&mut g, "fan");
    let m = vnode(&mut g, "relu", "m", &[t_in], &[t_fan]);
    let mut consumers = Vec::new();
    for i in 0..3 {
        let out = tensor(&mut g, &format!("c{i}_out"));
        consumers.push(vnode(&mut g, "exp", &format!("c{i}"), &[t_fan], &[out]));
    }

    let cfg = FusionConfig {
        max_multi_consumers: 1,
        ..Default::default()
    };
    let partition = ClusterBuilder::new(&g, &cfg).compute().unwrap();
    let m_cluster = cluster_containing(&partition, m);
    assert_eq!(m_cluster.len(), 2, "exactly one consumer joins m");
    let joined: Vec<_> = consumers
        .iter()
        .filter(|c| m_cluster.contains(c))
        .collect();
    assert_eq!(joined.len(), 1);
    for &c in &consumers {
        if !m_cluster.contains(&c) {
            assert_eq!(cluster_containing(&partition, c), vec![c]);
        }
    }
    assert_budget_respected(&g, &partition, cfg.max_multi_consumers);
}

#[test]
fn zero_budget_disables_multi_consumer_clustering() {
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let t_fan = tensor(&mut g, "fan");
    let m = vnode(&mut g, "relu", "m", &[t_in], &[t_fan]);
    let o1 = tensor(&mut g, "o1");
    let o2 = tensor(&mut g, "o2");
    let c1 = vnode(&mut g, "exp", "c1", &[t_fan], &[o1]);
    let c2 = vnode(&mut g, "sqrt", "c2", &[t_fan], &[o2]);

    let cfg = FusionConfig {
        max_multi_consumers: 0,
        ..Default::default()
    };
    let partition = ClusterBuilder::new(&g, &cfg).compute().unwrap();
    for id in [m, c1, c2] {
        assert_eq!(cluster_containing(&partition, id), vec![id]);
    }
}

#[test]
fn cycle_repair_dissolves_and_reclusters() {
    // a feeds both b and the unclusterable e; c consumes b and e. The
    // multi-consumer union {a, b, c} collapses into a cycle through e, so
    // repair must dissolve it and re-cluster without the relaxation.
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let t_a = tensor(&mut g, "a_out");
    let t_b = tensor(&mut g, "b_out");
    let t_e = tensor(&mut g, "e_out");
    let t_c = tensor(&mut g, "c_out");
    let a = vnode(&mut g, "relu", "a", &[t_in], &[t_a]);
    let b = vnode(&mut g, "exp", "b", &[t_a], &[t_b]);
    let e = g.add_node(
        Node::new("matmul", "e", EngineClass::Matrix)
            .with_inputs([Some(t_a)])
            .with_outputs([Some(t_e)]),
    );
    let c = vnode(&mut g, "add", "c", &[t_b, t_e], &[t_c]);

    let cfg = FusionConfig::default();
    let partition = ClusterBuilder::new(&g, &cfg).compute().unwrap();

    // a must have been pulled out; b and c may stay together (collapsing
    // {b, c} leaves e strictly upstream).
    assert_eq!(cluster_containing(&partition, a), vec![a]);
    let bc = cluster_containing(&partition, b);
    assert!(bc.contains(&c));
    assert!(!partition.keys().any(|&root| root == e), "e is not eligible");
    for members in partition.values() {
        let set = members.iter().copied().collect();
        assert!(!g.creates_cycle_when_fused(&set));
    }
}

#[test]
fn control_dependency_inversion_rejects_clustering() {
    // x must run between a and b (a blocks x, x blocks b); fusing a and b
    // would invert that ordering.
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let t_mid = tensor(&mut g, "mid");
    let t_out = tensor(&mut g, "out");
    let t_x = tensor(&mut g, "x_out");
    let a = vnode(&mut g, "relu", "a", &[t_in], &[t_mid]);
    let b = vnode(&mut g, "exp", "b", &[t_mid], &[t_out]);
    let x = g.add_node(
        Node::new("memset", "x", EngineClass::Dma).with_outputs([Some(t_x)]),
    );
    g.add_control_edge(a, x);
    g.add_control_edge(x, b);

    let cfg = FusionConfig::default();
    let partition = ClusterBuilder::new(&g, &cfg).compute().unwrap();
    assert_eq!(cluster_containing(&partition, a), vec![a]);
    assert_eq!(cluster_containing(&partition, b), vec![b]);
}

#[test]
fn partition_is_total_and_respects_budget() {
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let mut prev = t_in;
    let mut eligible = Vec::new();
    for i in 0..6 {
        let out = tensor(&mut g, &format!("t{i}"));
        eligible.push(vnode(&mut g, "relu", &format!("n{i}"), &[prev], &[out]));
        prev = out;
    }
    // A fan-out in the middle.
    let side = tensor(&mut g, "side");
    let mid_out = g.node(eligible[2]).outputs[0].unwrap();
    eligible.push(vnode(&mut g, "exp", "side", &[mid_out], &[side]));

    let cfg = FusionConfig::default();
    let partition = ClusterBuilder::new(&g, &cfg).compute().unwrap();
    let mut seen = Vec::new();
    for members in partition.values() {
        seen.extend_from_slice(members);
    }
    seen.sort();
    let mut expected = eligible.clone();
    expected.sort();
    assert_eq!(seen, expected, "every eligible node is in exactly one cluster");
    assert_budget_respected(&g, &partition, cfg.max_multi_consumers);
    assert_no_partial_overlap(&g, &partition);
}

#[test]
fn prebuilt_cluster_is_seeded_and_non_expandable() {
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let t1 = tensor(&mut g, "t1");
    let t2 = tensor(&mut g, "t2");
    let t3 = tensor(&mut g, "t3");
    let t4 = tensor(&mut g, "t4");
    let a = vnode(&mut g, "relu", "a", &[t_in], &[t1]);
    let b = vnode(&mut g, "exp", "b", &[t1], &[t2]);
    let c = vnode(&mut g, "sqrt", "c", &[t2], &[t3]);
    let d = vnode(&mut g, "relu", "d", &[t3], &[t4]);
    g.set_prebuilt_clusters(vec![(9, vec![a, b])]);

    let cfg = FusionConfig::default();
    let partition = ClusterBuilder::new(&g, &cfg).compute().unwrap();
    let ab = cluster_containing(&partition, a);
    assert_eq!(ab.len(), 2);
    assert!(ab.contains(&b));
    // c could not grow backwards into the pre-extracted cluster.
    let cd = cluster_containing(&partition, c);
    assert!(cd.contains(&d));
    assert!(!cd.contains(&b));
}

#[test]
fn disconnected_prebuilt_cluster_is_fatal() {
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let t1 = tensor(&mut g, "t1");
    let t2 = tensor(&mut g, "t2");
    let t3 = tensor(&mut g, "t3");
    let a = vnode(&mut g, "relu", "a", &[t_in], &[t1]);
    let _b = vnode(&mut g, "exp", "b", &[t1], &[t2]);
    let c = vnode(&mut g, "sqrt", "c", &[t2], &[t3]);
    g.set_prebuilt_clusters(vec![(3, vec![a, c])]);

    let cfg = FusionConfig::default();
    let err = ClusterBuilder::new(&g, &cfg).compute().unwrap_err();
    assert!(matches!(err, FuseError::Invariant(_)));
}

// ---- end-to-end fusion -------------------------------------------------

#[test]
fn fusing_a_chain_replaces_it_with_one_kernel() -> anyhow::Result<()> {
    let mut g = Graph::new();
    let nodes = chain3(&mut g);
    let backend = mock(fuse_everything);

    fuse::run(&mut g, &FusionConfig::default(), &backend, &SifRegistry::new())?;

    assert_eq!(g.node_count(), 1);
    let fused = g.node_ids().next().unwrap();
    let node = g.node(fused);
    assert_eq!(node.op, "fused_eltwise");
    assert!(node.name.starts_with("fused_kernel_"));
    assert_eq!(node.origin_nodes.len(), 3);
    for orig in nodes {
        assert!(node.origin_nodes.contains(&orig));
    }
    assert!(node.stitchable);
    assert!(g.is_acyclic());
    Ok(())
}

#[test]
fn existing_nodes_are_reused_unchanged() {
    // The optimizer fuses a and b but echoes c back by its unique id.
    let mut g = Graph::new();
    let [a, b, c] = chain3(&mut g);
    let c_uid = node_uid(c);
    let backend = mock(move |ir: &IrGraph| {
        let idx_in = ir_tensor_index(ir, "in");
        let idx_t2 = ir_tensor_index(ir, "t2");
        let idx_out = ir_tensor_index(ir, "out");
        assert!(ir.nodes.iter().any(|n| n.unique_id == c_uid), "c was sent out");
        // c echoed back by unique id, with edges rebuilt against the
        // returned tensor list.
        let echoed_c = IrNode {
            unique_id: c_uid,
            op: "sqrt".into(),
            name: "c".into(),
            input_edges: vec![IrEdge::internal(1, 1000)],
            output_edges: vec![IrEdge::boundary(2)],
            ..Default::default()
        };
        Ok(IrGraph {
            inference: ir.inference,
            tensors: vec![
                ir.tensors[idx_in].clone(),
                ir.tensors[idx_t2].clone(),
                ir.tensors[idx_out].clone(),
            ],
            nodes: vec![
                IrNode {
                    unique_id: 1000,
                    op: "fused_eltwise".into(),
                    name: "fused".into(),
                    input_edges: vec![IrEdge::boundary(0)],
                    output_edges: vec![IrEdge::boundary(1)],
                    fused_ids: ir
                        .nodes
                        .iter()
                        .map(|n| n.unique_id)
                        .filter(|&u| u != c_uid)
                        .collect(),
                    ..Default::default()
                },
                echoed_c,
            ],
        })
    });

    fuse::run(&mut g, &FusionConfig::default(), &backend, &SifRegistry::new()).unwrap();

    assert_eq!(g.node_count(), 2);
    assert!(g.contains_node(c), "echoed node survives unchanged");
    assert!(!g.contains_node(a));
    assert!(!g.contains_node(b));
    assert!(g.is_acyclic());
}

#[test]
fn bogus_provenance_aborts_the_pass() {
    let mut g = Graph::new();
    chain3(&mut g);
    let backend = mock(|ir: &IrGraph| {
        let mut out = fuse_everything(ir)?;
        out.nodes[0].fused_ids.push(0xDEAD_BEEF);
        Ok(out)
    });

    let err = fuse::run(&mut g, &FusionConfig::default(), &backend, &SifRegistry::new())
        .unwrap_err();
    assert!(matches!(err, FuseError::Invariant(_)));
}

#[test]
fn unanchored_new_persistent_output_rejects_fusion() {
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let t1 = tensor(&mut g, "t1");
    let t2 = tensor(&mut g, "t2");
    let t_out = persistent(&mut g, "out", 7, 0);
    g.mark_graph_input(t_in);
    g.mark_graph_output(t_out);
    vnode(&mut g, "relu", "a", &[t_in], &[t1]);
    vnode(&mut g, "exp", "b", &[t1], &[t2]);
    vnode(&mut g, "sqrt", "c", &[t2], &[t_out]);

    let backend = mock(|ir: &IrGraph| {
        let mut out = fuse_everything(ir)?;
        // A new persistent output in the right section but past the range
        // of any original output: not a subset alias.
        let mut extra = out.tensors[1].clone();
        extra.unique_id = 9999;
        extra.name = "stray".into();
        extra.section = IrSection {
            kind: IrSectionKind::Persistent,
            id: 7,
            offset: 128,
        };
        out.tensors.push(extra);
        out.nodes[0].output_edges.push(IrEdge::boundary(2));
        Ok(out)
    });

    fuse::run(&mut g, &FusionConfig::default(), &backend, &SifRegistry::new()).unwrap();
    // Rejected by validation: the graph is untouched.
    assert_eq!(g.node_count(), 3);
}

#[test]
fn optimizer_failure_aborts_the_pass() {
    let mut g = Graph::new();
    chain3(&mut g);
    let backend = mock(|_ir: &IrGraph| {
        Err(BackendError::OptimizeFailed(FuserStatus::Failed))
    });

    let err = fuse::run(&mut g, &FusionConfig::default(), &backend, &SifRegistry::new())
        .unwrap_err();
    assert!(matches!(err, FuseError::Backend(_)));
    assert_eq!(g.node_count(), 3, "graph is left in its pre-call state");
}

#[test]
fn dynamic_fused_node_carries_split_shape_inference() {
    let mut g = Graph::new();
    let t_in = g.add_tensor(
        Tensor::new("in", DType::F32, &[8, 4]).with_min_sizes(&[1, 4]),
    );
    let t1 = g.add_tensor(Tensor::new("t1", DType::F32, &[8, 4]).with_min_sizes(&[1, 4]));
    let t_out = g.add_tensor(Tensor::new("out", DType::F32, &[8, 4]).with_min_sizes(&[1, 4]));
    g.mark_graph_input(t_in);
    g.mark_graph_output(t_out);
    vnode(&mut g, "relu", "a", &[t_in], &[t1]);
    vnode(&mut g, "exp", "b", &[t1], &[t_out]);

    let backend = mock(|ir: &IrGraph| {
        let mut out = fuse_everything(ir)?;
        // Parameters on the fused node select the split fast path.
        out.nodes[0].params = vec![1, 2, 3, 4];
        Ok(out)
    });

    fuse::run(&mut g, &FusionConfig::default(), &backend, &SifRegistry::new()).unwrap();
    assert_eq!(g.node_count(), 1);
    let fused = g.node_ids().next().unwrap();
    let info = g.node(fused).multi_sif.as_ref().expect("multi-sif data");
    assert_eq!(info.nodes.len(), 1);
    assert_eq!(info.nodes[0].sif, Some(sinter_core::fuse::sif::SPLIT_FUSED_SIF));
}

#[test]
fn foreign_subcluster_is_replaced_atomically() {
    // Two disjoint chains, both coming back as fused nodes of the same
    // foreign sub-cluster: one atomic replacement for their union.
    let mut g = Graph::new();
    let t_in1 = tensor(&mut g, "in1");
    let t_m1 = tensor(&mut g, "m1");
    let t_out1 = tensor(&mut g, "out1");
    let t_in2 = tensor(&mut g, "in2");
    let t_m2 = tensor(&mut g, "m2");
    let t_out2 = tensor(&mut g, "out2");
    g.mark_graph_input(t_in1);
    g.mark_graph_input(t_in2);
    g.mark_graph_output(t_out1);
    g.mark_graph_output(t_out2);
    let a1 = vnode(&mut g, "relu", "a1", &[t_in1], &[t_m1]);
    let b1 = vnode(&mut g, "exp", "b1", &[t_m1], &[t_out1]);
    let a2 = vnode(&mut g, "relu", "a2", &[t_in2], &[t_m2]);
    let b2 = vnode(&mut g, "exp", "b2", &[t_m2], &[t_out2]);
    let pair1: Vec<u64> = vec![node_uid(a1), node_uid(b1)];
    let pair2: Vec<u64> = vec![node_uid(a2), node_uid(b2)];

    let backend = mock(move |ir: &IrGraph| {
        let f = |n: u32, ins: usize, outs: usize, fused_ids: &[u64]| IrNode {
            unique_id: 2000 + n as u64,
            op: "fused_eltwise".into(),
            name: format!("fused{n}"),
            input_edges: vec![IrEdge::boundary(ins)],
            output_edges: vec![IrEdge::boundary(outs)],
            fused_ids: fused_ids.to_vec(),
            origin_cluster: Some(5),
            ..Default::default()
        };
        Ok(IrGraph {
            inference: ir.inference,
            tensors: vec![
                ir.tensors[ir_tensor_index(ir, "in1")].clone(),
                ir.tensors[ir_tensor_index(ir, "out1")].clone(),
                ir.tensors[ir_tensor_index(ir, "in2")].clone(),
                ir.tensors[ir_tensor_index(ir, "out2")].clone(),
            ],
            nodes: vec![f(0, 0, 1, &pair1), f(1, 2, 3, &pair2)],
        })
    });

    fuse::run(&mut g, &FusionConfig::default(), &backend, &SifRegistry::new()).unwrap();
    assert_eq!(g.node_count(), 2);
    for id in g.node_ids().collect::<Vec<_>>() {
        assert_eq!(g.node(id).origin_nodes.len(), 2);
    }
    assert!(g.is_acyclic());
}

#[test]
fn replacement_that_would_cycle_is_skipped_locally() {
    // Diamond: a feeds b and e, c consumes both. Fusing {a, b, c} while e
    // stays behind would cycle; the facade rejects it and the graph is kept.
    let mut g = Graph::new();
    let t_in = tensor(&mut g, "in");
    let t_a = tensor(&mut g, "a_out");
    let t_b = tensor(&mut g, "b_out");
    let t_e = tensor(&mut g, "e_out");
    let t_c = tensor(&mut g, "c_out");
    g.mark_graph_input(t_in);
    g.mark_graph_output(t_c);
    let a = vnode(&mut g, "relu", "a", &[t_in], &[t_a]);
    let b = vnode(&mut g, "exp", "b", &[t_a], &[t_b]);
    let e = vnode(&mut g, "sqrt", "e", &[t_a], &[t_e]);
    let c = vnode(&mut g, "add", "c", &[t_b, t_e], &[t_c]);
    let fused_ids: Vec<u64> = [a, b, c].iter().map(|&n| node_uid(n)).collect();
    let e_uid = node_uid(e);

    let backend = mock(move |ir: &IrGraph| {
        let idx_in = ir_tensor_index(ir, "in");
        let idx_a = ir_tensor_index(ir, "a_out");
        let idx_e = ir_tensor_index(ir, "e_out");
        let idx_c = ir_tensor_index(ir, "c_out");
        assert!(ir.nodes.iter().any(|n| n.unique_id == e_uid), "e was sent out");
        let echoed_e = IrNode {
            unique_id: e_uid,
            op: "sqrt".into(),
            name: "e".into(),
            input_edges: vec![IrEdge::internal(1, 3000)],
            output_edges: vec![IrEdge::internal(2, 3000)],
            ..Default::default()
        };
        Ok(IrGraph {
            inference: ir.inference,
            tensors: vec![
                ir.tensors[idx_in].clone(),
                ir.tensors[idx_a].clone(),
                ir.tensors[idx_e].clone(),
                ir.tensors[idx_c].clone(),
            ],
            nodes: vec![
                IrNode {
                    unique_id: 3000,
                    op: "fused_eltwise".into(),
                    name: "fused".into(),
                    input_edges: vec![IrEdge::boundary(0), IrEdge::boundary(2)],
                    output_edges: vec![IrEdge::boundary(1), IrEdge::boundary(3)],
                    fused_ids: fused_ids.clone(),
                    ..Default::default()
                },
                echoed_e,
            ],
        })
    });

    fuse::run(&mut g, &FusionConfig::default(), &backend, &SifRegistry::new()).unwrap();
    // The skipped replacement left every original node in place.
    assert_eq!(g.node_count(), 4);
    for id in [a, b, e, c] {
        assert!(g.contains_node(id));
    }
}

#[test]
fn validation_is_idempotent() {
    let mut g = Graph::new();
    chain3(&mut g);
    let members: Vec<NodeId> = g.topo_sorted();
    let ctx = fuse::build_cluster_context(&g, &members);
    let optimized = fuse_everything(&ctx.ir).unwrap();

    assert!(fuse::validate_optimized(&g, &ctx, &optimized).is_ok());
    assert!(fuse::validate_optimized(&g, &ctx, &optimized).is_ok());
}

#[test]
fn missing_required_external_rejects_validation() {
    let mut g = Graph::new();
    chain3(&mut g);
    let members: Vec<NodeId> = g.topo_sorted();
    let ctx = fuse::build_cluster_context(&g, &members);
    let mut optimized = fuse_everything(&ctx.ir).unwrap();
    // Drop the output edge: the graph output no longer reappears.
    optimized.nodes[0].output_edges.clear();
    optimized.tensors.truncate(1);

    let err = fuse::validate_optimized(&g, &ctx, &optimized).unwrap_err();
    assert!(matches!(
        err,
        fuse::ValidationReject::MissingExternal(_) | fuse::ValidationReject::NodeWithoutOutputs(_)
    ));
}
