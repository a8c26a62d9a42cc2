//! Atomic graph edits.
//!
//! Every edit here either fully succeeds or leaves the graph unchanged; the
//! cycle probes run against a hypothetical edge set instead of mutating and
//! restoring, so a rejected edit cannot leave the graph dirty.

use super::{Graph, Node, NodeId};
use crate::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("replacement would introduce a cycle into the graph")]
    WouldCycle,
    #[error("node {0:?} is not in the graph")]
    UnknownNode(NodeId),
}

/// Identity of a node in the hypothetical post-edit graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Virt {
    Old(NodeId),
    New(usize),
}

impl Graph {
    /// Atomically replace `old` nodes with `new` ones.
    ///
    /// The replacement is checked for cycles up front; on rejection the graph
    /// is untouched and the caller keeps the detached `new` nodes. Control
    /// edges of the replaced nodes that point outside the replaced set are
    /// transferred to the first new node so no ordering is lost.
    ///
    /// Returns the ids of the inserted nodes, in input order.
    pub fn replace_nodes(
        &mut self,
        old: &[NodeId],
        new: Vec<Node>,
    ) -> Result<Vec<NodeId>, GraphError> {
        for &id in old {
            if !self.contains_node(id) {
                return Err(GraphError::UnknownNode(id));
            }
        }
        let old_set: HashSet<NodeId> = old.iter().copied().collect();
        let mut carried_blocking: HashSet<NodeId> = HashSet::default();
        let mut carried_blocked: HashSet<NodeId> = HashSet::default();
        for &id in old {
            carried_blocking.extend(self.blocking_nodes(id).filter(|n| !old_set.contains(n)));
            carried_blocked.extend(self.blocked_nodes(id).filter(|n| !old_set.contains(n)));
        }
        if self.replacement_creates_cycle(old, &new, &carried_blocking, &carried_blocked) {
            return Err(GraphError::WouldCycle);
        }

        for &id in old {
            self.remove_node(id);
        }
        let ids: Vec<NodeId> = new.into_iter().map(|n| self.add_node(n)).collect();
        if let Some(&first) = ids.first() {
            for b in carried_blocking {
                self.add_control_edge(b, first);
            }
            for b in carried_blocked {
                self.add_control_edge(first, b);
            }
        }
        Ok(ids)
    }

    /// Would removing `old` and inserting `new` leave a cycle?
    ///
    /// Runs over the hypothetical edge set: data edges are recomputed from
    /// operand lists with `old` absent and `new` present, control edges keep
    /// their surviving endpoints, and the edges that would be transferred to
    /// the first new node are included.
    fn replacement_creates_cycle(
        &self,
        old: &[NodeId],
        new: &[Node],
        carried_blocking: &HashSet<NodeId>,
        carried_blocked: &HashSet<NodeId>,
    ) -> bool {
        let old_set: HashSet<NodeId> = old.iter().copied().collect();

        // tensor -> hypothetical producer
        let mut new_producer = HashMap::default();
        for (i, node) in new.iter().enumerate() {
            for t in node.outputs.iter().copied().flatten() {
                new_producer.insert(t, Virt::New(i));
            }
        }
        let producer_of = |t| -> Option<Virt> {
            if let Some(&v) = new_producer.get(&t) {
                return Some(v);
            }
            self.producer(t)
                .filter(|p| !old_set.contains(p))
                .map(Virt::Old)
        };

        let preds = |v: Virt| -> Vec<Virt> {
            let mut out = Vec::new();
            match v {
                Virt::Old(id) => {
                    for t in self.node(id).inputs.iter().copied().flatten() {
                        out.extend(producer_of(t));
                    }
                    out.extend(
                        self.blocking_nodes(id)
                            .filter(|n| !old_set.contains(n))
                            .map(Virt::Old),
                    );
                    if !new.is_empty() && carried_blocked.contains(&id) {
                        out.push(Virt::New(0));
                    }
                }
                Virt::New(i) => {
                    for t in new[i].inputs.iter().copied().flatten() {
                        out.extend(producer_of(t));
                    }
                    if i == 0 {
                        out.extend(carried_blocking.iter().map(|&n| Virt::Old(n)));
                    }
                }
            }
            out
        };

        // DFS three-color cycle detection over the hypothetical graph.
        let mut state: HashMap<Virt, bool> = HashMap::default();
        let mut stack: Vec<(Virt, usize)> = Vec::new();
        let roots = self
            .node_ids()
            .filter(|id| !old_set.contains(id))
            .map(Virt::Old)
            .chain((0..new.len()).map(Virt::New));
        for root in roots {
            if state.contains_key(&root) {
                continue;
            }
            stack.push((root, 0));
            state.insert(root, false);
            while let Some(&(v, i)) = stack.last() {
                let p = preds(v);
                if i < p.len() {
                    stack.last_mut().expect("non-empty stack").1 += 1;
                    let next = p[i];
                    match state.get(&next) {
                        Some(false) => return true,
                        Some(true) => {}
                        None => {
                            state.insert(next, false);
                            stack.push((next, 0));
                        }
                    }
                } else {
                    state.insert(v, true);
                    stack.pop();
                }
            }
        }
        false
    }

    /// Would collapsing `members` into a single placeholder node create a
    /// cycle? True exactly when a path leaves the member set and re-enters
    /// it, which is what a placeholder replacement plus topological check
    /// would report.
    pub fn creates_cycle_when_fused(&self, members: &HashSet<NodeId>) -> bool {
        let mut reaches: HashMap<NodeId, bool> = HashMap::default();
        for &m in members {
            for succ in self.successors(m) {
                if !members.contains(&succ)
                    && self.reaches_member(succ, members, &mut reaches)
                {
                    return true;
                }
            }
        }
        false
    }

    fn reaches_member(
        &self,
        from: NodeId,
        members: &HashSet<NodeId>,
        memo: &mut HashMap<NodeId, bool>,
    ) -> bool {
        if let Some(&r) = memo.get(&from) {
            return r;
        }
        // Mark in-progress as non-reaching; a DAG walk never revisits a node
        // on the same path, so this only memoizes completed subtrees early.
        memo.insert(from, false);
        let mut found = false;
        for succ in self.successors(from) {
            if members.contains(&succ) || self.reaches_member(succ, members, memo) {
                found = true;
                break;
            }
        }
        memo.insert(from, found);
        found
    }

    /// Remove control edges that are parallel to a data path, so that
    /// clusters blocked only by redundant ordering edges can still fuse.
    pub fn drop_redundant_control_edges(&mut self) {
        let mut redundant = Vec::new();
        for id in self.node_ids().collect::<Vec<_>>() {
            for blocked in self.blocked_nodes(id).collect::<Vec<_>>() {
                if self.data_path_exists(id, blocked) {
                    redundant.push((id, blocked));
                }
            }
        }
        for (blocking, blocked) in redundant {
            log::debug!("dropping redundant control edge {blocking:?} -> {blocked:?}");
            self.remove_control_edge(blocking, blocked);
        }
    }

    fn data_path_exists(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen: HashSet<NodeId> = HashSet::default();
        while let Some(id) = stack.pop() {
            for t in self.node(id).outputs.iter().copied().flatten() {
                for &c in self.consumers(t) {
                    if c == to {
                        return true;
                    }
                    if seen.insert(c) {
                        stack.push(c);
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DType, EngineClass, Tensor};

    fn t(g: &mut Graph, name: &str) -> crate::graph::TensorId {
        g.add_tensor(Tensor::new(name, DType::F32, &[4]))
    }

    /// a -> b -> c with a side edge a -> e -> c.
    fn diamondish(g: &mut Graph) -> (Vec<NodeId>, crate::graph::TensorId) {
        let t_in = t(g, "in");
        let t_a = t(g, "a_out");
        let t_b = t(g, "b_out");
        let t_e = t(g, "e_out");
        let t_c = t(g, "c_out");
        let a = g.add_node(
            Node::new("relu", "a", EngineClass::Vector)
                .with_inputs([Some(t_in)])
                .with_outputs([Some(t_a)]),
        );
        let b = g.add_node(
            Node::new("relu", "b", EngineClass::Vector)
                .with_inputs([Some(t_a)])
                .with_outputs([Some(t_b)]),
        );
        let e = g.add_node(
            Node::new("sqrt", "e", EngineClass::Vector)
                .with_inputs([Some(t_a)])
                .with_outputs([Some(t_e)]),
        );
        let c = g.add_node(
            Node::new("add", "c", EngineClass::Vector)
                .with_inputs([Some(t_b), Some(t_e)])
                .with_outputs([Some(t_c)]),
        );
        (vec![a, b, e, c], t_c)
    }

    #[test]
    fn collapse_cycle_detected_through_sibling() {
        let mut g = Graph::new();
        let (ids, _) = diamondish(&mut g);
        // {a, b, c} collapsed would form cluster -> e -> cluster.
        let members: HashSet<NodeId> = [ids[0], ids[1], ids[3]].into_iter().collect();
        assert!(g.creates_cycle_when_fused(&members));
        // {a, b} is fine: e only consumes from it, never feeds back before c.
        let members: HashSet<NodeId> = [ids[0], ids[1]].into_iter().collect();
        assert!(!g.creates_cycle_when_fused(&members));
    }

    #[test]
    fn replace_rejects_cycle_and_leaves_graph_untouched() {
        let mut g = Graph::new();
        let (ids, t_c) = diamondish(&mut g);
        let (a, b, e, c) = (ids[0], ids[1], ids[2], ids[3]);
        let t_in = g.node(a).inputs[0].unwrap();
        let t_a = g.node(a).outputs[0].unwrap();
        let t_e = g.node(e).inputs[0];
        assert_eq!(t_e, Some(t_a));
        // Fusing a, b, c into one node that still feeds and consumes e's
        // tensors closes a loop through e.
        let fused = Node::new("fused_abc", "fused", EngineClass::Vector)
            .with_inputs([Some(t_in), g.node(c).inputs[1]])
            .with_outputs([Some(t_a), Some(t_c)]);
        let before = g.node_count();
        let err = g.replace_nodes(&[a, b, c], vec![fused]).unwrap_err();
        assert!(matches!(err, GraphError::WouldCycle));
        assert_eq!(g.node_count(), before);
        assert!(g.contains_node(a) && g.contains_node(b) && g.contains_node(c));
    }

    #[test]
    fn replace_succeeds_and_transfers_control_edges() {
        let mut g = Graph::new();
        let (ids, t_c) = diamondish(&mut g);
        let (a, b, e, c) = (ids[0], ids[1], ids[2], ids[3]);
        let t_in = g.node(a).inputs[0].unwrap();
        let lone_out = t(&mut g, "lone");
        let lone =
            g.add_node(Node::new("relu", "lone", EngineClass::Vector).with_outputs([Some(lone_out)]));
        g.add_control_edge(lone, b);

        // Replace the whole diamond: no external data edges survive.
        let fused = Node::new("fused_all", "fused", EngineClass::Vector)
            .with_inputs([Some(t_in)])
            .with_outputs([Some(t_c)]);
        let new_ids = g.replace_nodes(&[a, b, e, c], vec![fused]).unwrap();
        assert_eq!(new_ids.len(), 1);
        assert!(g.is_acyclic());
        assert!(g
            .blocking_nodes(new_ids[0])
            .collect::<Vec<_>>()
            .contains(&lone));
    }

    #[test]
    fn redundant_control_edge_dropped() {
        let mut g = Graph::new();
        let (ids, _) = diamondish(&mut g);
        // a -> c already has a data path; the control edge is redundant.
        g.add_control_edge(ids[0], ids[3]);
        g.drop_redundant_control_edges();
        assert!(g.blocked_nodes(ids[0]).next().is_none());
    }
}
