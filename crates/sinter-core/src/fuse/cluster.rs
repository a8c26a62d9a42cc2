//! Cluster construction: partition the eligible node set into maximal
//! fusable clusters, then repair any cycle the multi-consumer relaxation
//! introduced.
//!
//! Clusters are grown incrementally with a union-find; the cluster id is the
//! set representative. Growth follows the topological node order, so
//! clusters extend along the natural dependency direction and which cluster
//! forms is deterministic (an accepted tie-break, not a correctness
//! requirement).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use slotmap::SecondaryMap;

use super::union_find::UnionFind;
use super::FuseError;
use crate::config::FusionConfig;
use crate::graph::{has_wide_operands, EngineClass, Graph, Node, NodeId, TensorId};
use crate::{HashMap, HashSet};

/// A cluster is named by its union-find representative.
pub type ClusterId = NodeId;

/// Whether a single node is eligible to participate in fusion at all.
pub fn can_cluster_basic(graph: &Graph, node: &Node) -> bool {
    let engine_ok = node.engine == EngineClass::Vector
        || node.op == "reshape"
        || node.op == "broadcast";
    engine_ok && !has_wide_operands(graph, node)
}

/// A persistent byte range inside a memory section. Ordered by
/// (section, start, end) so partial overlaps sit next to each other in a
/// sorted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SecRange {
    section: u64,
    start: u64,
    end: u64,
}

impl SecRange {
    fn partial_overlap(&self, other: &SecRange) -> bool {
        self.section == other.section
            && self != other
            && self.start < other.end
            && other.start < self.end
    }
}

/// Per-cluster bookkeeping, merged on union, dropped when the pass ends.
#[derive(Default)]
struct ClusterBook {
    /// Persistent tensors touched, keyed by identity so a tensor shared by
    /// producer and consumer enters the range sets once.
    persist: HashMap<TensorId, bool>, // tensor -> seen as input
    in_ranges: BTreeSet<SecRange>,
    out_ranges: BTreeSet<SecRange>,
    /// Nodes already known to overlap this cluster; a memoized rejection.
    overlap_nodes: HashSet<NodeId>,
    /// Members that are multi-consumer or multi-output; bounded by the
    /// configured budget.
    multi_nodes: HashSet<NodeId>,
    /// Unions accepted through the multi-consumer relaxation; also bounded
    /// by the budget, which is what stops a relaxed node from absorbing
    /// every one of its consumers.
    relaxed_unions: usize,
    /// Members that carry any control dependency.
    ctrl_nodes: HashSet<NodeId>,
    /// Closure of nodes blocked by / blocking the members in `ctrl_nodes`.
    blocking_blocked: HashSet<NodeId>,
}

impl ClusterBook {
    fn merge(mut a: ClusterBook, b: ClusterBook) -> ClusterBook {
        a.persist.extend(b.persist);
        a.in_ranges.extend(b.in_ranges);
        a.out_ranges.extend(b.out_ranges);
        a.overlap_nodes.extend(b.overlap_nodes);
        a.multi_nodes.extend(b.multi_nodes);
        a.relaxed_unions += b.relaxed_unions;
        a.ctrl_nodes.extend(b.ctrl_nodes);
        a.blocking_blocked.extend(b.blocking_blocked);
        a
    }
}

/// Snapshot of a cluster's persistent ranges plus one not-yet-committed
/// node, used for the overlap test.
#[derive(Default)]
struct RangeView {
    persist: HashSet<TensorId>,
    ins: BTreeSet<SecRange>,
    outs: BTreeSet<SecRange>,
}

impl RangeView {
    fn is_empty(&self) -> bool {
        self.persist.is_empty()
    }
}

/// True when any range of `src` partially overlaps a range of `dst`.
/// An exact duplicate (same section, start and end) is a perfect alias and
/// is tolerated; everything else that intersects is a hazard. The sorted
/// order bounds the scan to the section's own ranges.
fn ranges_conflict(dst: &BTreeSet<SecRange>, src: &BTreeSet<SecRange>) -> bool {
    for r in src {
        let section_lo = SecRange {
            section: r.section,
            start: 0,
            end: 0,
        };
        let section_hi = SecRange {
            section: r.section,
            start: r.end,
            end: u64::MAX,
        };
        for other in dst.range(section_lo..section_hi) {
            if other.partial_overlap(r) {
                return true;
            }
        }
    }
    false
}

pub struct ClusterBuilder<'g> {
    graph: &'g Graph,
    budget: usize,
    multi_enabled: bool,
    honor_prebuilt: bool,
    ctrl_configured: bool,
    uf: UnionFind,
    clustered: SecondaryMap<NodeId, bool>,
    /// Eligible nodes in topological order.
    nodes: Vec<NodeId>,
    books: HashMap<ClusterId, ClusterBook>,
    /// Non-expandable clusters seeded from the complex-operation expansion.
    prebuilt_roots: HashSet<ClusterId>,
    /// Deferred sibling consumers of the multi-consumer node being grown.
    pending_consumers: VecDeque<NodeId>,
    pending_owner: Option<NodeId>,
}

impl<'g> ClusterBuilder<'g> {
    pub fn new(graph: &'g Graph, cfg: &FusionConfig) -> Self {
        let budget = cfg.clamped_budget();
        let mut builder = Self {
            graph,
            budget,
            multi_enabled: budget > 0,
            honor_prebuilt: cfg.honor_prebuilt_clusters,
            ctrl_configured: graph.control_deps_configured(),
            uf: UnionFind::new(),
            clustered: SecondaryMap::new(),
            nodes: Vec::new(),
            books: HashMap::default(),
            prebuilt_roots: HashSet::default(),
            pending_consumers: VecDeque::new(),
            pending_owner: None,
        };
        for id in graph.topo_sorted() {
            if !can_cluster_basic(graph, graph.node(id)) {
                continue;
            }
            builder.uf.insert(id);
            builder.clustered.insert(id, false);
            builder.nodes.push(id);
            log::trace!("clusterable node {}", graph.node(id).name);
        }
        builder
    }

    /// Partition the eligible node set. Every eligible node ends up in
    /// exactly one cluster; unclusterable neighbors simply leave singletons.
    pub fn compute(&mut self) -> Result<BTreeMap<ClusterId, Vec<NodeId>>, FuseError> {
        if self.honor_prebuilt {
            self.seed_prebuilt()?;
        }

        for seed in self.nodes.clone() {
            if self.clustered[seed] {
                continue;
            }
            // The iteration order guarantees we never visit the seed again.
            self.clustered.insert(seed, true);
            log::debug!("growing cluster from {}", self.graph.node(seed).name);
            self.grow(seed, true);
        }

        self.repair_cycles();

        let mut partition: BTreeMap<ClusterId, Vec<NodeId>> = BTreeMap::new();
        for &id in &self.nodes {
            let root = self.uf.find(id);
            partition.entry(root).or_default().push(id);
        }

        // Post-condition: the partition is total.
        for &id in &self.nodes {
            assert!(
                self.clustered[id],
                "node {} left unclustered after clustering",
                self.graph.node(id).name
            );
        }
        log::info!("created {} clusters", partition.len());
        Ok(partition)
    }

    /// The cluster id a node currently belongs to.
    pub fn cluster_of(&mut self, id: NodeId) -> ClusterId {
        self.uf.find(id)
    }

    // ---- growth --------------------------------------------------------

    fn grow(&mut self, seed: NodeId, allow_multi: bool) {
        let graph = self.graph;
        let multi_active = self.multi_enabled && allow_multi;
        let mut current = seed;
        let mut first = true;
        self.pending_consumers.clear();
        self.pending_owner = None;

        loop {
            let node = graph.node(current);
            let Some(primary) = node.primary_output() else {
                log::trace!("{} has no outputs, done clustering", node.name);
                return;
            };
            if graph.tensor(primary).memory.is_workspace() {
                log::trace!(
                    "{} writes workspace tensor {}, done clustering",
                    node.name,
                    graph.tensor(primary).name
                );
                return;
            }

            let is_multi = self.is_multi_consumer_or_outputs(current);
            if is_multi {
                if !multi_active {
                    log::debug!("{} is multi-consumer and relaxation is off", node.name);
                    return;
                }
                let root = self.uf.find(current);
                let book = self.books.entry(root).or_default();
                book.multi_nodes.insert(current);
                debug_assert!(
                    book.multi_nodes.len() <= self.budget,
                    "cluster exceeds its multi-consumer budget"
                );
            }

            let mut next: Option<NodeId> = None;
            let mut producer_join = false;
            let mut via_relaxation = false;

            // The relaxation also lets the seed absorb what feeds it, once.
            if first && multi_active {
                first = false;
                for input in node.inputs.iter().copied().flatten() {
                    if let Some(producer) = graph.producer(input) {
                        let relaxed =
                            is_multi || self.is_multi_consumer_or_outputs(producer);
                        if self.can_join(current, producer, relaxed) {
                            next = Some(producer);
                            producer_join = true;
                            via_relaxation = relaxed;
                            break;
                        }
                        log::trace!(
                            "cannot join {} with producer {}",
                            node.name,
                            graph.node(producer).name
                        );
                    }
                }
            }

            // A multi-consumer node tries its remaining siblings through a
            // deferred queue; the first consumer is picked up by the main
            // advance below, and growth resumes from it.
            if next.is_none() && is_multi {
                if graph.distinct_consumer_count(primary) > 1
                    && self.pending_consumers.is_empty()
                    && self.pending_owner != Some(current)
                {
                    self.pending_owner = Some(current);
                    let mut seen: HashSet<NodeId> = HashSet::default();
                    for &c in graph.consumers(primary) {
                        if seen.insert(c) {
                            self.pending_consumers.push_back(c);
                        }
                    }
                    self.pending_consumers.pop_front();
                }
            }
            if next.is_none() {
                // Sibling joins always go through the relaxation: they only
                // exist because some node's output is multi-consumed.
                while let Some(candidate) = self.pending_consumers.pop_front() {
                    if self.can_join(current, candidate, true) {
                        next = Some(candidate);
                        via_relaxation = true;
                        break;
                    }
                    log::trace!(
                        "cannot join {} with sibling consumer {}",
                        node.name,
                        graph.node(candidate).name
                    );
                }
            }

            if next.is_none() {
                let Some(&candidate) = graph.consumers(primary).first() else {
                    log::trace!("{} has no consumers, done clustering", node.name);
                    return;
                };
                let relaxed = is_multi || self.is_multi_consumer_or_outputs(candidate);
                if !self.can_join(current, candidate, relaxed) {
                    log::debug!(
                        "cannot join {} with {}, done clustering",
                        node.name,
                        graph.node(candidate).name
                    );
                    return;
                }
                next = Some(candidate);
                via_relaxation = relaxed;
            }

            let next = next.expect("join candidate");
            self.join(current, next, via_relaxation);
            self.clustered.insert(next, true);
            log::debug!(
                "cluster({}) union cluster({})",
                graph.node(current).name,
                graph.node(next).name
            );
            if !producer_join {
                current = next;
            }
        }
    }

    /// All acceptance checks for unioning `candidate` into `current`'s
    /// cluster, in rejection-cost order. `relaxed` marks a union that only
    /// exists because of the multi-consumer relaxation.
    fn can_join(&mut self, current: NodeId, candidate: NodeId, relaxed: bool) -> bool {
        if !self.uf.contains(candidate) {
            return false;
        }
        let root_cand = self.uf.find(candidate);
        if self.prebuilt_roots.contains(&root_cand) {
            log::trace!(
                "{} is part of a non-expandable pre-extracted cluster",
                self.graph.node(candidate).name
            );
            return false;
        }
        let root_curr = self.uf.find(current);

        if self.overlaps(root_curr, current, root_cand, candidate) {
            return false;
        }

        if root_curr == root_cand {
            // Already together; the caller may advance through the edge.
            return true;
        }

        if self.ctrl_configured && self.ctrl_dep_conflict(root_curr, current, root_cand, candidate)
        {
            return false;
        }

        if self.multi_enabled
            && !self.budget_allows(root_curr, current, root_cand, candidate, relaxed)
        {
            return false;
        }

        true
    }

    fn join(&mut self, current: NodeId, candidate: NodeId, relaxed: bool) {
        let root_a = self.uf.find(current);
        let root_b = self.uf.find(candidate);
        if root_a == root_b {
            return;
        }
        let new_root = self.uf.union(current, candidate);

        let book_a = self.books.remove(&root_a).unwrap_or_default();
        let book_b = self.books.remove(&root_b).unwrap_or_default();
        let mut book = ClusterBook::merge(book_a, book_b);

        commit_node_ranges(self.graph, &mut book, current);
        commit_node_ranges(self.graph, &mut book, candidate);

        if self.multi_enabled {
            if self.is_multi_consumer_or_outputs(current) {
                book.multi_nodes.insert(current);
            }
            if self.is_multi_consumer_or_outputs(candidate) {
                book.multi_nodes.insert(candidate);
            }
            if relaxed {
                book.relaxed_unions += 1;
            }
        }

        if self.ctrl_configured {
            record_ctrl(self.graph, &mut book, current);
            record_ctrl(self.graph, &mut book, candidate);
            debug_assert!(
                book.ctrl_nodes.is_disjoint(&book.blocking_blocked),
                "dependency within the fused nodes while clustering {}",
                self.graph.node(candidate).name
            );
        }

        if self.prebuilt_roots.remove(&root_a) || self.prebuilt_roots.remove(&root_b) {
            self.prebuilt_roots.insert(new_root);
        }
        self.books.insert(new_root, book);
    }

    // ---- acceptance checks ---------------------------------------------

    fn overlaps(
        &mut self,
        root_curr: NodeId,
        current: NodeId,
        root_cand: NodeId,
        candidate: NodeId,
    ) -> bool {
        let curr_view = self.view_for(root_curr, current);
        let cand_view = self.view_for(root_cand, candidate);
        if curr_view.is_empty() || cand_view.is_empty() {
            // Nothing persistent on one side, nothing to hazard on.
            return false;
        }

        let cached = self
            .books
            .get(&root_curr)
            .is_some_and(|b| b.overlap_nodes.contains(&candidate))
            || self
                .books
                .get(&root_cand)
                .is_some_and(|b| b.overlap_nodes.contains(&current));
        if cached {
            log::trace!(
                "{} known to overlap the cluster of {}",
                self.graph.node(candidate).name,
                self.graph.node(current).name
            );
            return true;
        }

        if root_curr == root_cand {
            return false;
        }

        let conflict = ranges_conflict(&curr_view.ins, &cand_view.outs)
            || ranges_conflict(&curr_view.outs, &cand_view.ins)
            || ranges_conflict(&curr_view.ins, &cand_view.ins)
            || ranges_conflict(&curr_view.outs, &cand_view.outs);
        if conflict {
            log::debug!(
                "{} overlaps persistent ranges of cluster {:?}",
                self.graph.node(candidate).name,
                root_curr
            );
            self.books
                .entry(root_curr)
                .or_default()
                .overlap_nodes
                .insert(candidate);
            return true;
        }
        false
    }

    fn view_for(&self, root: NodeId, node: NodeId) -> RangeView {
        let mut view = RangeView::default();
        if let Some(book) = self.books.get(&root) {
            view.persist.extend(book.persist.keys().copied());
            view.ins.extend(book.in_ranges.iter().copied());
            view.outs.extend(book.out_ranges.iter().copied());
        }
        for (tensor, is_input) in persistent_operands(self.graph, node) {
            if !view.persist.insert(tensor) {
                continue;
            }
            let range = tensor_range(self.graph, tensor);
            if is_input {
                view.ins.insert(range);
            } else {
                view.outs.insert(range);
            }
        }
        view
    }

    fn ctrl_dep_conflict(
        &mut self,
        root_curr: NodeId,
        current: NodeId,
        root_cand: NodeId,
        candidate: NodeId,
    ) -> bool {
        {
            let book = self.books.entry(root_curr).or_default();
            record_ctrl(self.graph, book, current);
        }
        {
            let book = self.books.entry(root_cand).or_default();
            record_ctrl(self.graph, book, candidate);
        }
        // The candidate's transitive blocked/blocking closure against the
        // cluster's recorded members-with-dependencies and their closure.
        let curr_book = &self.books[&root_curr];
        let cand_closure = &self.books[&root_cand].blocking_blocked;
        if !cand_closure.is_disjoint(&curr_book.blocking_blocked)
            || !cand_closure.is_disjoint(&curr_book.ctrl_nodes)
        {
            log::debug!(
                "control dependency between {} and the cluster of {}",
                self.graph.node(candidate).name,
                self.graph.node(current).name
            );
            return true;
        }
        false
    }

    fn budget_allows(
        &mut self,
        root_curr: NodeId,
        current: NodeId,
        root_cand: NodeId,
        candidate: NodeId,
        relaxed: bool,
    ) -> bool {
        let cand_is_multi = self.is_multi_consumer_or_outputs(candidate);
        let curr_is_multi = self.is_multi_consumer_or_outputs(current);

        let empty = ClusterBook::default();
        let book_a = self.books.get(&root_curr).unwrap_or(&empty);
        let book_b = self.books.get(&root_cand).unwrap_or(&empty);

        let mut members = book_a.multi_nodes.len() + book_b.multi_nodes.len();
        if curr_is_multi && !book_a.multi_nodes.contains(&current) {
            members += 1;
        }
        if cand_is_multi && !book_b.multi_nodes.contains(&candidate) {
            members += 1;
        }
        let charges = book_a.relaxed_unions + book_b.relaxed_unions + relaxed as usize;

        if members > self.budget || charges > self.budget {
            log::debug!(
                "multi-consumer budget reached for {} and {}, done clustering",
                self.graph.node(current).name,
                self.graph.node(candidate).name
            );
            return false;
        }
        true
    }

    fn is_multi_consumer_or_outputs(&self, id: NodeId) -> bool {
        let node = self.graph.node(id);
        if node.outputs.iter().flatten().count() > 1 {
            return true;
        }
        node.primary_output()
            .map(|t| self.graph.distinct_consumer_count(t) > 1)
            .unwrap_or(false)
    }

    // ---- pre-extracted clusters ----------------------------------------

    /// Union the ready-made node lists from the complex-operation expansion,
    /// verify them, and mark them non-expandable. A malformed list is a
    /// contract breach with the expansion step, not a data condition.
    fn seed_prebuilt(&mut self) -> Result<(), FuseError> {
        let clusters = self.graph.prebuilt_clusters().to_vec();
        if clusters.is_empty() {
            return Ok(());
        }
        log::debug!("seeding {} pre-extracted clusters", clusters.len());
        for (origin, nodes) in clusters {
            let known: Vec<NodeId> = nodes
                .iter()
                .copied()
                .filter(|&n| self.uf.contains(n))
                .collect();
            let Some(&last) = known.last() else {
                log::debug!("pre-extracted cluster {origin} has no clusterable nodes");
                continue;
            };
            for &n in &known {
                if n == last {
                    continue;
                }
                let root_last = self.uf.find(last);
                let root_n = self.uf.find(n);
                if self.overlaps(root_last, last, root_n, n) {
                    return Err(FuseError::Invariant(format!(
                        "pre-extracted cluster {origin} has overlapping persistent tensors"
                    )));
                }
                self.join(last, n, false);
                self.clustered.insert(n, true);
            }
            if !self.is_connected(&known) {
                return Err(FuseError::Invariant(format!(
                    "pre-extracted cluster {origin} is not connected"
                )));
            }
            self.clustered.insert(last, true);
            let root = self.uf.find(last);
            // Commit ranges even for a single-node list.
            let book = self.books.entry(root).or_default();
            commit_node_ranges(self.graph, book, last);
            self.prebuilt_roots.insert(root);
            log::debug!(
                "pre-extracted cluster {origin} seeded with {} nodes",
                known.len()
            );
        }
        Ok(())
    }

    fn is_connected(&self, members: &[NodeId]) -> bool {
        let set: HashSet<NodeId> = members.iter().copied().collect();
        let Some(&start) = members.first() else {
            return true;
        };
        let mut seen: HashSet<NodeId> = HashSet::default();
        let mut stack = vec![start];
        seen.insert(start);
        while let Some(id) = stack.pop() {
            let node = self.graph.node(id);
            let mut neighbors: Vec<NodeId> = Vec::new();
            for t in node.inputs.iter().copied().flatten() {
                neighbors.extend(self.graph.producer(t));
            }
            for t in node.outputs.iter().copied().flatten() {
                neighbors.extend_from_slice(self.graph.consumers(t));
            }
            for n in neighbors {
                if set.contains(&n) && seen.insert(n) {
                    stack.push(n);
                }
            }
        }
        seen.len() == set.len()
    }

    // ---- cycle repair --------------------------------------------------

    /// A cycle closed around a multi-consumer node only becomes visible once
    /// a consumer-side join loops back through a sibling branch, so it is
    /// found here by collapsing each relaxed cluster and probing, after the
    /// first full partition. Offending clusters are dissolved and their
    /// members re-clustered with the relaxation off.
    fn repair_cycles(&mut self) {
        let mut members_by_root: HashMap<NodeId, Vec<NodeId>> = HashMap::default();
        for &id in &self.nodes {
            let root = self.uf.find(id);
            members_by_root.entry(root).or_default().push(id);
        }

        let mut dissolved: Vec<NodeId> = Vec::new();
        for (root, members) in members_by_root {
            if members.len() < 2 || self.prebuilt_roots.contains(&root) {
                continue;
            }
            let used_relaxation = self
                .books
                .get(&root)
                .is_some_and(|b| !b.multi_nodes.is_empty());
            if !used_relaxation {
                continue;
            }
            log::trace!("searching for cycles in cluster {root:?}");
            let set: HashSet<NodeId> = members.iter().copied().collect();
            if self.graph.creates_cycle_when_fused(&set) {
                log::debug!("cluster {root:?} would cycle, dissolving");
                for &m in &members {
                    self.uf.insert(m);
                    self.clustered.insert(m, false);
                }
                self.books.remove(&root);
                dissolved.extend(members);
            }
        }
        if dissolved.is_empty() {
            return;
        }

        let dissolved_set: HashSet<NodeId> = dissolved.into_iter().collect();
        for seed in self.nodes.clone() {
            if !dissolved_set.contains(&seed) || self.clustered[seed] {
                continue;
            }
            self.clustered.insert(seed, true);
            log::debug!(
                "re-clustering {} without multi-consumer relaxation",
                self.graph.node(seed).name
            );
            self.grow(seed, false);
        }
    }
}

// ---- free helpers ------------------------------------------------------

fn tensor_range(graph: &Graph, tensor: TensorId) -> SecRange {
    let t = graph.tensor(tensor);
    let (section, offset) = match t.memory {
        crate::graph::MemoryClass::Persistent { section, offset } => (section, offset),
        _ => unreachable!("range of a non-persistent tensor"),
    };
    SecRange {
        section,
        start: offset,
        end: offset + t.byte_size(),
    }
}

/// Persistent operands of a node, with their input/output role.
fn persistent_operands(
    graph: &Graph,
    node: NodeId,
) -> impl Iterator<Item = (TensorId, bool)> + '_ {
    let n = graph.node(node);
    let ins = n
        .inputs
        .iter()
        .copied()
        .flatten()
        .map(|t| (t, true))
        .collect::<Vec<_>>();
    let outs = n
        .outputs
        .iter()
        .copied()
        .flatten()
        .map(|t| (t, false))
        .collect::<Vec<_>>();
    ins.into_iter()
        .chain(outs)
        .filter(move |&(t, _)| graph.tensor(t).memory.is_persistent())
}

fn commit_node_ranges(graph: &Graph, book: &mut ClusterBook, node: NodeId) {
    for (tensor, is_input) in persistent_operands(graph, node) {
        if book.persist.contains_key(&tensor) {
            continue;
        }
        book.persist.insert(tensor, is_input);
        let range = tensor_range(graph, tensor);
        if is_input {
            book.in_ranges.insert(range);
        } else {
            book.out_ranges.insert(range);
        }
    }
}

fn record_ctrl(graph: &Graph, book: &mut ClusterBook, node: NodeId) {
    if !graph.has_control_deps(node) {
        return;
    }
    if book.ctrl_nodes.insert(node) {
        book.blocking_blocked.extend(graph.blocked_nodes(node));
        book.blocking_blocked.extend(graph.blocking_nodes(node));
    }
}
