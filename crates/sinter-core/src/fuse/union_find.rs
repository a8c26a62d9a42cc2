//! Union-find over node ids.
//!
//! Kept separate from the graph arena on purpose: the partition is keyed by
//! the same stable ids but has its own lifetime, so graph edits and cluster
//! bookkeeping never invalidate each other.

use crate::graph::NodeId;
use slotmap::SecondaryMap;

#[derive(Default)]
pub struct UnionFind {
    parent: SecondaryMap<NodeId, NodeId>,
    rank: SecondaryMap<NodeId, u32>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` as its own singleton set. Re-inserting an id resets it to a
    /// singleton; cycle repair relies on this to dissolve a cluster.
    pub fn insert(&mut self, id: NodeId) {
        self.parent.insert(id, id);
        self.rank.insert(id, 0);
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.parent.contains_key(id)
    }

    /// The set representative; this is the cluster id.
    pub fn find(&mut self, id: NodeId) -> NodeId {
        let mut root = id;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Path halving.
        let mut cur = id;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Union the sets of `a` and `b`, returning the surviving representative.
    pub fn union(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }
        let (winner, loser) = if self.rank[ra] >= self.rank[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[loser] = winner;
        if self.rank[ra] == self.rank[rb] {
            self.rank[winner] += 1;
        }
        winner
    }
}
