//! Arena representation of a phylogenetic tree.
//!
//! Nodes live in a `Vec` and refer to each other by [`NodeId`]. Every node
//! except the root owns the edge that leads to it from its parent, so
//! "the edge of node `n`" and "the split subtended by `n`" mean the same
//! thing throughout the crate.
//!
//! ```text
//!           root            (root edge: split = all taxa)
//!          /    \
//!      node1     D          node1 edge: {A,B,C}
//!      /   \
//!     A   node2             node2 edge: {B,C}
//!         /   \
//!        B     C
//! ```

use crate::bitset::Bitset;
use crate::error::{Result, SumTreesError};

pub type NodeId = usize;

/// How a tree's root is to be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rooting {
    Rooted,
    Unrooted,
    /// No rooting statement; treated as unrooted.
    Unknown,
}

impl Rooting {
    pub fn is_rooted(self) -> bool {
        self == Rooting::Rooted
    }
}

/// Policy applied by readers to a tree's own rooting statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RootingInterpretation {
    ForceRooted,
    ForceUnrooted,
    #[default]
    DefaultUnrooted,
    DefaultRooted,
}

impl RootingInterpretation {
    /// Resolves the rooting of a tree given its (optional) `[&R]`/`[&U]` statement.
    pub fn apply(self, statement: Option<Rooting>) -> Rooting {
        match self {
            RootingInterpretation::ForceRooted => Rooting::Rooted,
            RootingInterpretation::ForceUnrooted => Rooting::Unrooted,
            RootingInterpretation::DefaultUnrooted => statement.unwrap_or(Rooting::Unknown),
            RootingInterpretation::DefaultRooted => statement.unwrap_or(Rooting::Rooted),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RootingInterpretation::ForceRooted => "force-rooted",
            RootingInterpretation::ForceUnrooted => "force-unrooted",
            RootingInterpretation::DefaultUnrooted => "default-unrooted",
            RootingInterpretation::DefaultRooted => "default-rooted",
        }
    }
}

/// Data attached to the edge leading into a node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Edge {
    pub length: Option<f64>,
    /// Unnormalized split computed by [`encode_splits`](crate::splits::encode_splits).
    pub split: Option<Bitset>,
    /// Proportion of counted trees containing this edge's split.
    pub support: Option<f64>,
    pub summarized_length: Option<f64>,
    /// Rendered as `[&key=value,...]` metadata by the writers.
    pub annotations: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Bit index in the taxon namespace (leaves only, normally).
    pub taxon: Option<usize>,
    pub label: Option<String>,
    pub edge: Edge,
    /// Distance to the leaves, set by [`Tree::calc_node_ages`].
    pub age: Option<f64>,
    pub summarized_age: Option<f64>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
    pub rooting: Rooting,
    /// Intrinsic tree weight (e.g. from a `[&W 1/2]` comment).
    pub weight: Option<f64>,
    pub label: Option<String>,
    /// Tree-level metadata such as topology counts.
    pub annotations: Vec<(String, String)>,
}

impl Tree {
    /// A tree consisting of a single root node.
    pub fn new(rooting: Rooting) -> Self {
        Tree {
            nodes: vec![Node::default()],
            root: 0,
            rooting,
            weight: None,
            label: None,
            annotations: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_rooted(&self) -> bool {
        self.rooting.is_rooted()
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id].is_leaf()
    }

    /// Appends `node` as the last child of `parent`.
    pub fn add_child(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        let id = self.nodes.len();
        node.parent = Some(parent);
        self.nodes.push(node);
        self.nodes[parent].children.push(id);
        id
    }

    /// Appends a leaf for taxon `taxon` under `parent`.
    pub fn add_leaf(&mut self, parent: NodeId, taxon: usize, length: Option<f64>) -> NodeId {
        self.add_child(
            parent,
            Node {
                taxon: Some(taxon),
                edge: Edge {
                    length,
                    ..Edge::default()
                },
                ..Node::default()
            },
        )
    }

    /// Detaches `child` from its current parent and attaches it to `new_parent`.
    pub fn reparent(&mut self, child: NodeId, new_parent: NodeId) {
        if let Some(old) = self.nodes[child].parent {
            self.nodes[old].children.retain(|&c| c != child);
        }
        self.nodes[child].parent = Some(new_parent);
        self.nodes[new_parent].children.push(child);
    }

    /// Node ids with every node preceding its parent (children before parents).
    pub fn postorder(&self) -> Vec<NodeId> {
        let mut order = self.preorder();
        order.reverse();
        order
    }

    /// Node ids with every node preceding its children, root first.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            // reversed so the first child is visited first
            stack.extend(self.nodes[id].children.iter().rev());
        }
        order
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        self.preorder()
            .into_iter()
            .filter(|&id| self.nodes[id].is_leaf())
            .collect()
    }

    /// Non-root, non-leaf nodes in preorder.
    pub fn internal_nodes(&self) -> Vec<NodeId> {
        self.preorder()
            .into_iter()
            .filter(|&id| id != self.root && !self.nodes[id].is_leaf())
            .collect()
    }

    /// True once every edge carries a split.
    pub fn is_encoded(&self) -> bool {
        self.nodes.iter().all(|n| n.edge.split.is_some())
    }

    /// Drops every edge length.
    pub fn clear_edge_lengths(&mut self) {
        for node in &mut self.nodes {
            node.edge.length = None;
        }
    }

    /// Computes node ages as distance from the tips, assuming an ultrametric tree.
    ///
    /// Leaves have age 0. An internal node's age is taken from its first
    /// child; every other child must agree within `precision`.
    ///
    /// # Errors
    /// `NotUltrametric` if children disagree, `MissingEdgeLength` if a
    /// non-root edge has no length.
    pub fn calc_node_ages(&mut self, precision: f64) -> Result<()> {
        for id in self.postorder() {
            if self.nodes[id].is_leaf() {
                self.nodes[id].age = Some(0.0);
                continue;
            }
            let mut age: Option<f64> = None;
            for &child in &self.nodes[id].children {
                let child_node = &self.nodes[child];
                let length = child_node
                    .edge
                    .length
                    .ok_or(SumTreesError::MissingEdgeLength { node: child })?;
                let candidate = child_node.age.unwrap_or(0.0) + length;
                match age {
                    None => age = Some(candidate),
                    Some(first) if (first - candidate).abs() > precision => {
                        return Err(SumTreesError::NotUltrametric {
                            node: id,
                            first,
                            second: candidate,
                            precision,
                        });
                    }
                    Some(_) => {}
                }
            }
            self.nodes[id].age = age;
        }
        Ok(())
    }

    /// Reroots the tree at the midpoint of its longest leaf-to-leaf path.
    ///
    /// Missing edge lengths count as 0. An edge crossed by the midpoint is
    /// split in two, and nodes left with a single child (such as the old
    /// root of an unrooted bifurcation) are spliced out with their lengths
    /// summed. The result is rooted; splits and ages are cleared and must be
    /// recomputed. A tree whose leaves are all at distance 0 is left as is.
    pub fn reroot_at_midpoint(&mut self) {
        let Some(&start) = self.leaves().first() else {
            return;
        };
        let (from, _) = self.farthest_leaf(start);
        let (to, diameter) = self.farthest_leaf(from);
        if diameter <= MIDPOINT_EPSILON {
            return;
        }
        let half = diameter / 2.0;
        let path = self.path(from, to);
        let mut walked = 0.0;
        let mut new_root = to;
        for pair in path.windows(2) {
            let (near, far) = (pair[0], pair[1]);
            let owner = if self.nodes[near].parent == Some(far) { near } else { far };
            let length = self.nodes[owner].edge.length.unwrap_or(0.0);
            if walked + length < half - MIDPOINT_EPSILON {
                walked += length;
                continue;
            }
            let offset = half - walked;
            new_root = if offset <= MIDPOINT_EPSILON {
                near
            } else if length - offset <= MIDPOINT_EPSILON {
                far
            } else {
                // distance from the owning (lower) end to the new node
                let below = if owner == near { offset } else { length - offset };
                self.split_edge(owner, below)
            };
            break;
        }
        self.rebuild_from(new_root);
    }

    /// Leaf farthest from `start` and its distance, walking edges in both
    /// directions.
    fn farthest_leaf(&self, start: NodeId) -> (NodeId, f64) {
        let mut best = (start, 0.0);
        let mut stack = vec![(start, None, 0.0)];
        while let Some((id, from, distance)) = stack.pop() {
            if self.nodes[id].is_leaf() && distance > best.1 {
                best = (id, distance);
            }
            for next in self.neighbours(id) {
                if Some(next) != from {
                    stack.push((next, Some(id), distance + self.edge_between(id, next).length.unwrap_or(0.0)));
                }
            }
        }
        best
    }

    /// Node ids on the path from `a` to `b`, both included.
    fn path(&self, a: NodeId, b: NodeId) -> Vec<NodeId> {
        let ancestors = |mut id: NodeId| {
            let mut line = vec![id];
            while let Some(parent) = self.nodes[id].parent {
                line.push(parent);
                id = parent;
            }
            line
        };
        let up = ancestors(a);
        let mut down = ancestors(b);
        let Some(lca_in_up) = up.iter().position(|id| down.contains(id)) else {
            return Vec::new();
        };
        let lca = up[lca_in_up];
        let lca_in_down = down.iter().position(|&id| id == lca).unwrap_or(down.len());
        down.truncate(lca_in_down);
        down.reverse();
        up[..=lca_in_up].iter().copied().chain(down).collect()
    }

    fn neighbours(&self, id: NodeId) -> Vec<NodeId> {
        let node = &self.nodes[id];
        node.children.iter().copied().chain(node.parent).collect()
    }

    /// The edge joining two adjacent nodes, stored on the lower one.
    fn edge_between(&self, a: NodeId, b: NodeId) -> &Edge {
        if self.nodes[b].parent == Some(a) { &self.nodes[b].edge } else { &self.nodes[a].edge }
    }

    /// Inserts a node on `owner`'s edge, `below` above `owner`, and returns it.
    fn split_edge(&mut self, owner: NodeId, below: f64) -> NodeId {
        let Some(parent) = self.nodes[owner].parent else {
            return owner;
        };
        let length = self.nodes[owner].edge.length.unwrap_or(0.0);
        let id = self.nodes.len();
        let mut edge = self.nodes[owner].edge.clone();
        edge.length = Some(length - below);
        self.nodes.push(Node {
            parent: Some(parent),
            children: vec![owner],
            edge,
            ..Node::default()
        });
        if let Some(slot) = self.nodes[parent].children.iter_mut().find(|c| **c == owner) {
            *slot = id;
        }
        self.nodes[owner].parent = Some(id);
        self.nodes[owner].edge.length = Some(below);
        id
    }

    /// Replaces the arena with the same unrooted graph hanging from
    /// `new_root`.
    fn rebuild_from(&mut self, new_root: NodeId) {
        let mut nodes = vec![Node {
            taxon: self.nodes[new_root].taxon,
            label: self.nodes[new_root].label.clone(),
            ..Node::default()
        }];
        let mut stack = vec![(new_root, None, 0)];
        while let Some((old, from, new)) = stack.pop() {
            for next in self.neighbours(old) {
                if Some(next) == from {
                    continue;
                }
                let (mut prev, mut current) = (old, next);
                let mut edge = self.edge_between(prev, current).clone();
                loop {
                    let onward: Vec<NodeId> =
                        self.neighbours(current).into_iter().filter(|&n| n != prev).collect();
                    if onward.len() != 1 || self.nodes[current].taxon.is_some() {
                        break;
                    }
                    let mut merged = self.edge_between(current, onward[0]).clone();
                    merged.length = match (edge.length, merged.length) {
                        (None, None) => None,
                        (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
                    };
                    edge = merged;
                    prev = current;
                    current = onward[0];
                }
                edge.split = None;
                let id = nodes.len();
                nodes.push(Node {
                    parent: Some(new),
                    taxon: self.nodes[current].taxon,
                    label: self.nodes[current].label.clone(),
                    edge,
                    ..Node::default()
                });
                nodes[new].children.push(id);
                stack.push((current, Some(prev), id));
            }
        }
        self.nodes = nodes;
        self.root = 0;
        self.rooting = Rooting::Rooted;
    }
}

const MIDPOINT_EPSILON: f64 = 1e-12;
