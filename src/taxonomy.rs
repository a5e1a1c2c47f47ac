//src/taxonomy.rs

use ahash::AHashMap;

use crate::error::{CurateError, Result};

/// Index of a node inside a [`TaxonomyTree`] arena.
pub type NodeId = usize;

/// Total order over rank names, coarse to fine.
/// Depth comparison is index comparison in this order.
#[derive(Debug, Clone)]
pub struct RankOrder {
    ranks: Vec<String>,
    index: AHashMap<String, usize>,
}

impl RankOrder {
    pub fn new<I, S>(ranks: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ranks: Vec<String> = ranks.into_iter().map(Into::into).collect();
        let mut index = AHashMap::with_capacity(ranks.len());
        for (i, rank) in ranks.iter().enumerate() {
            if index.insert(rank.clone(), i).is_some() {
                return Err(CurateError::Taxonomy(format!("duplicate rank '{rank}'")));
            }
        }
        Ok(Self { ranks, index })
    }

    pub fn ranks(&self) -> &[String] {
        &self.ranks
    }

    pub fn contains(&self, rank: &str) -> bool {
        self.index.contains_key(rank)
    }

    /// Position of `rank` in the order, `None` if unknown.
    pub fn depth(&self, rank: &str) -> Option<usize> {
        self.index.get(rank).copied()
    }

    /// Like [`depth`](Self::depth) but an unknown rank is a configuration error.
    pub fn require(&self, rank: &str) -> Result<usize> {
        self.depth(rank).ok_or_else(|| {
            CurateError::Configuration(format!(
                "unknown rank '{rank}' (known ranks: {})",
                self.ranks.join(", ")
            ))
        })
    }

    /// `true` if `rank` is strictly finer than `than`. Unknown ranks are never deeper.
    pub fn is_deeper(&self, rank: &str, than: &str) -> bool {
        match (self.depth(rank), self.depth(than)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }
}

/// One taxon. Parent and children are arena indices, never references.
#[derive(Debug, Clone)]
pub struct TaxonomyNode {
    pub tax_id: String,
    pub rank: String,
    pub name: String,
    /// Sequence ids attached directly to this node.
    pub sequence_ids: Vec<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl TaxonomyNode {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in declaration order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Arena-backed taxonomy keyed by tax id. Built once, then read-only.
#[derive(Debug, Clone)]
pub struct TaxonomyTree {
    ranks: RankOrder,
    nodes: Vec<TaxonomyNode>,
    by_tax_id: AHashMap<String, NodeId>,
}

impl TaxonomyTree {
    /// Creates a tree holding only its root.
    pub fn new(ranks: RankOrder, root_tax_id: &str, root_rank: &str, root_name: &str) -> Result<Self> {
        if !ranks.contains(root_rank) {
            return Err(CurateError::Taxonomy(format!(
                "root {root_tax_id} has unknown rank '{root_rank}'"
            )));
        }
        let root = TaxonomyNode {
            tax_id: root_tax_id.to_string(),
            rank: root_rank.to_string(),
            name: root_name.to_string(),
            sequence_ids: Vec::new(),
            parent: None,
            children: Vec::new(),
        };
        let mut by_tax_id = AHashMap::new();
        by_tax_id.insert(root.tax_id.clone(), 0);
        Ok(Self {
            ranks,
            nodes: vec![root],
            by_tax_id,
        })
    }

    /// Appends a child under `parent`. The child's rank must be strictly
    /// deeper than its parent's and its tax id must be new.
    pub fn add_child(&mut self, parent: NodeId, tax_id: &str, rank: &str, name: &str) -> Result<NodeId> {
        if self.by_tax_id.contains_key(tax_id) {
            return Err(CurateError::Taxonomy(format!("duplicate tax_id {tax_id}")));
        }
        let parent_rank = &self
            .nodes
            .get(parent)
            .ok_or_else(|| CurateError::Taxonomy(format!("no parent node for {tax_id}")))?
            .rank;
        if !self.ranks.contains(rank) {
            return Err(CurateError::Taxonomy(format!(
                "tax_id {tax_id} has unknown rank '{rank}'"
            )));
        }
        if !self.ranks.is_deeper(rank, parent_rank) {
            return Err(CurateError::Taxonomy(format!(
                "tax_id {tax_id} ({rank}) is not below its parent's rank ({parent_rank})"
            )));
        }

        let id = self.nodes.len();
        self.nodes.push(TaxonomyNode {
            tax_id: tax_id.to_string(),
            rank: rank.to_string(),
            name: name.to_string(),
            sequence_ids: Vec::new(),
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        self.by_tax_id.insert(tax_id.to_string(), id);
        Ok(id)
    }

    /// Attaches a sequence id directly to the node for `tax_id`.
    pub fn add_sequence(&mut self, tax_id: &str, seqname: &str) -> Result<()> {
        let id = self
            .get(tax_id)
            .ok_or_else(|| CurateError::Taxonomy(format!("sequence {seqname} references unknown tax_id {tax_id}")))?;
        self.nodes[id].sequence_ids.push(seqname.to_string());
        Ok(())
    }

    pub fn ranks(&self) -> &RankOrder {
        &self.ranks
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &TaxonomyNode {
        &self.nodes[id]
    }

    pub fn get(&self, tax_id: &str) -> Option<NodeId> {
        self.by_tax_id.get(tax_id).copied()
    }

    /// Pre-order walk of the subtree rooted at `start`, children in
    /// declaration order.
    pub fn descendants(&self, start: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter().rev().copied());
        }
        order
    }

    /// Pre-order walk of the whole tree.
    pub fn iter(&self) -> impl Iterator<Item = &TaxonomyNode> + '_ {
        self.descendants(self.root()).into_iter().map(move |id| &self.nodes[id])
    }

    /// All sequence ids in the subtree of `start`, in pre-order.
    pub fn subtree_sequence_ids(&self, start: NodeId) -> Vec<&str> {
        self.descendants(start)
            .into_iter()
            .flat_map(|id| self.nodes[id].sequence_ids.iter().map(String::as_str))
            .collect()
    }

    /// Number of sequences in the subtree of every node under `start`
    /// (inclusive). Nodes outside that subtree are absent.
    pub fn subtree_sequence_counts(&self, start: NodeId) -> AHashMap<NodeId, usize> {
        let order = self.descendants(start);
        let mut counts: AHashMap<NodeId, usize> =
            order.iter().map(|&id| (id, self.nodes[id].sequence_ids.len())).collect();
        // Reverse pre-order visits every child before its parent
        for &id in order.iter().rev().filter(|&&id| id != start) {
            if let Some(parent) = self.nodes[id].parent {
                let n = counts[&id];
                *counts.entry(parent).or_insert(0) += n;
            }
        }
        counts
    }

    pub fn total_sequences(&self) -> usize {
        self.nodes.iter().map(|n| n.sequence_ids.len()).sum()
    }

    /// Nodes at exactly `rank`, in pre-order.
    pub fn nodes_at_rank(&self, rank: &str) -> Vec<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .filter(|&id| self.nodes[id].rank == rank)
            .collect()
    }

    /// Sequence ids attached to nodes whose rank is strictly coarser than `rank`.
    pub fn sequences_above_rank(&self, rank: &str) -> Result<Vec<&str>> {
        let limit = self.ranks.require(rank)?;
        Ok(self
            .iter()
            .filter(|n| self.ranks.depth(&n.rank).is_some_and(|d| d < limit))
            .flat_map(|n| n.sequence_ids.iter().map(String::as_str))
            .collect())
    }
}
