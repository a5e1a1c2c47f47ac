//src/select.rs

use ahash::AHashSet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::SelectConfig;
use crate::error::Result;
use crate::taxonomy::{NodeId, TaxonomyTree};

/// Marker of synthetic ranks such as `below_genus`.
const PLACEHOLDER_RANK_MARKER: &str = "below";

enum Visit {
    Enter(NodeId),
    /// Children of the node have been handled; `usize` is the output length
    /// before they were visited.
    Exit(NodeId, usize),
}

/// Finds nodes to draw sequences from, preferring `target_rank` nodes and
/// falling back to the deepest ancestor with sequences when no descendant
/// qualifies.
///
/// Per node, depth-first:
///  1) at `target_rank` with sequences in the subtree: select it, stop;
///  2) otherwise visit the children in order, and if they selected anything
///     that is the result for this subtree;
///  3) otherwise select the node itself if its subtree has sequences, its
///     rank is not a placeholder, and it is strictly deeper than `index_rank`.
///
/// The selected subtrees are disjoint.
pub fn find_nodes(tree: &TaxonomyTree, start: NodeId, index_rank: &str, target_rank: &str) -> Result<Vec<NodeId>> {
    let ranks = tree.ranks();
    ranks.require(index_rank)?;
    ranks.require(target_rank)?;

    // Only the start subtree is walked
    let counts = tree.subtree_sequence_counts(start);
    let mut selected = Vec::new();
    let mut stack = vec![Visit::Enter(start)];

    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(id) => {
                let node = tree.node(id);
                if node.rank == target_rank && counts[&id] > 0 {
                    selected.push(id);
                    continue;
                }
                stack.push(Visit::Exit(id, selected.len()));
                stack.extend(node.children().iter().rev().map(|&c| Visit::Enter(c)));
            }
            Visit::Exit(id, before) => {
                if selected.len() > before {
                    continue;
                }
                let node = tree.node(id);
                if counts[&id] > 0
                    && !node.rank.contains(PLACEHOLDER_RANK_MARKER)
                    && ranks.is_deeper(&node.rank, index_rank)
                {
                    selected.push(id);
                }
            }
        }
    }

    Ok(selected)
}

/// All sequence ids under `node`, or a uniform sample of `per_taxon` of them
/// drawn without replacement from `rng`.
pub fn sample_sequence_ids<R: Rng + ?Sized>(
    tree: &TaxonomyTree,
    node: NodeId,
    per_taxon: usize,
    rng: &mut R,
) -> Vec<String> {
    let ids = tree.subtree_sequence_ids(node);
    if ids.len() <= per_taxon {
        return ids.into_iter().map(str::to_string).collect();
    }
    ids.choose_multiple(rng, per_taxon).map(|s| s.to_string()).collect()
}

/// Selected nodes under `start`, sampled down to `config.per_taxon` each.
pub fn choose_sequence_ids<R: Rng + ?Sized>(
    tree: &TaxonomyTree,
    start: NodeId,
    config: &SelectConfig,
    rng: &mut R,
) -> Result<Vec<String>> {
    let nodes = find_nodes(tree, start, &config.index_rank, &config.target_rank)?;
    Ok(nodes
        .into_iter()
        .flat_map(|node| sample_sequence_ids(tree, node, config.per_taxon, &mut *rng))
        .collect())
}

/// Sequences chosen for one index-rank node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSelection {
    pub tax_id: String,
    pub tax_name: String,
    pub sequence_ids: Vec<String>,
}

/// Reference selections for every index-rank node.
#[derive(Debug, Clone, Default)]
pub struct SelectionResults {
    pub selections: Vec<IndexSelection>,
    /// Sequence ids not chosen for any index node, in tree order.
    pub unused_ids: Vec<String>,
}

impl SelectionResults {
    /// Renders `tax_id,tax_id.refpkg` lines, one per selection.
    pub fn get_index_csv(&self) -> String {
        self.selections
            .iter()
            .map(|s| format!("{0},{0}.refpkg\n", s.tax_id))
            .collect()
    }

    pub fn total_selected(&self) -> usize {
        self.selections.iter().map(|s| s.sequence_ids.len()).sum()
    }
}

/// Chooses reference sequences for each node at `config.index_rank`.
/// One generator seeded from `config.seed` is shared across nodes in tree
/// order, so results are reproducible for a given seed and taxonomy.
pub fn select_references(tree: &TaxonomyTree, config: &SelectConfig) -> Result<SelectionResults> {
    config.validate(tree.ranks())?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let nodes = tree.nodes_at_rank(&config.index_rank);
    let mut results = SelectionResults::default();

    for (i, &id) in nodes.iter().enumerate() {
        let node = tree.node(id);
        if let Some(only) = &config.only {
            if !only.contains(&node.tax_id) {
                log::info!("Skipping {}", node.tax_id);
                continue;
            }
        }

        log::info!("{}: {} ({}/{})", node.tax_id, node.name, i + 1, nodes.len());
        let ids = choose_sequence_ids(tree, id, config, &mut rng)?;
        // No reference tree can be built from fewer than two sequences
        if ids.len() < 2 {
            log::warn!("Skipping {}: {} sequence(s)", node.tax_id, ids.len());
            continue;
        }
        results.selections.push(IndexSelection {
            tax_id: node.tax_id.clone(),
            tax_name: node.name.clone(),
            sequence_ids: ids,
        });
    }

    let used: AHashSet<&str> = results
        .selections
        .iter()
        .flat_map(|s| s.sequence_ids.iter().map(String::as_str))
        .collect();
    results.unused_ids = tree
        .subtree_sequence_ids(tree.root())
        .into_iter()
        .filter(|id| !used.contains(id))
        .map(str::to_string)
        .collect();

    log::info!(
        "{} sequences selected for {} index nodes, {} unused",
        results.total_selected(),
        results.selections.len(),
        results.unused_ids.len()
    );
    Ok(results)
}
