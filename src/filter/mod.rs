pub mod job;
pub mod pool;
pub mod progress;
pub mod scheduler;

use std::collections::BTreeSet;

use ahash::AHashMap;

use crate::error::{CurateError, Result};
use crate::taxonomy::TaxonomyTree;
use crate::types::FilterOutcome;

pub use job::{FilterJob, JobOutput};
pub use pool::{Job, JobPool, RayonJobPool};
pub use progress::{CsvTaxonLog, IndicatifProgress, NoProgress, NoReport, ProgressSink, TaxonReporter};
pub use scheduler::OutlierFilterScheduler;

/// Global accumulator of filtering outcomes, keyed by sequence name.
/// Only the scheduler's control thread mutates it.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcomes {
    outcomes: AHashMap<String, FilterOutcome>,
}

impl FilterOutcomes {
    /// Adds a batch. Per-taxon batches are disjoint, so a sequence seen
    /// twice means two batches claimed it.
    pub fn merge<I: IntoIterator<Item = FilterOutcome>>(&mut self, batch: I) -> Result<()> {
        for outcome in batch {
            if let Some(previous) = self.outcomes.insert(outcome.seqname.clone(), outcome) {
                return Err(CurateError::DataIntegrity(format!(
                    "sequence {} received more than one filtering outcome",
                    previous.seqname
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, seqname: &str) -> Option<&FilterOutcome> {
        self.outcomes.get(seqname)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterOutcome> + '_ {
        self.outcomes.values()
    }

    pub fn kept_ids(&self) -> BTreeSet<&str> {
        self.iter().filter(|o| !o.is_outlier).map(|o| o.seqname.as_str()).collect()
    }

    pub fn pruned_ids(&self) -> BTreeSet<&str> {
        self.iter().filter(|o| o.is_outlier).map(|o| o.seqname.as_str()).collect()
    }

    /// Every sequence attached to the taxonomy must have exactly one outcome
    /// and no outcome may name a sequence the taxonomy does not hold.
    pub fn verify_complete(&self, tree: &TaxonomyTree) -> Result<()> {
        let ids = tree.subtree_sequence_ids(tree.root());
        if let Some(missing) = ids.iter().find(|id| !self.outcomes.contains_key(**id)) {
            return Err(CurateError::DataIntegrity(format!(
                "sequence {missing} is missing from the filtering outcome"
            )));
        }
        if ids.len() != self.outcomes.len() {
            return Err(CurateError::DataIntegrity(format!(
                "{} outcomes for {} input sequences",
                self.outcomes.len(),
                ids.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::RankOrder;

    #[test]
    fn merge_rejects_duplicates() {
        let mut acc = FilterOutcomes::default();
        acc.merge(vec![FilterOutcome::unfiltered("a", true, None)]).unwrap();
        let err = acc.merge(vec![FilterOutcome::unfiltered("a", false, None)]).unwrap_err();
        assert!(matches!(err, CurateError::DataIntegrity(_)));
    }

    #[test]
    fn verify_complete_detects_gaps() {
        let ranks = RankOrder::new(["root", "species"]).unwrap();
        let mut tree = TaxonomyTree::new(ranks, "1", "root", "root").unwrap();
        tree.add_child(tree.root(), "2", "species", "sp").unwrap();
        tree.add_sequence("2", "a").unwrap();
        tree.add_sequence("2", "b").unwrap();

        let mut acc = FilterOutcomes::default();
        acc.merge(vec![FilterOutcome::unfiltered("a", true, Some("2"))]).unwrap();
        assert!(acc.verify_complete(&tree).is_err());

        acc.merge(vec![FilterOutcome::unfiltered("b", false, Some("2"))]).unwrap();
        acc.verify_complete(&tree).unwrap();
        assert_eq!(acc.kept_ids().into_iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(acc.pruned_ids().into_iter().collect::<Vec<_>>(), vec!["b"]);

        acc.merge(vec![FilterOutcome::unfiltered("stray", true, None)]).unwrap();
        assert!(acc.verify_complete(&tree).is_err());
    }
}
