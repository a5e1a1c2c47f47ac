// src/lib.rs
pub mod cluster_merge;
pub mod config;
pub mod dereplicate;
pub mod distance;
pub mod error;
pub mod fasta;
pub mod filter;
pub mod outliers;
pub mod select;
pub mod taxdb;
pub mod taxonomy;
pub mod types;

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;

pub use crate::cluster_merge::{merge_clusters, MergeSummary};
pub use crate::config::{Config, DereplicateConfig, FilterConfig, RareTaxonAction, SelectConfig};
pub use crate::dereplicate::{dereplicate, ClusterCommand, ClusteringEngine, DereplicationResults};
pub use crate::distance::{AlignAndDistance, AllPairsCommand, PrealignedPDistance};
pub use crate::error::{CurateError, Result};
pub use crate::fasta::{InMemorySource, IndexedFasta, SequenceSource};
pub use crate::filter::{FilterOutcomes, OutlierFilterScheduler, ProgressSink, TaxonReporter};
pub use crate::select::{select_references, SelectionResults};
pub use crate::taxdb::SeqInfo;
pub use crate::taxonomy::TaxonomyTree;

use crate::fasta::write_fasta;
use crate::filter::RayonJobPool;
use crate::taxdb::read_taxtable;

/// Outcome of outlier filtering together with the seqinfo it was run on.
/// Text outputs are generated on demand.
pub struct FilterResults {
    pub outcomes: FilterOutcomes,
    pub seq_info: SeqInfo,
    pub filter_rank: String,
}

impl FilterResults {
    pub fn kept_ids(&self) -> BTreeSet<&str> {
        self.outcomes.kept_ids()
    }

    /// Seqinfo rows of the kept sequences, original columns and order.
    pub fn get_filtered_seqinfo(&self) -> Result<String> {
        let mut out = Vec::new();
        self.seq_info
            .write_filtered(&mut out, |name| self.outcomes.get(name).is_some_and(|o| !o.is_outlier))?;
        into_text(out)
    }

    /// Every seqinfo row with `centroid,dist,is_out,<filter_rank>_id` appended.
    pub fn get_detailed_seqinfo(&self) -> Result<String> {
        let mut out = Vec::new();
        self.seq_info.write_detailed(&mut out, &self.outcomes, &self.filter_rank)?;
        into_text(out)
    }

    /// Writes the kept sequences in seqinfo order and returns how many.
    pub fn write_kept_fasta<W: Write>(&self, source: &dyn SequenceSource, writer: W) -> Result<usize> {
        let kept = self.kept_ids();
        let ids: Vec<String> = self
            .seq_info
            .records()
            .iter()
            .map(|r| self.seq_info.seqname(r))
            .filter(|name| kept.contains(name))
            .map(str::to_string)
            .collect();
        let records = source.fetch(&ids)?;
        write_fasta(writer, &records)
    }
}

fn into_text(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| CurateError::DataIntegrity(e.to_string()))
}

/// Loads a taxtable and attaches the sequences listed in a seqinfo file.
pub fn load_taxonomy<P: AsRef<Path>, Q: AsRef<Path>>(taxtable: P, seqinfo: Q) -> Result<(TaxonomyTree, SeqInfo)> {
    let mut tree = read_taxtable(taxtable)?;
    let seq_info = SeqInfo::from_path(seqinfo)?;
    seq_info.populate(&mut tree)?;
    Ok((tree, seq_info))
}

/// Indexed access for plain FASTA; gzip input is read into memory.
pub fn open_sequence_source<P: AsRef<Path>>(path: P) -> Result<Arc<dyn SequenceSource>> {
    let path = path.as_ref();
    if path.extension().is_some_and(|ext| ext == "gz") {
        let source = InMemorySource::from_path(path)?;
        log::info!("Loaded {} sequences from {}", source.len(), path.display());
        Ok(Arc::new(source))
    } else {
        Ok(Arc::new(IndexedFasta::open(path)?))
    }
}

/// Filters an already loaded taxonomy on a rayon pool of `config.threads`.
pub fn filter_taxonomy(
    tree: &TaxonomyTree,
    seq_info: SeqInfo,
    source: Arc<dyn SequenceSource>,
    aligner: Arc<dyn AlignAndDistance>,
    config: &FilterConfig,
    progress: &dyn ProgressSink,
    reporter: &mut dyn TaxonReporter,
) -> Result<FilterResults> {
    config.validate(tree.ranks())?;
    let pool = RayonJobPool::new(config.threads)?;
    let scheduler = OutlierFilterScheduler::new(config.clone(), source, aligner);
    let outcomes = scheduler.run(tree, pool, progress, reporter)?;

    Ok(FilterResults {
        outcomes,
        seq_info,
        filter_rank: config.filter_rank.clone(),
    })
}

/// Unified entry point: taxtable, seqinfo and sequence file in, filtering
/// results out.
pub fn filter_outliers<P: AsRef<Path>>(
    taxtable: P,
    seqinfo: P,
    sequences: P,
    aligner: Arc<dyn AlignAndDistance>,
    config: &FilterConfig,
    progress: &dyn ProgressSink,
    reporter: &mut dyn TaxonReporter,
) -> Result<FilterResults> {
    // 1. Taxonomy with sequences attached
    let (tree, seq_info) = load_taxonomy(taxtable, seqinfo)?;

    // 2. Sequence access shared by the workers
    let source = open_sequence_source(sequences)?;

    // 3. Filter
    filter_taxonomy(&tree, seq_info, source, aligner, config, progress, reporter)
}

/// Loads a taxonomy and selects reference sequences for its index-rank nodes.
pub fn select_references_from_paths<P: AsRef<Path>>(
    taxtable: P,
    seqinfo: P,
    config: &SelectConfig,
) -> Result<SelectionResults> {
    let (tree, _) = load_taxonomy(taxtable, seqinfo)?;
    select_references(&tree, config)
}

/// Merges clusters sharing a best-hit tax id in the SQLite store at `path`.
pub fn merge_cluster_database<P: AsRef<Path>>(path: P) -> Result<MergeSummary> {
    let mut conn = Connection::open(path)?;
    merge_clusters(&mut conn)
}
