//src/types.rs

/// A minimal representation of a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub id: String,
    /// Everything after the id on the header line (may be empty).
    pub description: String,
    pub residues: String,
}

impl SequenceRecord {
    pub fn new(id: impl Into<String>, residues: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            residues: residues.into(),
        }
    }
}

/// The fate of one sequence submitted for outlier filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub seqname: String,
    /// Medoid of the taxon the sequence was filtered with; `None` when no
    /// distance-based filtering took place (rare taxa, above filter rank).
    pub centroid: Option<String>,
    /// Distance to `centroid`.
    pub distance: Option<f64>,
    pub is_outlier: bool,
    /// Tax id of the filter-rank node this sequence was resolved under.
    pub filter_tax_id: Option<String>,
}

impl FilterOutcome {
    /// An outcome decided by policy rather than by distance.
    pub fn unfiltered(seqname: impl Into<String>, keep: bool, filter_tax_id: Option<&str>) -> Self {
        Self {
            seqname: seqname.into(),
            centroid: None,
            distance: None,
            is_outlier: !keep,
            filter_tax_id: filter_tax_id.map(str::to_string),
        }
    }
}

/// One row of the per-taxon log: `tax_id,tax_name,n,kept,pruned`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonReport {
    pub tax_id: String,
    pub tax_name: String,
    pub n_total: usize,
    pub n_kept: usize,
    pub n_pruned: usize,
}
