//src/error.rs

use thiserror::Error;

/// Every failure the curation pipelines can surface.
#[derive(Error, Debug)]
pub enum CurateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Invalid rank names, unknown policies, out-of-range numbers.
    /// Always detected before any job is dispatched.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Malformed taxonomy or seqinfo input.
    #[error("Invalid taxonomy: {0}")]
    Taxonomy(String),

    /// An alignment, distance or clustering collaborator failed or
    /// produced incomplete output.
    #[error("External tool error: {0}")]
    ExternalTool(String),

    /// A logic defect: an invariant of the aggregated results was violated.
    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("Filtering failed for {tax_id} ({tax_name}): {source}")]
    TaxonFailed {
        tax_id: String,
        tax_name: String,
        #[source]
        source: Box<CurateError>,
    },

    #[error("Filter job for {tax_id} ({tax_name}) panicked")]
    JobPanicked { tax_id: String, tax_name: String },
}

impl CurateError {
    /// Wrap `self` with the taxon it was raised for.
    pub fn for_taxon(self, tax_id: &str, tax_name: &str) -> Self {
        CurateError::TaxonFailed {
            tax_id: tax_id.to_string(),
            tax_name: tax_name.to_string(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping `TaxonFailed` context.
    pub fn root_cause(&self) -> &CurateError {
        match self {
            CurateError::TaxonFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, CurateError>;
