//src/config.rs

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CurateError, Result};
use crate::taxonomy::RankOrder;

/// What to do with a taxon that has too few sequences for distance filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RareTaxonAction {
    #[default]
    Keep,
    Drop,
}

impl FromStr for RareTaxonAction {
    type Err = CurateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(RareTaxonAction::Keep),
            "drop" => Ok(RareTaxonAction::Drop),
            other => Err(CurateError::Configuration(format!(
                "unknown rare taxon action '{other}' (expected keep or drop)"
            ))),
        }
    }
}

impl fmt::Display for RareTaxonAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RareTaxonAction::Keep => write!(f, "keep"),
            RareTaxonAction::Drop => write!(f, "drop"),
        }
    }
}

fn default_threads() -> usize {
    num_cpus::get()
}

/// Settings for per-taxon medoid outlier filtering.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub filter_rank: String,
    /// Maximum distance from the taxon medoid before a sequence is pruned.
    pub distance_cutoff: f64,
    /// Number of taxa filtered concurrently.
    pub threads: usize,
    pub min_seqs_for_filtering: usize,
    pub rare_taxon_action: RareTaxonAction,
    /// How often the control loop wakes to refresh progress.
    pub poll_interval_ms: u64,
    /// Where the input of a failed alignment is copied for inspection.
    pub postmortem_dir: Option<PathBuf>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            filter_rank: "species".to_string(),
            distance_cutoff: 0.015,
            threads: default_threads(),
            min_seqs_for_filtering: 5,
            rare_taxon_action: RareTaxonAction::Keep,
            poll_interval_ms: 1000,
            postmortem_dir: None,
        }
    }
}

impl FilterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self, ranks: &RankOrder) -> Result<()> {
        ranks.require(&self.filter_rank)?;
        if !self.distance_cutoff.is_finite() || self.distance_cutoff < 0.0 {
            return Err(CurateError::Configuration(format!(
                "distance cutoff must be a non-negative number, got {}",
                self.distance_cutoff
            )));
        }
        if self.threads == 0 {
            return Err(CurateError::Configuration("threads must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(CurateError::Configuration("poll interval must be positive".into()));
        }
        Ok(())
    }
}

/// Settings for choosing reference sequences per index-rank node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectConfig {
    pub index_rank: String,
    pub target_rank: String,
    pub per_taxon: usize,
    pub seed: u64,
    /// Restrict selection to these index-rank tax ids.
    pub only: Option<BTreeSet<String>>,
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            index_rank: "order".to_string(),
            target_rank: "species".to_string(),
            per_taxon: 5,
            seed: 1,
            only: None,
        }
    }
}

impl SelectConfig {
    pub fn validate(&self, ranks: &RankOrder) -> Result<()> {
        ranks.require(&self.index_rank)?;
        ranks.require(&self.target_rank)?;
        if self.per_taxon == 0 {
            return Err(CurateError::Configuration("per_taxon must be at least 1".into()));
        }
        Ok(())
    }
}

/// Settings for clustering-based dereplication of named sequences.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DereplicateConfig {
    /// Seqinfo column whose values define the groups.
    pub group_on: String,
    /// Clustering identity in [0, 1].
    pub identity: f64,
    pub threads: usize,
}

impl Default for DereplicateConfig {
    fn default() -> Self {
        Self {
            group_on: "species".to_string(),
            identity: 1.0,
            threads: default_threads(),
        }
    }
}

impl DereplicateConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.identity) {
            return Err(CurateError::Configuration(format!(
                "identity must be between 0 and 1, got {}",
                self.identity
            )));
        }
        if self.threads == 0 {
            return Err(CurateError::Configuration("threads must be at least 1".into()));
        }
        Ok(())
    }
}

/// Top-level configuration file, every section optional.
///
/// ```toml
/// [filter]
/// filter_rank = "species"
/// distance_cutoff = 0.015
/// rare_taxon_action = "drop"
///
/// [select]
/// index_rank = "order"
/// seed = 42
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub filter: FilterConfig,
    pub select: SelectConfig,
    pub dereplicate: DereplicateConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| CurateError::Configuration(e.to_string()))
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
