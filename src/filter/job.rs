//src/filter/job.rs

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use ahash::AHashSet;

use crate::distance::AlignAndDistance;
use crate::error::{CurateError, Result};
use crate::fasta::{write_fasta, SequenceSource};
use crate::outliers::detect_outliers;
use crate::types::{FilterOutcome, SequenceRecord};

/// Medoid filtering of the sequences under one filter-rank taxon.
#[derive(Debug, Clone)]
pub struct FilterJob {
    pub tax_id: String,
    pub tax_name: String,
    pub seqnames: Vec<String>,
}

/// What a finished job hands back to the control thread.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub outcomes: Vec<FilterOutcome>,
    pub n_kept: usize,
    pub n_pruned: usize,
}

impl FilterJob {
    /// Fetches the sequences, aligns them, computes distances and flags
    /// every sequence farther than `cutoff` from the medoid.
    ///
    /// When the alignment collaborator fails and `postmortem_dir` is set,
    /// the input sequences are written there before the error is returned.
    pub fn run(
        &self,
        source: &dyn SequenceSource,
        aligner: &dyn AlignAndDistance,
        cutoff: f64,
        postmortem_dir: Option<&Path>,
    ) -> Result<JobOutput> {
        let sequences = source.fetch(&self.seqnames)?;

        let (names, distances) = aligner
            .align_and_distance(&sequences)
            .and_then(|(names, distances)| {
                if names.len() != sequences.len() || distances.len() != names.len() {
                    return Err(CurateError::ExternalTool(format!(
                        "{} returned {} names and a {}x{} matrix for {} sequences",
                        aligner.name(),
                        names.len(),
                        distances.len(),
                        distances.len(),
                        sequences.len()
                    )));
                }
                Ok((names, distances))
            })
            .inspect_err(|e| {
                if let (CurateError::ExternalTool(_), Some(dir)) = (e, postmortem_dir) {
                    self.preserve_input(&sequences, dir);
                }
            })?;

        let submitted: AHashSet<&str> = self.seqnames.iter().map(String::as_str).collect();
        let mut returned = AHashSet::with_capacity(names.len());
        for name in &names {
            if !submitted.contains(name.as_str()) || !returned.insert(name.as_str()) {
                return Err(CurateError::DataIntegrity(format!(
                    "{} returned sequence {name}, which was not submitted once for {}",
                    aligner.name(),
                    self.tax_id
                )));
            }
        }

        let result = detect_outliers(&distances, cutoff)?;
        let centroid = &names[result.medoid];
        let outcomes: Vec<FilterOutcome> = names
            .iter()
            .zip(result.distances.iter().zip(&result.is_outlier))
            .map(|(name, (&distance, &is_outlier))| FilterOutcome {
                seqname: name.clone(),
                centroid: Some(centroid.clone()),
                distance: Some(distance),
                is_outlier,
                filter_tax_id: Some(self.tax_id.clone()),
            })
            .collect();

        let n_pruned = result.n_outliers();
        Ok(JobOutput {
            n_kept: outcomes.len() - n_pruned,
            n_pruned,
            outcomes,
        })
    }

    fn postmortem_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}_failed.fasta", self.tax_id))
    }

    /// Best effort: a failure here must not hide the original error.
    fn preserve_input(&self, sequences: &[SequenceRecord], dir: &Path) {
        let path = self.postmortem_path(dir);
        let written = fs::create_dir_all(dir)
            .map_err(CurateError::from)
            .and_then(|_| File::create(&path).map_err(CurateError::from))
            .and_then(|f| write_fasta(BufWriter::new(f), sequences));
        match written {
            Ok(_) => log::error!("Input for {} preserved in {}", self.tax_id, path.display()),
            Err(e) => log::warn!("Could not preserve input for {}: {}", self.tax_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::PrealignedPDistance;
    use crate::fasta::InMemorySource;
    use crate::outliers::DistanceMatrix;

    fn source() -> InMemorySource {
        InMemorySource::new(vec![
            SequenceRecord::new("a", "AAAAAAAAAA"),
            SequenceRecord::new("b", "AAAAAAAAAA"),
            SequenceRecord::new("c", "AAAAAAAAAT"),
            SequenceRecord::new("d", "TTTTTAAAAA"),
        ])
    }

    fn job() -> FilterJob {
        FilterJob {
            tax_id: "42".into(),
            tax_name: "Foo bar".into(),
            seqnames: vec!["a".into(), "b".into(), "c".into(), "d".into()],
        }
    }

    #[test]
    fn flags_sequences_beyond_cutoff() {
        let out = job().run(&source(), &PrealignedPDistance, 0.15, None).unwrap();
        assert_eq!(out.n_kept, 3);
        assert_eq!(out.n_pruned, 1);
        let d = out.outcomes.iter().find(|o| o.seqname == "d").unwrap();
        assert!(d.is_outlier);
        assert_eq!(d.centroid.as_deref(), Some("a"));
        assert_eq!(d.filter_tax_id.as_deref(), Some("42"));
        assert!((d.distance.unwrap() - 0.5).abs() < 1e-12);
    }

    struct BrokenAligner;

    impl AlignAndDistance for BrokenAligner {
        fn align_and_distance(&self, _sequences: &[SequenceRecord]) -> Result<(Vec<String>, DistanceMatrix)> {
            Err(CurateError::ExternalTool("not all pairwise comparisons are represented".into()))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[test]
    fn failed_alignment_preserves_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = job().run(&source(), &BrokenAligner, 0.1, Some(dir.path())).unwrap_err();
        assert!(matches!(err, CurateError::ExternalTool(_)));

        let kept = crate::fasta::read_fasta_records(dir.path().join("42_failed.fasta")).unwrap();
        assert_eq!(kept.len(), 4);
    }

    /// Drops the last sequence from its answer.
    struct ShortAligner;

    impl AlignAndDistance for ShortAligner {
        fn align_and_distance(&self, sequences: &[SequenceRecord]) -> Result<(Vec<String>, DistanceMatrix)> {
            let n = sequences.len() - 1;
            Ok((sequences[..n].iter().map(|s| s.id.clone()).collect(), DistanceMatrix::zeros(n)))
        }

        fn name(&self) -> &str {
            "short"
        }
    }

    #[test]
    fn count_mismatch_is_external_tool_error() {
        let err = job().run(&source(), &ShortAligner, 0.1, None).unwrap_err();
        assert!(matches!(err, CurateError::ExternalTool(ref m) if m.contains("short")));
    }

    #[test]
    fn missing_sequence_in_source_is_data_integrity_error() {
        let mut j = job();
        j.seqnames.push("zz".into());
        let err = j.run(&source(), &PrealignedPDistance, 0.1, None).unwrap_err();
        assert!(matches!(err, CurateError::DataIntegrity(_)));
    }
}
