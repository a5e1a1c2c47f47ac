//src/distance.rs

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::Command;

use ahash::AHashMap;

use crate::error::{CurateError, Result};
use crate::fasta::write_fasta;
use crate::outliers::DistanceMatrix;
use crate::types::SequenceRecord;

/// Multiple alignment followed by pairwise distance computation.
///
/// Implementations must return every input sequence exactly once in the name
/// list, with the matrix indexed in that order, and fail with
/// [`CurateError::ExternalTool`] when the underlying tool's output is
/// incomplete.
pub trait AlignAndDistance: Send + Sync {
    fn align_and_distance(&self, sequences: &[SequenceRecord]) -> Result<(Vec<String>, DistanceMatrix)>;

    fn name(&self) -> &str;
}

/// Reads `-blast6out` style all-pairs output into a square distance matrix.
/// `seqnames` fixes the marginal order of the matrix.
///
/// Columns: query, target, pct_id, align_len, mismatches, gaps, qstart, qend,
/// tstart, tend, evalue, bit_score. Distance is `1 - pct_id / 100`. When a
/// pair was aligned more than once the longest alignment is used.
pub fn parse_blast6_allpairs<R: BufRead>(reader: R, seqnames: &[String]) -> Result<DistanceMatrix> {
    let index: AHashMap<&str, usize> = seqnames.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();

    // (i, j) with i < j -> (align_len, distance)
    let mut best: BTreeMap<(usize, usize), (u64, f64)> = BTreeMap::new();
    let mut seen = vec![false; seqnames.len()];

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            return Err(CurateError::ExternalTool(format!(
                "malformed blast6 line {}: expected 12 columns, found {}",
                lineno + 1,
                fields.len()
            )));
        }

        let lookup = |name: &str| {
            index
                .get(name)
                .copied()
                .ok_or_else(|| CurateError::ExternalTool(format!("unexpected sequence '{name}' in all-pairs output")))
        };
        let q = lookup(fields[0])?;
        let t = lookup(fields[1])?;
        let pct_id: f64 = fields[2]
            .trim()
            .parse()
            .map_err(|_| CurateError::ExternalTool(format!("bad pct_id on line {}", lineno + 1)))?;
        if !(0.0..=100.0).contains(&pct_id) {
            return Err(CurateError::ExternalTool(format!(
                "pct_id {} out of range on line {}",
                fields[2].trim(),
                lineno + 1
            )));
        }
        let align_len: u64 = fields[3]
            .trim()
            .parse()
            .map_err(|_| CurateError::ExternalTool(format!("bad align_len on line {}", lineno + 1)))?;

        seen[q] = true;
        seen[t] = true;
        if q == t {
            continue;
        }

        let key = (q.min(t), q.max(t));
        let dist = 1.0 - pct_id / 100.0;
        match best.get(&key) {
            // first occurrence wins ties
            Some(&(len, _)) if len >= align_len => {}
            _ => {
                best.insert(key, (align_len, dist));
            }
        }
    }

    if let Some(i) = seen.iter().position(|&s| !s) {
        if seqnames.len() > 1 {
            return Err(CurateError::ExternalTool(format!(
                "some sequences are missing from the output (first: {})",
                seqnames[i]
            )));
        }
    }

    let n = seqnames.len();
    let expected = n * n.saturating_sub(1) / 2;
    if best.len() != expected {
        return Err(CurateError::ExternalTool(format!(
            "not all pairwise comparisons are represented ({} of {expected})",
            best.len()
        )));
    }

    let mut values = vec![0.0; n * n];
    for ((i, j), (_, d)) in best {
        values[i * n + j] = d;
        values[j * n + i] = d;
    }
    DistanceMatrix::new(n, values)
}

/// Runs an external all-pairs global aligner that writes blast6 output.
///
/// `args` is a template: `{input}` is replaced by a temporary FASTA of the
/// sequences and `{output}` by the path the tool must write to.
#[derive(Debug, Clone)]
pub struct AllPairsCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl AllPairsCommand {
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `usearch -allpairs_global {input} -blast6out {output} -id 0.0 -quiet`
    pub fn usearch<P: Into<PathBuf>>(program: P) -> Self {
        let args = ["-allpairs_global", "{input}", "-blast6out", "{output}", "-id", "0.0", "-quiet"];
        Self::new(program, args.iter().map(|s| s.to_string()).collect())
    }
}

impl AlignAndDistance for AllPairsCommand {
    fn align_and_distance(&self, sequences: &[SequenceRecord]) -> Result<(Vec<String>, DistanceMatrix)> {
        let names: Vec<String> = sequences.iter().map(|s| s.id.clone()).collect();
        if names.len() < 2 {
            return Ok((names.clone(), DistanceMatrix::zeros(names.len())));
        }

        let input = tempfile::Builder::new().suffix(".fasta").tempfile()?;
        write_fasta(input.as_file(), sequences)?;
        let output = tempfile::Builder::new().suffix(".blast6out").tempfile()?;

        let input_path = input.path().to_string_lossy().into_owned();
        let output_path = output.path().to_string_lossy().into_owned();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{input}", &input_path).replace("{output}", &output_path))
            .collect();

        log::debug!("{} {}", self.program.display(), args.join(" "));
        let status = Command::new(&self.program).args(&args).status().map_err(|e| {
            CurateError::ExternalTool(format!("failed to start {}: {e}", self.program.display()))
        })?;
        if !status.success() {
            return Err(CurateError::ExternalTool(format!(
                "{} exited with {status}",
                self.program.display()
            )));
        }

        let matrix = parse_blast6_allpairs(BufReader::new(File::open(output.path())?), &names)?;
        Ok((names, matrix))
    }

    fn name(&self) -> &str {
        self.program.file_name().and_then(|s| s.to_str()).unwrap_or("all-pairs")
    }
}

/// Uncorrected p-distance over sequences that are already aligned.
/// Columns where either sequence has a gap (`-` or `.`) are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrealignedPDistance;

fn is_gap(b: u8) -> bool {
    b == b'-' || b == b'.'
}

impl AlignAndDistance for PrealignedPDistance {
    fn align_and_distance(&self, sequences: &[SequenceRecord]) -> Result<(Vec<String>, DistanceMatrix)> {
        let names: Vec<String> = sequences.iter().map(|s| s.id.clone()).collect();
        let width = sequences.first().map(|s| s.residues.len()).unwrap_or(0);
        if let Some(s) = sequences.iter().find(|s| s.residues.len() != width) {
            return Err(CurateError::ExternalTool(format!(
                "sequence {} is not aligned ({} columns, expected {width})",
                s.id,
                s.residues.len()
            )));
        }

        let mut matrix = DistanceMatrix::zeros(sequences.len());
        for i in 0..sequences.len() {
            let a = sequences[i].residues.as_bytes();
            for j in (i + 1)..sequences.len() {
                let b = sequences[j].residues.as_bytes();
                let (mut compared, mut differ) = (0usize, 0usize);
                for (&x, &y) in a.iter().zip(b) {
                    if is_gap(x) || is_gap(y) {
                        continue;
                    }
                    compared += 1;
                    if !x.eq_ignore_ascii_case(&y) {
                        differ += 1;
                    }
                }
                let d = if compared == 0 { 1.0 } else { differ as f64 / compared as f64 };
                matrix.set(i, j, d);
            }
        }
        Ok((names, matrix))
    }

    fn name(&self) -> &str {
        "p-distance"
    }
}
