//src/dereplicate.rs

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::Command;

use ahash::{AHashMap, AHashSet};
use csv::{StringRecord, WriterBuilder};
use rayon::prelude::*;

use crate::config::DereplicateConfig;
use crate::error::{CurateError, Result};
use crate::fasta::{write_fasta, SequenceSource};
use crate::taxdb::SeqInfo;
use crate::types::SequenceRecord;

/// One sequence's cluster assignment: `seed` names the cluster
/// representative, which is its own seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub seqname: String,
    pub seed: String,
}

/// Greedy clustering at a fixed identity threshold.
pub trait ClusteringEngine: Send + Sync {
    /// Assigns every input sequence to exactly one cluster.
    fn cluster(&self, sequences: &[SequenceRecord], identity: f64) -> Result<Vec<ClusterMember>>;
}

/// Reads usearch/uclust `.uc` output.
///
/// Columns: type, cluster, size, pct_id, strand, -, -, cigar, query,
/// target. `S` rows open a cluster with the query as seed, `H` rows assign
/// the query to the target seed, `C` summary rows are skipped. A query with
/// no hit (`N`) seeds its own cluster.
pub fn parse_uc<R: BufRead>(reader: R) -> Result<Vec<ClusterMember>> {
    let mut members = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 10 {
            return Err(CurateError::ExternalTool(format!(
                "malformed uc line {}: expected 10 columns, found {}",
                lineno + 1,
                fields.len()
            )));
        }
        let query = fields[8].trim();
        let seed = match fields[0] {
            "S" | "N" => query,
            "H" => fields[9].trim(),
            "C" => continue,
            other => {
                return Err(CurateError::ExternalTool(format!(
                    "unknown uc record type '{other}' on line {}",
                    lineno + 1
                )))
            }
        };
        members.push(ClusterMember {
            seqname: query.to_string(),
            seed: seed.to_string(),
        });
    }
    Ok(members)
}

/// Runs an external greedy clusterer that writes `.uc` output.
///
/// `args` is a template: `{input}` is replaced by a temporary FASTA of the
/// group in priority order, `{output}` by the `.uc` path to write and
/// `{identity}` by the clustering identity.
#[derive(Debug, Clone)]
pub struct ClusterCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ClusterCommand {
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `usearch -cluster_smallmem {input} -usersort -id {identity} -uc {output} -quiet`
    pub fn usearch<P: Into<PathBuf>>(program: P) -> Self {
        let args = [
            "-cluster_smallmem",
            "{input}",
            "-usersort",
            "-id",
            "{identity}",
            "-uc",
            "{output}",
            "-quiet",
        ];
        Self::new(program, args.iter().map(|s| s.to_string()).collect())
    }
}

impl ClusteringEngine for ClusterCommand {
    fn cluster(&self, sequences: &[SequenceRecord], identity: f64) -> Result<Vec<ClusterMember>> {
        let input = tempfile::Builder::new().suffix(".fasta").tempfile()?;
        write_fasta(input.as_file(), sequences)?;
        let output = tempfile::Builder::new().suffix(".uc").tempfile()?;

        let input_path = input.path().to_string_lossy().into_owned();
        let output_path = output.path().to_string_lossy().into_owned();
        let identity = identity.to_string();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace("{input}", &input_path)
                    .replace("{output}", &output_path)
                    .replace("{identity}", &identity)
            })
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

        parse_uc(BufReader::new(File::open(output.path())?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Seed,
    Hit,
}

impl MemberKind {
    pub fn code(&self) -> &'static str {
        match self {
            MemberKind::Seed => "S",
            MemberKind::Hit => "H",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DereplicatedRow {
    pub kind: MemberKind,
    pub seqname: String,
    pub seed: String,
    pub group: String,
}

#[derive(Debug, Clone, Default)]
pub struct DereplicationResults {
    pub rows: Vec<DereplicatedRow>,
}

impl DereplicationResults {
    /// Unique seed names, in row order.
    pub fn seeds(&self) -> Vec<&str> {
        let mut seen = AHashSet::new();
        self.rows
            .iter()
            .filter(|r| seen.insert(r.seed.as_str()))
            .map(|r| r.seed.as_str())
            .collect()
    }

    /// Generate `type,seqname,seed,group` CSV text on demand
    pub fn get_seq_info_out(&self) -> Result<String> {
        let mut wtr = WriterBuilder::new().from_writer(Vec::new());
        wtr.write_record(["type", "seqname", "seed", "group"])?;
        for row in &self.rows {
            wtr.write_record([row.kind.code(), row.seqname.as_str(), row.seed.as_str(), row.group.as_str()])?;
        }
        let bytes = wtr.into_inner().map_err(|e| CurateError::Io(e.into_error()))?;
        String::from_utf8(bytes).map_err(|e| CurateError::DataIntegrity(e.to_string()))
    }

    /// Writes one record per seed, in [`seeds`](Self::seeds) order, and
    /// returns how many.
    pub fn write_seed_fasta<W: Write>(&self, source: &dyn SequenceSource, writer: W) -> Result<usize> {
        let seeds: Vec<String> = self.seeds().into_iter().map(str::to_string).collect();
        let records = source.fetch(&seeds)?;
        write_fasta(writer, &records)
    }
}

/// Group labels to keep, whitespace separated.
pub fn parse_include_labels(text: &str) -> AHashSet<String> {
    text.split_whitespace().map(str::to_string).collect()
}

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "t" | "1" | "yes" | "type")
}

/// Column positions used to order a group before clustering.
struct SortColumns {
    is_type: Option<usize>,
    ambig_count: Option<usize>,
    length: Option<usize>,
}

impl SortColumns {
    /// Type strains first, then fewest ambiguous bases, then longest.
    fn key(&self, record: &StringRecord) -> (bool, usize, std::cmp::Reverse<usize>) {
        let field = |col: Option<usize>| col.and_then(|c| record.get(c)).unwrap_or("");
        let number = |col: Option<usize>| field(col).trim().parse::<usize>().unwrap_or(0);
        (
            !truthy(field(self.is_type)),
            number(self.ambig_count),
            std::cmp::Reverse(number(self.length)),
        )
    }
}

fn cluster_group(
    group: &str,
    seqnames: Vec<String>,
    source: &dyn SequenceSource,
    engine: &dyn ClusteringEngine,
    identity: f64,
) -> Result<Vec<DereplicatedRow>> {
    // Don't cluster groups represented by only one sequence
    if seqnames.len() == 1 {
        let name = seqnames.into_iter().next().unwrap_or_default();
        return Ok(vec![DereplicatedRow {
            kind: MemberKind::Seed,
            seqname: name.clone(),
            seed: name,
            group: group.to_string(),
        }]);
    }

    let sequences = source.fetch(&seqnames)?;
    let members = engine.cluster(&sequences, identity)?;

    let mut expected: AHashSet<&str> = seqnames.iter().map(String::as_str).collect();
    for m in &members {
        if !expected.remove(m.seqname.as_str()) {
            return Err(CurateError::ExternalTool(format!(
                "clustering of group {group} returned unexpected or repeated sequence {}",
                m.seqname
            )));
        }
    }
    if let Some(missing) = expected.into_iter().next() {
        return Err(CurateError::ExternalTool(format!(
            "clustering of group {group} is missing sequence {missing}"
        )));
    }

    Ok(members
        .into_iter()
        .map(|m| DereplicatedRow {
            kind: if m.seqname == m.seed { MemberKind::Seed } else { MemberKind::Hit },
            seqname: m.seqname,
            seed: m.seed,
            group: group.to_string(),
        })
        .collect())
}

/// Clusters sequences within each `group_on` group and reports every
/// sequence with its cluster seed. Groups are clustered in parallel; the
/// output keeps the order in which groups first appear in `seq_info`.
pub fn dereplicate(
    seq_info: &SeqInfo,
    source: &dyn SequenceSource,
    engine: &dyn ClusteringEngine,
    config: &DereplicateConfig,
    include: Option<&AHashSet<String>>,
) -> Result<DereplicationResults> {
    config.validate()?;
    let group_col = seq_info.column(&config.group_on).ok_or_else(|| {
        CurateError::Configuration(format!("seqinfo has no '{}' column to group on", config.group_on))
    })?;
    let sort = SortColumns {
        is_type: seq_info.column("is_type"),
        ambig_count: seq_info.column("ambig_count"),
        length: seq_info.column("length"),
    };

    // group label -> records, first-appearance order
    let mut order: Vec<(&str, Vec<&StringRecord>)> = Vec::new();
    let mut index: AHashMap<&str, usize> = AHashMap::new();
    for record in seq_info.records() {
        let key = record.get(group_col).unwrap_or("").trim();
        if include.is_some_and(|inc| !inc.contains(key)) {
            continue;
        }
        let slot = *index.entry(key).or_insert_with(|| {
            order.push((key, Vec::new()));
            order.len() - 1
        });
        order[slot].1.push(record);
    }

    let groups: Vec<(&str, Vec<String>)> = order
        .into_iter()
        .map(|(key, mut records)| {
            records.sort_by_key(|r| sort.key(r));
            (key, records.into_iter().map(|r| seq_info.seqname(r).to_string()).collect())
        })
        .collect();
    log::info!("Dereplicating {} groups on '{}'", groups.len(), config.group_on);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build()
        .map_err(|e| CurateError::Configuration(e.to_string()))?;

    let per_group: Vec<Vec<DereplicatedRow>> = pool.install(|| {
        groups
            .into_par_iter()
            .map(|(key, names)| cluster_group(key, names, source, engine, config.identity))
            .collect::<Result<Vec<_>>>()
    })?;

    Ok(DereplicationResults {
        rows: per_group.into_iter().flatten().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fasta::InMemorySource;
    use parking_lot::Mutex;

    /// Clusters identical residues together; the first sequence seen with a
    /// given residue string is the seed.
    struct ExactEngine {
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ClusteringEngine for ExactEngine {
        fn cluster(&self, sequences: &[SequenceRecord], _identity: f64) -> Result<Vec<ClusterMember>> {
            self.calls.lock().push(sequences.iter().map(|s| s.id.clone()).collect());
            let mut seeds: AHashMap<&str, &str> = AHashMap::new();
            Ok(sequences
                .iter()
                .map(|s| {
                    let seed = *seeds.entry(s.residues.as_str()).or_insert(s.id.as_str());
                    ClusterMember {
                        seqname: s.id.clone(),
                        seed: seed.to_string(),
                    }
                })
                .collect())
        }
    }

    const SEQINFO: &str = "\
seqname,tax_id,species,is_type,ambig_count,length
a,10,sp1,,0,100
b,10,sp1,type,0,90
c,10,sp1,,2,120
d,11,sp2,,0,100
e,12,sp3,,0,100
f,12,sp3,,0,100
";

    fn source() -> InMemorySource {
        InMemorySource::new(vec![
            SequenceRecord::new("a", "ACGT"),
            SequenceRecord::new("b", "ACGT"),
            SequenceRecord::new("c", "TTTT"),
            SequenceRecord::new("d", "GGGG"),
            SequenceRecord::new("e", "CCCC"),
            SequenceRecord::new("f", "CCCA"),
        ])
    }

    #[test]
    fn groups_are_sorted_and_singletons_skip_the_engine() {
        let info = SeqInfo::from_reader(SEQINFO.as_bytes()).unwrap();
        let engine = ExactEngine {
            calls: Mutex::new(Vec::new()),
        };
        let config = DereplicateConfig {
            threads: 2,
            ..DereplicateConfig::default()
        };
        let results = dereplicate(&info, &source(), &engine, &config, None).unwrap();

        let groups: Vec<&str> = results.rows.iter().map(|r| r.group.as_str()).collect();
        assert_eq!(groups, vec!["sp1", "sp1", "sp1", "sp2", "sp3", "sp3"]);
        // type strain b leads sp1 and seeds the identical a
        assert_eq!(results.rows[0].seqname, "b");
        assert_eq!(results.rows[1].seqname, "a");
        assert_eq!(results.rows[1].seed, "b");
        assert_eq!(results.rows[1].kind, MemberKind::Hit);
        assert_eq!(results.seeds(), vec!["b", "c", "d", "e", "f"]);

        let calls = engine.calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.len() > 1));

        let csv = results.get_seq_info_out().unwrap();
        assert!(csv.starts_with("type,seqname,seed,group\nS,b,b,sp1\nH,a,b,sp1\n"));
    }

    #[test]
    fn include_limits_groups() {
        let info = SeqInfo::from_reader(SEQINFO.as_bytes()).unwrap();
        let engine = ExactEngine {
            calls: Mutex::new(Vec::new()),
        };
        let include: AHashSet<String> = ["sp2".to_string()].into_iter().collect();
        let results = dereplicate(&info, &source(), &engine, &DereplicateConfig::default(), Some(&include)).unwrap();
        assert_eq!(results.rows.len(), 1);
        assert_eq!(results.rows[0].seqname, "d");
    }

    struct ForgetfulEngine;

    impl ClusteringEngine for ForgetfulEngine {
        fn cluster(&self, sequences: &[SequenceRecord], _identity: f64) -> Result<Vec<ClusterMember>> {
            Ok(sequences
                .iter()
                .skip(1)
                .map(|s| ClusterMember {
                    seqname: s.id.clone(),
                    seed: s.id.clone(),
                })
                .collect())
        }
    }

    #[test]
    fn incomplete_clustering_is_an_external_tool_error() {
        let info = SeqInfo::from_reader(SEQINFO.as_bytes()).unwrap();
        let err = dereplicate(&info, &source(), &ForgetfulEngine, &DereplicateConfig::default(), None).unwrap_err();
        assert!(matches!(err, CurateError::ExternalTool(_)));
    }

    #[test]
    fn uc_rows_map_to_seeds() {
        let uc = "\
S\t0\t4\t*\t+\t0\t0\t*\tb\t*
H\t0\t4\t100.0\t+\t0\t0\t4M\ta\tb
S\t1\t4\t*\t+\t0\t0\t*\tc\t*
N\t*\t4\t*\t*\t*\t*\t*\td\t*
C\t0\t2\t*\t*\t*\t*\t*\tb\t*
C\t1\t1\t*\t*\t*\t*\t*\tc\t*
";
        let members = parse_uc(uc.as_bytes()).unwrap();
        let pairs: Vec<(&str, &str)> = members.iter().map(|m| (m.seqname.as_str(), m.seed.as_str())).collect();
        assert_eq!(pairs, vec![("b", "b"), ("a", "b"), ("c", "c"), ("d", "d")]);

        assert!(matches!(parse_uc("S\t0\t4\n".as_bytes()), Err(CurateError::ExternalTool(_))));
        let bad_type = "X\t0\t4\t*\t+\t0\t0\t*\tb\t*\n";
        assert!(matches!(parse_uc(bad_type.as_bytes()), Err(CurateError::ExternalTool(_))));
    }

    /// First record seeds one cluster that every later record joins. Exits
    /// non-zero unless called with identity 0.97.
    const ONE_CLUSTER: &str = r#"test "$3" = 0.97 || exit 3
awk 'BEGIN { OFS = "\t" }
/^>/ {
    id = substr($1, 2)
    if (seed == "") { seed = id; print "S", 0, 4, "*", "+", 0, 0, "*", id, "*" }
    else print "H", 0, 4, "100.0", "+", 0, 0, "4M", id, seed
}
END { print "C", 0, 1, "*", "*", "*", "*", "*", seed, "*" }' "$1" > "$2""#;

    fn shell_clusterer() -> ClusterCommand {
        let args = ["-c", ONE_CLUSTER, "sh", "{input}", "{output}", "{identity}"];
        ClusterCommand::new("sh", args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn command_engine_clusters_each_group() {
        let info = SeqInfo::from_reader(SEQINFO.as_bytes()).unwrap();
        let config = DereplicateConfig {
            identity: 0.97,
            threads: 2,
            ..DereplicateConfig::default()
        };
        let results = dereplicate(&info, &source(), &shell_clusterer(), &config, None).unwrap();

        let seq_info_out = results.get_seq_info_out().unwrap();
        assert_eq!(
            seq_info_out,
            "type,seqname,seed,group\nS,b,b,sp1\nH,a,b,sp1\nH,c,b,sp1\nS,d,d,sp2\nS,e,e,sp3\nH,f,e,sp3\n"
        );

        let mut fasta = Vec::new();
        assert_eq!(results.write_seed_fasta(&source(), &mut fasta).unwrap(), 3);
        assert_eq!(String::from_utf8(fasta).unwrap(), ">b\nACGT\n>d\nGGGG\n>e\nCCCC\n");
    }

    #[test]
    fn failing_clusterer_is_an_external_tool_error() {
        let info = SeqInfo::from_reader(SEQINFO.as_bytes()).unwrap();
        // identity 1.0 makes the script exit 3
        let err = dereplicate(&info, &source(), &shell_clusterer(), &DereplicateConfig::default(), None).unwrap_err();
        assert!(matches!(err, CurateError::ExternalTool(ref m) if m.contains("exited")));
    }

    #[test]
    fn include_labels_split_on_whitespace() {
        let labels = parse_include_labels("sp1\nsp3  sp4\n");
        assert_eq!(labels.len(), 3);
        assert!(labels.contains("sp3"));
    }

    #[test]
    fn missing_group_column_is_a_configuration_error() {
        let info = SeqInfo::from_reader(SEQINFO.as_bytes()).unwrap();
        let config = DereplicateConfig {
            group_on: "genus".into(),
            ..DereplicateConfig::default()
        };
        let err = dereplicate(&info, &source(), &ForgetfulEngine, &config, None).unwrap_err();
        assert!(matches!(err, CurateError::Configuration(_)));
    }
}
