use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use refcurate_rs::dereplicate::parse_include_labels;
use refcurate_rs::filter::{CsvTaxonLog, IndicatifProgress, NoReport, TaxonReporter};
use refcurate_rs::{
    dereplicate, filter_taxonomy, load_taxonomy, merge_cluster_database, open_sequence_source, select_references,
    AlignAndDistance, AllPairsCommand, ClusterCommand, Config, PrealignedPDistance, RareTaxonAction, Result, SeqInfo,
};

#[derive(Parser)]
#[command(name = "refcurate-rs", version, about = "Reference sequence set curation")]
struct Cli {
    /// TOML file with [filter], [select] and [dereplicate] sections
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drop sequences far from their taxon's medoid
    FilterOutliers {
        #[arg(long)]
        taxtable: PathBuf,
        #[arg(long)]
        seqinfo: PathBuf,
        /// FASTA, optionally gzipped
        #[arg(long)]
        sequences: PathBuf,
        /// Seqinfo rows of the kept sequences
        #[arg(long)]
        out_seqinfo: PathBuf,
        /// Kept sequences as FASTA
        #[arg(long)]
        out_fasta: Option<PathBuf>,
        /// All seqinfo rows with centroid, distance and outlier columns
        #[arg(long)]
        detailed_seqinfo: Option<PathBuf>,
        /// Per-taxon CSV log: tax_id,tax_name,n,kept,pruned
        #[arg(long = "log")]
        taxon_log: Option<PathBuf>,
        #[arg(long)]
        filter_rank: Option<String>,
        #[arg(long)]
        distance_cutoff: Option<f64>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        min_seqs_for_filtering: Option<usize>,
        /// keep or drop
        #[arg(long)]
        rare_taxon_action: Option<RareTaxonAction>,
        #[arg(long)]
        postmortem_dir: Option<PathBuf>,
        /// usearch-compatible all-pairs aligner
        #[arg(long, default_value = "usearch")]
        aligner: PathBuf,
        /// Sequences are already aligned; use p-distance instead of an aligner
        #[arg(long)]
        prealigned: bool,
    },
    /// Choose reference sequences for every index-rank taxon
    Select {
        #[arg(long)]
        taxtable: PathBuf,
        #[arg(long)]
        seqinfo: PathBuf,
        /// index_tax_id,seqname rows
        #[arg(long)]
        out: PathBuf,
        /// tax_id,tax_id.refpkg lines
        #[arg(long)]
        index: Option<PathBuf>,
        /// Sequence names chosen for no index taxon
        #[arg(long)]
        unused: Option<PathBuf>,
        #[arg(long)]
        index_rank: Option<String>,
        #[arg(long)]
        target_rank: Option<String>,
        #[arg(long)]
        per_taxon: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Comma-separated index tax ids
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },
    /// Cluster sequences within each group and keep the cluster seeds
    Dereplicate {
        /// FASTA, optionally gzipped
        #[arg(long)]
        sequences: PathBuf,
        #[arg(long)]
        seqinfo: PathBuf,
        /// type,seqname,seed,group rows
        #[arg(long)]
        seq_info_out: Option<PathBuf>,
        /// Seed sequences as FASTA
        #[arg(long)]
        seqs_out: Option<PathBuf>,
        /// Seqinfo column to group on
        #[arg(long)]
        group_on: Option<String>,
        /// Clustering identity between 0 and 1
        #[arg(long = "id")]
        identity: Option<f64>,
        /// File of group labels to include, whitespace separated
        #[arg(long)]
        include: Option<PathBuf>,
        #[arg(long)]
        threads: Option<usize>,
        /// usearch-compatible clusterer writing .uc output
        #[arg(long, default_value = "usearch")]
        clusterer: PathBuf,
    },
    /// Merge clusters whose sequences share a best-hit tax id
    MergeClusters {
        #[arg(long)]
        database: PathBuf,
    },
}

fn spinner(color: &str, msg: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template(&format!("{{spinner:.{color}}} {{msg}}"))
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(msg.to_string());
    spinner
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::FilterOutliers {
            taxtable,
            seqinfo,
            sequences,
            out_seqinfo,
            out_fasta,
            detailed_seqinfo,
            taxon_log,
            filter_rank,
            distance_cutoff,
            threads,
            min_seqs_for_filtering,
            rare_taxon_action,
            postmortem_dir,
            aligner,
            prealigned,
        } => {
            let cfg = &mut config.filter;
            if let Some(v) = filter_rank {
                cfg.filter_rank = v;
            }
            if let Some(v) = distance_cutoff {
                cfg.distance_cutoff = v;
            }
            if let Some(v) = threads {
                cfg.threads = v;
            }
            if let Some(v) = min_seqs_for_filtering {
                cfg.min_seqs_for_filtering = v;
            }
            if let Some(v) = rare_taxon_action {
                cfg.rare_taxon_action = v;
            }
            if postmortem_dir.is_some() {
                cfg.postmortem_dir = postmortem_dir;
            }

            // 1. Inputs
            let sp = spinner("blue", "Loading taxonomy and sequences...");
            let (tree, seq_info) = load_taxonomy(&taxtable, &seqinfo)?;
            let source = open_sequence_source(&sequences)?;
            sp.finish_with_message(format!("Loaded {} taxa, {} sequences.", tree.len(), seq_info.len()));

            // 2. Filtering
            let aligner: Arc<dyn AlignAndDistance> = if prealigned {
                Arc::new(PrealignedPDistance)
            } else {
                Arc::new(AllPairsCommand::usearch(aligner))
            };
            let mut reporter: Box<dyn TaxonReporter> = match &taxon_log {
                Some(path) => Box::new(CsvTaxonLog::new(BufWriter::new(File::create(path)?))?),
                None => Box::new(NoReport),
            };
            let progress = IndicatifProgress::new();
            let results = filter_taxonomy(
                &tree,
                seq_info,
                Arc::clone(&source),
                aligner,
                &config.filter,
                &progress,
                reporter.as_mut(),
            )?;

            // 3. Outputs
            let sp = spinner("yellow", "Writing output files...");
            fs::write(&out_seqinfo, results.get_filtered_seqinfo()?)?;
            if let Some(path) = &detailed_seqinfo {
                fs::write(path, results.get_detailed_seqinfo()?)?;
            }
            if let Some(path) = &out_fasta {
                let n = results.write_kept_fasta(source.as_ref(), BufWriter::new(File::create(path)?))?;
                log::info!("Wrote {n} sequences to {}", path.display());
            }
            sp.finish_with_message(format!(
                "Kept {} of {} sequences.",
                results.kept_ids().len(),
                results.outcomes.len()
            ));
        }

        Command::Select {
            taxtable,
            seqinfo,
            out,
            index,
            unused,
            index_rank,
            target_rank,
            per_taxon,
            seed,
            only,
        } => {
            let cfg = &mut config.select;
            if let Some(v) = index_rank {
                cfg.index_rank = v;
            }
            if let Some(v) = target_rank {
                cfg.target_rank = v;
            }
            if let Some(v) = per_taxon {
                cfg.per_taxon = v;
            }
            if let Some(v) = seed {
                cfg.seed = v;
            }
            if !only.is_empty() {
                cfg.only = Some(only.into_iter().collect());
            }

            let sp = spinner("green", "Selecting reference sequences...");
            let (tree, _) = load_taxonomy(&taxtable, &seqinfo)?;
            let results = select_references(&tree, &config.select)?;
            sp.finish_with_message(format!(
                "Selected {} sequences for {} taxa.",
                results.total_selected(),
                results.selections.len()
            ));

            write_selection(&out, &results)?;
            if let Some(path) = &index {
                fs::write(path, results.get_index_csv())?;
            }
            if let Some(path) = &unused {
                fs::write(path, results.unused_ids.iter().map(|id| format!("{id}\n")).collect::<String>())?;
            }
        }

        Command::Dereplicate {
            sequences,
            seqinfo,
            seq_info_out,
            seqs_out,
            group_on,
            identity,
            include,
            threads,
            clusterer,
        } => {
            let cfg = &mut config.dereplicate;
            if let Some(v) = group_on {
                cfg.group_on = v;
            }
            if let Some(v) = identity {
                cfg.identity = v;
            }
            if let Some(v) = threads {
                cfg.threads = v;
            }
            let include = match &include {
                Some(path) => Some(parse_include_labels(&fs::read_to_string(path)?)),
                None => None,
            };

            let sp = spinner("blue", "Loading sequences...");
            let seq_info = SeqInfo::from_path(&seqinfo)?;
            let source = open_sequence_source(&sequences)?;
            sp.finish_with_message(format!("Loaded {} seqinfo rows.", seq_info.len()));

            let sp = spinner("green", "Clustering groups...");
            let engine = ClusterCommand::usearch(clusterer);
            let results = dereplicate(&seq_info, source.as_ref(), &engine, &config.dereplicate, include.as_ref())?;
            sp.finish_with_message(format!(
                "{} seeds from {} sequences.",
                results.seeds().len(),
                results.rows.len()
            ));

            if let Some(path) = &seq_info_out {
                fs::write(path, results.get_seq_info_out()?)?;
            }
            if let Some(path) = &seqs_out {
                let n = results.write_seed_fasta(source.as_ref(), BufWriter::new(File::create(path)?))?;
                log::info!("Wrote {n} seed sequences to {}", path.display());
            }
        }

        Command::MergeClusters { database } => {
            let sp = spinner("cyan", "Merging clusters...");
            let summary = merge_cluster_database(&database)?;
            sp.finish_with_message(format!(
                "Merged {} groups, {} rows updated.",
                summary.groups.len(),
                summary.rows_updated
            ));
        }
    }

    Ok(())
}

fn write_selection(path: &Path, results: &refcurate_rs::SelectionResults) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["index_tax_id", "seqname"])?;
    for selection in &results.selections {
        for id in &selection.sequence_ids {
            wtr.write_record([selection.tax_id.as_str(), id.as_str()])?;
        }
    }
    wtr.flush()?;
    Ok(())
}
