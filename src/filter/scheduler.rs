//src/filter/scheduler.rs

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use crossbeam::channel::{self, RecvTimeoutError, Sender};

use crate::config::{FilterConfig, RareTaxonAction};
use crate::distance::AlignAndDistance;
use crate::error::{CurateError, Result};
use crate::fasta::SequenceSource;
use crate::filter::job::{FilterJob, JobOutput};
use crate::filter::pool::{Job, JobPool};
use crate::filter::progress::{ProgressSink, TaxonReporter};
use crate::filter::FilterOutcomes;
use crate::taxonomy::TaxonomyTree;
use crate::types::{FilterOutcome, TaxonReport};

/// Dispatch slot plus what the job produced, or the panic payload.
type Completion = (usize, std::thread::Result<Result<JobOutput>>);

/// Bookkeeping for a job that has been submitted but not yet absorbed.
struct InFlight {
    tax_id: String,
    tax_name: String,
    n_total: usize,
}

/// Runs medoid outlier filtering for every node at the configured filter
/// rank on a bounded worker pool.
///
/// Only the thread calling [`OutlierFilterScheduler::run`] touches the
/// outcome accumulator, the progress sink and the reporter. Workers share
/// nothing but read access to the sequence source and the aligner.
pub struct OutlierFilterScheduler {
    config: FilterConfig,
    source: Arc<dyn SequenceSource>,
    aligner: Arc<dyn AlignAndDistance>,
}

impl OutlierFilterScheduler {
    pub fn new(config: FilterConfig, source: Arc<dyn SequenceSource>, aligner: Arc<dyn AlignAndDistance>) -> Self {
        Self { config, source, aligner }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Filters `tree` and returns one outcome per attached sequence.
    ///
    /// The first failing job aborts the run: nothing more is submitted, the
    /// pool is shut down without waiting for running jobs and the error is
    /// returned wrapped with the taxon it came from.
    pub fn run<P: JobPool>(
        &self,
        tree: &TaxonomyTree,
        pool: P,
        progress: &dyn ProgressSink,
        reporter: &mut dyn TaxonReporter,
    ) -> Result<FilterOutcomes> {
        self.config.validate(tree.ranks())?;
        if pool.width() == 0 {
            return Err(CurateError::Configuration("worker pool has no capacity".into()));
        }

        let mut outcomes = FilterOutcomes::default();
        let jobs = self.plan(tree, &mut outcomes, reporter)?;
        self.dispatch(jobs, pool, &mut outcomes, progress, reporter)?;

        outcomes.verify_complete(tree)?;
        log::info!(
            "Kept {} of {} sequences",
            outcomes.len() - outcomes.pruned_ids().len(),
            outcomes.len()
        );
        Ok(outcomes)
    }

    /// Resolves everything that needs no distance computation and returns
    /// the jobs for the rest, in pre-order.
    fn plan(
        &self,
        tree: &TaxonomyTree,
        outcomes: &mut FilterOutcomes,
        reporter: &mut dyn TaxonReporter,
    ) -> Result<Vec<FilterJob>> {
        let filter_rank = self.config.filter_rank.as_str();
        let mut jobs = Vec::new();
        let mut targets = Vec::new();
        let mut unfiltered = Vec::new();

        // Sequences outside every filter-rank subtree are kept as they are.
        let mut stack = vec![tree.root()];
        while let Some(id) = stack.pop() {
            let node = tree.node(id);
            if node.rank == filter_rank {
                targets.push(id);
                continue;
            }
            unfiltered.extend(node.sequence_ids.iter().map(|s| FilterOutcome::unfiltered(s.as_str(), true, None)));
            stack.extend(node.children().iter().rev().copied());
        }
        let above = tree.sequences_above_rank(filter_rank)?.len();
        log::info!("Keeping {above} sequences classified above {filter_rank}");
        if unfiltered.len() > above {
            log::warn!(
                "Keeping {} sequences with no {filter_rank} ancestor unfiltered",
                unfiltered.len() - above
            );
        }
        outcomes.merge(unfiltered)?;

        for id in targets {
            let node = tree.node(id);
            let seqnames: Vec<String> = tree.subtree_sequence_ids(id).into_iter().map(str::to_string).collect();
            let n = seqnames.len();

            if n == 0 {
                log::debug!("No sequences for {} ({})", node.tax_id, node.name);
                reporter.report(&TaxonReport {
                    tax_id: node.tax_id.clone(),
                    tax_name: node.name.clone(),
                    n_total: 0,
                    n_kept: 0,
                    n_pruned: 0,
                })?;
                continue;
            }

            if n < self.config.min_seqs_for_filtering {
                let keep = self.config.rare_taxon_action == RareTaxonAction::Keep;
                log::debug!(
                    "{} ({}) has {n} sequences, below {}: {}",
                    node.tax_id,
                    node.name,
                    self.config.min_seqs_for_filtering,
                    self.config.rare_taxon_action
                );
                outcomes.merge(
                    seqnames
                        .iter()
                        .map(|s| FilterOutcome::unfiltered(s.as_str(), keep, Some(node.tax_id.as_str()))),
                )?;
                reporter.report(&TaxonReport {
                    tax_id: node.tax_id.clone(),
                    tax_name: node.name.clone(),
                    n_total: n,
                    n_kept: if keep { n } else { 0 },
                    n_pruned: if keep { 0 } else { n },
                })?;
                continue;
            }

            jobs.push(FilterJob {
                tax_id: node.tax_id.clone(),
                tax_name: node.name.clone(),
                seqnames,
            });
        }

        Ok(jobs)
    }

    fn dispatch<P: JobPool>(
        &self,
        jobs: Vec<FilterJob>,
        mut pool: P,
        outcomes: &mut FilterOutcomes,
        progress: &dyn ProgressSink,
        reporter: &mut dyn TaxonReporter,
    ) -> Result<()> {
        let total = jobs.len();
        let width = pool.width();
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::unbounded::<Completion>();
        let mut tx = Some(tx);
        let mut pending = jobs.into_iter().enumerate();
        let mut in_flight: AHashMap<usize, InFlight> = AHashMap::with_capacity(width);
        let mut completed = 0usize;

        log::info!("Filtering {total} taxa on {width} workers");
        progress.start(total);

        let result = loop {
            // Top up the pool, never beyond its width
            while in_flight.len() < width {
                let (Some(sender), Some((slot, job))) = (&tx, pending.next()) else { break };
                in_flight.insert(
                    slot,
                    InFlight {
                        tax_id: job.tax_id.clone(),
                        tax_name: job.tax_name.clone(),
                        n_total: job.seqnames.len(),
                    },
                );
                pool.submit(self.make_job(slot, job, sender.clone(), Arc::clone(&cancel)));
            }
            // Once everything is submitted only the jobs hold senders, so a
            // job the pool discards shows up as a disconnect.
            if pending.len() == 0 {
                tx = None;
            }

            if in_flight.is_empty() {
                break Ok(());
            }

            let first = match rx.recv_timeout(self.config.poll_interval()) {
                Ok(done) => done,
                Err(RecvTimeoutError::Timeout) => {
                    progress.update(completed, total);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(CurateError::DataIntegrity(format!(
                        "worker pool dropped {} jobs without running them",
                        in_flight.len()
                    )));
                }
            };

            let absorbed = std::iter::once(first).chain(rx.try_iter()).try_for_each(|(slot, done)| -> Result<()> {
                absorb(slot, done, &mut in_flight, &mut *outcomes, &mut *reporter)?;
                completed += 1;
                Ok(())
            });
            progress.update(completed, total);
            if let Err(e) = absorbed {
                break Err(e);
            }
        };

        if let Err(e) = &result {
            cancel.store(true, Ordering::SeqCst);
            log::error!("{e}");
            if !in_flight.is_empty() {
                log::warn!("Abandoning {} running filter jobs", in_flight.len());
            }
        }
        pool.shutdown();
        progress.finish();
        result
    }

    fn make_job(&self, slot: usize, job: FilterJob, tx: Sender<Completion>, cancel: Arc<AtomicBool>) -> Job {
        let source = Arc::clone(&self.source);
        let aligner = Arc::clone(&self.aligner);
        let cutoff = self.config.distance_cutoff;
        let postmortem = self.config.postmortem_dir.clone();

        Box::new(move || {
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            let done = panic::catch_unwind(AssertUnwindSafe(|| {
                job.run(source.as_ref(), aligner.as_ref(), cutoff, postmortem.as_deref())
            }));
            // The receiver is gone once the run has been abandoned
            let _ = tx.send((slot, done));
        })
    }
}

/// Folds one finished job into the accumulator.
fn absorb(
    slot: usize,
    done: std::thread::Result<Result<JobOutput>>,
    in_flight: &mut AHashMap<usize, InFlight>,
    outcomes: &mut FilterOutcomes,
    reporter: &mut dyn TaxonReporter,
) -> Result<()> {
    let info = in_flight
        .remove(&slot)
        .ok_or_else(|| CurateError::DataIntegrity(format!("completion for unknown job slot {slot}")))?;

    let output = match done {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(e.for_taxon(&info.tax_id, &info.tax_name)),
        Err(_) => {
            return Err(CurateError::JobPanicked {
                tax_id: info.tax_id,
                tax_name: info.tax_name,
            })
        }
    };

    if output.outcomes.len() != info.n_total || output.n_kept + output.n_pruned != info.n_total {
        return Err(CurateError::DataIntegrity(format!(
            "job for {} returned {} outcomes ({} kept, {} pruned) for {} sequences",
            info.tax_id,
            output.outcomes.len(),
            output.n_kept,
            output.n_pruned,
            info.n_total
        )));
    }

    if output.n_pruned == info.n_total {
        log::info!("Pruned all {} sequences for {} ({})", info.n_total, info.tax_id, info.tax_name);
    } else if output.n_pruned > 0 {
        log::info!(
            "Pruned {}/{} sequences for {} ({})",
            output.n_pruned,
            info.n_total,
            info.tax_id,
            info.tax_name
        );
    }

    reporter.report(&TaxonReport {
        tax_id: info.tax_id,
        tax_name: info.tax_name,
        n_total: info.n_total,
        n_kept: output.n_kept,
        n_pruned: output.n_pruned,
    })?;
    outcomes.merge(output.outcomes)
}
