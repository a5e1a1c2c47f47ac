//src/filter/progress.rs

use std::io::Write;

use csv::{QuoteStyle, WriterBuilder};
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::Result;
use crate::types::TaxonReport;

/// Live "completed/total" display, refreshed from the control thread.
pub trait ProgressSink {
    fn start(&self, total: usize);
    fn update(&self, completed: usize, total: usize);
    fn finish(&self);
}

/// Progress sink that shows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn start(&self, _total: usize) {}
    fn update(&self, _completed: usize, _total: usize) {}
    fn finish(&self) {}
}

/// Counter drawn on stderr: `       3/      12 taxa completed`.
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{pos:>8}/{len:8} taxa completed [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for IndicatifProgress {
    fn start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
    }

    fn update(&self, completed: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(completed as u64);
    }

    fn finish(&self) {
        self.bar.finish();
    }
}

/// Receives one report per filter-rank taxon.
pub trait TaxonReporter {
    fn report(&mut self, report: &TaxonReport) -> Result<()>;
}

/// Discards reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReport;

impl TaxonReporter for NoReport {
    fn report(&mut self, _report: &TaxonReport) -> Result<()> {
        Ok(())
    }
}

/// Collects reports in memory.
impl TaxonReporter for Vec<TaxonReport> {
    fn report(&mut self, report: &TaxonReport) -> Result<()> {
        self.push(report.clone());
        Ok(())
    }
}

/// Writes `tax_id,tax_name,n,kept,pruned` rows, non-numeric fields quoted.
pub struct CsvTaxonLog<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvTaxonLog<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = WriterBuilder::new().quote_style(QuoteStyle::NonNumeric).from_writer(inner);
        writer.write_record(["tax_id", "tax_name", "n", "kept", "pruned"])?;
        Ok(Self { writer })
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| crate::error::CurateError::Io(e.into_error()))
    }
}

impl<W: Write> TaxonReporter for CsvTaxonLog<W> {
    fn report(&mut self, report: &TaxonReport) -> Result<()> {
        self.writer.write_record([
            report.tax_id.clone(),
            report.tax_name.clone(),
            report.n_total.to_string(),
            report.n_kept.to_string(),
            report.n_pruned.to_string(),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}
