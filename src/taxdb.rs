//src/taxdb.rs

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use ahash::AHashMap;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use crate::error::{CurateError, Result};
use crate::filter::FilterOutcomes;
use crate::taxonomy::{RankOrder, TaxonomyTree};

/// Parses a taxtable in the format:
/// ```text
/// tax_id,parent_id,rank,tax_name,root,phylum,...,species
/// 1,1,root,root,1,,...,
/// ```
/// The columns after `tax_name` give the rank order, coarse to fine.
/// The root row has `parent_id == tax_id` (or an empty parent).
/// Rows may come in any order.
pub fn parse_taxtable<R: Read>(reader: R) -> Result<TaxonomyTree> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers = rdr.headers()?.clone();

    let expected = ["tax_id", "parent_id", "rank", "tax_name"];
    for (i, name) in expected.iter().enumerate() {
        if headers.get(i).map(str::trim) != Some(*name) {
            return Err(CurateError::Taxonomy(format!(
                "taxtable column {} should be '{name}'",
                i + 1
            )));
        }
    }
    let ranks = RankOrder::new(headers.iter().skip(expected.len()).map(str::trim))?;
    if ranks.ranks().is_empty() {
        return Err(CurateError::Taxonomy("taxtable defines no rank columns".into()));
    }

    // (tax_id, parent_id, rank, tax_name)
    let mut rows: Vec<(String, String, String, String)> = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("").trim().to_string();
        rows.push((field(0), field(1), field(2), field(3)));
    }

    let mut roots = rows
        .iter()
        .enumerate()
        .filter(|(_, (tax_id, parent, _, _))| parent.is_empty() || parent == tax_id);
    let root_idx = match (roots.next(), roots.next()) {
        (Some((i, _)), None) => i,
        (None, _) => return Err(CurateError::Taxonomy("taxtable has no root".into())),
        (Some(_), Some(_)) => return Err(CurateError::Taxonomy("taxtable has more than one root".into())),
    };

    // parent tax_id -> row indices, in row order
    let mut children_map: AHashMap<&str, Vec<usize>> = AHashMap::new();
    for (i, (tax_id, parent, _, _)) in rows.iter().enumerate() {
        if i != root_idx {
            children_map.entry(parent.as_str()).or_default().push(i);
            if parent == tax_id {
                return Err(CurateError::Taxonomy(format!("tax_id {tax_id} is its own parent")));
            }
        }
    }

    let (root_id, _, root_rank, root_name) = &rows[root_idx];
    let mut tree = TaxonomyTree::new(ranks, root_id, root_rank, root_name)?;

    let mut stack = vec![(root_idx, tree.root())];
    let mut added = 1;
    while let Some((row_idx, node)) = stack.pop() {
        let tax_id = rows[row_idx].0.as_str();
        if let Some(kids) = children_map.get(tax_id) {
            for &child in kids {
                let (child_id, _, rank, name) = &rows[child];
                let child_node = tree.add_child(node, child_id, rank, name)?;
                stack.push((child, child_node));
                added += 1;
            }
        }
    }

    if added != rows.len() {
        return Err(CurateError::Taxonomy(format!(
            "{} taxtable row(s) are not connected to the root",
            rows.len() - added
        )));
    }

    log::info!("Loaded taxonomy with {} nodes", tree.len());
    Ok(tree)
}

pub fn read_taxtable<P: AsRef<Path>>(path: P) -> Result<TaxonomyTree> {
    parse_taxtable(File::open(path)?)
}

/// A sequence info table kept as raw CSV records so it can be written back
/// with its original columns.
#[derive(Debug, Clone)]
pub struct SeqInfo {
    headers: StringRecord,
    records: Vec<StringRecord>,
    seqname_col: usize,
    tax_id_col: usize,
}

impl SeqInfo {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = rdr.headers()?.clone();
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| CurateError::Taxonomy(format!("seqinfo has no '{name}' column")))
        };
        let seqname_col = find("seqname")?;
        let tax_id_col = find("tax_id")?;

        let records = rdr.records().collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            headers,
            records,
            seqname_col,
            tax_id_col,
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn headers(&self) -> &StringRecord {
        &self.headers
    }

    pub fn records(&self) -> &[StringRecord] {
        &self.records
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.trim() == name)
    }

    pub fn seqname<'a>(&self, record: &'a StringRecord) -> &'a str {
        record.get(self.seqname_col).unwrap_or("").trim()
    }

    pub fn tax_id<'a>(&self, record: &'a StringRecord) -> &'a str {
        record.get(self.tax_id_col).unwrap_or("").trim()
    }

    /// Attaches every sequence to its tax id node.
    pub fn populate(&self, tree: &mut TaxonomyTree) -> Result<()> {
        for record in &self.records {
            tree.add_sequence(self.tax_id(record), self.seqname(record))?;
        }
        log::info!("Added {} sequences", self.records.len());
        Ok(())
    }

    /// Writes the rows accepted by `keep`, original columns and order.
    pub fn write_filtered<W, F>(&self, writer: W, keep: F) -> Result<()>
    where
        W: Write,
        F: Fn(&str) -> bool,
    {
        let mut wtr = WriterBuilder::new().from_writer(writer);
        wtr.write_record(&self.headers)?;
        for record in &self.records {
            if keep(self.seqname(record)) {
                wtr.write_record(record)?;
            }
        }
        wtr.flush()?;
        Ok(())
    }

    /// Writes every row joined with its filtering outcome:
    /// `...,centroid,dist,is_out,<filter_rank>_id`.
    pub fn write_detailed<W: Write>(&self, writer: W, outcomes: &FilterOutcomes, filter_rank: &str) -> Result<()> {
        let mut wtr = WriterBuilder::new().from_writer(writer);
        let mut header = self.headers.clone();
        header.push_field("centroid");
        header.push_field("dist");
        header.push_field("is_out");
        header.push_field(&format!("{filter_rank}_id"));
        wtr.write_record(&header)?;

        for record in &self.records {
            let mut row = record.clone();
            match outcomes.get(self.seqname(record)) {
                Some(o) => {
                    row.push_field(o.centroid.as_deref().unwrap_or(""));
                    row.push_field(&o.distance.map(|d| d.to_string()).unwrap_or_default());
                    row.push_field(if o.is_outlier { "true" } else { "false" });
                    row.push_field(o.filter_tax_id.as_deref().unwrap_or(""));
                }
                None => {
                    for _ in 0..4 {
                        row.push_field("");
                    }
                }
            }
            wtr.write_record(&row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAXTABLE: &str = "\
tax_id,parent_id,rank,tax_name,root,genus,species
3,2,species,Foo bar,1,2,3
1,1,root,root,1,,
2,1,genus,Foo,1,2,
4,2,species,Foo baz,1,2,4
";

    #[test]
    fn taxtable_rows_in_any_order() {
        let tree = parse_taxtable(TAXTABLE.as_bytes()).unwrap();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.ranks().ranks(), &["root", "genus", "species"]);
        let genus = tree.get("2").unwrap();
        let kids: Vec<&str> = tree
            .node(genus)
            .children()
            .iter()
            .map(|&c| tree.node(c).tax_id.as_str())
            .collect();
        assert_eq!(kids, vec!["3", "4"]);
    }

    #[test]
    fn orphan_rows_are_rejected() {
        let table = "tax_id,parent_id,rank,tax_name,root,species\n1,1,root,root,1,\n5,9,species,x,1,5\n";
        assert!(matches!(parse_taxtable(table.as_bytes()), Err(CurateError::Taxonomy(_))));
    }

    #[test]
    fn seqinfo_populates_and_filters() {
        let mut tree = parse_taxtable(TAXTABLE.as_bytes()).unwrap();
        let seqinfo = "seqname,tax_id,length\na,3,100\nb,4,120\nc,2,90\n";
        let info = SeqInfo::from_reader(seqinfo.as_bytes()).unwrap();
        info.populate(&mut tree).unwrap();
        assert_eq!(tree.total_sequences(), 3);

        let mut out = Vec::new();
        info.write_filtered(&mut out, |s| s != "b").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "seqname,tax_id,length\na,3,100\nc,2,90\n");
    }

    #[test]
    fn seqinfo_requires_seqname_column() {
        assert!(SeqInfo::from_reader("name,tax_id\na,1\n".as_bytes()).is_err());
    }
}
