//src/cluster_merge.rs

use std::collections::BTreeSet;

use ahash::AHashMap;
use rusqlite::{params, Connection, Transaction};

use crate::error::Result;

pub type ClusterId = i64;

/// Tables the merge reads and rewrites.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sequences (
    sequence_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS best_hits (
    sequence_id INTEGER NOT NULL REFERENCES sequences(sequence_id),
    tax_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS cluster_sequences (
    sequence_name TEXT NOT NULL,
    cluster_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_cluster_sequences_cluster_id ON cluster_sequences(cluster_id);
";

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Distinct (tax_id, cluster_id) pairs restricted to tax ids whose best
/// hits fall in more than one cluster, ordered by tax_id.
const TAX_IDS_SPANNING_CLUSTERS: &str = "
WITH tax_to_cluster AS (
    SELECT DISTINCT b.tax_id, cs.cluster_id
    FROM best_hits b
    INNER JOIN sequences s USING (sequence_id)
    INNER JOIN cluster_sequences cs ON cs.sequence_name = s.name
)
SELECT tax_id, cluster_id
FROM tax_to_cluster
WHERE tax_id IN (SELECT tax_id FROM tax_to_cluster GROUP BY tax_id HAVING COUNT(cluster_id) > 1)
ORDER BY tax_id, cluster_id
";

/// Groups of cluster ids that share a tax id, one group per tax id.
pub fn find_clusters_to_merge(conn: &Connection) -> Result<Vec<(String, Vec<ClusterId>)>> {
    let mut stmt = conn.prepare(TAX_IDS_SPANNING_CLUSTERS)?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, ClusterId>(1)?)))?;

    let mut groups: Vec<(String, Vec<ClusterId>)> = Vec::new();
    for row in rows {
        let (tax_id, cluster_id) = row?;
        match groups.last_mut() {
            Some((last, ids)) if *last == tax_id => ids.push(cluster_id),
            _ => groups.push((tax_id, vec![cluster_id])),
        }
    }
    Ok(groups)
}

/// Folds groups of cluster ids into merge groups: any two clusters that are
/// linked through a chain of shared tax ids end up in the same set.
///
/// Each group is unioned with the current component of every member seen
/// before, and the union becomes the component of all its members, so the
/// result does not depend on the order groups arrive in. The returned sets
/// partition every cluster id that appeared in a group; they are sorted by
/// their smallest member.
pub fn merge_by_tax_id<I, G>(groups: I) -> Vec<BTreeSet<ClusterId>>
where
    I: IntoIterator<Item = G>,
    G: IntoIterator<Item = ClusterId>,
{
    let mut components: Vec<Option<BTreeSet<ClusterId>>> = Vec::new();
    let mut owner: AHashMap<ClusterId, usize> = AHashMap::new();

    for group in groups {
        let mut merged: BTreeSet<ClusterId> = group.into_iter().collect();
        let previous: BTreeSet<usize> = merged.iter().filter_map(|c| owner.get(c).copied()).collect();
        for idx in previous {
            if let Some(component) = components[idx].take() {
                merged.extend(component);
            }
        }

        let idx = components.len();
        for &cluster_id in &merged {
            owner.insert(cluster_id, idx);
        }
        components.push(Some(merged));
    }

    let mut result: Vec<BTreeSet<ClusterId>> = components.into_iter().flatten().collect();
    result.sort_by_key(|c| c.iter().next().copied());
    result
}

/// What one merge run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub groups: Vec<BTreeSet<ClusterId>>,
    pub rows_updated: usize,
}

fn rewrite_group(tx: &Transaction<'_>, group: &BTreeSet<ClusterId>) -> Result<usize> {
    let Some(&canonical) = group.iter().next() else {
        return Ok(0);
    };
    log::info!("Merging {} clusters to {}", group.len(), canonical);

    let mut stmt = tx.prepare_cached("UPDATE cluster_sequences SET cluster_id = ?1 WHERE cluster_id = ?2")?;
    let mut updated = 0;
    for &cluster_id in group.iter().skip(1) {
        updated += stmt.execute(params![canonical, cluster_id])?;
    }
    Ok(updated)
}

/// Rewrites every cluster that shares a tax id with another cluster to the
/// smallest id of its merge group, in one transaction.
/// Running it again after success changes nothing.
pub fn merge_clusters(conn: &mut Connection) -> Result<MergeSummary> {
    let tx = conn.transaction()?;

    let to_merge = find_clusters_to_merge(&tx)?;
    let groups = merge_by_tax_id(to_merge.into_iter().map(|(_, ids)| ids));

    let mut rows_updated = 0;
    for group in &groups {
        rows_updated += rewrite_group(&tx, group)?;
    }
    tx.commit()?;

    log::info!("Merged {} cluster groups ({} rows updated)", groups.len(), rows_updated);
    Ok(MergeSummary { groups, rows_updated })
}
