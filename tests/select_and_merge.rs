use std::collections::BTreeSet;
use std::fs;

use rusqlite::{params, Connection};

use refcurate_rs::cluster_merge::create_schema;
use refcurate_rs::{merge_cluster_database, select_references_from_paths, MergeSummary, SelectConfig};

const TAXTABLE: &str = "\
tax_id,parent_id,rank,tax_name,root,order,genus,species
1,1,root,root,1,,,
2,1,order,Order A,1,2,,
3,1,order,Order B,1,3,,
20,2,genus,Genus A1,1,2,20,
21,20,species,Species A1a,1,2,20,21
22,20,species,Species A1b,1,2,20,22
30,3,genus,Genus B1,1,3,30,
31,30,species,Species B1a,1,3,30,31
";

const SEQINFO: &str = "\
seqname,tax_id
a1,21
a2,21
a3,21
a4,22
a5,22
a6,20
b1,31
";

fn write_taxonomy(dir: &std::path::Path) {
    fs::write(dir.join("taxtable.csv"), TAXTABLE).unwrap();
    fs::write(dir.join("seq_info.csv"), SEQINFO).unwrap();
}

#[test]
fn selects_per_species_and_skips_thin_orders() {
    let dir = tempfile::tempdir().unwrap();
    write_taxonomy(dir.path());

    let config = SelectConfig {
        per_taxon: 2,
        seed: 11,
        ..SelectConfig::default()
    };
    let results =
        select_references_from_paths(dir.path().join("taxtable.csv"), dir.path().join("seq_info.csv"), &config)
            .unwrap();

    // Order B holds a single sequence and cannot seed a reference tree
    assert_eq!(results.selections.len(), 1);
    let a = &results.selections[0];
    assert_eq!(a.tax_id, "2");
    assert_eq!(a.sequence_ids.len(), 4);
    let (from_a1a, from_a1b): (Vec<&String>, Vec<&String>) =
        a.sequence_ids.iter().partition(|id| ["a1", "a2", "a3"].contains(&id.as_str()));
    assert_eq!(from_a1a.len(), 2);
    assert_eq!(from_a1b.len(), 2);
    assert_eq!(results.get_index_csv(), "2,2.refpkg\n");

    let all: BTreeSet<&str> = ["a1", "a2", "a3", "a4", "a5", "a6", "b1"].into();
    let used: BTreeSet<&str> = a.sequence_ids.iter().map(String::as_str).collect();
    let unused: BTreeSet<&str> = results.unused_ids.iter().map(String::as_str).collect();
    assert!(used.is_disjoint(&unused));
    assert_eq!(used.union(&unused).copied().collect::<BTreeSet<_>>(), all);

    let again =
        select_references_from_paths(dir.path().join("taxtable.csv"), dir.path().join("seq_info.csv"), &config)
            .unwrap();
    assert_eq!(again.selections, results.selections);
}

#[test]
fn merge_cluster_database_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("clusters.db");
    {
        let conn = Connection::open(&db).unwrap();
        create_schema(&conn).unwrap();
        // tax A spans clusters 1 and 2, tax B spans 2 and 3, tax C only 7
        let rows = [
            (1, "s1", "A", 1),
            (2, "s2", "A", 2),
            (3, "s3", "B", 2),
            (4, "s4", "B", 3),
            (5, "s5", "C", 7),
        ];
        for (id, name, tax_id, cluster) in rows {
            conn.execute("INSERT INTO sequences (sequence_id, name) VALUES (?1, ?2)", params![id, name])
                .unwrap();
            conn.execute("INSERT INTO best_hits (sequence_id, tax_id) VALUES (?1, ?2)", params![id, tax_id])
                .unwrap();
            conn.execute(
                "INSERT INTO cluster_sequences (sequence_name, cluster_id) VALUES (?1, ?2)",
                params![name, cluster],
            )
            .unwrap();
        }
    }

    let first = merge_cluster_database(&db).unwrap();
    assert_eq!(first.groups, vec![BTreeSet::from([1, 2, 3])]);
    assert_eq!(first.rows_updated, 3);

    let conn = Connection::open(&db).unwrap();
    let mut stmt = conn
        .prepare("SELECT sequence_name, cluster_id FROM cluster_sequences ORDER BY sequence_name")
        .unwrap();
    let assigned: Vec<(String, i64)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        assigned,
        vec![
            ("s1".to_string(), 1),
            ("s2".to_string(), 1),
            ("s3".to_string(), 1),
            ("s4".to_string(), 1),
            ("s5".to_string(), 7),
        ]
    );

    assert_eq!(merge_cluster_database(&db).unwrap(), MergeSummary::default());
}
