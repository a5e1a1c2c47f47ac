use std::fs;

use refcurate_rs::dereplicate::parse_include_labels;
use refcurate_rs::{dereplicate, open_sequence_source, ClusterCommand, DereplicateConfig, SeqInfo};

const SEQINFO: &str = "\
seqname,tax_id,species,is_type,ambig_count,length
a1,10,Foo bar,false,0,12
a2,10,Foo bar,true,0,12
a3,10,Foo bar,false,3,12
b1,11,Foo baz,false,0,12
c1,12,Foo qux,false,0,12
c2,12,Foo qux,false,0,10
";

const FASTA: &str = "\
>a1
ACGTACGTACGT
>a2
ACGTACGTACGA
>a3
ACGTNNNTACGT
>b1
TTTTACGTACGT
>c1
GGGGACGTACGT
>c2
GGGGACGTAC
";

/// Every record after the first joins the first record's cluster.
const ONE_CLUSTER: &str = r#"awk 'BEGIN { OFS = "\t" }
/^>/ {
    id = substr($1, 2)
    if (seed == "") { seed = id; print "S", 0, 12, "*", "+", 0, 0, "*", id, "*" }
    else print "H", 0, 12, "99.0", "+", 0, 0, "12M", id, seed
}' "$1" > "$2""#;

#[test]
fn dereplicates_named_groups_from_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("seq_info.csv"), SEQINFO).unwrap();
    fs::write(dir.path().join("seqs.fasta"), FASTA).unwrap();

    let seq_info = SeqInfo::from_path(dir.path().join("seq_info.csv")).unwrap();
    let source = open_sequence_source(dir.path().join("seqs.fasta")).unwrap();
    let engine = ClusterCommand::new(
        "sh",
        ["-c", ONE_CLUSTER, "sh", "{input}", "{output}"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    let config = DereplicateConfig {
        threads: 2,
        ..DereplicateConfig::default()
    };
    let all = dereplicate(&seq_info, source.as_ref(), &engine, &config, None).unwrap();
    assert_eq!(
        all.get_seq_info_out().unwrap(),
        "type,seqname,seed,group\n\
         S,a2,a2,Foo bar\nH,a1,a2,Foo bar\nH,a3,a2,Foo bar\n\
         S,b1,b1,Foo baz\n\
         S,c1,c1,Foo qux\nH,c2,c1,Foo qux\n"
    );

    let mut seeds = Vec::new();
    assert_eq!(all.write_seed_fasta(source.as_ref(), &mut seeds).unwrap(), 3);
    assert_eq!(
        String::from_utf8(seeds).unwrap(),
        ">a2\nACGTACGTACGA\n>b1\nTTTTACGTACGT\n>c1\nGGGGACGTACGT\n"
    );

    let by_tax_id = DereplicateConfig {
        group_on: "tax_id".into(),
        ..config
    };
    let include = parse_include_labels("10\n12\n");
    let some = dereplicate(&seq_info, source.as_ref(), &engine, &by_tax_id, Some(&include)).unwrap();
    let groups: Vec<&str> = some.rows.iter().map(|r| r.group.as_str()).collect();
    assert_eq!(groups, vec!["10", "10", "10", "12", "12"]);
    assert_eq!(some.seeds(), vec!["a2", "c1"]);
}
