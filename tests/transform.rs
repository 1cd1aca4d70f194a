mod common;

use std::fs;

use bts_ingest::domain::Dataset;
use bts_ingest::transform::{add_metrics, curated_name};

use common::utf8;

#[test]
fn t100_gets_asm_and_rpm_columns() {
    let temp = tempfile::tempdir().unwrap();
    let source = utf8(temp.path().join("seg__2001Q3.csv"));
    fs::write(
        source.as_std_path(),
        "SEATS,PASSENGERS,DISTANCE,ORIGIN\n\"1,200\",100,500,JFK\n,3,10,LAX\n",
    )
    .unwrap();
    let dest = utf8(temp.path().join("updated").join(curated_name("seg__2001Q3.csv")));

    add_metrics(&source, &dest, Dataset::T100Segment.metrics()).unwrap();

    let output = fs::read_to_string(dest.as_std_path()).unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines[0], "SEATS,PASSENGERS,DISTANCE,ORIGIN,ASM,RPM");
    assert_eq!(lines[1], "\"1,200\",100,500,JFK,600000,50000");
    assert_eq!(lines[2], ",3,10,LAX,0,30");
    assert!(dest.ends_with("seg__2001Q3__with_metrics.csv"));
}

#[test]
fn existing_metric_column_is_recomputed_in_place() {
    let temp = tempfile::tempdir().unwrap();
    let source = utf8(temp.path().join("m.csv"));
    fs::write(
        source.as_std_path(),
        "PASSENGERS,RPM,MARKET_DISTANCE\n2,999,100\n1\n",
    )
    .unwrap();
    let dest = utf8(temp.path().join("m__with_metrics.csv"));

    add_metrics(&source, &dest, Dataset::Db1bMarket.metrics()).unwrap();

    let output = fs::read_to_string(dest.as_std_path()).unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines[0], "PASSENGERS,RPM,MARKET_DISTANCE");
    assert_eq!(lines[1], "2,200,100");
    assert_eq!(lines[2], "1,0,");
}
