mod common;

use std::path::{Path, PathBuf};

use common::{FakeDB, FakeDBError};
use pretty_assertions::{assert_eq, assert_ne};
use sqlgolden::{
    regenerate_files, run_files, Outcomes, ParseErrorKind, RewriteError, RunConfig,
};

const PASSING: &str = "\
statement ok
create table t(a int)

statement ok
insert into t values (1)

query I
select * from t
----
1
";

const FAILING: &str = "\
statement ok
create table t(a int)

statement ok
insert into t values (1)

query I
select * from t
----
42
";

const MALFORMED: &str = "\
statement ok
create table t(a int)

query IA
select * from t
----
";

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

fn config() -> RunConfig<sqlgolden::DefaultColumnType> {
    RunConfig {
        jobs: 4,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_run_files_merges_reports() {
    let dir = tempfile::tempdir().unwrap();
    let files = vec![
        write(dir.path(), "c.slt", FAILING),
        write(dir.path(), "a.slt", PASSING),
        write(dir.path(), "b.slt", MALFORMED),
        write(dir.path(), "d.slt", FAILING),
    ];

    let make_conn = || async { Ok::<_, FakeDBError>(FakeDB::default()) };
    let summary = run_files(files.clone(), make_conn, &config()).await;

    assert_eq!(summary.files, 3);
    assert_eq!(
        summary.outcomes,
        Outcomes {
            pass: 7,
            fail: 2,
            ..Default::default()
        }
    );
    assert!(summary.any_failed());

    // failures follow the order of the input files, whatever order they finished in
    let failed: Vec<&str> = summary.failures.iter().map(|c| c.name.as_str()).collect();
    let expected = [&files[0], &files[3]].map(|f| format!("{}:7", f.display()));
    assert_eq!(failed, expected);

    assert_eq!(summary.parse_errors.len(), 1);
    assert_eq!(summary.parse_errors[0].kind(), ParseErrorKind::InvalidType('A'));

    let json = summary.as_json();
    assert_eq!(json["pass"], 7);
    assert_eq!(json["fail"], 2);
    assert_eq!(json["total"], 9);
    assert_eq!(json["files"], 3);
    assert_eq!(json["parse_errors"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["failures"][0]["verdict"], "fail");
}

#[tokio::test]
async fn test_run_files_all_passing() {
    let dir = tempfile::tempdir().unwrap();
    let files = vec![
        write(dir.path(), "a.slt", PASSING),
        write(dir.path(), "b.slt", PASSING),
    ];

    let make_conn = || async { Ok::<_, FakeDBError>(FakeDB::default()) };
    let summary = run_files(files, make_conn, &config()).await;

    assert!(!summary.any_failed(), "{}", summary.display(false));
    assert_eq!(summary.outcomes.pass, 6);
    assert_eq!(summary.as_json()["failures"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn test_regenerate_files_keeps_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let files = vec![
        write(dir.path(), "c.slt", FAILING),
        write(dir.path(), "b.slt", MALFORMED),
        write(dir.path(), "a.slt", PASSING),
    ];

    let make_conn = || async { Ok::<_, FakeDBError>(FakeDB::default()) };
    let results = regenerate_files(files.clone(), make_conn, &config()).await;

    let order: Vec<&PathBuf> = results.iter().map(|(f, _)| f).collect();
    assert_eq!(order, files.iter().collect::<Vec<_>>());

    let [(_, failing), (_, malformed), (_, passing)] = &results[..] else {
        panic!("expected three results, got {}", results.len());
    };
    assert_eq!(failing.as_ref().map(|r| r.rewritten).ok(), Some(1));
    assert!(matches!(malformed, Err(RewriteError::Parse(_))));
    assert_eq!(passing.as_ref().map(|r| r.rewritten).ok(), Some(0));

    assert_ne!(std::fs::read_to_string(&files[0]).unwrap(), FAILING);
    assert_eq!(std::fs::read_to_string(&files[1]).unwrap(), MALFORMED);

    // the regenerated file passes
    let summary = run_files(vec![files[0].clone()], make_conn, &config()).await;
    assert!(!summary.any_failed(), "{}", summary.display(false));
    assert_eq!(summary.outcomes.pass, 3);
}
