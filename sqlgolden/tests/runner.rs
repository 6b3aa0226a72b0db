mod common;

use std::time::{Duration, Instant};

use common::{FakeDB, FakeDBError, SlowDB, YieldDB};
use sqlgolden::{
    CaseFilter, FileReport, MakeConnection, Normalizer, Outcomes, RewriteError, Runner,
    TestErrorKind, Verdict, VolatileTokens,
};

fn runner() -> Runner<FakeDB, impl MakeConnection<Conn = FakeDB>> {
    Runner::new(|| async { Ok::<_, FakeDBError>(FakeDB::default()) })
}

fn slow_runner(broken: bool) -> Runner<SlowDB, impl MakeConnection<Conn = SlowDB>> {
    Runner::new(move || async move {
        Ok::<_, FakeDBError>(SlowDB {
            inner: FakeDB::default(),
            delay: Duration::from_secs(10),
            broken,
        })
    })
}

fn verdicts(report: &FileReport) -> Vec<(String, &'static str)> {
    report
        .cases
        .iter()
        .map(|c| (c.name.clone(), c.verdict.as_str()))
        .collect()
}

#[test]
fn test_mask_file() {
    let report = runner().run_file("../tests/slt/mask.slt").unwrap();
    assert_eq!(
        report.outcomes(),
        Outcomes {
            pass: 6,
            disabled: 2,
            ..Default::default()
        }
    );
}

#[test]
fn test_mask_null_replacement_keeps_upper_case() {
    let script = "\
query T
SELECT mask('AbCD123-@$#', NULL, 'q', 'd', 'o');
----
XqXXdddoooo
";
    let report = runner().run_script(script).unwrap();
    let failure = report.failures().next().unwrap();
    let Verdict::Fail(err) = &failure.verdict else {
        panic!("expected a failure, got {:?}", failure.verdict);
    };
    let TestErrorKind::QueryResultMismatch { actual, cell, .. } = err.kind() else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(actual, "AqCDdddoooo");
    assert_eq!(
        cell.as_deref(),
        Some("row 1, column 1: expected XqXXdddoooo, but got AqCDdddoooo")
    );
}

#[test]
fn test_mask_null_input() {
    let script = "\
query T
SELECT mask(NULL, 'Q', NULL, NULL, NULL);
----
NULL

query T
SELECT mask(NULL);
----
(empty)
";
    let report = runner().run_script(script).unwrap();
    assert_eq!(
        verdicts(&report),
        vec![
            ("<unknown>:1".to_string(), "pass"),
            ("<unknown>:6".to_string(), "fail"),
        ]
    );
}

const EXPLAIN_SCRIPT: &str = "\
statement ok
create table t(a int, b varchar)

explain
EXPLAIN SELECT a FROM t
----
logical_plan
01)TableScan: t projection=[a]
physical_plan
01)DataSourceExec: file_groups={1 group: [[WORKSPACE_ROOT/data/t.parquet]]}, projection=[a], file_type=parquet
";

#[test]
fn test_explain_across_workspace_roots() {
    for root in ["/home/alice/src/engine", "/builds/1234/engine"] {
        let mut runner = Runner::new(move || async move {
            Ok::<_, FakeDBError>(FakeDB::with_workspace_root(root))
        });
        runner.with_normalizer(Normalizer::new(
            VolatileTokens::new().with_workspace_root(root),
        ));
        let report = runner.run_script(EXPLAIN_SCRIPT).unwrap();
        assert!(!report.has_failures(), "{}", report.display(false));
        assert_eq!(report.outcomes().pass, 2);
    }
}

#[test]
fn test_explain_structural_change() {
    let script = EXPLAIN_SCRIPT.replace("DataSourceExec", "ParquetExec");
    let mut runner = runner();
    runner.with_normalizer(Normalizer::new(VolatileTokens::from_env()));
    let report = runner.run_script(&script).unwrap();
    assert_eq!(report.outcomes().fail, 1);
    let Verdict::Fail(err) = &report.cases[1].verdict else {
        panic!("expected a failure, got {:?}", report.cases[1].verdict);
    };
    let TestErrorKind::PlanMismatch {
        expected, actual, ..
    } = err.kind()
    else {
        panic!("unexpected error: {err}");
    };
    assert!(expected.contains("01)ParquetExec: file_groups={1 group: [[WORKSPACE_ROOT/data"));
    assert!(actual.contains("01)DataSourceExec: file_groups={1 group: [[WORKSPACE_ROOT/data"));
}

#[test]
fn test_failures_do_not_stop_the_run() {
    let script = "\
statement ok
create table example_basic(name varchar)

statement ok
insert into example_basic values ('Alice'), ('Bob')

query T
select * from example_basic
----
Alice
Eve

statement error no such table
select * from missing

query T
select * from example_basic
----
Alice
Bob
";
    let report = runner().run_script(script).unwrap();
    assert_eq!(
        verdicts(&report),
        vec![
            ("<unknown>:1".to_string(), "pass"),
            ("<unknown>:4".to_string(), "pass"),
            ("<unknown>:7".to_string(), "fail"),
            ("<unknown>:13".to_string(), "pass"),
            ("<unknown>:16".to_string(), "pass"),
        ]
    );
    assert!(report.outcomes().any_failed());
}

#[test]
fn test_disabled_cases_are_counted() {
    let script = "\
## Reference result: 1
#query I
#SELECT one();
#----
#1

#statement ok
#create function one()

statement ok
create table t(a int)
";
    let report = runner().run_script(script).unwrap();
    assert_eq!(
        report.outcomes(),
        Outcomes {
            pass: 1,
            disabled: 2,
            ..Default::default()
        }
    );
    assert_eq!(report.outcomes().total(), 3);
}

#[test]
fn test_filter_keeps_statements() {
    let script = "\
statement ok
create table example_basic(name varchar)

statement ok
insert into example_basic values ('Alice')

query T nosort names
select * from example_basic
----
Alice

query T
select * from example_basic
----
Bob
";
    let mut runner = runner();
    runner.with_filter(CaseFilter::new("names$").unwrap());
    let report = runner.run_script(script).unwrap();
    assert_eq!(
        verdicts(&report),
        vec![
            ("<unknown>:1".to_string(), "pass"),
            ("<unknown>:4".to_string(), "pass"),
            ("<unknown>:7 names".to_string(), "pass"),
            ("<unknown>:12".to_string(), "skipped"),
        ]
    );
}

#[test]
fn test_verdicts_are_deterministic() {
    let first = runner().run_file("../tests/slt/basic.slt").unwrap();
    let second = runner().run_file("../tests/slt/basic.slt").unwrap();
    assert_eq!(verdicts(&first), verdicts(&second));
    assert_eq!(first.outcomes(), second.outcomes());
    assert!(!first.has_failures(), "{}", first.display(false));
    // the case after `halt`
    assert_eq!(first.cases.last().unwrap().verdict.as_str(), "skipped");
}

#[tokio::test]
async fn test_timeout_is_errored() {
    let script = "\
statement ok
select slow

statement ok
create table t(a int)
";
    let mut runner = slow_runner(false);
    runner.with_timeout(Duration::from_millis(50));
    let report = runner.run_script_async(script).await.unwrap();

    let Verdict::Errored(err) = &report.cases[0].verdict else {
        panic!("expected an error, got {:?}", report.cases[0].verdict);
    };
    assert!(matches!(err.kind(), TestErrorKind::Timeout { .. }), "{err}");
    assert!(matches!(report.cases[1].verdict, Verdict::Pass));
}

#[tokio::test]
async fn test_timeout_does_not_block_the_executor() {
    let mut runner = Runner::new(|| async { Ok::<_, FakeDBError>(YieldDB(FakeDB::default())) });
    runner.with_timeout(Duration::from_secs(5));

    let start = Instant::now();
    let report = runner
        .run_script_async("statement ok\ncreate table t(a int)\n")
        .await
        .unwrap();
    assert!(
        matches!(report.cases[0].verdict, Verdict::Pass),
        "{}",
        report.display(false)
    );
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_transport_failure_is_errored() {
    let script = "\
statement error
select * from missing

query I
select 1
----
1
";
    let report = slow_runner(true).run_script_async(script).await.unwrap();
    assert_eq!(
        report.outcomes(),
        Outcomes {
            errored: 2,
            ..Default::default()
        }
    );
}

const PRICES: &str = "\
# prices are stored with two decimal digits

statement ok
create table example_prices(item varchar, price decimal(10,2))

statement ok
insert into example_prices values ('tea', 1.50), ('cake', 12.00)

query TN
select * from example_prices
----
tea 1.5
cake 12.00

query T
SELECT mask('AbCD123-@$#');
----
XxXXnnn-@$#

query T
SELECT mask('AbCD123-@$#', 'Q', 'q', 'd');
----
XxXXnnn-@$#
";

#[tokio::test]
async fn test_regenerate_failing_cases() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prices.slt");
    std::fs::write(&path, PRICES).unwrap();

    let result = runner().regenerate_file_async(&path).await.unwrap();
    assert_eq!(result.rewritten, 2);
    assert_eq!(result.report.outcomes().fail, 2);

    let expected = PRICES
        .replace("tea 1.5\n", "tea 1.50\n")
        .replace("'d');\n----\nXxXXnnn-@$#", "'d');\n----\nQqQQddd-@$#");
    let regenerated = std::fs::read_to_string(&path).unwrap();
    pretty_assertions::assert_eq!(regenerated, expected);

    // a second pass finds nothing to rewrite
    let result = runner().regenerate_file_async(&path).await.unwrap();
    assert_eq!(result.rewritten, 0);
    assert!(!result.report.has_failures());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), expected);
}

#[tokio::test]
async fn test_regenerate_refuses_errored_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prices.slt");
    std::fs::write(&path, PRICES).unwrap();

    let err = slow_runner(true)
        .regenerate_file_async(&path)
        .await
        .unwrap_err();
    let RewriteError::Errored { errors, .. } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(errors.len(), 5);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), PRICES);
}
