//! Test runner.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::executor::block_on;
use futures::future::{self, Either};
use futures_timer::Delay;
use itertools::Itertools;
use owo_colors::OwoColorize;
use regex::Regex;
use similar::{Change, ChangeTag, TextDiff};

use crate::compare::Comparator;
use crate::normalize::Normalizer;
use crate::parser::*;
use crate::plan::PlanSection;
use crate::substitution::Substitution;
use crate::summary::{CaseReport, FileReport, Verdict};
use crate::{ColumnType, Connections, MakeConnection};

/// Type-erased error type.
pub(crate) type AnyError = Arc<dyn std::error::Error + Send + Sync>;

/// Output of a record.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RecordOutput<T: ColumnType> {
    /// No output. Occurs when the record is skipped or not a `query`, `statement`, or `explain`.
    Nothing,
    /// The output of a `query`.
    Query {
        types: Vec<T>,
        rows: Vec<Vec<String>>,
        error: Option<AnyError>,
    },
    /// The output of a `statement`.
    Statement { count: u64, error: Option<AnyError> },
    /// The output of an `explain`.
    Explain {
        sections: Vec<PlanSection>,
        error: Option<AnyError>,
    },
    /// The case could not be executed at all.
    Errored(TestErrorKind),
}

impl<T: ColumnType> RecordOutput<T> {
    /// The error the engine reported for the SQL, if any.
    pub fn error(&self) -> Option<&AnyError> {
        match self {
            Self::Query { error, .. } | Self::Statement { error, .. } | Self::Explain { error, .. } => {
                error.as_ref()
            }
            Self::Nothing | Self::Errored(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DBOutput<T: ColumnType> {
    Rows {
        types: Vec<T>,
        rows: Vec<Vec<String>>,
    },
    /// A statement in the query has completed.
    ///
    /// The number of rows modified or selected is returned.
    ///
    /// If the test case doesn't specify `statement count <n>`, the number is simply ignored.
    StatementComplete(u64),
    /// The plan of an explained query, one entry per section.
    Plan { sections: Vec<PlanSection> },
}

/// The async database to be tested.
#[async_trait]
pub trait AsyncDB {
    /// The error type of SQL execution.
    type Error: std::error::Error + Send + Sync + 'static;
    /// The type of result columns
    type ColumnType: ColumnType;

    /// Async run a SQL query and return the output.
    ///
    /// Rows must be returned in the order the engine produced them.
    async fn run(&mut self, sql: &str) -> Result<DBOutput<Self::ColumnType>, Self::Error>;

    /// Engine name of current database.
    fn engine_name(&self) -> &str {
        ""
    }

    /// [`Runner`] calls this function to perform `sleep` records.
    ///
    /// The default implementation is a [`futures_timer::Delay`], which works with any async
    /// runtime. Case timeouts never go through this function.
    async fn sleep(dur: Duration) {
        Delay::new(dur).await;
    }

    /// Whether an error means the engine could not be reached or did not answer, as opposed to
    /// the SQL failing. Such cases are reported as errored, never as failed.
    fn is_transport_error(_err: &Self::Error) -> bool {
        false
    }
}

/// The database to be tested.
pub trait DB {
    /// The error type of SQL execution.
    type Error: std::error::Error + Send + Sync + 'static;
    /// The type of result columns
    type ColumnType: ColumnType;

    /// Run a SQL query and return the output.
    fn run(&mut self, sql: &str) -> Result<DBOutput<Self::ColumnType>, Self::Error>;

    /// Engine name of current database.
    fn engine_name(&self) -> &str {
        ""
    }

    fn is_transport_error(_err: &Self::Error) -> bool {
        false
    }
}

/// Compat-layer for the new AsyncDB and DB trait
#[async_trait]
impl<D> AsyncDB for D
where
    D: DB + Send,
{
    type Error = D::Error;
    type ColumnType = D::ColumnType;

    async fn run(&mut self, sql: &str) -> Result<DBOutput<Self::ColumnType>, Self::Error> {
        D::run(self, sql)
    }

    fn engine_name(&self) -> &str {
        D::engine_name(self)
    }

    fn is_transport_error(err: &Self::Error) -> bool {
        D::is_transport_error(err)
    }
}

/// The error type for running a test case.
///
/// For colored error message, use `self.display()`.
#[derive(thiserror::Error, Clone)]
#[error("{kind}\nat {loc}\n")]
pub struct TestError {
    kind: TestErrorKind,
    loc: Location,
}

impl TestError {
    pub fn display(&self, colorize: bool) -> TestErrorDisplay<'_> {
        TestErrorDisplay {
            err: self,
            colorize,
        }
    }
}

/// Overrides the `Display` implementation of [`TestError`] to support controlling colorization.
pub struct TestErrorDisplay<'a> {
    err: &'a TestError,
    colorize: bool,
}

impl<'a> Display for TestErrorDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}\nat {}\n",
            self.err.kind.display(self.colorize),
            self.err.loc
        )
    }
}

impl std::fmt::Debug for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl TestError {
    /// Returns the corresponding [`TestErrorKind`] for this error.
    pub fn kind(&self) -> TestErrorKind {
        self.kind.clone()
    }

    /// Returns the location from which the error originated.
    pub fn location(&self) -> Location {
        self.loc.clone()
    }

    /// Whether the case could not be executed, rather than producing mismatching output.
    pub fn is_errored(&self) -> bool {
        self.kind.is_errored()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Statement,
    Query,
    Explain,
}

impl RecordKind {
    /// The kind of the executable records.
    pub fn of<T: ColumnType>(record: &Record<T>) -> Option<Self> {
        match record {
            Record::Statement { .. } => Some(Self::Statement),
            Record::Query { .. } => Some(Self::Query),
            Record::Explain { .. } => Some(Self::Explain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Statement => "statement",
            RecordKind::Query => "query",
            RecordKind::Explain => "explain",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error kind for running a test case.
///
/// For colored error message, use `self.display()`.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum TestErrorKind {
    #[error("{kind} is expected to fail, but actually succeed:\n[SQL] {sql}")]
    Ok { sql: String, kind: RecordKind },
    #[error("{kind} failed: {err}\n[SQL] {sql}")]
    Fail {
        sql: String,
        err: AnyError,
        kind: RecordKind,
    },
    // Remember to also update [`TestErrorKindDisplay`] if this message is changed.
    #[error("{kind} is expected to fail with error:\n\t{expected_err}\nbut got error:\n\t{err}\n[SQL] {sql}"
    )]
    ErrorMismatch {
        sql: String,
        err: AnyError,
        expected_err: String,
        kind: RecordKind,
    },
    #[error("statement is expected to affect {expected} rows, but actually {actual}\n[SQL] {sql}")]
    StatementResultMismatch {
        sql: String,
        expected: u64,
        actual: String,
    },
    // Remember to also update [`TestErrorKindDisplay`] if this message is changed.
    #[error(
        "query result mismatch:\n[SQL] {sql}\n[Diff] (-expected|+actual)\n{}{}",
        TextDiff::from_lines(.expected, .actual).iter_all_changes().format_with("\n", |diff, f| format_diff(&diff, f, false)),
        format_cell(.cell)
    )]
    QueryResultMismatch {
        sql: String,
        expected: String,
        actual: String,
        /// The first pair of cells that differ once decoded, when rows line up.
        cell: Option<String>,
    },
    #[error(
        "query columns mismatch:\n[SQL] {sql}\n{}",
        format_column_diff(expected, actual, false)
    )]
    QueryResultColumnsMismatch {
        sql: String,
        expected: String,
        actual: String,
    },
    // Remember to also update [`TestErrorKindDisplay`] if this message is changed.
    #[error(
        "plan mismatch:\n[SQL] {sql}\n[Expected]\n{}\n[Actual]\n{}",
        indent_block(.expected),
        indent_block(.actual)
    )]
    PlanMismatch {
        sql: String,
        expected: String,
        actual: String,
    },
    #[error("{kind} got unexpected output from the engine: {actual}\n[SQL] {sql}")]
    UnexpectedOutput {
        sql: String,
        kind: RecordKind,
        actual: &'static str,
    },
    #[error("{kind} could not be executed: {err}\n[SQL] {sql}")]
    Transport {
        sql: String,
        err: AnyError,
        kind: RecordKind,
    },
    #[error("{kind} timed out after {timeout:?}\n[SQL] {sql}")]
    Timeout {
        sql: String,
        timeout: Duration,
        kind: RecordKind,
    },
    #[error("{err}\n[SQL] {sql}")]
    Substitution { sql: String, err: AnyError },
}

impl TestErrorKind {
    pub(crate) fn at(self, loc: Location) -> TestError {
        TestError { kind: self, loc }
    }

    /// Whether the case could not be executed: the engine was unreachable, did not answer in time,
    /// or the SQL could not be prepared.
    pub fn is_errored(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Substitution { .. }
        )
    }

    pub fn display(&self, colorize: bool) -> TestErrorKindDisplay<'_> {
        TestErrorKindDisplay {
            error: self,
            colorize,
        }
    }
}

/// Overrides the `Display` implementation of [`TestErrorKind`] to support controlling colorization.
pub struct TestErrorKindDisplay<'a> {
    error: &'a TestErrorKind,
    colorize: bool,
}

impl<'a> Display for TestErrorKindDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.colorize {
            return write!(f, "{}", self.error);
        }
        match self.error {
            TestErrorKind::ErrorMismatch {
                sql,
                err,
                expected_err,
                kind,
            } => write!(
                f,
                "{kind} is expected to fail with error:\n\t{}\nbut got error:\n\t{}\n[SQL] {sql}",
                expected_err.bright_green(),
                err.bright_red(),
            ),
            TestErrorKind::QueryResultMismatch {
                sql,
                expected,
                actual,
                cell,
            } => write!(
                f,
                "query result mismatch:\n[SQL] {sql}\n[Diff] ({}|{})\n{}{}",
                "-expected".bright_red(),
                "+actual".bright_green(),
                TextDiff::from_lines(expected, actual)
                    .iter_all_changes()
                    .format_with("\n", |diff, f| format_diff(&diff, f, true)),
                format_cell(cell)
            ),
            TestErrorKind::QueryResultColumnsMismatch {
                sql,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "query columns mismatch:\n[SQL] {sql}\n{}",
                    format_column_diff(expected, actual, true)
                )
            }
            TestErrorKind::PlanMismatch {
                sql,
                expected,
                actual,
            } => write!(
                f,
                "plan mismatch:\n[SQL] {sql}\n{}\n{}\n{}\n{}",
                "[Expected]".bright_green(),
                indent_block(expected),
                "[Actual]".bright_red(),
                indent_block(actual),
            ),
            TestErrorKind::Transport { .. } | TestErrorKind::Timeout { .. } => {
                write!(f, "{}", self.error.bright_yellow())
            }
            _ => write!(f, "{}", self.error),
        }
    }
}

fn format_diff(
    diff: &Change<&str>,
    f: &mut dyn FnMut(&dyn std::fmt::Display) -> std::fmt::Result,
    colorize: bool,
) -> std::fmt::Result {
    match diff.tag() {
        ChangeTag::Equal => f(&diff
            .value()
            .lines()
            .format_with("\n", |line, f| f(&format_args!("    {line}")))),
        ChangeTag::Insert => f(&diff.value().lines().format_with("\n", |line, f| {
            if colorize {
                f(&format_args!("+   {line}").bright_green())
            } else {
                f(&format_args!("+   {line}"))
            }
        })),
        ChangeTag::Delete => f(&diff.value().lines().format_with("\n", |line, f| {
            if colorize {
                f(&format_args!("-   {line}").bright_red())
            } else {
                f(&format_args!("-   {line}"))
            }
        })),
    }
}

fn format_column_diff(expected: &str, actual: &str, colorize: bool) -> String {
    let (expected, actual) = TextDiff::from_chars(expected, actual)
        .iter_all_changes()
        .fold(
            ("".to_string(), "".to_string()),
            |(expected, actual), change| match change.tag() {
                ChangeTag::Equal => (
                    format!("{}{}", expected, change.value()),
                    format!("{}{}", actual, change.value()),
                ),
                ChangeTag::Delete => (
                    if colorize {
                        format!("{}[{}]", expected, change.value().bright_red())
                    } else {
                        format!("{}[{}]", expected, change.value())
                    },
                    actual,
                ),
                ChangeTag::Insert => (
                    expected,
                    if colorize {
                        format!("{}[{}]", actual, change.value().bright_green())
                    } else {
                        format!("{}[{}]", actual, change.value())
                    },
                ),
            },
        );
    format!("[Expected] {expected}\n[Actual  ] {actual}")
}

fn format_cell(cell: &Option<String>) -> String {
    match cell {
        Some(cell) => format!("\n[Cell] {cell}"),
        None => String::new(),
    }
}

fn indent_block(block: &str) -> String {
    if block.is_empty() {
        return "    (empty)".to_string();
    }
    block.lines().map(|line| format!("    {line}")).join("\n")
}

/// [`Runner`] uses this validator to check that the expected column types match an actual output.
///
/// # Default
///
/// By default ([`default_column_validator`]), column types are not validated. The number of
/// columns is always checked.
pub type ColumnTypeValidator<T> = fn(actual: &Vec<T>, expected: &Vec<T>) -> bool;

/// The default validator always returns success for any inputs of expected and actual sets of
/// columns.
pub fn default_column_validator<T: ColumnType>(_: &Vec<T>, _: &Vec<T>) -> bool {
    true
}

/// The strict validator checks:
/// - the number of columns is as expected
/// - each column has the same type as expected
#[allow(clippy::ptr_arg)]
pub fn strict_column_validator<T: ColumnType>(actual: &Vec<T>, expected: &Vec<T>) -> bool {
    actual.len() == expected.len()
        && !actual
            .iter()
            .zip(expected.iter())
            .any(|(actual_column, expected_column)| actual_column.to_char() != expected_column.to_char())
}

/// Selects the `query` and `explain` cases to run by their name.
///
/// The name of a case is `file:line`, followed by its subtest and its query label, if any.
/// Statements always run, so that the selected cases see the effects of all statements before them.
#[derive(Debug, Clone)]
pub struct CaseFilter(Regex);

impl CaseFilter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self)
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.0.is_match(name)
    }
}

impl FromStr for CaseFilter {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Returns the name the [`CaseFilter`] matches a case against.
pub fn case_name(loc: &Location, subtest: Option<&str>, label: Option<&str>) -> String {
    let mut name = loc.to_string();
    for part in [subtest, label].into_iter().flatten() {
        name.push(' ');
        name.push_str(part);
    }
    name
}

/// Test runner.
pub struct Runner<D: AsyncDB, M: MakeConnection> {
    conn: Connections<D, M>,
    column_type_validator: ColumnTypeValidator<D::ColumnType>,
    normalizer: Normalizer,
    substitution: Option<Substitution>,
    sort_mode: Option<SortMode>,
    /// 0 means never hashing
    hash_threshold: usize,
    /// Labels for condition `skipif` and `onlyif`.
    labels: HashSet<String>,
    timeout: Option<Duration>,
    filter: Option<CaseFilter>,
}

impl<D: AsyncDB, M: MakeConnection<Conn = D>> Runner<D, M> {
    /// Create a new test runner on the database, with the given connection maker.
    ///
    /// See [`MakeConnection`] for more details.
    pub fn new(make_conn: M) -> Self {
        Runner {
            column_type_validator: default_column_validator,
            normalizer: Normalizer::default(),
            substitution: None,
            sort_mode: None,
            hash_threshold: 0,
            labels: HashSet::new(),
            timeout: None,
            filter: None,
            conn: Connections::new(make_conn),
        }
    }

    /// Add a label for condition `skipif` and `onlyif`.
    pub fn add_label(&mut self, label: &str) {
        self.labels.insert(label.to_string());
    }

    pub fn with_column_validator(&mut self, validator: ColumnTypeValidator<D::ColumnType>) {
        self.column_type_validator = validator;
    }

    pub fn with_hash_threshold(&mut self, hash_threshold: usize) {
        self.hash_threshold = hash_threshold;
    }

    pub fn with_normalizer(&mut self, normalizer: Normalizer) {
        self.normalizer = normalizer;
    }

    /// Cases running longer than `timeout` are recorded as errored.
    pub fn with_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn with_filter(&mut self, filter: CaseFilter) {
        self.filter = Some(filter);
    }

    pub(crate) fn comparator(&self) -> Comparator<'_, D::ColumnType> {
        Comparator {
            normalizer: &self.normalizer,
            column_type_validator: self.column_type_validator,
            sort_mode: self.sort_mode,
            hash_threshold: self.hash_threshold,
        }
    }

    pub async fn apply_record(
        &mut self,
        record: Record<D::ColumnType>,
    ) -> RecordOutput<D::ColumnType> {
        tracing::debug!(?record, "testing");

        match record {
            Record::Statement {
                conditions,
                connection,
                sql,
                ..
            } => {
                self.execute(RecordKind::Statement, &conditions, connection, sql)
                    .await
            }
            Record::Query {
                conditions,
                connection,
                sql,
                ..
            } => {
                self.execute(RecordKind::Query, &conditions, connection, sql)
                    .await
            }
            Record::Explain {
                conditions,
                connection,
                sql,
                ..
            } => {
                self.execute(RecordKind::Explain, &conditions, connection, sql)
                    .await
            }
            Record::Sleep { duration, .. } => {
                D::sleep(duration).await;
                RecordOutput::Nothing
            }
            Record::Control(control) => {
                match control {
                    Control::SortMode(sort_mode) => {
                        self.sort_mode = Some(sort_mode);
                    }
                    Control::Substitution(on_off) => match (&mut self.substitution, on_off) {
                        (s @ None, true) => {
                            *s = Some(Substitution::new(self.normalizer.tokens().clone()))
                        }
                        (s @ Some(_), false) => *s = None,
                        _ => {}
                    },
                }

                RecordOutput::Nothing
            }
            Record::HashThreshold { loc: _, threshold } => {
                self.hash_threshold = threshold as usize;
                RecordOutput::Nothing
            }
            Record::Halt { .. }
            | Record::Disabled { .. }
            | Record::Newline
            | Record::Comment(_)
            | Record::Subtest { .. }
            | Record::Condition(_)
            | Record::Connection(_) => RecordOutput::Nothing,
        }
    }

    /// Sends `sql` to the engine, bounded by the case timeout.
    async fn execute(
        &mut self,
        kind: RecordKind,
        conditions: &[Condition],
        connection: Connection,
        sql: String,
    ) -> RecordOutput<D::ColumnType> {
        /// Returns whether we should skip this record, according to given `conditions`.
        fn should_skip(
            labels: &HashSet<String>,
            engine_name: &str,
            conditions: &[Condition],
        ) -> bool {
            conditions.iter().any(|c| {
                c.should_skip(
                    labels
                        .iter()
                        .map(|l| l.as_str())
                        // attach the engine name to the labels
                        .chain(Some(engine_name).filter(|n| !n.is_empty())),
                )
            })
        }

        let sql = match self.may_substitute(&sql) {
            Ok(sql) => sql,
            Err(err) => return RecordOutput::Errored(TestErrorKind::Substitution { sql, err }),
        };

        let timeout = self.timeout;
        let conn = match self.conn.get(connection.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                return RecordOutput::Errored(TestErrorKind::Transport {
                    sql,
                    err: Arc::new(e),
                    kind,
                })
            }
        };
        if should_skip(&self.labels, conn.engine_name(), conditions) {
            return RecordOutput::Nothing;
        }

        let result = match timeout {
            None => Some(conn.run(&sql).await),
            Some(timeout) => match future::select(conn.run(&sql), Delay::new(timeout)).await {
                Either::Left((result, _)) => Some(result),
                Either::Right(_) => None,
            },
        };
        let Some(result) = result else {
            // A late answer to the abandoned SQL must never reach the next case.
            tracing::warn!(%sql, ?timeout, ?connection, "case timed out, dropping the connection");
            self.conn.remove(&connection);
            return RecordOutput::Errored(TestErrorKind::Timeout {
                sql,
                timeout: timeout.unwrap_or_default(),
                kind,
            });
        };

        match result {
            Ok(DBOutput::Rows { types, rows }) => RecordOutput::Query {
                types,
                rows,
                error: None,
            },
            Ok(DBOutput::StatementComplete(count)) => {
                RecordOutput::Statement { count, error: None }
            }
            Ok(DBOutput::Plan { sections }) => RecordOutput::Explain {
                sections,
                error: None,
            },
            Err(e) if D::is_transport_error(&e) => {
                tracing::warn!(%sql, error = %e, "engine transport failure");
                RecordOutput::Errored(TestErrorKind::Transport {
                    sql,
                    err: Arc::new(e),
                    kind,
                })
            }
            Err(e) => {
                let error: Option<AnyError> = Some(Arc::new(e));
                match kind {
                    RecordKind::Statement => RecordOutput::Statement { count: 0, error },
                    RecordKind::Query => RecordOutput::Query {
                        types: vec![],
                        rows: vec![],
                        error,
                    },
                    RecordKind::Explain => RecordOutput::Explain {
                        sections: vec![],
                        error,
                    },
                }
            }
        }
    }

    /// Run a single record.
    ///
    /// Returns the output of the record if it matches the expectation.
    pub async fn run_async(
        &mut self,
        record: Record<D::ColumnType>,
    ) -> Result<RecordOutput<D::ColumnType>, TestError> {
        let output = self.apply_record(record.clone()).await;
        self.comparator().check(&record, &output)?;
        Ok(output)
    }

    /// Run a single record.
    ///
    /// Returns the output of the record if successful.
    pub fn run(
        &mut self,
        record: Record<D::ColumnType>,
    ) -> Result<RecordOutput<D::ColumnType>, TestError> {
        block_on(self.run_async(record))
    }

    /// Run the records of one file in order, recording a verdict for every case.
    ///
    /// A failing case never stops the run. After a `halt` record the remaining cases are skipped.
    pub async fn run_records_async(
        &mut self,
        file: &str,
        records: Vec<Record<D::ColumnType>>,
    ) -> FileReport {
        self.drive(file, records, |_, _, _, _| {}).await
    }

    /// Runs `records` like [`Runner::run_records_async`], handing every executed case to
    /// `observe` along with its index in `records`.
    pub(crate) async fn drive(
        &mut self,
        file: &str,
        records: Vec<Record<D::ColumnType>>,
        mut observe: impl FnMut(usize, &Record<D::ColumnType>, &RecordOutput<D::ColumnType>, &Verdict),
    ) -> FileReport {
        let mut report = FileReport::new(file);
        let mut subtest: Option<String> = None;
        let mut halted = false;

        for (idx, record) in records.into_iter().enumerate() {
            match &record {
                Record::Disabled { .. } => {
                    report.disabled += 1;
                    continue;
                }
                Record::Halt { loc } if !halted => {
                    tracing::warn!(%loc, "halt record encountered, skipping the rest of the file");
                    halted = true;
                    continue;
                }
                Record::Subtest { name, .. } => subtest = Some(name.clone()),
                _ => {}
            }

            let Some(kind) = RecordKind::of(&record) else {
                if !halted {
                    self.apply_record(record).await;
                }
                continue;
            };
            let (loc, label) = match &record {
                Record::Query {
                    loc,
                    expected: QueryExpect::Results { label, .. },
                    ..
                } => (loc.clone(), label.as_deref()),
                Record::Statement { loc, .. }
                | Record::Query { loc, .. }
                | Record::Explain { loc, .. } => (loc.clone(), None),
                _ => continue,
            };
            let name = case_name(&loc, subtest.as_deref(), label);
            let selected = kind == RecordKind::Statement
                || self.filter.as_ref().map_or(true, |f| f.is_match(&name));

            let verdict = if halted || !selected {
                Verdict::Skipped
            } else {
                let output = self.apply_record(record.clone()).await;
                let verdict = match (&output, self.comparator().check(&record, &output)) {
                    (RecordOutput::Nothing, _) => Verdict::Skipped,
                    (_, Ok(())) => Verdict::Pass,
                    (_, Err(e)) if e.is_errored() => Verdict::Errored(e),
                    (_, Err(e)) => Verdict::Fail(e),
                };
                observe(idx, &record, &output, &verdict);
                verdict
            };
            tracing::debug!(%name, verdict = verdict.as_str(), "case finished");
            report.cases.push(CaseReport {
                name,
                kind,
                loc,
                verdict,
            });
        }
        report
    }

    /// Run a script.
    pub async fn run_script_async(&mut self, script: &str) -> Result<FileReport, ParseError> {
        self.run_script_with_name_async(script, "<unknown>").await
    }

    /// Run a script with a given script name.
    pub async fn run_script_with_name_async(
        &mut self,
        script: &str,
        name: impl Into<Arc<str>>,
    ) -> Result<FileReport, ParseError> {
        let name = name.into();
        let records = parse_with_name(script, name.clone())?;
        Ok(self.run_records_async(&name, records).await)
    }

    /// Run a test file. A file that fails to parse is not executed at all.
    pub async fn run_file_async(
        &mut self,
        filename: impl AsRef<Path>,
    ) -> Result<FileReport, ParseError> {
        let filename = filename.as_ref();
        let records = parse_file(filename)?;
        Ok(self
            .run_records_async(&filename.to_string_lossy(), records)
            .await)
    }

    /// Run a script.
    pub fn run_script(&mut self, script: &str) -> Result<FileReport, ParseError> {
        block_on(self.run_script_async(script))
    }

    /// Run a test file.
    pub fn run_file(&mut self, filename: impl AsRef<Path>) -> Result<FileReport, ParseError> {
        block_on(self.run_file_async(filename))
    }

    /// Substitute the input SQL with [`Substitution`], if enabled by `control substitution`.
    ///
    /// We use the `subst` crate to support extensive substitutions, incl. `$NAME`, `${NAME}`,
    /// `${NAME:default}`. The cost is that we will have to use escape characters, e.g., `\$` & `\\`.
    fn may_substitute(&self, input: &str) -> Result<String, AnyError> {
        if let Some(substitution) = &self.substitution {
            substitution
                .substitute(input)
                .map_err(|e| Arc::new(e) as AnyError)
        } else {
            Ok(input.to_string())
        }
    }
}
