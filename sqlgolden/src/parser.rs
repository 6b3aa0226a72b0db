//! Test file parser.

use std::fmt;
use std::iter::Peekable;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use regex::Regex;

use crate::plan::{is_section_header, PlanSection};
use crate::{CellKind, ColumnType};

pub(crate) const RESULTS_DELIMITER: &str = "----";

/// The location in source file.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Location {
    file: Arc<str>,
    line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl Location {
    pub fn new(file: impl Into<Arc<str>>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// File path.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Line number, starting from 1.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Returns the location of next line.
    #[must_use]
    fn next_line(mut self) -> Self {
        self.line += 1;
        self
    }

    /// Returns the location of the line with the given 0-based index.
    fn at_index(&self, index: usize) -> Self {
        Self {
            file: self.file.clone(),
            line: index as u32 + 1,
        }
    }
}

/// Expectation for a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementExpect {
    /// Statement should succeed.
    Ok,
    /// Statement should succeed and affect the given number of rows.
    Count(u64),
    /// Statement should fail with the given error message.
    Error(ExpectedError),
}

/// Expectation for a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryExpect<T: ColumnType> {
    /// Query should succeed and return the given results.
    Results {
        types: Vec<T>,
        sort_mode: Option<SortMode>,
        label: Option<String>,
        /// `None` when the query has no `----` separator: only success is checked. `Some` of an
        /// empty block expects an empty result set.
        results: Option<Vec<String>>,
    },
    /// Query should fail with the given error message.
    Error(ExpectedError),
}

#[cfg(test)]
impl<T: ColumnType> QueryExpect<T> {
    /// Creates a new [`QueryExpect`] with empty results.
    fn empty_results() -> Self {
        Self::Results {
            types: Vec::new(),
            sort_mode: None,
            label: None,
            results: Some(Vec::new()),
        }
    }
}

/// Expectation for an `explain` case.
#[derive(Debug, Clone, PartialEq)]
pub enum ExplainExpect {
    /// The plan should be produced and match the given sections. `None` when there is no `----`
    /// separator.
    Plan(Option<Vec<PlanSection>>),
    /// Planning should fail with the given error message.
    Error(ExpectedError),
}

/// A single directive in a test file.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Record<T: ColumnType> {
    /// A statement is an SQL command that is to be evaluated but from which we do not expect to
    /// get results (other than success or failure).
    Statement {
        loc: Location,
        conditions: Vec<Condition>,
        connection: Connection,
        /// The SQL command.
        sql: String,
        expected: StatementExpect,
    },
    /// A query is an SQL command from which we expect to receive results. The result set might be
    /// empty.
    Query {
        loc: Location,
        conditions: Vec<Condition>,
        connection: Connection,
        /// The SQL command.
        sql: String,
        expected: QueryExpect<T>,
    },
    /// An SQL command whose plan is compared section by section.
    Explain {
        loc: Location,
        conditions: Vec<Condition>,
        connection: Connection,
        sql: String,
        expected: ExplainExpect,
    },
    /// A commented out case, kept verbatim and never executed.
    Disabled {
        loc: Location,
        /// The header line without its `#`, e.g. `query T`.
        header: String,
        /// The following lines without their `#`.
        body: Vec<String>,
    },
    /// A sleep period.
    Sleep {
        loc: Location,
        duration: Duration,
    },
    /// Subtest.
    Subtest {
        loc: Location,
        name: String,
    },
    /// A halt record causes the runner to skip the rest of the test file.
    /// For debugging use only.
    Halt {
        loc: Location,
    },
    /// Control statements.
    Control(Control),
    /// Set the maximum number of result values that will be accepted
    /// for a query.  If the number of result values exceeds this number,
    /// then an MD5 hash is computed of all values, and the resulting hash
    /// is the only result.
    ///
    /// If the threshold is 0, then hashing is never used.
    HashThreshold {
        loc: Location,
        threshold: u64,
    },
    /// Condition statements, including `onlyif` and `skipif`.
    Condition(Condition),
    /// Connection statements to specify the connection to use for the following statement.
    Connection(Connection),
    /// Comment and provenance lines (`##`), without their leading `#`.
    Comment(Vec<String>),
    Newline,
}

impl<T: ColumnType> Record<T> {
    /// Unparses the record to its string representation in the test file.
    pub fn unparse(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        write!(w, "{self}")
    }

    /// The location of records that carry one.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Record::Statement { loc, .. }
            | Record::Query { loc, .. }
            | Record::Explain { loc, .. }
            | Record::Disabled { loc, .. }
            | Record::Sleep { loc, .. }
            | Record::Subtest { loc, .. }
            | Record::Halt { loc }
            | Record::HashThreshold { loc, .. } => Some(loc),
            Record::Control(_)
            | Record::Condition(_)
            | Record::Connection(_)
            | Record::Comment(_)
            | Record::Newline => None,
        }
    }
}

/// As is the standard for Display, does not print any trailing
/// newline except for records that always end with a blank line such
/// as Query, Statement and Explain.
impl<T: ColumnType> std::fmt::Display for Record<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Statement { sql, expected, .. } => {
                write!(f, "statement ")?;
                match expected {
                    StatementExpect::Ok => write!(f, "ok")?,
                    StatementExpect::Count(cnt) => write!(f, "count {cnt}")?,
                    StatementExpect::Error(err) => err.fmt_inline(f)?,
                }
                writeln!(f)?;
                // statement always end with a blank line
                writeln!(f, "{sql}")?;

                if let StatementExpect::Error(err) = expected {
                    err.fmt_multiline(f)?;
                }
                Ok(())
            }
            Record::Query { sql, expected, .. } => {
                write!(f, "query ")?;
                match expected {
                    QueryExpect::Results {
                        types,
                        sort_mode,
                        label,
                        ..
                    } => {
                        write!(f, "{}", types.iter().map(|c| c.to_char()).join(""))?;
                        if let Some(sort_mode) = sort_mode {
                            write!(f, " {}", sort_mode.as_str())?;
                        }
                        if let Some(label) = label {
                            write!(f, " {label}")?;
                        }
                    }
                    QueryExpect::Error(err) => err.fmt_inline(f)?,
                }
                writeln!(f)?;
                writeln!(f, "{sql}")?;

                match expected {
                    QueryExpect::Results {
                        results: Some(results),
                        ..
                    } => {
                        write!(f, "{RESULTS_DELIMITER}")?;
                        for result in results {
                            write!(f, "\n{result}")?;
                        }
                        // query always ends with a blank line
                        writeln!(f)?
                    }
                    QueryExpect::Results { results: None, .. } => {}
                    QueryExpect::Error(err) => err.fmt_multiline(f)?,
                }
                Ok(())
            }
            Record::Explain { sql, expected, .. } => {
                write!(f, "explain")?;
                if let ExplainExpect::Error(err) = expected {
                    write!(f, " ")?;
                    err.fmt_inline(f)?;
                }
                writeln!(f)?;
                writeln!(f, "{sql}")?;

                match expected {
                    ExplainExpect::Plan(Some(sections)) => {
                        write!(f, "{RESULTS_DELIMITER}")?;
                        for section in sections {
                            write!(f, "\n{section}")?;
                        }
                        writeln!(f)?
                    }
                    ExplainExpect::Plan(None) => {}
                    ExplainExpect::Error(err) => err.fmt_multiline(f)?,
                }
                Ok(())
            }
            Record::Disabled { header, body, .. } => {
                write!(f, "#{}", header.trim_end())?;
                for line in body {
                    write!(f, "\n#{}", line.trim_end())?;
                }
                Ok(())
            }
            Record::Sleep { duration, .. } => {
                write!(f, "sleep {}", humantime::format_duration(*duration))
            }
            Record::Subtest { name, .. } => {
                write!(f, "subtest {name}")
            }
            Record::Halt { .. } => {
                write!(f, "halt")
            }
            Record::Control(c) => match c {
                Control::SortMode(m) => write!(f, "control sortmode {}", m.as_str()),
                Control::Substitution(s) => write!(f, "control substitution {}", s.as_str()),
            },
            Record::Condition(cond) => match cond {
                Condition::OnlyIf { label } => write!(f, "onlyif {label}"),
                Condition::SkipIf { label } => write!(f, "skipif {label}"),
            },
            Record::Connection(conn) => {
                if let Connection::Named(conn) = conn {
                    write!(f, "connection {}", conn)?;
                }
                Ok(())
            }
            Record::HashThreshold { threshold, .. } => {
                write!(f, "hash-threshold {threshold}")
            }
            Record::Comment(comment) => {
                let mut first = true;
                for line in comment {
                    if !first {
                        writeln!(f)?;
                    }
                    first = false;
                    write!(f, "#{}", line.trim_end())?;
                }
                Ok(())
            }
            Record::Newline => Ok(()), // Display doesn't end with newline
        }
    }
}

/// Expected error message after `error` or under `----`.
#[derive(Debug, Clone)]
pub enum ExpectedError {
    /// No expected error message.
    ///
    /// Any error message is considered as a match.
    Empty,
    /// An inline regular expression after `error`.
    ///
    /// The actual error message that matches the regex is considered as a match.
    Inline(Regex),
    /// A multiline error message under `----`, ends with 2 consecutive empty lines.
    ///
    /// The actual error message that's exactly the same as the expected one is considered as a
    /// match.
    Multiline(String),
}

impl ExpectedError {
    /// Parses an inline regex variant from tokens.
    fn parse_inline_tokens(tokens: &[&str]) -> Result<Self, ParseErrorKind> {
        Self::new_inline(tokens.join(" "))
    }

    /// Creates an inline expected error message from a regex string.
    ///
    /// If the regex is empty, it's considered as [`ExpectedError::Empty`].
    fn new_inline(regex: String) -> Result<Self, ParseErrorKind> {
        if regex.is_empty() {
            Ok(Self::Empty)
        } else {
            let regex =
                Regex::new(&regex).map_err(|_| ParseErrorKind::InvalidErrorMessage(regex))?;
            Ok(Self::Inline(regex))
        }
    }

    /// Returns whether it's an empty match.
    fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Unparses the expected message after `statement`.
    fn fmt_inline(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error")?;
        if let Self::Inline(regex) = self {
            write!(f, " {regex}")?;
        }
        Ok(())
    }

    /// Unparses the expected message with `----`, if it's multiline.
    fn fmt_multiline(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Self::Multiline(results) = self {
            writeln!(f, "{}", RESULTS_DELIMITER)?;
            writeln!(f, "{}", results.trim())?;
            writeln!(f)?; // another empty line to indicate the end of multiline message
        }
        Ok(())
    }

    /// Returns whether the given error message matches the expected one.
    pub fn is_match(&self, err: &str) -> bool {
        match self {
            Self::Empty => true,
            Self::Inline(regex) => regex.is_match(err),
            Self::Multiline(results) => results.trim() == err.trim(),
        }
    }

    /// Creates an expected error message from the actual error message. Used by the rewriter
    /// to regenerate failing cases.
    ///
    /// A reference might be provided to help decide whether to use inline or multiline.
    pub fn from_actual_error(reference: Option<&Self>, actual_err: &str) -> Self {
        let trimmed_err = actual_err.trim();
        let err_is_multiline = trimmed_err.lines().next_tuple::<(_, _)>().is_some();

        let multiline = match reference {
            Some(Self::Multiline(_)) => true, // always multiline if the ref is multiline
            _ => err_is_multiline,            // prefer inline as long as it fits
        };

        if multiline {
            // Even if the actual error is empty, we still use `Multiline` to indicate that
            // an exact empty error is expected, instead of any error by `Empty`.
            Self::Multiline(trimmed_err.to_string())
        } else if trimmed_err.is_empty() {
            Self::Empty
        } else {
            match Regex::new(&regex::escape(actual_err)) {
                Ok(regex) => Self::Inline(regex),
                Err(_) => Self::Multiline(trimmed_err.to_string()),
            }
        }
    }
}

impl std::fmt::Display for ExpectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedError::Empty => write!(f, "(any)"),
            ExpectedError::Inline(regex) => write!(f, "(regex) {}", regex),
            ExpectedError::Multiline(results) => write!(f, "(multiline) {}", results.trim()),
        }
    }
}

impl PartialEq for ExpectedError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Empty, Self::Empty) => true,
            (Self::Inline(l0), Self::Inline(r0)) => l0.as_str() == r0.as_str(),
            (Self::Multiline(l0), Self::Multiline(r0)) => l0 == r0,
            _ => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Control {
    /// Control sort mode.
    SortMode(SortMode),
    /// Control whether or not to substitute variables in the SQL.
    Substitution(bool),
}

trait ControlItem: Sized {
    /// Try to parse from string.
    fn try_from_str(s: &str) -> Result<Self, ParseErrorKind>;

    /// Convert to string.
    fn as_str(&self) -> &'static str;
}

impl ControlItem for bool {
    fn try_from_str(s: &str) -> Result<Self, ParseErrorKind> {
        match s {
            "on" => Ok(true),
            "off" => Ok(false),
            _ => Err(ParseErrorKind::InvalidControl(s.to_string())),
        }
    }

    fn as_str(&self) -> &'static str {
        if *self {
            "on"
        } else {
            "off"
        }
    }
}

/// The condition to run a case.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Condition {
    /// The case is evaluated only if the label is seen.
    OnlyIf { label: String },
    /// The case is not evaluated if the label is seen.
    SkipIf { label: String },
}

impl Condition {
    /// Evaluate condition on given `label`, returns whether to skip this record.
    pub(crate) fn should_skip<'a>(&'a self, labels: impl IntoIterator<Item = &'a str>) -> bool {
        match self {
            Condition::OnlyIf { label } => !labels.into_iter().contains(&label.as_str()),
            Condition::SkipIf { label } => labels.into_iter().contains(&label.as_str()),
        }
    }
}

/// The connection to use for the following statement.
#[derive(Default, Debug, PartialEq, Eq, Hash, Clone)]
pub enum Connection {
    /// The default connection if not specified or if the name is "default".
    #[default]
    Default,
    /// A named connection.
    Named(String),
}

impl Connection {
    fn new(name: impl AsRef<str>) -> Self {
        match name.as_ref() {
            "default" => Self::Default,
            name => Self::Named(name.to_owned()),
        }
    }
}

/// Whether to apply sorting before checking the results of a query.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SortMode {
    /// The default option. The results appear in exactly the order in which they were received
    /// from the database engine.
    NoSort,
    /// Gathers all output from the database engine then sorts it by rows.
    RowSort,
    /// It works like rowsort except that it does not honor row groupings. Each individual result
    /// value is sorted on its own.
    ValueSort,
}

impl ControlItem for SortMode {
    fn try_from_str(s: &str) -> Result<Self, ParseErrorKind> {
        match s {
            "nosort" => Ok(Self::NoSort),
            "rowsort" => Ok(Self::RowSort),
            "valuesort" => Ok(Self::ValueSort),
            _ => Err(ParseErrorKind::InvalidSortMode(s.to_string())),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::NoSort => "nosort",
            Self::RowSort => "rowsort",
            Self::ValueSort => "valuesort",
        }
    }
}

/// The error type for parsing test files.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
#[error("parse error at {loc}: {kind}")]
pub struct ParseError {
    kind: ParseErrorKind,
    loc: Location,
}

impl ParseError {
    /// Returns the corresponding [`ParseErrorKind`] for this error.
    pub fn kind(&self) -> ParseErrorKind {
        self.kind.clone()
    }

    /// Returns the location from which the error originated.
    pub fn location(&self) -> Location {
        self.loc.clone()
    }
}

/// The error kind for parsing test files.
#[derive(thiserror::Error, Debug, Eq, PartialEq, Clone)]
#[non_exhaustive]
pub enum ParseErrorKind {
    #[error("unexpected token: {0:?}")]
    UnexpectedToken(String),
    #[error("unexpected EOF")]
    UnexpectedEOF,
    #[error("missing SQL after the case header")]
    EmptySql,
    #[error("invalid sort mode: {0:?}")]
    InvalidSortMode(String),
    #[error("invalid line: {0:?}")]
    InvalidLine(String),
    #[error("invalid type character: {0:?} in type string")]
    InvalidType(char),
    #[error("invalid number: {0:?}")]
    InvalidNumber(String),
    #[error("invalid error message: {0:?}")]
    InvalidErrorMessage(String),
    #[error("duplicated error messages after error` and under `----`")]
    DuplicatedErrorMessage,
    #[error("statement should have no result, use `query` instead")]
    StatementHasResults,
    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),
    #[error("invalid control: {0:?}")]
    InvalidControl(String),
    #[error("result row {row:?} does not match the {columns} column(s) of the type string")]
    InvalidResultRow { row: String, columns: usize },
    #[error("plan line outside of a plan section: {0:?}")]
    PlanLineOutsideSection(String),
    #[error("no such file")]
    FileNotFound,
    #[error("failed to read file: {0}")]
    Unreadable(String),
}

impl ParseErrorKind {
    fn at(self, loc: Location) -> ParseError {
        ParseError { kind: self, loc }
    }
}

/// A record with the 0-based range of source lines it was parsed from.
///
/// Trailing blank lines are not part of the range.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T: ColumnType> {
    pub record: Record<T>,
    pub lines: Range<usize>,
}

/// Parse a script into a list of records.
pub fn parse<T: ColumnType>(script: &str) -> Result<Vec<Record<T>>, ParseError> {
    parse_with_name(script, "<unknown>")
}

/// Parse a script into a list of records with a given script name.
pub fn parse_with_name<T: ColumnType>(
    script: &str,
    name: impl Into<Arc<str>>,
) -> Result<Vec<Record<T>>, ParseError> {
    Ok(parse_spanned(script, name)?
        .into_iter()
        .map(|s| s.record)
        .collect())
}

/// Parse a script, keeping the source lines of every record.
pub fn parse_spanned<T: ColumnType>(
    script: &str,
    name: impl Into<Arc<str>>,
) -> Result<Vec<Spanned<T>>, ParseError> {
    parse_inner(&Location::new(name, 0), script)
}

/// Parse a test file.
pub fn parse_file<T: ColumnType>(filename: impl AsRef<Path>) -> Result<Vec<Record<T>>, ParseError> {
    let (name, script) = read_script(filename.as_ref())?;
    parse_with_name(&script, name)
}

/// Reads a test file, returning its name for locations and its content.
pub(crate) fn read_script(path: &Path) -> Result<(Arc<str>, String), ParseError> {
    let name: Arc<str> = path.to_string_lossy().into();
    let loc = Location::new(name.clone(), 0);
    if !path.exists() {
        return Err(ParseErrorKind::FileNotFound.at(loc));
    }
    let script = fs_err::read_to_string(path)
        .map_err(|e| ParseErrorKind::Unreadable(e.to_string()).at(loc))?;
    Ok((name, script))
}

#[allow(clippy::collapsible_match)]
fn parse_inner<T: ColumnType>(loc: &Location, script: &str) -> Result<Vec<Spanned<T>>, ParseError> {
    let raw: Vec<&str> = script.lines().collect();
    let mut lines = raw.iter().copied().enumerate().peekable();
    let mut records = vec![];
    let mut conditions = vec![];
    let mut connection = Connection::Default;
    let mut comments = vec![];
    let mut comments_start = 0;
    // file-level sort mode, needed to validate result rows
    let mut file_sort_mode = None;

    while let Some((num, line)) = lines.next() {
        if let Some(text) = line.strip_prefix('#') {
            if !is_disabled_header(text) {
                if comments.is_empty() {
                    comments_start = num;
                }
                comments.push(text.to_string());
                continue;
            }
            if !comments.is_empty() {
                records.push(Spanned {
                    record: Record::Comment(std::mem::take(&mut comments)),
                    lines: comments_start..num,
                });
            }
            let mut body = vec![];
            while let Some(&(_, next)) = lines.peek() {
                match next.strip_prefix('#') {
                    Some(text) if !text.starts_with('#') && !is_disabled_header(text) => {
                        body.push(text.to_string());
                        lines.next();
                    }
                    _ => break,
                }
            }
            records.push(Spanned {
                record: Record::Disabled {
                    loc: loc.at_index(num),
                    header: text.to_string(),
                    body,
                },
                lines: num..span_end(&raw, num, &mut lines),
            });
            continue;
        }
        if !comments.is_empty() {
            records.push(Spanned {
                record: Record::Comment(std::mem::take(&mut comments)),
                lines: comments_start..num,
            });
        }

        if line.is_empty() {
            records.push(Spanned {
                record: Record::Newline,
                lines: num..num + 1,
            });
            continue;
        }

        let loc = loc.at_index(num);

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let record = match tokens.as_slice() {
            [] => continue,
            ["halt"] => Record::Halt { loc },
            ["subtest", name] => Record::Subtest {
                loc,
                name: name.to_string(),
            },
            ["sleep", dur] => Record::Sleep {
                duration: humantime::parse_duration(dur).map_err(|_| {
                    ParseErrorKind::InvalidDuration(dur.to_string()).at(loc.clone())
                })?,
                loc,
            },
            ["skipif", label] => {
                let cond = Condition::SkipIf {
                    label: label.to_string(),
                };
                conditions.push(cond.clone());
                Record::Condition(cond)
            }
            ["onlyif", label] => {
                let cond = Condition::OnlyIf {
                    label: label.to_string(),
                };
                conditions.push(cond.clone());
                Record::Condition(cond)
            }
            ["connection", name] => {
                let conn = Connection::new(name);
                connection = conn.clone();
                Record::Connection(conn)
            }
            ["statement", res @ ..] => {
                let mut expected = match res {
                    ["ok"] => StatementExpect::Ok,
                    ["error", tokens @ ..] => {
                        let error = ExpectedError::parse_inline_tokens(tokens)
                            .map_err(|e| e.at(loc.clone()))?;
                        StatementExpect::Error(error)
                    }
                    ["count", count_str] => {
                        let count = count_str.parse::<u64>().map_err(|_| {
                            ParseErrorKind::InvalidNumber((*count_str).into()).at(loc.clone())
                        })?;
                        StatementExpect::Count(count)
                    }
                    _ => return Err(ParseErrorKind::InvalidLine(line.into()).at(loc)),
                };
                let (sql, has_results) = parse_lines(&mut lines, &loc, Some(RESULTS_DELIMITER))?;
                if has_results {
                    if let StatementExpect::Error(e) = &mut expected {
                        // If no inline error message is specified, it might be a multiline error.
                        if e.is_empty() {
                            *e = parse_multiline_error(&mut lines);
                        } else {
                            return Err(ParseErrorKind::DuplicatedErrorMessage.at(loc.clone()));
                        }
                    } else {
                        return Err(ParseErrorKind::StatementHasResults.at(loc.clone()));
                    }
                }
                Record::Statement {
                    loc,
                    conditions: std::mem::take(&mut conditions),
                    connection: std::mem::take(&mut connection),
                    sql,
                    expected,
                }
            }
            ["query", res @ ..] => {
                let mut expected = match res {
                    ["error", tokens @ ..] => {
                        let error = ExpectedError::parse_inline_tokens(tokens)
                            .map_err(|e| e.at(loc.clone()))?;
                        QueryExpect::Error(error)
                    }
                    [type_str, res @ ..] => {
                        let types = type_str
                            .chars()
                            .map(|ch| {
                                T::from_char(ch)
                                    .ok_or_else(|| ParseErrorKind::InvalidType(ch).at(loc.clone()))
                            })
                            .try_collect()?;
                        let sort_mode = res
                            .first()
                            .map(|&s| SortMode::try_from_str(s))
                            .transpose()
                            .map_err(|e| e.at(loc.clone()))?;
                        let label = res.get(1).map(|s| s.to_string());
                        QueryExpect::Results {
                            types,
                            sort_mode,
                            label,
                            results: None,
                        }
                    }
                    [] => QueryExpect::Results {
                        types: Vec::new(),
                        sort_mode: None,
                        label: None,
                        results: None,
                    },
                };

                // The SQL for the query is found on second and subsequent lines of the record
                // up to first line of the form "----" or until the end of the record.
                let (sql, has_result) = parse_lines(&mut lines, &loc, Some(RESULTS_DELIMITER))?;
                if has_result {
                    match &mut expected {
                        // Lines following the "----" are expected results of the query, one row
                        // per line.
                        QueryExpect::Results {
                            types,
                            sort_mode,
                            results,
                            ..
                        } => {
                            let block = parse_block(&mut lines, false);
                            validate_result_rows(
                                types,
                                sort_mode.or(file_sort_mode),
                                &block,
                                &loc,
                            )?;
                            *results = Some(block.into_iter().map(|(_, l)| l.to_string()).collect());
                        }
                        // If no inline error message is specified, it might be a multiline error.
                        QueryExpect::Error(e) => {
                            if e.is_empty() {
                                *e = parse_multiline_error(&mut lines);
                            } else {
                                return Err(ParseErrorKind::DuplicatedErrorMessage.at(loc.clone()));
                            }
                        }
                    }
                }
                Record::Query {
                    loc,
                    conditions: std::mem::take(&mut conditions),
                    connection: std::mem::take(&mut connection),
                    sql,
                    expected,
                }
            }
            ["explain", res @ ..] => {
                let mut expected = match res {
                    [] => ExplainExpect::Plan(None),
                    ["error", tokens @ ..] => {
                        let error = ExpectedError::parse_inline_tokens(tokens)
                            .map_err(|e| e.at(loc.clone()))?;
                        ExplainExpect::Error(error)
                    }
                    _ => return Err(ParseErrorKind::InvalidLine(line.into()).at(loc)),
                };
                let (sql, has_result) = parse_lines(&mut lines, &loc, Some(RESULTS_DELIMITER))?;
                if has_result {
                    match &mut expected {
                        ExplainExpect::Plan(sections) => {
                            *sections = Some(parse_plan_sections(&mut lines, &loc)?);
                        }
                        ExplainExpect::Error(e) => {
                            if e.is_empty() {
                                *e = parse_multiline_error(&mut lines);
                            } else {
                                return Err(ParseErrorKind::DuplicatedErrorMessage.at(loc.clone()));
                            }
                        }
                    }
                }
                Record::Explain {
                    loc,
                    conditions: std::mem::take(&mut conditions),
                    connection: std::mem::take(&mut connection),
                    sql,
                    expected,
                }
            }
            ["control", res @ ..] => match res {
                ["sortmode", sort_mode] => match SortMode::try_from_str(sort_mode) {
                    Ok(sort_mode) => {
                        file_sort_mode = Some(sort_mode);
                        Record::Control(Control::SortMode(sort_mode))
                    }
                    Err(k) => return Err(k.at(loc)),
                },
                ["substitution", on_off] => match bool::try_from_str(on_off) {
                    Ok(on_off) => Record::Control(Control::Substitution(on_off)),
                    Err(k) => return Err(k.at(loc)),
                },
                _ => return Err(ParseErrorKind::InvalidLine(line.into()).at(loc)),
            },
            ["hash-threshold", threshold] => Record::HashThreshold {
                loc: loc.clone(),
                threshold: threshold.parse::<u64>().map_err(|_| {
                    ParseErrorKind::InvalidNumber((*threshold).into()).at(loc.clone())
                })?,
            },
            _ => return Err(ParseErrorKind::InvalidLine(line.into()).at(loc)),
        };
        records.push(Spanned {
            record,
            lines: num..span_end(&raw, num, &mut lines),
        });
    }
    if !comments.is_empty() {
        records.push(Spanned {
            record: Record::Comment(comments),
            lines: comments_start..raw.len(),
        });
    }
    Ok(records)
}

/// Returns whether a line opens a record. Used to end SQL text and expectation blocks that are not
/// followed by a blank line.
fn is_directive_line(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["statement", "ok"] | ["statement", "error", ..] | ["statement", "count", _] => true,
        ["query"] | ["query", "error", ..] => true,
        ["query", types, rest @ ..] => {
            rest.len() <= 2 && types.chars().all(|c| c.is_ascii_uppercase() || c == '?')
        }
        ["explain"] | ["explain", "error", ..] => true,
        ["skipif" | "onlyif" | "connection" | "subtest" | "sleep" | "hash-threshold", _] => true,
        ["halt"] => true,
        ["control", _, _] => true,
        _ => false,
    }
}

/// Returns whether the text of a `#` line is the header of a commented out case.
fn is_disabled_header(text: &str) -> bool {
    matches!(
        text.split_whitespace().next(),
        Some("statement" | "query" | "explain")
    ) && is_directive_line(text)
}

fn is_hash_line(line: &str) -> bool {
    line.contains(" values hashing to ")
}

/// The exclusive end of the record starting at `start`: the next unread line, without trailing
/// blank lines.
fn span_end<'a>(
    raw: &[&str],
    start: usize,
    lines: &mut Peekable<impl Iterator<Item = (usize, &'a str)>>,
) -> usize {
    let mut end = lines.peek().map_or(raw.len(), |(n, _)| *n);
    while end > start + 1 && raw[end - 1].is_empty() {
        end -= 1;
    }
    end
}

/// Parse one or more lines until empty line, a delimiter or the next directive.
fn parse_lines<'a>(
    lines: &mut Peekable<impl Iterator<Item = (usize, &'a str)>>,
    loc: &Location,
    delimiter: Option<&str>,
) -> Result<(String, bool), ParseError> {
    let mut found_delimiter = false;
    let mut out: String = match lines.next() {
        Some((_, "")) => return Err(ParseErrorKind::EmptySql.at(loc.clone().next_line())),
        Some((_, line)) => line.into(),
        None => return Err(ParseErrorKind::UnexpectedEOF.at(loc.clone().next_line())),
    };

    while let Some(&(_, line)) = lines.peek() {
        if line.is_empty() {
            lines.next();
            break;
        }
        if delimiter == Some(line) {
            lines.next();
            found_delimiter = true;
            break;
        }
        if is_directive_line(line) {
            break;
        }
        lines.next();
        out += "\n";
        out += line;
    }

    Ok((out, found_delimiter))
}

/// Parse the lines of an expectation block, until an empty line. With `stop_at_directive`, the
/// next directive line also ends the block.
///
/// Query results only end at an empty line: a row may read like a directive, e.g. `halt`.
fn parse_block<'a>(
    lines: &mut Peekable<impl Iterator<Item = (usize, &'a str)>>,
    stop_at_directive: bool,
) -> Vec<(usize, &'a str)> {
    let mut block = vec![];
    while let Some(&(num, line)) = lines.peek() {
        if line.is_empty() {
            lines.next();
            break;
        }
        if stop_at_directive && is_directive_line(line) {
            break;
        }
        lines.next();
        block.push((num, line));
    }
    block
}

/// Parse the plan sections under `----` of an `explain` case.
fn parse_plan_sections<'a>(
    lines: &mut Peekable<impl Iterator<Item = (usize, &'a str)>>,
    loc: &Location,
) -> Result<Vec<PlanSection>, ParseError> {
    let mut sections: Vec<PlanSection> = vec![];
    for (num, line) in parse_block(lines, true) {
        if is_section_header(line) {
            sections.push(PlanSection::new(line, vec![]));
        } else if let Some(section) = sections.last_mut() {
            section.lines.push(line.to_string());
        } else {
            return Err(ParseErrorKind::PlanLineOutsideSection(line.into()).at(loc.at_index(num)));
        }
    }
    Ok(sections)
}

/// Checks that every result row has as many cells as the type string has columns. Rows with more
/// cells are accepted when a text column may hold whitespace.
fn validate_result_rows<T: ColumnType>(
    types: &[T],
    sort_mode: Option<SortMode>,
    rows: &[(usize, &str)],
    loc: &Location,
) -> Result<(), ParseError> {
    if types.is_empty() || sort_mode == Some(SortMode::ValueSort) {
        return Ok(());
    }
    let has_text = types.iter().any(|t| t.cell_kind() == CellKind::Text);
    for &(num, row) in rows {
        if is_hash_line(row) {
            continue;
        }
        let cells = row.split_whitespace().count();
        if cells < types.len() || (cells > types.len() && !has_text) {
            return Err(ParseErrorKind::InvalidResultRow {
                row: row.to_string(),
                columns: types.len(),
            }
            .at(loc.at_index(num)));
        }
    }
    Ok(())
}

/// Parse multiline output under `----`, ending with 2 consecutive empty lines.
fn parse_multiple_result<'a>(
    lines: &mut Peekable<impl Iterator<Item = (usize, &'a str)>>,
) -> String {
    let mut results = String::new();

    while let Some((_, line)) = lines.next() {
        if line.is_empty() && lines.peek().map_or(true, |(_, l)| l.is_empty()) {
            lines.next();
            break;
        }
        results += line;
        results.push('\n');
    }

    results.trim().to_string()
}

/// Parse multiline error message under `----`.
fn parse_multiline_error<'a>(
    lines: &mut Peekable<impl Iterator<Item = (usize, &'a str)>>,
) -> ExpectedError {
    let lines = parse_multiple_result(lines);
    if lines.is_empty() {
        ExpectedError::Empty
    } else {
        ExpectedError::Multiline(lines)
    }
}
