//! Verdicts of cases and their aggregation over files.

use std::fmt;
use std::ops;

use owo_colors::OwoColorize;

use crate::parser::{Location, ParseError};
use crate::runner::{RecordKind, TestError};

/// The outcome of one case.
#[derive(Debug, Clone)]
pub enum Verdict {
    Pass,
    /// The engine answered, but not as expected.
    Fail(TestError),
    /// Not executed: filtered out, excluded by a condition, or after `halt`.
    Skipped,
    /// The case could not be executed.
    Errored(TestError),
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail(_) => "fail",
            Verdict::Skipped => "skipped",
            Verdict::Errored(_) => "errored",
        }
    }

    pub fn error(&self) -> Option<&TestError> {
        match self {
            Verdict::Fail(e) | Verdict::Errored(e) => Some(e),
            Verdict::Pass | Verdict::Skipped => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaseReport {
    /// `file:line`, followed by the subtest and the query label, if any.
    pub name: String,
    pub kind: RecordKind,
    pub loc: Location,
    pub verdict: Verdict,
}

impl CaseReport {
    pub fn display(&self, colorize: bool) -> CaseReportDisplay<'_> {
        CaseReportDisplay {
            case: self,
            colorize,
        }
    }
}

pub struct CaseReportDisplay<'a> {
    case: &'a CaseReport,
    colorize: bool,
}

impl fmt::Display for CaseReportDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let CaseReport { name, verdict, .. } = self.case;
        let label = verdict.as_str().to_uppercase();
        match (verdict, self.colorize) {
            (Verdict::Fail(_), true) => write!(f, "{} {name}", label.bright_red())?,
            (Verdict::Errored(_), true) => write!(f, "{} {name}", label.bright_yellow())?,
            _ => write!(f, "{label} {name}")?,
        }
        if let Some(error) = verdict.error() {
            write!(f, "\n{}", indent(&error.display(self.colorize).to_string(), 4))?;
        }
        Ok(())
    }
}

/// The verdicts of the cases of one file, in file order.
#[derive(Debug, Clone, Default)]
pub struct FileReport {
    pub file: String,
    pub cases: Vec<CaseReport>,
    /// Number of commented out cases.
    pub disabled: usize,
}

impl FileReport {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Default::default()
        }
    }

    pub fn outcomes(&self) -> Outcomes {
        let mut outcomes = Outcomes {
            disabled: self.disabled,
            ..Default::default()
        };
        for case in &self.cases {
            match case.verdict {
                Verdict::Pass => outcomes.pass += 1,
                Verdict::Fail(_) => outcomes.fail += 1,
                Verdict::Skipped => outcomes.skipped += 1,
                Verdict::Errored(_) => outcomes.errored += 1,
            }
        }
        outcomes
    }

    /// The failed and errored cases.
    pub fn failures(&self) -> impl Iterator<Item = &CaseReport> {
        self.cases.iter().filter(|c| c.verdict.error().is_some())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    pub fn display(&self, colorize: bool) -> FileReportDisplay<'_> {
        FileReportDisplay {
            report: self,
            colorize,
        }
    }
}

pub struct FileReportDisplay<'a> {
    report: &'a FileReport,
    colorize: bool,
}

impl fmt::Display for FileReportDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for case in self.report.failures() {
            writeln!(f, "{}", case.display(self.colorize))?;
        }
        write!(f, "{}: {}", self.report.file, self.report.outcomes())
    }
}

/// Counts of verdicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcomes {
    pub pass: usize,
    pub fail: usize,
    pub skipped: usize,
    pub errored: usize,
    pub disabled: usize,
}

impl ops::AddAssign<Outcomes> for Outcomes {
    fn add_assign(&mut self, rhs: Outcomes) {
        self.pass += rhs.pass;
        self.fail += rhs.fail;
        self.skipped += rhs.skipped;
        self.errored += rhs.errored;
        self.disabled += rhs.disabled;
    }
}

impl fmt::Display for Outcomes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status = if self.any_failed() {
            "FAIL!"
        } else {
            "SUCCESS!"
        };
        write!(
            f,
            "{} pass={} fail={} skipped={} errored={} disabled={} total={}",
            status,
            self.pass,
            self.fail,
            self.skipped,
            self.errored,
            self.disabled,
            self.total(),
        )
    }
}

impl Outcomes {
    pub fn any_failed(&self) -> bool {
        self.fail > 0 || self.errored > 0
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.skipped + self.errored + self.disabled
    }

    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "pass": self.pass,
            "fail": self.fail,
            "skipped": self.skipped,
            "errored": self.errored,
            "disabled": self.disabled,
            "total": self.total(),
        })
    }
}

/// The merged reports of a run over many files.
#[derive(Debug, Default)]
pub struct Summary {
    pub outcomes: Outcomes,
    /// Failed and errored cases, in input file order.
    pub failures: Vec<CaseReport>,
    /// Files that were not executed because they failed to parse.
    pub parse_errors: Vec<ParseError>,
    /// Number of files that were executed.
    pub files: usize,
}

impl Summary {
    pub fn add_file(&mut self, report: FileReport) {
        self.outcomes += report.outcomes();
        self.files += 1;
        self.failures
            .extend(report.cases.into_iter().filter(|c| c.verdict.error().is_some()));
    }

    pub fn add_parse_error(&mut self, err: ParseError) {
        self.parse_errors.push(err);
    }

    pub fn any_failed(&self) -> bool {
        self.outcomes.any_failed() || !self.parse_errors.is_empty()
    }

    pub fn as_json(&self) -> serde_json::Value {
        let mut json = self.outcomes.as_json();
        json["files"] = self.files.into();
        json["parse_errors"] = self
            .parse_errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .into();
        json["failures"] = self
            .failures
            .iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.name,
                    "verdict": c.verdict.as_str(),
                    "error": c.verdict.error().map(|e| e.to_string()),
                })
            })
            .collect::<Vec<_>>()
            .into();
        json
    }

    pub fn display(&self, colorize: bool) -> SummaryDisplay<'_> {
        SummaryDisplay {
            summary: self,
            colorize,
        }
    }
}

pub struct SummaryDisplay<'a> {
    summary: &'a Summary,
    colorize: bool,
}

impl fmt::Display for SummaryDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for err in &self.summary.parse_errors {
            if self.colorize {
                writeln!(f, "{}", err.bright_red())?;
            } else {
                writeln!(f, "{err}")?;
            }
        }
        for case in &self.summary.failures {
            writeln!(f, "{}", case.display(self.colorize))?;
        }
        let mut outcomes = self.summary.outcomes.to_string();
        if !self.summary.parse_errors.is_empty() {
            outcomes = outcomes.replacen("SUCCESS!", "FAIL!", 1);
            outcomes.push_str(&format!(
                " parse-errors={}",
                self.summary.parse_errors.len()
            ));
        }
        write!(f, "{outcomes}")
    }
}

fn indent(s: &str, n: usize) -> String {
    let space = " ".repeat(n);
    let s = s.trim_end().replace('\n', &format!("\n{space}"));
    format!("{space}{s}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_display() {
        let mut outcomes = Outcomes {
            pass: 3,
            skipped: 1,
            disabled: 2,
            ..Default::default()
        };
        assert_eq!(
            outcomes.to_string(),
            "SUCCESS! pass=3 fail=0 skipped=1 errored=0 disabled=2 total=6"
        );

        outcomes += Outcomes {
            errored: 1,
            ..Default::default()
        };
        assert!(outcomes.any_failed());
        assert_eq!(
            outcomes.to_string(),
            "FAIL! pass=3 fail=0 skipped=1 errored=1 disabled=2 total=7"
        );
        assert_eq!(outcomes.as_json()["total"], 7);
    }

    #[test]
    fn test_indent() {
        assert_eq!(indent("a\nb\n", 2), "  a\n  b");
    }
}
