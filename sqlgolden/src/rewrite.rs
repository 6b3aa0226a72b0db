//! Regeneration of test files from actual output.

use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::compare::Comparator;
use crate::normalize::Normalizer;
use crate::parser::*;
use crate::runner::{AsyncDB, ColumnTypeValidator, RecordOutput, Runner, TestError};
use crate::summary::{FileReport, Verdict};
use crate::{ColumnType, MakeConnection};

#[derive(thiserror::Error, Debug)]
pub enum RewriteError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(
        "{file}: {} case(s) could not be executed, the file is left unchanged",
        .errors.len()
    )]
    Errored {
        file: String,
        errors: Vec<TestError>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The result of regenerating one file.
#[derive(Debug)]
pub struct RewriteReport {
    /// Verdicts of the cases before the file was rewritten.
    pub report: FileReport,
    /// Number of cases whose expectation was replaced.
    pub rewritten: usize,
}

/// Updates the expectation of `record` so that it matches `record_output`.
///
/// Returns `None` when the record can not be updated from the output, e.g. when it was skipped.
/// A record whose expectation already holds is returned unchanged. Query results and plans are
/// written normalized, and sorted or hashed the way they are compared.
pub fn update_record_with_output<T: ColumnType>(
    record: &Record<T>,
    record_output: &RecordOutput<T>,
    normalizer: &Normalizer,
    column_type_validator: ColumnTypeValidator<T>,
    file_sort_mode: Option<SortMode>,
    hash_threshold: usize,
) -> Option<Record<T>> {
    let comparator = Comparator {
        normalizer,
        column_type_validator,
        sort_mode: file_sort_mode,
        hash_threshold,
    };
    update_record(record, record_output, &comparator)
}

fn update_record<T: ColumnType>(
    record: &Record<T>,
    record_output: &RecordOutput<T>,
    comparator: &Comparator<'_, T>,
) -> Option<Record<T>> {
    if matches!(
        record_output,
        RecordOutput::Nothing | RecordOutput::Errored(_)
    ) {
        return None;
    }
    if comparator.check(record, record_output).is_ok() {
        return Some(record.clone());
    }

    match (record.clone(), record_output) {
        // statement, query or plan
        (
            Record::Statement {
                sql,
                loc,
                conditions,
                connection,
                expected,
            },
            RecordOutput::Query { error: None, .. } | RecordOutput::Explain { error: None, .. },
        ) => Some(Record::Statement {
            sql,
            loc,
            conditions,
            connection,
            expected: match expected {
                StatementExpect::Error(_) => StatementExpect::Ok,
                expected => expected,
            },
        }),
        // query, statement
        (
            Record::Query {
                sql,
                loc,
                conditions,
                connection,
                expected: _,
            },
            RecordOutput::Statement { error: None, .. },
        ) => Some(Record::Statement {
            sql,
            loc,
            conditions,
            connection,
            expected: StatementExpect::Ok,
        }),
        // statement, statement
        (
            Record::Statement {
                loc,
                conditions,
                connection,
                sql,
                expected,
            },
            RecordOutput::Statement { count, error },
        ) => match (error, expected) {
            // Ok
            (None, expected) => Some(Record::Statement {
                sql,
                loc,
                conditions,
                connection,
                expected: match expected {
                    StatementExpect::Count(_) => StatementExpect::Count(*count),
                    StatementExpect::Error(_) | StatementExpect::Ok => StatementExpect::Ok,
                },
            }),
            // Error mismatch, update expected error
            (Some(e), r) => {
                let reference = match &r {
                    StatementExpect::Error(e) => Some(e),
                    StatementExpect::Count(_) | StatementExpect::Ok => None,
                };
                Some(Record::Statement {
                    sql,
                    expected: StatementExpect::Error(ExpectedError::from_actual_error(
                        reference,
                        &e.to_string(),
                    )),
                    loc,
                    conditions,
                    connection,
                })
            }
        },
        // query, query
        (
            Record::Query {
                loc,
                conditions,
                connection,
                sql,
                expected,
            },
            RecordOutput::Query { types, rows, error },
        ) => match (error, expected) {
            // Error mismatch
            (Some(e), r) => {
                let reference = match &r {
                    QueryExpect::Error(e) => Some(e),
                    QueryExpect::Results { .. } => None,
                };
                Some(Record::Query {
                    sql,
                    expected: QueryExpect::Error(ExpectedError::from_actual_error(
                        reference,
                        &e.to_string(),
                    )),
                    loc,
                    conditions,
                    connection,
                })
            }
            (None, expected) => {
                let (expected_types, sort_mode, label) = match expected {
                    QueryExpect::Results {
                        types,
                        sort_mode,
                        label,
                        ..
                    } => (types, sort_mode, label),
                    QueryExpect::Error(_) => (vec![], None, None),
                };
                let width = if types.is_empty() {
                    rows.first().map_or(0, Vec::len)
                } else {
                    types.len()
                };
                let results = comparator
                    .render_rows(rows, comparator.sort_mode_for(sort_mode))
                    .lines();
                let types = if expected_types.len() == width
                    && (types.is_empty()
                        || (comparator.column_type_validator)(types, &expected_types))
                {
                    // Respect the original file's types while they still describe the rows.
                    expected_types
                } else {
                    types.clone()
                };
                Some(Record::Query {
                    sql,
                    loc,
                    conditions,
                    connection,
                    expected: QueryExpect::Results {
                        results: Some(results),
                        types,
                        sort_mode,
                        label,
                    },
                })
            }
        },
        // explain, explain
        (
            Record::Explain {
                loc,
                conditions,
                connection,
                sql,
                expected,
            },
            RecordOutput::Explain { sections, error },
        ) => match (error, expected) {
            (Some(e), r) => {
                let reference = match &r {
                    ExplainExpect::Error(e) => Some(e),
                    ExplainExpect::Plan(_) => None,
                };
                Some(Record::Explain {
                    sql,
                    expected: ExplainExpect::Error(ExpectedError::from_actual_error(
                        reference,
                        &e.to_string(),
                    )),
                    loc,
                    conditions,
                    connection,
                })
            }
            (None, _) => Some(Record::Explain {
                sql,
                loc,
                conditions,
                connection,
                expected: ExplainExpect::Plan(Some(comparator.normalize_sections(sections))),
            }),
        },
        // explain, statement: an empty plan
        (
            Record::Explain {
                loc,
                conditions,
                connection,
                sql,
                expected: _,
            },
            RecordOutput::Statement { error: None, .. },
        ) => Some(Record::Explain {
            sql,
            loc,
            conditions,
            connection,
            expected: ExplainExpect::Plan(Some(vec![])),
        }),

        // No update possible, return the original record
        _ => None,
    }
}

impl<D: AsyncDB, M: MakeConnection<Conn = D>> Runner<D, M> {
    /// Runs a test file and replaces the expectations of its failing cases with the actual
    /// output. Every other line of the file is kept as it is.
    ///
    /// The file is left unchanged if it fails to parse, or if any case errored.
    pub async fn regenerate_file_async(
        &mut self,
        filename: impl AsRef<Path>,
    ) -> Result<RewriteReport, RewriteError> {
        let path = filename.as_ref();
        let (name, script) = read_script(path)?;
        let spanned = parse_spanned::<D::ColumnType>(&script, name.clone())?;
        let spans: Vec<Range<usize>> = spanned.iter().map(|s| s.lines.clone()).collect();
        let records = spanned.into_iter().map(|s| s.record).collect();

        let mut failed = vec![];
        let report = self
            .drive(&name, records, |idx, record, output, verdict| {
                if let Verdict::Fail(_) = verdict {
                    failed.push((idx, record.clone(), output.clone()));
                }
            })
            .await;

        let errors: Vec<TestError> = report
            .cases
            .iter()
            .filter_map(|c| match &c.verdict {
                Verdict::Errored(e) => Some(e.clone()),
                _ => None,
            })
            .collect();
        if !errors.is_empty() {
            tracing::error!(
                file = %name,
                errored = errors.len(),
                "cases could not be executed, refusing to rewrite the file"
            );
            return Err(RewriteError::Errored {
                file: name.to_string(),
                errors,
            });
        }

        // The sort mode and hash threshold in effect at the end of the file. They are file-level
        // settings, normally declared before the first case.
        let comparator = self.comparator();
        let mut replacements = vec![];
        for (idx, record, output) in failed {
            if let Some(updated) = update_record(&record, &output, &comparator) {
                replacements.push((spans[idx].clone(), updated.to_string()));
            }
        }

        let rewritten = replacements.len();
        if rewritten > 0 {
            write_atomically(path, &splice(&script, &replacements))?;
            tracing::info!(file = %name, rewritten, "rewrote failing cases");
        }
        Ok(RewriteReport { report, rewritten })
    }
}

/// Replaces line ranges of `script`. `replacements` must be sorted and must not overlap.
fn splice(script: &str, replacements: &[(Range<usize>, String)]) -> String {
    let lines: Vec<&str> = script.split_inclusive('\n').collect();
    let mut out = String::with_capacity(script.len());
    let mut next = 0;
    for (range, text) in replacements {
        lines[next..range.start].iter().for_each(|l| out.push_str(l));
        out.push_str(text);
        if !text.ends_with('\n') {
            out.push('\n');
        }
        // A multiline error message ends with two blank lines, and result rows with one: the
        // next record must not be read as a row.
        let followed_by_blank = lines
            .get(range.end)
            .map_or(true, |l| l.trim_end_matches(['\r', '\n']).is_empty());
        let has_block = text.lines().any(|l| l == RESULTS_DELIMITER);
        if (text.ends_with("\n\n") || has_block) && !followed_by_blank {
            out.push('\n');
        }
        next = range.end;
    }
    lines[next..].iter().for_each(|l| out.push_str(l));
    out
}

/// Writes through a `.temp` sibling, then renames it over `path`.
fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".temp");
    let temp = PathBuf::from(temp);
    fs_err::write(&temp, content)?;
    fs_err::rename(&temp, path)
}
