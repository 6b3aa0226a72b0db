//! Comparison of engine output with the expectations of a record.

use itertools::Itertools;
use md5::Digest;

use crate::normalize::Normalizer;
use crate::parser::*;
use crate::plan::{render_sections, PlanSection};
use crate::runner::{ColumnTypeValidator, RecordKind, RecordOutput, TestError, TestErrorKind};
use crate::value::Value;
use crate::{CellKind, ColumnType};

/// Actual query rows, normalized and arranged the way they are written in a test file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rendered {
    /// Cells of each row, in the order of the sort mode.
    Rows(Vec<Vec<String>>),
    /// Every value on its own line, sorted.
    Values(Vec<String>),
    /// A single `"<n> values hashing to <md5>"` line.
    Hash(String),
}

impl Rendered {
    pub fn lines(&self) -> Vec<String> {
        match self {
            Rendered::Rows(rows) => rows.iter().map(|row| row.join(" ")).collect(),
            Rendered::Values(values) => values.clone(),
            Rendered::Hash(hash) => vec![hash.clone()],
        }
    }
}

pub(crate) struct Comparator<'a, T: ColumnType> {
    pub normalizer: &'a Normalizer,
    pub column_type_validator: ColumnTypeValidator<T>,
    /// The file-level sort mode set by `control sortmode`.
    pub sort_mode: Option<SortMode>,
    /// 0 means never hashing
    pub hash_threshold: usize,
}

impl<'a, T: ColumnType> Comparator<'a, T> {
    /// Checks the output of a record against its expectation.
    pub fn check(&self, record: &Record<T>, output: &RecordOutput<T>) -> Result<(), TestError> {
        let (loc, result) = match record {
            Record::Statement {
                loc, sql, expected, ..
            } => (loc, self.check_statement(sql, expected, output)),
            Record::Query {
                loc, sql, expected, ..
            } => (loc, self.check_query(sql, expected, output)),
            Record::Explain {
                loc, sql, expected, ..
            } => (loc, self.check_explain(sql, expected, output)),
            _ => return Ok(()),
        };
        result.map_err(|kind| kind.at(loc.clone()))
    }

    /// The sort mode in effect for a query.
    pub fn sort_mode_for(&self, sort_mode: Option<SortMode>) -> SortMode {
        sort_mode.or(self.sort_mode).unwrap_or(SortMode::NoSort)
    }

    fn check_error(
        &self,
        sql: &str,
        kind: RecordKind,
        expected: &ExpectedError,
        actual: Option<&crate::runner::AnyError>,
    ) -> Result<(), TestErrorKind> {
        match actual {
            None => Err(TestErrorKind::Ok {
                sql: sql.to_string(),
                kind,
            }),
            Some(e) if !expected.is_match(&e.to_string()) => Err(TestErrorKind::ErrorMismatch {
                sql: sql.to_string(),
                err: e.clone(),
                expected_err: expected.to_string(),
                kind,
            }),
            Some(_) => Ok(()),
        }
    }

    fn check_statement(
        &self,
        sql: &str,
        expected: &StatementExpect,
        output: &RecordOutput<T>,
    ) -> Result<(), TestErrorKind> {
        let kind = RecordKind::Statement;
        match (output, expected) {
            (RecordOutput::Nothing, _) => return Ok(()),
            (RecordOutput::Errored(e), _) => return Err(e.clone()),
            (_, StatementExpect::Error(expected)) => {
                return self.check_error(sql, kind, expected, output.error())
            }
            _ => {}
        }
        if let Some(err) = output.error() {
            return Err(TestErrorKind::Fail {
                sql: sql.to_string(),
                err: err.clone(),
                kind,
            });
        }
        let StatementExpect::Count(expected) = *expected else {
            return Ok(());
        };
        let actual = match output {
            RecordOutput::Statement { count, .. } => count.to_string(),
            RecordOutput::Query { rows, .. } => rows.len().to_string(),
            _ => "returned a plan".to_string(),
        };
        if actual != expected.to_string() {
            return Err(TestErrorKind::StatementResultMismatch {
                sql: sql.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn check_query(
        &self,
        sql: &str,
        expected: &QueryExpect<T>,
        output: &RecordOutput<T>,
    ) -> Result<(), TestErrorKind> {
        let kind = RecordKind::Query;
        let (expected_types, sort_mode, results) = match (output, expected) {
            (RecordOutput::Nothing, _) => return Ok(()),
            (RecordOutput::Errored(e), _) => return Err(e.clone()),
            (_, QueryExpect::Error(expected)) => {
                return self.check_error(sql, kind, expected, output.error())
            }
            (
                _,
                QueryExpect::Results {
                    types,
                    sort_mode,
                    results,
                    ..
                },
            ) => (types, *sort_mode, results.as_deref()),
        };
        if let Some(err) = output.error() {
            return Err(TestErrorKind::Fail {
                sql: sql.to_string(),
                err: err.clone(),
                kind,
            });
        }

        match output {
            RecordOutput::Query { types, rows, .. } => {
                self.check_rows(sql, expected_types, sort_mode, results, types, rows)
            }
            // A statement returned no rows.
            RecordOutput::Statement { .. } => match results {
                Some(results) if !results.is_empty() => Err(TestErrorKind::QueryResultMismatch {
                    sql: sql.to_string(),
                    expected: results.join("\n"),
                    actual: String::new(),
                    cell: None,
                }),
                _ => Ok(()),
            },
            RecordOutput::Explain { .. } => Err(TestErrorKind::UnexpectedOutput {
                sql: sql.to_string(),
                kind,
                actual: "a plan",
            }),
            RecordOutput::Nothing | RecordOutput::Errored(_) => Ok(()),
        }
    }

    fn check_rows(
        &self,
        sql: &str,
        expected_types: &Vec<T>,
        sort_mode: Option<SortMode>,
        expected: Option<&[String]>,
        actual_types: &Vec<T>,
        rows: &[Vec<String>],
    ) -> Result<(), TestErrorKind> {
        let width = if actual_types.is_empty() {
            rows.first().map_or(0, Vec::len)
        } else {
            actual_types.len()
        };
        let columns_mismatch = !expected_types.is_empty()
            && (width > 0 || !actual_types.is_empty())
            && expected_types.len() != width;
        let types_mismatch = !actual_types.is_empty()
            && !(self.column_type_validator)(actual_types, expected_types);
        if columns_mismatch || types_mismatch {
            let actual = if actual_types.is_empty() {
                "?".repeat(width)
            } else {
                actual_types.iter().map(|c| c.to_char()).join("")
            };
            return Err(TestErrorKind::QueryResultColumnsMismatch {
                sql: sql.to_string(),
                expected: expected_types.iter().map(|c| c.to_char()).join(""),
                actual,
            });
        }

        let Some(expected) = expected else {
            return Ok(());
        };
        let sort_mode = self.sort_mode_for(sort_mode);
        let rendered = self.render_rows(rows, sort_mode);
        let expected_lines = self.expected_lines(expected, &rendered, sort_mode);
        let mismatch = |cell: Option<String>| TestErrorKind::QueryResultMismatch {
            sql: sql.to_string(),
            expected: expected_lines.join("\n"),
            actual: rendered.lines().join("\n"),
            cell,
        };

        let Rendered::Rows(actual_rows) = &rendered else {
            if expected_lines != rendered.lines() {
                return Err(mismatch(None));
            }
            return Ok(());
        };
        if expected_lines.len() != actual_rows.len() {
            return Err(mismatch(None));
        }
        // An engine that reports no usable type leaves the decoding to the declared signature.
        let kind_of = |i: usize| match actual_types.get(i).map(|c| c.cell_kind()) {
            Some(kind) if kind != CellKind::Text => kind,
            _ => expected_types.get(i).map_or(CellKind::Text, |c| c.cell_kind()),
        };
        for (row_idx, (line, row)) in expected_lines.iter().zip_eq(actual_rows).enumerate() {
            if *line == row.join(" ") {
                continue;
            }
            let cells: Vec<&str> = line.split(' ').collect();
            if cells.len() != row.len() {
                return Err(mismatch(None));
            }
            for (col_idx, (expected, actual)) in cells.iter().zip_eq(row).enumerate() {
                let kind = kind_of(col_idx);
                let declared_scale = actual_types.get(col_idx).and_then(|c| c.decimal_scale());
                let expected = Value::parse(expected, kind, None);
                let actual = Value::parse(actual, kind, declared_scale);
                if !expected.matches(&actual) {
                    return Err(mismatch(Some(format!(
                        "row {}, column {}: expected {expected}, but got {actual}",
                        row_idx + 1,
                        col_idx + 1
                    ))));
                }
            }
        }
        Ok(())
    }

    /// Normalizes, sorts and, above the hash threshold, hashes actual rows.
    pub fn render_rows(&self, rows: &[Vec<String>], sort_mode: SortMode) -> Rendered {
        let mut rows: Vec<Vec<String>> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| self.normalizer.normalize_cell(cell))
                    .collect()
            })
            .collect();

        let values: Vec<String> = match sort_mode {
            SortMode::NoSort => rows.iter().flatten().cloned().collect(),
            SortMode::RowSort => {
                rows.sort_by_cached_key(|row| row.join(" "));
                rows.iter().flatten().cloned().collect()
            }
            SortMode::ValueSort => {
                let mut values: Vec<String> = rows
                    .iter()
                    .flatten()
                    .flat_map(|cell| cell.split(' ').map(str::to_string).collect_vec())
                    .filter(|value| !value.is_empty())
                    .collect();
                values.sort();
                values
            }
        };

        if self.hash_threshold > 0 && values.len() > self.hash_threshold {
            let mut md5 = md5::Md5::new();
            for value in &values {
                md5.update(value.as_bytes());
                md5.update(b"\n");
            }
            return Rendered::Hash(format!(
                "{} values hashing to {:x}",
                values.len(),
                md5.finalize()
            ));
        }
        match sort_mode {
            SortMode::ValueSort => Rendered::Values(values),
            SortMode::NoSort | SortMode::RowSort => Rendered::Rows(rows),
        }
    }

    /// Normalizes expected lines and arranges them like `rendered`.
    fn expected_lines(
        &self,
        expected: &[String],
        rendered: &Rendered,
        sort_mode: SortMode,
    ) -> Vec<String> {
        let mut lines: Vec<String> = expected
            .iter()
            .map(|line| self.normalizer.normalize_cell(line))
            .collect();
        match (rendered, sort_mode) {
            (Rendered::Hash(_), _) | (_, SortMode::NoSort) => {}
            (_, SortMode::RowSort) => lines.sort(),
            (_, SortMode::ValueSort) => {
                lines = lines
                    .iter()
                    .flat_map(|line| line.split(' ').map(str::to_string).collect_vec())
                    .filter(|value| !value.is_empty())
                    .collect();
                lines.sort();
            }
        }
        lines
    }

    fn check_explain(
        &self,
        sql: &str,
        expected: &ExplainExpect,
        output: &RecordOutput<T>,
    ) -> Result<(), TestErrorKind> {
        let kind = RecordKind::Explain;
        let expected = match (output, expected) {
            (RecordOutput::Nothing, _) => return Ok(()),
            (RecordOutput::Errored(e), _) => return Err(e.clone()),
            (_, ExplainExpect::Error(expected)) => {
                return self.check_error(sql, kind, expected, output.error())
            }
            (_, ExplainExpect::Plan(expected)) => expected,
        };
        if let Some(err) = output.error() {
            return Err(TestErrorKind::Fail {
                sql: sql.to_string(),
                err: err.clone(),
                kind,
            });
        }
        let Some(expected) = expected else {
            return Ok(());
        };

        let actual = match output {
            RecordOutput::Explain { sections, .. } => self.normalize_sections(sections),
            RecordOutput::Statement { .. } => vec![],
            RecordOutput::Query { .. } => {
                return Err(TestErrorKind::UnexpectedOutput {
                    sql: sql.to_string(),
                    kind,
                    actual: "rows",
                })
            }
            RecordOutput::Nothing | RecordOutput::Errored(_) => return Ok(()),
        };
        let expected = self.normalize_sections(expected);
        if expected != actual {
            return Err(TestErrorKind::PlanMismatch {
                sql: sql.to_string(),
                expected: render_sections(&expected).join("\n"),
                actual: render_sections(&actual).join("\n"),
            });
        }
        Ok(())
    }

    pub fn normalize_sections(&self, sections: &[PlanSection]) -> Vec<PlanSection> {
        sections
            .iter()
            .map(|section| PlanSection {
                name: section.name.clone(),
                lines: section
                    .lines
                    .iter()
                    .map(|line| self.normalizer.normalize_plan_line(line))
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::runner::default_column_validator;
    use crate::{DecimalShape, DefaultColumnType};

    fn comparator(normalizer: &Normalizer) -> Comparator<'_, DefaultColumnType> {
        Comparator {
            normalizer,
            column_type_validator: default_column_validator,
            sort_mode: None,
            hash_threshold: 0,
        }
    }

    fn parse_record(script: &str) -> Record<DefaultColumnType> {
        parse(script).unwrap().remove(0)
    }

    fn rows(types: Vec<DefaultColumnType>, rows: &[&[&str]]) -> RecordOutput<DefaultColumnType> {
        RecordOutput::Query {
            types,
            rows: rows
                .iter()
                .map(|row| row.iter().map(|c| c.to_string()).collect())
                .collect(),
            error: None,
        }
    }

    fn mismatch_cell(result: Result<(), TestError>) -> Option<String> {
        match result.unwrap_err().kind() {
            TestErrorKind::QueryResultMismatch { cell, .. } => cell,
            kind => panic!("unexpected error: {kind}"),
        }
    }

    #[test]
    fn test_null_is_not_empty_string() {
        let normalizer = Normalizer::default();
        let comparator = comparator(&normalizer);
        let record = parse_record("query T\nSELECT NULL\n----\nNULL\n");

        let output = rows(vec![DefaultColumnType::Text], &[&["NULL"]]);
        comparator.check(&record, &output).unwrap();

        let output = rows(vec![DefaultColumnType::Text], &[&["(empty)"]]);
        let cell = mismatch_cell(comparator.check(&record, &output));
        assert_eq!(
            cell.as_deref(),
            Some("row 1, column 1: expected NULL, but got (empty)")
        );
    }

    #[test]
    fn test_decimal_scale_is_significant() {
        let normalizer = Normalizer::default();
        let comparator = comparator(&normalizer);
        let shape = DefaultColumnType::Decimal(Some(DecimalShape {
            precision: 10,
            scale: 2,
        }));

        let record = parse_record("query N\nSELECT 1.50\n----\n1.50\n");
        comparator
            .check(&record, &rows(vec![shape.clone()], &[&["1.5"]]))
            .unwrap();

        let record = parse_record("query N\nSELECT 1.5\n----\n1.5\n");
        assert!(comparator
            .check(&record, &rows(vec![shape], &[&["1.5"]]))
            .is_err());
    }

    #[test]
    fn test_integer_and_float_compare_by_value() {
        let normalizer = Normalizer::default();
        let comparator = comparator(&normalizer);
        let record = parse_record("query IR\nSELECT 1, 2.0\n----\n1 2\n");
        let output = rows(
            vec![DefaultColumnType::Integer, DefaultColumnType::FloatingPoint],
            &[&["1", "2.0"]],
        );
        comparator.check(&record, &output).unwrap();
    }

    #[test]
    fn test_untyped_columns_use_declared_types() {
        let normalizer = Normalizer::default();
        let comparator = comparator(&normalizer);
        let any = || DefaultColumnType::Any;

        let record = parse_record("query R\nSELECT 1.0\n----\n1\n");
        comparator
            .check(&record, &rows(vec![any()], &[&["1.0"]]))
            .unwrap();

        let record = parse_record("query IB\nSELECT 7, true\n----\n7 true\n");
        comparator
            .check(&record, &rows(vec![any(), any()], &[&["007", "t"]]))
            .unwrap();

        // a declared text column still compares verbatim
        let record = parse_record("query T\nSELECT '1.0'\n----\n1\n");
        assert!(comparator
            .check(&record, &rows(vec![any()], &[&["1.0"]]))
            .is_err());
    }

    #[test]
    fn test_rowsort() {
        let normalizer = Normalizer::default();
        let comparator = comparator(&normalizer);
        let output = rows(
            vec![DefaultColumnType::Integer, DefaultColumnType::Text],
            &[&["2", "b"], &["1", "a"]],
        );

        let sorted = parse_record("query IT rowsort\nSELECT * FROM t\n----\n1 a\n2 b\n");
        comparator.check(&sorted, &output).unwrap();

        let unsorted = parse_record("query IT nosort\nSELECT * FROM t\n----\n1 a\n2 b\n");
        assert!(comparator.check(&unsorted, &output).is_err());
    }

    #[test]
    fn test_file_level_sort_mode() {
        let normalizer = Normalizer::default();
        let mut comparator = comparator(&normalizer);
        comparator.sort_mode = Some(SortMode::RowSort);
        let output = rows(vec![DefaultColumnType::Integer], &[&["2"], &["1"]]);
        let record = parse_record("query I\nSELECT * FROM t\n----\n1\n2\n");
        comparator.check(&record, &output).unwrap();
    }

    #[test]
    fn test_valuesort() {
        let normalizer = Normalizer::default();
        let comparator = comparator(&normalizer);
        let output = rows(
            vec![DefaultColumnType::Integer, DefaultColumnType::Integer],
            &[&["4", "3"], &["2", "1"]],
        );
        let record = parse_record("query II valuesort\nSELECT * FROM t\n----\n1\n2\n3\n4\n");
        comparator.check(&record, &output).unwrap();
    }

    #[test]
    fn test_hash_threshold() {
        let normalizer = Normalizer::default();
        let mut comparator = comparator(&normalizer);
        comparator.hash_threshold = 2;
        let rendered = comparator.render_rows(
            &[vec!["1".to_string(), "2".to_string()], vec!["3".to_string(), "4".to_string()]],
            SortMode::NoSort,
        );
        let Rendered::Hash(line) = rendered else {
            panic!("expected a hash, got {rendered:?}");
        };
        assert!(line.starts_with("4 values hashing to "), "{line}");
        assert_eq!(line.len(), "4 values hashing to ".len() + 32);
    }

    #[test]
    fn test_column_count_mismatch() {
        let normalizer = Normalizer::default();
        let comparator = comparator(&normalizer);
        let record = parse_record("query II\nSELECT 1, 2\n----\n1 2\n");
        let output = rows(vec![DefaultColumnType::Integer], &[&["1"]]);
        let err = comparator.check(&record, &output).unwrap_err();
        assert!(
            matches!(err.kind(), TestErrorKind::QueryResultColumnsMismatch { .. }),
            "{err}"
        );
    }

    #[test]
    fn test_workspace_root_is_normalized_on_both_sides() {
        let normalizer = Normalizer::new(
            crate::VolatileTokens::new().with_workspace_root("/home/ci/work"),
        );
        let comparator = comparator(&normalizer);
        let record = parse_record("query T\nSELECT path FROM files\n----\nWORKSPACE_ROOT/a.csv\n");
        let output = rows(vec![DefaultColumnType::Text], &[&["/home/ci/work/a.csv"]]);
        comparator.check(&record, &output).unwrap();
    }

    #[test]
    fn test_explain() {
        let normalizer = Normalizer::default();
        let comparator = comparator(&normalizer);
        let record = parse_record(
            "explain\nSELECT a FROM t\n----\nphysical_plan\n01)ProjectionExec: expr=[a@0 as a]\n02)--DataSourceExec\n",
        );

        let plan = |lines: &[&str]| RecordOutput::<DefaultColumnType>::Explain {
            sections: vec![PlanSection::new(
                "physical_plan",
                lines.iter().map(|l| l.to_string()).collect(),
            )],
            error: None,
        };
        comparator
            .check(
                &record,
                &plan(&["01)ProjectionExec: expr=[a@0 as a]", "02)--DataSourceExec"]),
            )
            .unwrap();

        let err = comparator
            .check(
                &record,
                &plan(&["01)ProjectionExec: expr=[a@0 as a]", "02)----DataSourceExec"]),
            )
            .unwrap_err();
        assert!(matches!(err.kind(), TestErrorKind::PlanMismatch { .. }), "{err}");
    }

    #[test]
    fn test_empty_plan() {
        let normalizer = Normalizer::default();
        let comparator = comparator(&normalizer);
        let record = parse_record("explain\nSELECT 1\n----\n");
        comparator
            .check(
                &record,
                &RecordOutput::Explain {
                    sections: vec![],
                    error: None,
                },
            )
            .unwrap();
        assert!(comparator
            .check(
                &record,
                &RecordOutput::Explain {
                    sections: vec![PlanSection::new("logical_plan", vec!["01)x".to_string()])],
                    error: None,
                },
            )
            .is_err());
    }

    #[derive(thiserror::Error, Debug)]
    #[error("{0}")]
    struct EngineError(String);

    #[test]
    fn test_statement() {
        let normalizer = Normalizer::default();
        let comparator = comparator(&normalizer);
        let failed = |msg: &str| RecordOutput::<DefaultColumnType>::Statement {
            count: 0,
            error: Some(Arc::new(EngineError(msg.to_string()))),
        };

        let record = parse_record("statement error table .* not found\nDROP TABLE t\n");
        comparator
            .check(&record, &failed("table t not found"))
            .unwrap();
        let err = comparator
            .check(&record, &failed("permission denied"))
            .unwrap_err();
        assert!(matches!(err.kind(), TestErrorKind::ErrorMismatch { .. }), "{err}");

        let record = parse_record("statement count 2\nINSERT INTO t VALUES (1), (2)\n");
        comparator
            .check(
                &record,
                &RecordOutput::Statement {
                    count: 2,
                    error: None,
                },
            )
            .unwrap();
        assert!(comparator
            .check(
                &record,
                &RecordOutput::Statement {
                    count: 1,
                    error: None,
                },
            )
            .is_err());
    }
}
