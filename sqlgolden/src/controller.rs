//! Runs many test files concurrently.

use std::path::PathBuf;
use std::time::Duration;

use futures::{stream, StreamExt};

use crate::normalize::Normalizer;
use crate::rewrite::{RewriteError, RewriteReport};
use crate::runner::{default_column_validator, AsyncDB, CaseFilter, ColumnTypeValidator, Runner};
use crate::summary::Summary;
use crate::{ColumnType, MakeConnection};

/// Settings shared by the runners of all files.
#[derive(Clone)]
pub struct RunConfig<T: ColumnType> {
    /// Number of files executed at the same time.
    pub jobs: usize,
    pub timeout: Option<Duration>,
    pub filter: Option<CaseFilter>,
    /// Labels for condition `skipif` and `onlyif`.
    pub labels: Vec<String>,
    pub normalizer: Normalizer,
    pub hash_threshold: usize,
    pub column_type_validator: ColumnTypeValidator<T>,
}

impl<T: ColumnType> Default for RunConfig<T> {
    fn default() -> Self {
        Self {
            jobs: 1,
            timeout: None,
            filter: None,
            labels: vec![],
            normalizer: Normalizer::default(),
            hash_threshold: 0,
            column_type_validator: default_column_validator,
        }
    }
}

impl<T: ColumnType> RunConfig<T> {
    /// Creates a runner for one file.
    pub fn runner<D, M>(&self, make_conn: M) -> Runner<D, M>
    where
        D: AsyncDB<ColumnType = T>,
        M: MakeConnection<Conn = D>,
    {
        let mut runner = Runner::new(make_conn);
        for label in &self.labels {
            runner.add_label(label);
        }
        if let Some(timeout) = self.timeout {
            runner.with_timeout(timeout);
        }
        if let Some(filter) = &self.filter {
            runner.with_filter(filter.clone());
        }
        runner.with_normalizer(self.normalizer.clone());
        runner.with_hash_threshold(self.hash_threshold);
        runner.with_column_validator(self.column_type_validator);
        runner
    }
}

/// Runs `files` with up to `config.jobs` files in flight. Each file gets its own [`Runner`] and
/// connections. Reports are merged in the order of `files`.
pub async fn run_files<D, M>(
    files: Vec<PathBuf>,
    make_conn: M,
    config: &RunConfig<D::ColumnType>,
) -> Summary
where
    D: AsyncDB,
    M: MakeConnection<Conn = D> + Clone,
{
    let tasks = files.into_iter().enumerate().map(|(idx, file)| {
        let mut runner = config.runner(make_conn.clone());
        async move { (idx, runner.run_file_async(&file).await) }
    });
    let mut results: Vec<_> = stream::iter(tasks)
        .buffer_unordered(config.jobs.max(1))
        .collect()
        .await;
    results.sort_by_key(|(idx, _)| *idx);

    let mut summary = Summary::default();
    for (_, result) in results {
        match result {
            Ok(report) => {
                tracing::info!(file = %report.file, outcomes = %report.outcomes(), "file finished");
                summary.add_file(report);
            }
            Err(e) => {
                tracing::error!(error = %e, "file failed to parse");
                summary.add_parse_error(e);
            }
        }
    }
    summary
}

/// Regenerates `files` with up to `config.jobs` files in flight, see
/// [`Runner::regenerate_file_async`]. Results are returned in the order of `files`.
pub async fn regenerate_files<D, M>(
    files: Vec<PathBuf>,
    make_conn: M,
    config: &RunConfig<D::ColumnType>,
) -> Vec<(PathBuf, Result<RewriteReport, RewriteError>)>
where
    D: AsyncDB,
    M: MakeConnection<Conn = D> + Clone,
{
    let tasks = files.into_iter().enumerate().map(|(idx, file)| {
        let mut runner = config.runner(make_conn.clone());
        async move {
            let result = runner.regenerate_file_async(&file).await;
            (idx, file, result)
        }
    });
    let mut results: Vec<_> = stream::iter(tasks)
        .buffer_unordered(config.jobs.max(1))
        .collect()
        .await;
    results.sort_by_key(|(idx, _, _)| *idx);
    results
        .into_iter()
        .map(|(_, file, result)| (file, result))
        .collect()
}
