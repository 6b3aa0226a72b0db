mod engine;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sqlgolden::{
    regenerate_files, run_files, strict_column_validator, CaseFilter, DefaultColumnType,
    Normalizer, RewriteError, RunConfig, VolatilePattern, VolatileTokens,
};
use tracing_subscriber::EnvFilter;

use crate::engine::EngineArgs;

/// Runs golden-file SQL tests against a database engine.
#[derive(Parser, Debug)]
#[command(name = "sqlgolden", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run test files and report the verdict of every case.
    ///
    /// Exits with a failing code if any case failed or errored, or if any file failed to parse.
    Run {
        #[command(flatten)]
        opts: Opts,
        /// Save a JSON-formatted summary to FILE.
        #[arg(long, value_name = "FILE")]
        json_summary_file: Option<PathBuf>,
    },
    /// Rewrite the expectations of failing cases with the actual output.
    ///
    /// Files with a parse error or an errored case are left unchanged.
    Regenerate {
        #[command(flatten)]
        opts: Opts,
    },
}

#[derive(clap::Args, Debug)]
struct Opts {
    /// Test files, directories searched for `*.slt` files, or glob patterns.
    #[arg(value_name = "PATH", required = true)]
    paths: Vec<String>,
    /// Only run the query and explain cases whose name (`file:line [subtest] [label]`) matches
    /// the regex. Statements always run.
    #[arg(long, value_name = "REGEX")]
    filter: Option<CaseFilter>,
    /// Run N files at the same time.
    #[arg(short, long, value_name = "N", default_value_t = default_jobs())]
    jobs: usize,
    /// Record a case as errored when the engine does not answer in time, e.g. `30s`.
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
    /// Add a label for `skipif` and `onlyif` conditions.
    #[arg(long = "label", value_name = "LABEL")]
    labels: Vec<String>,
    /// Replace volatile text in actual and expected output.
    #[arg(long = "normalize", value_name = "PATTERN")]
    patterns: Vec<VolatilePattern>,
    /// Hash query results with more values than N. 0 never hashes.
    #[arg(long, value_name = "N", default_value_t = 0)]
    hash_threshold: usize,
    /// Check the type of every result column, not only their number.
    #[arg(long)]
    strict_types: bool,
    #[arg(long, value_enum, default_value_t = Color::Auto)]
    color: Color,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Auto,
    Always,
    Never,
}

impl Color {
    fn enabled(self) -> bool {
        match self {
            Color::Auto => std::io::stdout().is_terminal(),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

impl Opts {
    fn run_config(&self) -> RunConfig<DefaultColumnType> {
        let normalizer = self.patterns.iter().fold(
            Normalizer::new(VolatileTokens::from_env()),
            |normalizer, pattern| normalizer.with_pattern(*pattern),
        );
        let mut config = RunConfig {
            jobs: self.jobs,
            timeout: self.timeout,
            filter: self.filter.clone(),
            labels: self.labels.clone(),
            normalizer,
            hash_threshold: self.hash_threshold,
            ..Default::default()
        };
        if self.strict_types {
            config.column_type_validator = strict_column_validator;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    match args.command {
        Command::Run {
            opts,
            json_summary_file,
        } => {
            let files = expand_paths(&opts.paths)?;
            let config = opts.run_config();
            tracing::info!(files = files.len(), jobs = config.jobs, "running test files");
            let summary = run_files(files, opts.engine.make_connection(), &config).await;
            println!("{}", summary.display(opts.color.enabled()));

            if let Some(path) = json_summary_file {
                let json = serde_json::to_string_pretty(&summary.as_json())?;
                fs_err::write(&path, json)?;
            }
            Ok(if summary.any_failed() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::Regenerate { opts } => {
            let files = expand_paths(&opts.paths)?;
            let config = opts.run_config();
            let colorize = opts.color.enabled();
            let results = regenerate_files(files, opts.engine.make_connection(), &config).await;

            let mut failed = false;
            for (file, result) in results {
                match result {
                    Ok(report) => {
                        tracing::debug!(file = %file.display(), rewritten = report.rewritten, "file regenerated");
                        println!(
                            "{}: rewrote {} case(s), {}",
                            file.display(),
                            report.rewritten,
                            report.report.outcomes()
                        )
                    }
                    Err(RewriteError::Errored { file, errors }) => {
                        failed = true;
                        eprintln!("{file}: left unchanged, {} case(s) errored", errors.len());
                        for error in errors {
                            eprintln!("{}", error.display(colorize));
                        }
                    }
                    Err(e) => {
                        failed = true;
                        eprintln!("{}: {e}", file.display());
                    }
                }
            }
            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

/// Resolves files, directories and glob patterns into test files.
fn expand_paths(paths: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = vec![];
    for path in paths {
        let pattern = if Path::new(path).is_dir() {
            format!("{}/**/*.slt", path.trim_end_matches('/'))
        } else {
            path.clone()
        };
        let before = files.len();
        for entry in glob::glob(&pattern).with_context(|| format!("invalid pattern {path:?}"))? {
            let entry = entry.context("reading directory entry")?;
            if entry.is_file() {
                files.push(entry);
            }
        }
        if files.len() == before {
            bail!("no test files found for {path:?}");
        }
    }
    Ok(files)
}
