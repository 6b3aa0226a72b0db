//! Golden-file regression harness for SQL engines.
//!
//! Test files are written in the [sqllogictest][Sqllogictest] format, extended with `explain`
//! cases whose expectation is a set of named plan sections, and with commented out cases that are
//! kept as inert references. Expected and actual output are normalized before comparison, so that
//! paths and other volatile values do not break golden files between machines.
//!
//! [Sqllogictest]: https://www.sqlite.org/sqllogictest/doc/trunk/about.wiki
//!
//! # Usage
//!
//! Implement [`DB`] trait for your database structure:
//!
//! ```
//! struct MyDatabase {
//!     // fields
//! }
//!
//! #[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
//! enum MyError {
//!     // variants
//! }
//!
//! impl sqlgolden::DB for MyDatabase {
//!     type Error = MyError;
//!     // Or define your own column type
//!     type ColumnType = sqlgolden::DefaultColumnType;
//!     fn run(&mut self, sql: &str) -> Result<sqlgolden::DBOutput<Self::ColumnType>, Self::Error> {
//!         Ok(sqlgolden::DBOutput::StatementComplete(0))
//!     }
//! }
//!
//! // Then create a `Runner` on your database instance, and run the tests:
//! let mut tester = sqlgolden::Runner::new(|| async {
//!     let db = MyDatabase {
//!         // fields
//!     };
//!     Ok(db)
//! });
//! let _report = tester.run_file("../tests/slt/basic.slt");
//!
//! // You can also parse the script and execute the records separately:
//! let records = sqlgolden::parse_file("../tests/slt/basic.slt").unwrap();
//! for record in records {
//!     let _res = tester.run(record);
//! }
//! ```
//!
//! To run many files concurrently and aggregate their verdicts, see [`controller::run_files`].
//! To rewrite the expectations of failing cases, see [`Runner::regenerate_file_async`].

pub mod column_type;
pub mod connection;
pub mod controller;
pub mod harness;
pub mod normalize;
pub mod parser;
pub mod plan;
pub mod rewrite;
pub mod runner;
pub mod summary;
pub mod value;

pub use self::column_type::*;
pub use self::connection::*;
pub use self::controller::{regenerate_files, run_files, RunConfig};
pub use self::normalize::{Normalizer, VolatilePattern, VolatileTokens};
pub use self::parser::*;
pub use self::plan::PlanSection;
pub use self::rewrite::{update_record_with_output, RewriteError, RewriteReport};
pub use self::runner::*;
pub use self::summary::{CaseReport, FileReport, Outcomes, Summary, Verdict};
pub use self::value::{Value, EMPTY, NULL};

mod compare;
mod substitution;
