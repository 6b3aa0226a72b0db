//! An in-memory engine answering the SQL of the files under `tests/slt`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::{Captures, Regex};
use sqlgolden::normalize::WORKSPACE_ROOT;
use sqlgolden::{
    AsyncDB, DBOutput, DecimalShape, DefaultColumnType, PlanSection, VolatileTokens, DB, EMPTY,
    NULL,
};

#[derive(thiserror::Error, Debug)]
pub enum FakeDBError {
    #[error("no such table: {0}")]
    NoSuchTable(String),
    #[error("table already exists: {0}")]
    TableExists(String),
    #[error("unrecognized statement: {0}")]
    Unrecognized(String),
    #[error("connection reset by peer")]
    ConnectionReset,
}

struct Table {
    types: Vec<DefaultColumnType>,
    rows: Vec<Vec<String>>,
}

pub struct FakeDB {
    tables: BTreeMap<String, Table>,
    workspace_root: String,
}

impl Default for FakeDB {
    fn default() -> Self {
        let root = VolatileTokens::from_env()
            .get(WORKSPACE_ROOT)
            .unwrap_or_default()
            .to_string();
        Self::with_workspace_root(root)
    }
}

impl FakeDB {
    /// An engine scanning files below `root`, as shown by its plans.
    pub fn with_workspace_root(root: impl Into<String>) -> Self {
        Self {
            tables: BTreeMap::new(),
            workspace_root: root.into(),
        }
    }

    fn table(&self, name: &str) -> Result<&Table, FakeDBError> {
        self.tables
            .get(name)
            .ok_or_else(|| FakeDBError::NoSuchTable(name.to_string()))
    }

    fn create(&mut self, c: Captures) -> Result<DBOutput<DefaultColumnType>, FakeDBError> {
        let name = c[1].to_lowercase();
        if self.tables.contains_key(&name) {
            return Err(FakeDBError::TableExists(name));
        }
        let column = Regex::new(r"(\w+)\s+(\w+)(?:\((\d+)\s*,\s*(\d+)\))?").unwrap();
        let types = column
            .captures_iter(&c[2])
            .map(|col| {
                let shape = match (col.get(3), col.get(4)) {
                    (Some(p), Some(s)) => Some(DecimalShape {
                        precision: p.as_str().parse().unwrap(),
                        scale: s.as_str().parse().unwrap(),
                    }),
                    _ => None,
                };
                column_type(&col[2], shape)
            })
            .collect();
        self.tables.insert(
            name,
            Table {
                types,
                rows: vec![],
            },
        );
        Ok(DBOutput::StatementComplete(0))
    }

    fn insert(&mut self, c: Captures) -> Result<DBOutput<DefaultColumnType>, FakeDBError> {
        let name = c[1].to_lowercase();
        let table = self
            .tables
            .get_mut(&name)
            .ok_or(FakeDBError::NoSuchTable(name))?;
        let tuple = Regex::new(r"\(([^()]*)\)").unwrap();
        let rows: Vec<Vec<String>> = tuple
            .captures_iter(&c[2])
            .map(|t| t[1].split(',').map(literal).collect())
            .collect();
        let count = rows.len() as u64;
        table.rows.extend(rows);
        Ok(DBOutput::StatementComplete(count))
    }

    fn explain(&self, c: Captures) -> Result<DBOutput<DefaultColumnType>, FakeDBError> {
        let name = c[2].to_lowercase();
        self.table(&name)?;
        let projection = c[1].replace(' ', "");
        Ok(DBOutput::Plan {
            sections: vec![
                PlanSection::new(
                    "logical_plan",
                    vec![format!("01)TableScan: {name} projection=[{projection}]")],
                ),
                PlanSection::new(
                    "physical_plan",
                    vec![format!(
                        "01)DataSourceExec: file_groups={{1 group: [[{}/data/{name}.parquet]]}}, \
                         projection=[{projection}], file_type=parquet",
                        self.workspace_root
                    )],
                ),
            ],
        })
    }
}

impl DB for FakeDB {
    type Error = FakeDBError;
    type ColumnType = DefaultColumnType;

    fn run(&mut self, sql: &str) -> Result<DBOutput<Self::ColumnType>, Self::Error> {
        let sql = sql.trim().trim_end_matches(';').trim();
        let matches = |pattern: &str| Regex::new(pattern).unwrap().captures(sql);

        if let Some(c) = matches(r"(?is)^create table (\w+)\s*\((.*)\)$") {
            return self.create(c);
        }
        if let Some(c) = matches(r"(?is)^insert into (\w+) values (.*)$") {
            return self.insert(c);
        }
        if let Some(c) = matches(r"(?i)^drop table (\w+)$") {
            let name = c[1].to_lowercase();
            self.tables
                .remove(&name)
                .ok_or(FakeDBError::NoSuchTable(name))?;
            return Ok(DBOutput::StatementComplete(0));
        }
        if let Some(c) = matches(r"(?i)^select \* from (\w+)$") {
            let table = self.table(&c[1].to_lowercase())?;
            return Ok(DBOutput::Rows {
                types: table.types.clone(),
                rows: table.rows.clone(),
            });
        }
        if let Some(c) = matches(r"(?i)^select mask\((.*)\)$") {
            let args: Vec<Option<String>> = c[1].split(',').map(argument).collect();
            return Ok(DBOutput::Rows {
                types: vec![DefaultColumnType::Text],
                rows: vec![vec![mask(&args).unwrap_or_else(|| NULL.to_string())]],
            });
        }
        if let Some(c) = matches(r"(?i)^explain select (.+) from (\w+)$") {
            return self.explain(c);
        }
        Err(FakeDBError::Unrecognized(sql.to_string()))
    }

    fn engine_name(&self) -> &str {
        "fake"
    }
}

fn column_type(name: &str, shape: Option<DecimalShape>) -> DefaultColumnType {
    match name.to_lowercase().as_str() {
        "int" | "integer" | "bigint" => DefaultColumnType::Integer,
        "varchar" | "text" | "string" => DefaultColumnType::Text,
        "decimal" | "numeric" => DefaultColumnType::Decimal(shape),
        "double" | "float" | "real" => DefaultColumnType::FloatingPoint,
        "boolean" | "bool" => DefaultColumnType::Boolean,
        _ => DefaultColumnType::Any,
    }
}

/// Renders a literal of an `insert` the way the engine returns it.
fn literal(token: &str) -> String {
    match token.trim() {
        t if t.eq_ignore_ascii_case("null") => NULL.to_string(),
        "''" => EMPTY.to_string(),
        t => t.trim_matches('\'').to_string(),
    }
}

fn argument(token: &str) -> Option<String> {
    match token.trim() {
        t if t.eq_ignore_ascii_case("null") => None,
        t => Some(t.trim_matches('\'').to_string()),
    }
}

/// Masks upper case letters, lower case letters, digits and other characters of the first
/// argument. A missing replacement uses the default, a NULL one keeps the character.
fn mask(args: &[Option<String>]) -> Option<String> {
    let input = args.first()?.as_ref()?;
    let replacement = |idx: usize, default: Option<char>| match args.get(idx) {
        None => default,
        Some(arg) => arg.as_ref().and_then(|s| s.chars().next()),
    };
    let upper = replacement(1, Some('X'));
    let lower = replacement(2, Some('x'));
    let digit = replacement(3, Some('n'));
    let other = replacement(4, None);
    Some(
        input
            .chars()
            .map(|c| {
                let replaced = if c.is_ascii_uppercase() {
                    upper
                } else if c.is_ascii_lowercase() {
                    lower
                } else if c.is_ascii_digit() {
                    digit
                } else {
                    other
                };
                replaced.unwrap_or(c)
            })
            .collect(),
    )
}

/// An engine that answers after `delay`, or never when its connection is gone.
pub struct SlowDB {
    pub inner: FakeDB,
    pub delay: Duration,
    pub broken: bool,
}

#[async_trait]
impl AsyncDB for SlowDB {
    type Error = FakeDBError;
    type ColumnType = DefaultColumnType;

    async fn run(&mut self, sql: &str) -> Result<DBOutput<Self::ColumnType>, Self::Error> {
        if self.broken {
            return Err(FakeDBError::ConnectionReset);
        }
        if sql.contains("slow") {
            tokio::time::sleep(self.delay).await;
            return Ok(DBOutput::StatementComplete(0));
        }
        DB::run(&mut self.inner, sql)
    }

    fn engine_name(&self) -> &str {
        "fake"
    }

    async fn sleep(dur: Duration) {
        tokio::time::sleep(dur).await
    }

    fn is_transport_error(err: &Self::Error) -> bool {
        matches!(err, FakeDBError::ConnectionReset)
    }
}

/// Gives control back to the executor once before answering. Keeps the default `sleep`.
pub struct YieldDB(pub FakeDB);

#[async_trait]
impl AsyncDB for YieldDB {
    type Error = FakeDBError;
    type ColumnType = DefaultColumnType;

    async fn run(&mut self, sql: &str) -> Result<DBOutput<Self::ColumnType>, Self::Error> {
        tokio::task::yield_now().await;
        DB::run(&mut self.0, sql)
    }
}
