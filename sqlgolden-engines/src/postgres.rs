use std::time::Duration;

use async_trait::async_trait;
use sqlgolden::plan::{number_tree_lines, PHYSICAL_PLAN};
use sqlgolden::{DBOutput, DefaultColumnType, PlanSection, EMPTY, NULL};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

/// Connection configuration. This is a re-export of [`tokio_postgres::Config`].
pub type PostgresConfig = tokio_postgres::Config;

/// Postgres engine speaking the simple query protocol through [`tokio_postgres`]. Every value
/// comes back as text, and the connection task is aborted when the engine is dropped.
pub struct PostgresSimple {
    client: Client,
    connection: JoinHandle<()>,
}

impl PostgresSimple {
    pub async fn connect(config: PostgresConfig) -> Result<Self, tokio_postgres::Error> {
        let (client, connection) = config.connect(NoTls).await?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("postgres connection closed with error: {:?}", e);
            }
        });
        Ok(Self { client, connection })
    }
}

impl Drop for PostgresSimple {
    fn drop(&mut self) {
        self.connection.abort()
    }
}

#[async_trait]
impl sqlgolden::AsyncDB for PostgresSimple {
    type Error = tokio_postgres::Error;
    type ColumnType = DefaultColumnType;

    async fn run(&mut self, sql: &str) -> Result<DBOutput<Self::ColumnType>, Self::Error> {
        // `simple_query` renders values in the server's text format, e.g. `t`/`f` for booleans.
        // No type is reported, so cells are decoded by the declared signature.
        let mut output: Vec<Vec<String>> = vec![];
        let mut count = 0;
        for message in self.client.simple_query(sql).await? {
            match message {
                SimpleQueryMessage::Row(row) => output.push(
                    (0..row.len())
                        .map(|i| match row.get(i) {
                            None => NULL.to_string(),
                            Some("") => EMPTY.to_string(),
                            Some(v) => v.to_string(),
                        })
                        .collect(),
                ),
                SimpleQueryMessage::CommandComplete(n) => {
                    count = n;
                    break;
                }
                _ => {}
            }
        }

        if is_explain(sql) {
            return Ok(DBOutput::Plan {
                sections: explain_sections(&output),
            });
        }
        if output.is_empty() {
            Ok(DBOutput::StatementComplete(count))
        } else {
            Ok(DBOutput::Rows {
                types: vec![DefaultColumnType::Any; output[0].len()],
                rows: output,
            })
        }
    }

    fn engine_name(&self) -> &str {
        "postgres"
    }

    async fn sleep(dur: Duration) {
        tokio::time::sleep(dur).await
    }

    /// Errors reported by the server are failures of the SQL, anything else means the server
    /// could not be reached.
    fn is_transport_error(err: &Self::Error) -> bool {
        err.as_db_error().is_none()
    }
}

fn is_explain(sql: &str) -> bool {
    sql.trim_start()
        .get(..7)
        .is_some_and(|s| s.eq_ignore_ascii_case("explain"))
}

/// The text plan of `EXPLAIN`, one line per row, as a single physical plan section.
fn explain_sections(rows: &[Vec<String>]) -> Vec<PlanSection> {
    let lines = number_tree_lines(
        rows.iter()
            .filter_map(|row| row.first())
            .map(String::as_str),
    );
    vec![PlanSection::new(PHYSICAL_PLAN, lines)]
}
