use std::io;
use std::marker::PhantomData;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlgolden::{
    AsyncDB, DBOutput, DefaultColumnType, InvalidColumnType, PlanSection, EMPTY, NULL,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{Decoder, FramedRead};

/// Communicates with a subprocess via its stdin/stdout.
///
/// # Protocol
///
/// Sends one JSON object per line:
/// ```json
/// {"sql":"SELECT 1,2"}
/// ```
///
/// Receives a JSON stream, one value per SQL.
///
/// If the query returns rows, with a type string per column (`null` is SQL `NULL`):
/// ```json
/// {"rows":[["1",null]],"types":["I","N(10,2)"]}
/// ```
///
/// If the statement completes without rows:
/// ```json
/// {"count":3}
/// ```
///
/// If the SQL is explained:
/// ```json
/// {"plan":[{"name":"physical_plan","lines":["01)ProjectionExec: expr=[a@0 as a]"]}]}
/// ```
///
/// If the SQL fails:
/// ```json
/// {"err":"..."}
/// ```
///
/// Anything else, and any failure to talk to the subprocess, is a transport error.
pub struct ExternalDriver {
    child: Child,
    stdin: ChildStdin,
    stdout: FramedRead<ChildStdout, JsonDecoder<Output>>,
}

#[derive(Serialize)]
struct Input {
    sql: String,
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
enum Output {
    Rows {
        rows: Vec<Vec<Option<String>>>,
        #[serde(default)]
        types: Vec<String>,
    },
    Count {
        count: u64,
    },
    Plan {
        plan: Vec<PlanSection>,
    },
    Failed {
        err: String,
    },
}

#[derive(Debug, Error)]
pub enum ExternalDriverError {
    #[error("ser/de failed")]
    Json(#[from] serde_json::Error),
    #[error("io failed")]
    Io(#[from] io::Error),
    #[error(transparent)]
    InvalidType(#[from] InvalidColumnType),
    #[error("{0}")]
    Sql(String),
}

type Result<T> = std::result::Result<T, ExternalDriverError>;

impl ExternalDriver {
    /// Spawn and pipe into the subprocess with the given `cmd`.
    pub async fn connect(mut cmd: Command) -> Result<Self> {
        let cmd = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
        let stdout = FramedRead::new(stdout, JsonDecoder::default());

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Runs `command` through `sh -c`.
    pub async fn connect_shell(command: &str) -> Result<Self> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        Self::connect(cmd).await
    }
}

fn pipe_error(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("{name} of the external engine is not piped"),
    )
}

impl Drop for ExternalDriver {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[async_trait]
impl AsyncDB for ExternalDriver {
    type Error = ExternalDriverError;
    type ColumnType = DefaultColumnType;

    async fn run(&mut self, sql: &str) -> Result<DBOutput<Self::ColumnType>> {
        let input = Input {
            sql: sql.to_string(),
        };
        let mut input = serde_json::to_string(&input)?;
        input.push('\n');
        self.stdin.write_all(input.as_bytes()).await?;
        self.stdin.flush().await?;
        let output = match self.stdout.next().await {
            Some(Ok(output)) => output,
            Some(Err(e)) => return Err(e),
            None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        };
        into_db_output(output)
    }

    fn engine_name(&self) -> &str {
        "external"
    }

    async fn sleep(dur: Duration) {
        tokio::time::sleep(dur).await
    }

    fn is_transport_error(err: &Self::Error) -> bool {
        !matches!(err, ExternalDriverError::Sql(_))
    }
}

fn into_db_output(output: Output) -> Result<DBOutput<DefaultColumnType>> {
    match output {
        Output::Rows { rows, types } => Ok(DBOutput::Rows {
            types: types
                .iter()
                .map(|t| DefaultColumnType::from_str(t))
                .collect::<std::result::Result<_, _>>()?,
            rows: rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|cell| match cell {
                            None => NULL.to_string(),
                            Some(cell) if cell.is_empty() => EMPTY.to_string(),
                            Some(cell) => cell,
                        })
                        .collect()
                })
                .collect(),
        }),
        Output::Count { count } => Ok(DBOutput::StatementComplete(count)),
        Output::Plan { plan } => Ok(DBOutput::Plan { sections: plan }),
        Output::Failed { err } => Err(ExternalDriverError::Sql(err)),
    }
}

struct JsonDecoder<T>(PhantomData<T>);

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Decoder for JsonDecoder<T>
where
    T: for<'de> serde::de::Deserialize<'de>,
{
    type Item = T;
    type Error = ExternalDriverError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let mut inner = serde_json::Deserializer::from_slice(src.as_ref()).into_iter::<T>();
        match inner.next() {
            None => Ok(None),
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(v)) => {
                let len = inner.byte_offset();
                src.advance(len);
                Ok(Some(v))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use sqlgolden::DecimalShape;

    use super::*;

    #[test]
    fn test_decode_stream() {
        let mut decoder = JsonDecoder::<Output>::default();
        let mut src = BytesMut::from(
            &b"{\"count\":3}\n{\"rows\":[[\"a\",null,\"\"]],\"types\":[\"T\",\"T\",\"T\"]}\n{\"err\":"[..],
        );
        assert_eq!(
            decoder.decode(&mut src).unwrap(),
            Some(Output::Count { count: 3 })
        );
        let Some(Output::Rows { rows, types }) = decoder.decode(&mut src).unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(rows, vec![vec![Some("a".to_string()), None, Some(String::new())]]);
        assert_eq!(types.len(), 3);
        // incomplete value
        assert_eq!(decoder.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn test_into_db_output() {
        let output: Output = serde_json::from_str(
            r#"{"rows":[["1.50",null,""]],"types":["N(10,2)","T","T"]}"#,
        )
        .unwrap();
        let DBOutput::Rows { types, rows } = into_db_output(output).unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(rows, vec![vec!["1.50", "NULL", "(empty)"]]);
        assert!(matches!(
            types[0],
            DefaultColumnType::Decimal(Some(DecimalShape {
                precision: 10,
                scale: 2
            }))
        ));

        let output: Output = serde_json::from_str(
            r#"{"plan":[{"name":"physical_plan","lines":["01)EmptyExec"]}]}"#,
        )
        .unwrap();
        assert!(matches!(
            into_db_output(output).unwrap(),
            DBOutput::Plan { sections } if sections[0].name == "physical_plan"
        ));

        let output: Output = serde_json::from_str(r#"{"err":"table t not found"}"#).unwrap();
        let err = into_db_output(output).unwrap_err();
        assert_eq!(err.to_string(), "table t not found");
        assert!(!ExternalDriver::is_transport_error(&err));

        let output: Output = serde_json::from_str(r#"{"rows":[],"types":["X"]}"#).unwrap();
        let err = into_db_output(output).unwrap_err();
        assert!(ExternalDriver::is_transport_error(&err));
    }
}
