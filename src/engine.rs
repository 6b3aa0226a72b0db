//! Engine selection for the command line.

use std::time::Duration;

use async_trait::async_trait;
use sqlgolden::{AsyncDB, DBOutput, DefaultColumnType, MakeConnection};
use sqlgolden_engines::{ExternalDriver, ExternalDriverError, PostgresConfig, PostgresSimple};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// A subprocess speaking JSON over stdin/stdout.
    External,
    /// A Postgres compatible server.
    Postgres,
}

#[derive(clap::Args, Debug, Clone)]
pub struct EngineArgs {
    /// The engine under test.
    #[arg(long, value_enum, default_value_t = EngineKind::Postgres)]
    pub engine: EngineKind,
    /// Command of the external engine, run through `sh -c` once per connection.
    #[arg(long, value_name = "COMMAND", env = "SQLGOLDEN_EXTERNAL_CMD")]
    pub external_cmd: Option<String>,
    #[arg(long, default_value = "localhost")]
    pub host: String,
    #[arg(long, default_value_t = 5432)]
    pub port: u16,
    #[arg(long, default_value = "postgres")]
    pub db: String,
    #[arg(long, default_value = "postgres")]
    pub user: String,
    #[arg(long, default_value = "postgres", env = "PGPASSWORD", hide_env_values = true)]
    pub pass: String,
}

impl EngineArgs {
    pub async fn connect(&self) -> Result<Engine, EngineError> {
        match self.engine {
            EngineKind::External => {
                let command = self
                    .external_cmd
                    .as_deref()
                    .ok_or(EngineError::MissingCommand)?;
                Ok(Engine::External(ExternalDriver::connect_shell(command).await?))
            }
            EngineKind::Postgres => {
                let mut config = PostgresConfig::new();
                config
                    .host(&self.host)
                    .port(self.port)
                    .dbname(&self.db)
                    .user(&self.user)
                    .password(&self.pass);
                Ok(Engine::Postgres(PostgresSimple::connect(config).await?))
            }
        }
    }

    /// Makes a new connection for every file and every named connection in it.
    pub fn make_connection(&self) -> impl MakeConnection<Conn = Engine> + Clone {
        let args = self.clone();
        move || {
            let args = args.clone();
            async move { args.connect().await }
        }
    }
}

pub enum Engine {
    External(ExternalDriver),
    Postgres(PostgresSimple),
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("--external-cmd is required by the external engine")]
    MissingCommand,
    #[error(transparent)]
    External(#[from] ExternalDriverError),
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
}

#[async_trait]
impl AsyncDB for Engine {
    type Error = EngineError;
    type ColumnType = DefaultColumnType;

    async fn run(&mut self, sql: &str) -> Result<DBOutput<Self::ColumnType>, Self::Error> {
        match self {
            Engine::External(db) => Ok(db.run(sql).await?),
            Engine::Postgres(db) => Ok(db.run(sql).await?),
        }
    }

    fn engine_name(&self) -> &str {
        match self {
            Engine::External(db) => db.engine_name(),
            Engine::Postgres(db) => db.engine_name(),
        }
    }

    async fn sleep(dur: Duration) {
        tokio::time::sleep(dur).await
    }

    fn is_transport_error(err: &Self::Error) -> bool {
        match err {
            EngineError::MissingCommand => true,
            EngineError::External(e) => ExternalDriver::is_transport_error(e),
            EngineError::Postgres(e) => PostgresSimple::is_transport_error(e),
        }
    }
}
