//! `tokio-postgres` backend.
//!
//! [`PgConnector`] opens plain (non-TLS) connections and spawns each
//! connection's I/O task on the runtime driving the connect call. Rows are
//! read in the binary format and decoded by column type OID, see
//! [`value`] for the supported types.
//!
//! `tokio-postgres` reports the number of affected rows rather than the
//! server's command tag, so [`FetchResult::status`] is rebuilt from the
//! statement's leading keyword and that count.
//!
//! Portals are SQL cursors: `DECLARE` once, then one `FETCH FORWARD n` round
//! trip per batch, so other statements can run while a portal is open.
//! Outside a transaction the cursor is declared `WITH HOLD` and closed
//! explicitly. Statements `DECLARE` cannot wrap are executed in full and
//! their rows served from memory.

mod datetime;
mod value;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio_postgres::{Client, Config, NoTls, RowStream, Statement};

use crate::codec::JsonCodec;
use crate::config::ConnectParams;
use crate::driver::{
    Attribute, FetchResult, NativeConnection, NativeConnector, NativeError, NativeErrorKind,
    NativePortal, NativeResult, Row, TransactionOptions, Value,
};

pub(crate) type BoxError = Box<dyn StdError + Sync + Send>;

const DEFAULT_HOST: &str = "localhost";

/// Prefix of the SQL cursor names backing portals.
const PORTAL_PREFIX: &str = "pgbridge_portal_";

/// Leading keywords of statements `DECLARE ... CURSOR FOR` accepts.
const DECLARABLE_COMMANDS: &[&str] = &["SELECT", "VALUES", "TABLE"];

/// Driver options understood by [`PgConnector`].
mod options {
    pub const APPLICATION_NAME: &str = "application_name";
    pub const CONNECT_TIMEOUT: &str = "connect_timeout";
    pub const OPTIONS: &str = "options";
}

/// Map a `tokio-postgres` error onto the native error model.
pub(crate) fn native_error(err: &tokio_postgres::Error) -> NativeError {
    if let Some(db) = err.as_db_error() {
        return NativeError::from_server(db.code().code(), db.message());
    }
    if err.is_closed() {
        return NativeError::connection_closed();
    }

    let message = err.to_string();
    if message.starts_with("error serializing") || message.starts_with("error deserializing") {
        return NativeError::data_conversion(message);
    }
    match err.source().and_then(|source| source.downcast_ref::<io::Error>()) {
        Some(io_err) if io_err.kind() == io::ErrorKind::TimedOut => {
            NativeError::new(NativeErrorKind::Timeout, message)
        }
        Some(_) => NativeError::new(NativeErrorKind::Io, message),
        None => NativeError::new(NativeErrorKind::Interface, message),
    }
}

fn driver_config(params: &ConnectParams) -> NativeResult<Config> {
    let mut config = Config::new();
    config.host(params.host.as_deref().unwrap_or(DEFAULT_HOST));
    if let Some(port) = params.port {
        config.port(port);
    }
    if let Some(user) = &params.user {
        config.user(user);
    }
    if let Some(password) = &params.password {
        config.password(password);
    }
    if let Some(database) = &params.database {
        config.dbname(database);
    }

    for (key, value) in &params.options {
        match key.as_str() {
            options::APPLICATION_NAME => {
                config.application_name(value);
            }
            options::CONNECT_TIMEOUT => {
                let seconds: u64 = value.parse().map_err(|_| {
                    NativeError::new(
                        NativeErrorKind::Interface,
                        format!("invalid connect_timeout '{value}'"),
                    )
                })?;
                config.connect_timeout(Duration::from_secs(seconds));
            }
            options::OPTIONS => {
                config.options(value);
            }
            _ => tracing::debug!(option = %key, "Ignoring unsupported connect option"),
        }
    }
    Ok(config)
}

/// Connector for PostgreSQL servers over `tokio-postgres`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

#[async_trait]
impl NativeConnector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self, params: &ConnectParams) -> NativeResult<PgConnection> {
        let config = driver_config(params)?;
        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| native_error(&e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        tracing::debug!(host = ?params.host, database = ?params.database, "Connected");
        Ok(PgConnection::new(client))
    }
}

/// A prepared statement together with its text and leading SQL keyword.
#[derive(Debug, Clone)]
pub struct PgStatement {
    inner: Statement,
    sql: Arc<str>,
    command: Arc<str>,
}

impl PgStatement {
    /// Leading keyword of the statement text, uppercased.
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// First keyword of `sql`, uppercased.
fn leading_command(sql: &str) -> String {
    sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// Rebuild the server's command tag from a keyword and affected row count.
pub(crate) fn command_tag(command: &str, rows_affected: Option<u64>) -> Option<String> {
    if command.is_empty() {
        return None;
    }
    match (command, rows_affected) {
        ("INSERT", Some(rows)) => Some(format!("INSERT 0 {rows}")),
        (command, Some(rows)) => Some(format!("{command} {rows}")),
        (command, None) => Some(command.to_owned()),
    }
}

/// A live `tokio-postgres` client.
pub struct PgConnection {
    client: Option<Arc<Client>>,
    codec: JsonCodec,
    in_transaction: bool,
    portals_opened: u64,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PgConnection {
    fn new(client: Client) -> Self {
        Self {
            client: Some(Arc::new(client)),
            codec: JsonCodec::default(),
            in_transaction: false,
            portals_opened: 0,
        }
    }

    fn client(&self) -> NativeResult<&Arc<Client>> {
        self.client.as_ref().ok_or_else(NativeError::connection_closed)
    }

    async fn query(&self, statement: &PgStatement, params: &[Value]) -> NativeResult<RowStream> {
        self.client()?
            .query_raw(&statement.inner, params.iter())
            .await
            .map_err(|e| native_error(&e))
    }
}

#[async_trait]
impl NativeConnection for PgConnection {
    type Statement = PgStatement;
    type Portal = PgPortal;

    async fn prepare(&mut self, sql: &str) -> NativeResult<PgStatement> {
        let inner = self
            .client()?
            .prepare(sql)
            .await
            .map_err(|e| native_error(&e))?;
        Ok(PgStatement {
            inner,
            sql: sql.into(),
            command: leading_command(sql).into(),
        })
    }

    fn attributes(&self, statement: &PgStatement) -> Vec<Attribute> {
        statement
            .inner
            .columns()
            .iter()
            .map(|column| Attribute::new(column.name(), column.type_().oid()))
            .collect()
    }

    async fn fetch(
        &mut self,
        statement: &PgStatement,
        params: &[Value],
    ) -> NativeResult<FetchResult> {
        let mut stream = Box::pin(self.query(statement, params).await?);
        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await.map_err(|e| native_error(&e))? {
            rows.push(value::decode_row(&row, &self.codec)?);
        }
        Ok(FetchResult {
            rows,
            status: command_tag(statement.command(), stream.rows_affected()),
        })
    }

    async fn open_portal(
        &mut self,
        statement: &PgStatement,
        params: &[Value],
    ) -> NativeResult<PgPortal> {
        if !DECLARABLE_COMMANDS.contains(&statement.command()) {
            let result = self.fetch(statement, params).await?;
            return Ok(PgPortal {
                source: PortalSource::Buffered(result.rows.into()),
            });
        }

        self.portals_opened += 1;
        let name = format!("{PORTAL_PREFIX}{}", self.portals_opened);
        let hold = !self.in_transaction;
        let declare = format!(
            "DECLARE {name} NO SCROLL CURSOR {} FOR {}",
            if hold { "WITH HOLD" } else { "WITHOUT HOLD" },
            statement.sql
        );

        let client = self.client()?;
        client
            .execute_raw(declare.as_str(), params.iter())
            .await
            .map_err(|e| native_error(&e))?;
        tracing::debug!(portal = %name, hold, "Cursor declared");

        Ok(PgPortal {
            source: PortalSource::Cursor {
                client: Arc::downgrade(client),
                name,
                hold,
                codec: self.codec.clone(),
            },
        })
    }

    async fn execute_many(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> NativeResult<()> {
        let client = self.client()?;
        let statement = client.prepare(sql).await.map_err(|e| native_error(&e))?;
        for params in param_sets {
            client
                .execute_raw(&statement, params.iter())
                .await
                .map_err(|e| native_error(&e))?;
        }
        Ok(())
    }

    async fn begin(&mut self, options: &TransactionOptions) -> NativeResult<()> {
        self.client()?
            .batch_execute(&options.begin_statement())
            .await
            .map_err(|e| native_error(&e))?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> NativeResult<()> {
        self.in_transaction = false;
        self.client()?
            .batch_execute("COMMIT")
            .await
            .map_err(|e| native_error(&e))
    }

    async fn rollback(&mut self) -> NativeResult<()> {
        self.in_transaction = false;
        self.client()?
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| native_error(&e))
    }

    async fn reload_schema_state(&mut self) -> NativeResult<()> {
        self.client()?.clear_type_cache();
        Ok(())
    }

    async fn set_json_codec(&mut self, codec: JsonCodec) -> NativeResult<()> {
        self.codec = codec;
        Ok(())
    }

    async fn close(&mut self) -> NativeResult<()> {
        if self.client.take().is_some() {
            tracing::debug!("Connection closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.client.as_deref().is_none_or(Client::is_closed)
    }
}

enum PortalSource {
    /// SQL cursor on the server.
    Cursor {
        client: Weak<Client>,
        name: String,
        hold: bool,
        codec: JsonCodec,
    },
    /// Rows of a statement that cannot be declared as a cursor.
    Buffered(VecDeque<Row>),
    Closed,
}

/// Streams the rows of one executed statement.
pub struct PgPortal {
    source: PortalSource,
}

impl std::fmt::Debug for PgPortal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("PgPortal");
        match &self.source {
            PortalSource::Cursor { name, hold, .. } => {
                debug.field("cursor", name).field("hold", hold);
            }
            PortalSource::Buffered(rows) => {
                debug.field("buffered", &rows.len());
            }
            PortalSource::Closed => {
                debug.field("closed", &true);
            }
        }
        debug.finish()
    }
}

#[async_trait]
impl NativePortal for PgPortal {
    async fn fetch(&mut self, max_rows: usize) -> NativeResult<Vec<Row>> {
        if max_rows == 0 {
            return Ok(Vec::new());
        }
        let rows = match &mut self.source {
            PortalSource::Closed => return Ok(Vec::new()),
            PortalSource::Buffered(rows) => {
                let take = max_rows.min(rows.len());
                return Ok(rows.drain(..take).collect());
            }
            PortalSource::Cursor {
                client, name, codec, ..
            } => {
                let client = client.upgrade().ok_or_else(NativeError::connection_closed)?;
                let fetched = client
                    .query(format!("FETCH FORWARD {max_rows} FROM {name}").as_str(), &[])
                    .await
                    .map_err(|e| native_error(&e))?;
                fetched
                    .iter()
                    .map(|row| value::decode_row(row, codec))
                    .collect::<NativeResult<Vec<_>>>()?
            }
        };

        if rows.len() < max_rows {
            self.close().await?;
        }
        Ok(rows)
    }

    async fn close(&mut self) -> NativeResult<()> {
        let PortalSource::Cursor { client, name, hold, .. } =
            std::mem::replace(&mut self.source, PortalSource::Closed)
        else {
            return Ok(());
        };
        // Cursors declared inside a transaction close when it ends.
        if !hold {
            return Ok(());
        }
        let Some(client) = client.upgrade() else {
            return Ok(());
        };
        client
            .batch_execute(&format!("CLOSE {name}"))
            .await
            .map_err(|e| native_error(&e))?;
        tracing::debug!(portal = %name, "Cursor closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_command() {
        assert_eq!(leading_command("  select 1"), "SELECT");
        assert_eq!(leading_command("(SELECT 1) UNION (SELECT 2)"), "SELECT");
        assert_eq!(leading_command("insert into t values ($1)"), "INSERT");
        assert_eq!(leading_command("UPDATE\nt SET a = 1"), "UPDATE");
        assert_eq!(leading_command(""), "");
    }

    #[test]
    fn test_command_tag() {
        assert_eq!(
            command_tag("INSERT", Some(3)).as_deref(),
            Some("INSERT 0 3")
        );
        assert_eq!(command_tag("UPDATE", Some(2)).as_deref(), Some("UPDATE 2"));
        assert_eq!(command_tag("CREATE", None).as_deref(), Some("CREATE"));
        assert_eq!(command_tag("", Some(1)), None);
    }

    #[test]
    fn test_command_tag_feeds_rowcount() {
        use crate::cursor::parse_rowcount;
        assert_eq!(parse_rowcount(command_tag("INSERT", Some(3)).as_deref()), 3);
        assert_eq!(parse_rowcount(command_tag("DELETE", Some(0)).as_deref()), 0);
        assert_eq!(parse_rowcount(command_tag("SELECT", Some(5)).as_deref()), -1);
        assert_eq!(parse_rowcount(command_tag("WITH", Some(5)).as_deref()), -1);
    }

    #[test]
    fn test_driver_config() {
        let mut params = ConnectParams {
            user: Some("app".into()),
            port: Some(5433),
            database: Some("shop".into()),
            ..ConnectParams::default()
        };
        params
            .options
            .insert("application_name".into(), "pgbridge".into());
        params.options.insert("connect_timeout".into(), "5".into());

        let config = driver_config(&params).unwrap();
        assert_eq!(config.get_user(), Some("app"));
        assert_eq!(config.get_dbname(), Some("shop"));
        assert_eq!(config.get_ports(), &[5433]);
        assert_eq!(config.get_application_name(), Some("pgbridge"));
        assert_eq!(config.get_connect_timeout(), Some(&Duration::from_secs(5)));
    }

    #[test]
    fn test_driver_config_rejects_bad_timeout() {
        let mut params = ConnectParams::default();
        params.options.insert("connect_timeout".into(), "soon".into());
        let err = driver_config(&params).unwrap_err();
        assert_eq!(err.kind(), NativeErrorKind::Interface);
    }

    #[tokio::test]
    async fn test_closed_connection_reports_closed() {
        let mut connection = PgConnection {
            client: None,
            codec: JsonCodec::default(),
            in_transaction: false,
            portals_opened: 0,
        };
        assert!(connection.is_closed());
        let err = connection.prepare("SELECT 1").await.unwrap_err();
        assert_eq!(err, NativeError::connection_closed());
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_buffered_portal_serves_rows_then_ends() {
        let rows: Vec<Row> = (0..3).map(|i| Row::new(vec![Value::Int(i)])).collect();
        let mut portal = PgPortal {
            source: PortalSource::Buffered(rows.into()),
        };
        assert!(portal.fetch(0).await.unwrap().is_empty());
        assert_eq!(portal.fetch(2).await.unwrap().len(), 2);
        assert_eq!(portal.fetch(2).await.unwrap().len(), 1);
        assert!(portal.fetch(2).await.unwrap().is_empty());
        portal.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_portal_of_closed_connection() {
        let mut portal = PgPortal {
            source: PortalSource::Cursor {
                client: Weak::new(),
                name: format!("{PORTAL_PREFIX}1"),
                hold: true,
                codec: JsonCodec::default(),
            },
        };
        let err = portal.fetch(10).await.unwrap_err();
        assert_eq!(err, NativeError::connection_closed());

        portal.close().await.unwrap();
        assert!(matches!(portal.source, PortalSource::Closed));
        assert!(portal.fetch(10).await.unwrap().is_empty());
    }

    #[test]
    fn test_declarable_commands() {
        for sql in ["SELECT 1", "(select 1) union (select 2)", "VALUES (1)", "TABLE t"] {
            assert!(DECLARABLE_COMMANDS.contains(&leading_command(sql).as_str()), "{sql}");
        }
        for sql in ["INSERT INTO t VALUES (1) RETURNING id", "WITH x AS (DELETE FROM t) SELECT 1"] {
            assert!(!DECLARABLE_COMMANDS.contains(&leading_command(sql).as_str()), "{sql}");
        }
    }

    fn live_connection() -> (crate::Dialect, crate::Connection<PgConnection>) {
        let url = std::env::var("PGBRIDGE_TEST_URL").expect("PGBRIDGE_TEST_URL is set");
        let dialect = crate::Dialect::new();
        let args = crate::Dialect::create_connect_args(&url).unwrap();
        let connection = dialect.connect(&PgConnector, &args).unwrap();
        (dialect, connection)
    }

    #[test]
    #[ignore = "needs a PostgreSQL server at PGBRIDGE_TEST_URL"]
    fn test_statements_run_while_server_side_cursor_is_open() {
        let (_dialect, connection) = live_connection();

        let mut streaming = connection.cursor(true);
        streaming
            .execute(
                "SELECT g, repeat('x', 200) FROM generate_series(1, 200000) g",
                None,
            )
            .unwrap();
        assert_eq!(streaming.fetch_many(Some(10)).unwrap().len(), 10);

        let mut other = connection.cursor(false);
        other.execute("SELECT 42", None).unwrap();
        let row = other.fetch_one().unwrap().unwrap();
        assert_eq!(row[0].as_i64(), Some(42));

        let rows = streaming.fetch_many(Some(10)).unwrap();
        assert_eq!(rows[0][0].as_i64(), Some(11));

        connection.commit().unwrap();
        streaming.close();
        connection.close().unwrap();
    }

    #[test]
    #[ignore = "needs a PostgreSQL server at PGBRIDGE_TEST_URL"]
    fn test_server_side_cursor_in_autocommit() {
        let (dialect, connection) = live_connection();
        dialect.set_isolation_level(&connection, "AUTOCOMMIT").unwrap();

        let mut streaming = connection.cursor(true);
        streaming
            .execute("SELECT g FROM generate_series(1, 120) g", None)
            .unwrap();
        assert_eq!(streaming.fetch_many(Some(60)).unwrap().len(), 60);

        let mut other = connection.cursor(false);
        other.execute("SELECT 1", None).unwrap();
        assert_eq!(other.fetch_all().unwrap().len(), 1);

        assert_eq!(streaming.fetch_all().unwrap().len(), 60);
        streaming.close();
        connection.close().unwrap();
    }
}
