//! Native async driver boundary.
//!
//! The adapter never talks to the network itself. It consumes a driver through
//! the [`NativeConnector`], [`NativeConnection`] and [`NativePortal`] traits and
//! exchanges data with it as [`Value`]s and [`Row`]s. Driver failures are
//! reported as [`NativeError`]s, which carry a [`NativeErrorKind`] from a closed
//! set that the translator in [`crate::error`] maps onto the DBAPI hierarchy.

use std::fmt;
use std::ops::Index;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::codec::JsonCodec;
use crate::config::ConnectParams;

/// Result alias for driver calls.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

// ═══════════════════════════════════════════════════════════════════════════
// Native error model
// ═══════════════════════════════════════════════════════════════════════════

/// Classification of a native driver failure.
///
/// Server errors are classified from their SQLSTATE by
/// [`NativeErrorKind::from_sqlstate`]; client-side failures use
/// [`Interface`](Self::Interface), [`Io`](Self::Io),
/// [`Timeout`](Self::Timeout) or [`DataConversion`](Self::DataConversion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NativeErrorKind {
    /// Class 23: a constraint was violated.
    IntegrityConstraintViolation,
    /// Class 42: bad syntax or insufficient privileges.
    SyntaxOrAccess,
    /// A prepared statement no longer matches the server schema.
    InvalidCachedStatement,
    /// `XX000`: the server hit an internal error.
    InternalServer,
    /// Any other server-reported error.
    Postgres,
    /// Client-side misuse, including use of a closed connection.
    Interface,
    /// A value could not be converted to or from its wire form.
    DataConversion,
    /// Socket level failure.
    Io,
    /// The driver gave up waiting.
    Timeout,
}

const SERVER_LINEAGE_INTEGRITY: &[NativeErrorKind] = &[
    NativeErrorKind::IntegrityConstraintViolation,
    NativeErrorKind::Postgres,
];
const SERVER_LINEAGE_SYNTAX: &[NativeErrorKind] =
    &[NativeErrorKind::SyntaxOrAccess, NativeErrorKind::Postgres];
const SERVER_LINEAGE_CACHED: &[NativeErrorKind] = &[
    NativeErrorKind::InvalidCachedStatement,
    NativeErrorKind::Postgres,
];
const SERVER_LINEAGE_INTERNAL: &[NativeErrorKind] =
    &[NativeErrorKind::InternalServer, NativeErrorKind::Postgres];

/// Message the server sends when a cached plan's row type changed.
const CACHED_PLAN_CHANGED: &str = "cached plan must not change result type";

impl NativeErrorKind {
    /// Returns this kind followed by its ancestors, most specific first.
    #[must_use]
    pub const fn lineage(self) -> &'static [Self] {
        match self {
            Self::IntegrityConstraintViolation => SERVER_LINEAGE_INTEGRITY,
            Self::SyntaxOrAccess => SERVER_LINEAGE_SYNTAX,
            Self::InvalidCachedStatement => SERVER_LINEAGE_CACHED,
            Self::InternalServer => SERVER_LINEAGE_INTERNAL,
            Self::Postgres => &[Self::Postgres],
            Self::Interface => &[Self::Interface],
            Self::DataConversion => &[Self::DataConversion],
            Self::Io => &[Self::Io],
            Self::Timeout => &[Self::Timeout],
        }
    }

    /// Classifies a server error from its SQLSTATE and message.
    #[must_use]
    pub fn from_sqlstate(code: &str, message: &str) -> Self {
        match code {
            "XX000" => Self::InternalServer,
            "26000" => Self::InvalidCachedStatement,
            "0A000" if message.contains(CACHED_PLAN_CHANGED) => Self::InvalidCachedStatement,
            c if c.starts_with("23") => Self::IntegrityConstraintViolation,
            c if c.starts_with("42") => Self::SyntaxOrAccess,
            _ => Self::Postgres,
        }
    }

    /// Name used as the prefix of translated messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::IntegrityConstraintViolation => "IntegrityConstraintViolationError",
            Self::SyntaxOrAccess => "SyntaxOrAccessError",
            Self::InvalidCachedStatement => "InvalidCachedStatementError",
            Self::InternalServer => "InternalServerError",
            Self::Postgres => "PostgresError",
            Self::Interface => "InterfaceError",
            Self::DataConversion => "DataConversionError",
            Self::Io => "IoError",
            Self::Timeout => "TimeoutError",
        }
    }
}

impl fmt::Display for NativeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure reported by the native driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct NativeError {
    kind: NativeErrorKind,
    message: String,
    sqlstate: Option<String>,
}

impl NativeError {
    /// Create a client-side error of the given kind.
    #[must_use]
    pub fn new(kind: NativeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sqlstate: None,
        }
    }

    /// Create an error from a server response, classifying its SQLSTATE.
    #[must_use]
    pub fn from_server(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        Self {
            kind: NativeErrorKind::from_sqlstate(&code, &message),
            message,
            sqlstate: Some(code),
        }
    }

    /// Create the error raised when a closed connection is used.
    #[must_use]
    pub fn connection_closed() -> Self {
        Self::new(NativeErrorKind::Interface, "connection is closed")
    }

    /// Create a value conversion error.
    #[must_use]
    pub fn data_conversion(message: impl Into<String>) -> Self {
        Self::new(NativeErrorKind::DataConversion, message)
    }

    /// Attach a SQLSTATE without reclassifying.
    #[must_use]
    pub fn with_sqlstate(mut self, code: impl Into<String>) -> Self {
        self.sqlstate = Some(code.into());
        self
    }

    /// Kind of this error.
    #[must_use]
    pub const fn kind(&self) -> NativeErrorKind {
        self.kind
    }

    /// Driver message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Server SQLSTATE, if the error came from the server.
    #[must_use]
    pub fn sqlstate(&self) -> Option<&str> {
        self.sqlstate.as_deref()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Values and rows
// ═══════════════════════════════════════════════════════════════════════════

/// A single parameter or column value.
///
/// Numeric values too large or too precise for the native Rust types travel
/// as their decimal text in [`Value::Decimal`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Any integer column.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Text, also used for enum labels, UUIDs and types without a binary codec.
    Text(String),
    /// Exact numeric rendered as decimal text.
    Decimal(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Decoded JSON or JSONB document.
    Json(serde_json::Value),
}

impl Value {
    /// Returns true for SQL NULL.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the value as text when it is textual.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload, if any.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// One result row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row(Vec<Value>);

impl Row {
    /// Wrap column values.
    #[must_use]
    pub const fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for a row without columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value at `index`, if present.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// All values in column order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Consume the row, returning its values.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.0[index]
    }
}

/// Result column reported by a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attribute {
    /// Column name.
    pub name: String,
    /// Type OID of the column.
    pub type_oid: u32,
}

impl Attribute {
    /// Create a column descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, type_oid: u32) -> Self {
        Self {
            name: name.into(),
            type_oid,
        }
    }
}

/// Rows and completion status of a fully fetched statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResult {
    /// Every row the statement produced.
    pub rows: Vec<Row>,
    /// Command completion tag, e.g. `UPDATE 3`.
    pub status: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Transactions
// ═══════════════════════════════════════════════════════════════════════════

/// Transaction isolation level, or autocommit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// No explicit transaction is opened.
    Autocommit,
    /// `READ COMMITTED`.
    #[default]
    ReadCommitted,
    /// `REPEATABLE READ`.
    RepeatableRead,
    /// `SERIALIZABLE`.
    Serializable,
}

impl IsolationLevel {
    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Autocommit => "AUTOCOMMIT",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options a transaction is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// Open the transaction `READ ONLY`.
    pub readonly: bool,
    /// Open the transaction `DEFERRABLE`.
    pub deferrable: bool,
}

impl TransactionOptions {
    /// SQL that opens a transaction with these options.
    #[must_use]
    pub fn begin_statement(&self) -> String {
        let mut sql = format!("BEGIN ISOLATION LEVEL {}", self.isolation);
        if self.readonly {
            sql.push_str(" READ ONLY");
        }
        if self.deferrable {
            sql.push_str(" DEFERRABLE");
        }
        sql
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Driver traits
// ═══════════════════════════════════════════════════════════════════════════

/// Opens native connections.
#[async_trait]
pub trait NativeConnector: Clone + Send + Sync + 'static {
    /// Connection type produced by this connector.
    type Connection: NativeConnection;

    /// Open a new connection.
    async fn connect(&self, params: &ConnectParams) -> NativeResult<Self::Connection>;
}

/// A single async driver connection.
///
/// Callers guarantee that at most one method runs at a time.
#[async_trait]
pub trait NativeConnection: Send + 'static {
    /// Compiled statement handle; cheap to clone.
    type Statement: Clone + Send + Sync + 'static;
    /// Open streaming portal.
    type Portal: NativePortal;

    /// Compile `sql` into a reusable statement.
    async fn prepare(&mut self, sql: &str) -> NativeResult<Self::Statement>;

    /// Result columns of a compiled statement.
    fn attributes(&self, statement: &Self::Statement) -> Vec<Attribute>;

    /// Execute a statement and fetch every row.
    async fn fetch(
        &mut self,
        statement: &Self::Statement,
        params: &[Value],
    ) -> NativeResult<FetchResult>;

    /// Execute a statement and return a handle that streams its rows.
    async fn open_portal(
        &mut self,
        statement: &Self::Statement,
        params: &[Value],
    ) -> NativeResult<Self::Portal>;

    /// Execute `sql` once per parameter set, discarding results.
    async fn execute_many(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> NativeResult<()>;

    /// Open a transaction.
    async fn begin(&mut self, options: &TransactionOptions) -> NativeResult<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> NativeResult<()>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> NativeResult<()>;

    /// Drop cached type and schema state so it is introspected again.
    async fn reload_schema_state(&mut self) -> NativeResult<()>;

    /// Install the JSON/JSONB codec used for decoding.
    async fn set_json_codec(&mut self, _codec: JsonCodec) -> NativeResult<()> {
        Ok(())
    }

    /// Close the connection. Closing twice is a no-op.
    async fn close(&mut self) -> NativeResult<()>;

    /// Returns true once the connection can no longer be used.
    fn is_closed(&self) -> bool;
}

/// Streaming result handle for server-side cursors.
#[async_trait]
pub trait NativePortal: Send + 'static {
    /// Fetch up to `max_rows` rows; an empty result means exhaustion.
    async fn fetch(&mut self, max_rows: usize) -> NativeResult<Vec<Row>>;

    /// Release the portal on the server. Closing twice is a no-op.
    async fn close(&mut self) -> NativeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(
            NativeErrorKind::from_sqlstate("23505", "duplicate key"),
            NativeErrorKind::IntegrityConstraintViolation
        );
        assert_eq!(
            NativeErrorKind::from_sqlstate("42P01", "relation does not exist"),
            NativeErrorKind::SyntaxOrAccess
        );
        assert_eq!(
            NativeErrorKind::from_sqlstate("XX000", "cache lookup failed for type 1234"),
            NativeErrorKind::InternalServer
        );
        assert_eq!(
            NativeErrorKind::from_sqlstate("26000", "prepared statement does not exist"),
            NativeErrorKind::InvalidCachedStatement
        );
        assert_eq!(
            NativeErrorKind::from_sqlstate("0A000", "cached plan must not change result type"),
            NativeErrorKind::InvalidCachedStatement
        );
        assert_eq!(
            NativeErrorKind::from_sqlstate("0A000", "feature not supported"),
            NativeErrorKind::Postgres
        );
        assert_eq!(
            NativeErrorKind::from_sqlstate("57014", "canceling statement"),
            NativeErrorKind::Postgres
        );
    }

    #[test]
    fn test_lineage_ends_at_postgres_for_server_errors() {
        for kind in [
            NativeErrorKind::IntegrityConstraintViolation,
            NativeErrorKind::SyntaxOrAccess,
            NativeErrorKind::InvalidCachedStatement,
            NativeErrorKind::InternalServer,
        ] {
            let lineage = kind.lineage();
            assert_eq!(lineage.first(), Some(&kind));
            assert_eq!(lineage.last(), Some(&NativeErrorKind::Postgres));
        }
        assert_eq!(NativeErrorKind::Io.lineage(), &[NativeErrorKind::Io]);
    }

    #[test]
    fn test_native_error_from_server() {
        let err = NativeError::from_server("23505", "duplicate key value");
        assert_eq!(err.kind(), NativeErrorKind::IntegrityConstraintViolation);
        assert_eq!(err.sqlstate(), Some("23505"));
        assert_eq!(err.message(), "duplicate key value");
        assert_eq!(
            err.to_string(),
            "IntegrityConstraintViolationError: duplicate key value"
        );
    }

    #[test]
    fn test_begin_statement() {
        let options = TransactionOptions::default();
        assert_eq!(options.begin_statement(), "BEGIN ISOLATION LEVEL READ COMMITTED");

        let options = TransactionOptions {
            isolation: IsolationLevel::Serializable,
            readonly: true,
            deferrable: true,
        };
        assert_eq!(
            options.begin_statement(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY DEFERRABLE"
        );
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(7_i32), Value::Int(7));
        assert_eq!(Value::from("x"), Value::Text("x".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(true)), Value::Bool(true));
        assert!(Value::Null.is_null());
        assert_eq!(Value::Decimal("1.50".into()).as_str(), Some("1.50"));
    }

    #[test]
    fn test_row_access() {
        let row = Row::new(vec![Value::Int(1), Value::Text("a".into())]);
        assert_eq!(row.len(), 2);
        assert_eq!(row[0], Value::Int(1));
        assert_eq!(row.get(1), Some(&Value::Text("a".into())));
        assert!(row.get(2).is_none());
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"[1,"a"]"#);
    }
}
