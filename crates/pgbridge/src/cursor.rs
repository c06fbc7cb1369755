//! DBAPI-style cursors.
//!
//! A normal cursor fetches the whole result of a statement while holding the
//! execution mutex and serves `fetch_*` calls from memory. A server-side
//! cursor keeps a driver portal open and pulls rows in batches: 50 rows to
//! refill its read-ahead buffer, 1000 rows per round trip when draining.
//! Other statements may run on the connection between those batches.
//!
//! Statements use `%s` markers for parameters. When parameters are supplied
//! each marker becomes a positional `$n` placeholder (`$n::<cast>` when input
//! sizes were declared) and `%%` becomes a literal `%`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::sync::Mutex as TokioMutex;

use crate::bridge::Bridge;
use crate::clock::Timestamp;
use crate::connection::{ConnectionInner, SharedConnection, SharedSettings};
use crate::driver::{
    Attribute, FetchResult, NativeConnection, NativePortal, NativeResult, Row, TransactionOptions,
    Value,
};
use crate::error::{Error, Result};
use crate::types::TypeTag;

/// Rows pulled when a server-side cursor's buffer runs dry.
pub const SERVER_SIDE_BUFFER_SIZE: usize = 50;
/// Rows per round trip when a server-side cursor is drained.
pub const SERVER_SIDE_FETCH_ALL_BATCH: usize = 1000;

static ROWCOUNT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:UPDATE|DELETE|INSERT \d+) (\d+)").expect("rowcount pattern is valid")
});

type SharedPortal<P> = Arc<TokioMutex<P>>;

/// One entry of [`Cursor::description`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    /// Type OID reported by the driver.
    pub type_code: u32,
    pub display_size: Option<i32>,
    pub internal_size: Option<i32>,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
    pub null_ok: Option<bool>,
}

impl From<&Attribute> for ColumnDescription {
    fn from(attribute: &Attribute) -> Self {
        Self {
            name: attribute.name.clone(),
            type_code: attribute.type_oid,
            display_size: None,
            internal_size: None,
            precision: None,
            scale: None,
            null_ok: None,
        }
    }
}

/// Internal cursor state.
enum CursorInner<P> {
    /// Nothing executed, or closed.
    Idle,
    /// Fully fetched result of the last statement.
    Buffered { rows: VecDeque<Row> },
    /// Open portal plus read-ahead buffer.
    Streaming {
        portal: SharedPortal<P>,
        row_buffer: VecDeque<Row>,
    },
}

enum Outcome<P> {
    Fetched(FetchResult),
    Portal(P),
}

struct Executed<P> {
    attributes: Arc<[Attribute]>,
    outcome: Outcome<P>,
}

/// Cursor bound to a [`Connection`](crate::Connection).
pub struct Cursor<C: NativeConnection> {
    connection: SharedConnection<C>,
    bridge: Arc<Bridge>,
    settings: SharedSettings,
    server_side: bool,
    inner: CursorInner<C::Portal>,
    description: Option<Vec<ColumnDescription>>,
    rowcount: i64,
    arraysize: usize,
    input_sizes: Option<Vec<Option<TypeTag>>>,
    invalidate_schema_cache_asof: Timestamp,
}

impl<C: NativeConnection> fmt::Debug for Cursor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("server_side", &self.server_side)
            .field("description", &self.description)
            .field("rowcount", &self.rowcount)
            .field("arraysize", &self.arraysize)
            .field("input_sizes", &self.input_sizes)
            .finish_non_exhaustive()
    }
}

impl<C: NativeConnection> Cursor<C> {
    pub(crate) const fn new(
        connection: SharedConnection<C>,
        bridge: Arc<Bridge>,
        settings: SharedSettings,
        server_side: bool,
    ) -> Self {
        Self {
            connection,
            bridge,
            settings,
            server_side,
            inner: CursorInner::Idle,
            description: None,
            rowcount: -1,
            arraysize: 1,
            input_sizes: None,
            invalidate_schema_cache_asof: Timestamp::ZERO,
        }
    }

    pub const fn is_server_side(&self) -> bool {
        self.server_side
    }

    /// Result columns of the last statement; `None` if it returned none.
    pub fn description(&self) -> Option<&[ColumnDescription]> {
        self.description.as_deref()
    }

    /// Rows affected by the last UPDATE, DELETE or INSERT, else -1.
    pub const fn rowcount(&self) -> i64 {
        self.rowcount
    }

    pub const fn arraysize(&self) -> usize {
        self.arraysize
    }

    pub const fn set_arraysize(&mut self, arraysize: usize) {
        self.arraysize = arraysize;
    }

    /// Declare a type per parameter position; `None` leaves a position uncast.
    pub fn set_input_sizes(&mut self, sizes: &[Option<TypeTag>]) {
        self.input_sizes = Some(sizes.to_vec());
    }

    pub fn input_sizes(&self) -> Option<&[Option<TypeTag>]> {
        self.input_sizes.as_deref()
    }

    pub const fn invalidate_schema_cache_asof(&self) -> Timestamp {
        self.invalidate_schema_cache_asof
    }

    /// Invalidation timestamp the next statement is checked against.
    pub const fn set_invalidate_schema_cache_asof(&mut self, asof: Timestamp) {
        self.invalidate_schema_cache_asof = asof;
    }

    /// Execute one statement.
    pub fn execute(&mut self, operation: &str, parameters: Option<&[Value]>) -> Result<()> {
        let (sql, params) = match parameters {
            Some(params) => (
                render_operation(operation, &self.parameter_placeholders(params.len()))?,
                params.to_vec(),
            ),
            None => (operation.to_owned(), Vec::new()),
        };

        self.reset();
        let connection = Arc::clone(&self.connection);
        let options = self.settings.lock().transaction_options();
        let asof = self.invalidate_schema_cache_asof;
        let server_side = self.server_side;

        let executed = self.bridge.run(async move {
            let mut inner = connection.lock().await;
            prepare_and_execute(&mut *inner, &sql, &params, asof, options, server_side).await
        })?;

        self.description = describe(&executed.attributes);
        match executed.outcome {
            Outcome::Fetched(result) => {
                self.rowcount = parse_rowcount(result.status.as_deref());
                self.inner = CursorInner::Buffered {
                    rows: result.rows.into(),
                };
            }
            Outcome::Portal(portal) => {
                self.inner = CursorInner::Streaming {
                    portal: Arc::new(TokioMutex::new(portal)),
                    row_buffer: VecDeque::new(),
                };
            }
        }
        Ok(())
    }

    /// Execute one statement per parameter set without fetching results.
    ///
    /// An empty `seq_of_parameters` does nothing.
    pub fn executemany(&mut self, operation: &str, seq_of_parameters: &[Vec<Value>]) -> Result<()> {
        if self.server_side {
            return Err(Error::not_supported(
                "server side cursor doesn't support executemany yet",
            ));
        }
        let Some(first) = seq_of_parameters.first() else {
            return Ok(());
        };
        let sql = render_operation(operation, &self.parameter_placeholders(first.len()))?;

        self.reset();
        let connection = Arc::clone(&self.connection);
        let options = self.settings.lock().transaction_options();
        let asof = self.invalidate_schema_cache_asof;
        let param_sets = seq_of_parameters.to_vec();

        self.bridge.run(async move {
            let mut inner = connection.lock().await;
            inner.check_type_cache_invalidation(asof).await?;
            if !inner.started() {
                inner.start_transaction(options).await?;
            }
            let result = inner.native_mut().execute_many(&sql, &param_sets).await;
            result.map_err(|err| inner.handle_exception(err))
        })
    }

    pub fn fetch_one(&mut self) -> Result<Option<Row>> {
        self.refill_if_empty()?;
        Ok(self.rows_mut().and_then(VecDeque::pop_front))
    }

    /// Fetch up to `size` rows, `arraysize` when `None`.
    ///
    /// On a server-side cursor `None` fetches everything that is left.
    pub fn fetch_many(&mut self, size: Option<usize>) -> Result<Vec<Row>> {
        if self.is_streaming() {
            let Some(size) = size else {
                return self.fetch_all();
            };
            self.refill_if_empty()?;
            let buffered = self.rows_mut().map_or(0, |rows| rows.len());
            if size > buffered {
                let extra = self.fetch_from_portal(Some(size - buffered))?;
                if let Some(rows) = self.rows_mut() {
                    rows.extend(extra);
                }
            }
        }

        let size = size.unwrap_or(self.arraysize);
        let Some(rows) = self.rows_mut() else {
            return Ok(Vec::new());
        };
        let take = size.min(rows.len());
        Ok(rows.drain(..take).collect())
    }

    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        let rest = if self.is_streaming() {
            self.fetch_from_portal(None)?
        } else {
            Vec::new()
        };
        let Some(rows) = self.rows_mut() else {
            return Ok(Vec::new());
        };
        let mut all: Vec<Row> = rows.drain(..).collect();
        all.extend(rest);
        Ok(all)
    }

    /// Discard buffered rows and close any open portal.
    ///
    /// A portal that fails to close is logged and dropped.
    pub fn close(&mut self) {
        self.release_portal();
    }

    fn reset(&mut self) {
        self.release_portal();
        self.description = None;
        self.rowcount = -1;
    }

    fn release_portal(&mut self) {
        let CursorInner::Streaming { portal, .. } =
            std::mem::replace(&mut self.inner, CursorInner::Idle)
        else {
            return;
        };
        let connection = Arc::clone(&self.connection);

        let result = self.bridge.run(async move {
            let mut inner = connection.lock().await;
            let result = portal.lock().await.close().await;
            result.map_err(|err| inner.handle_exception(err))
        });
        if let Err(err) = result {
            tracing::debug!(error = %err, "Failed to close server-side cursor");
        }
    }

    const fn is_streaming(&self) -> bool {
        matches!(self.inner, CursorInner::Streaming { .. })
    }

    const fn rows_mut(&mut self) -> Option<&mut VecDeque<Row>> {
        match &mut self.inner {
            CursorInner::Idle => None,
            CursorInner::Buffered { rows } => Some(rows),
            CursorInner::Streaming { row_buffer, .. } => Some(row_buffer),
        }
    }

    fn refill_if_empty(&mut self) -> Result<()> {
        if !self.is_streaming() || self.rows_mut().is_some_and(|rows| !rows.is_empty()) {
            return Ok(());
        }
        let batch = self.fetch_from_portal(Some(SERVER_SIDE_BUFFER_SIZE))?;
        if let Some(rows) = self.rows_mut() {
            rows.extend(batch);
        }
        Ok(())
    }

    /// Pull `max_rows` rows from the portal, or all remaining rows for `None`.
    fn fetch_from_portal(&self, max_rows: Option<usize>) -> Result<Vec<Row>> {
        let CursorInner::Streaming { portal, .. } = &self.inner else {
            return Ok(Vec::new());
        };
        let portal = Arc::clone(portal);
        let connection = Arc::clone(&self.connection);

        self.bridge.run(async move {
            let mut inner = connection.lock().await;
            let mut portal = portal.lock().await;
            let result = match max_rows {
                Some(n) => portal.fetch(n).await,
                None => drain_portal(&mut *portal).await,
            };
            result.map_err(|err| inner.handle_exception(err))
        })
    }

    fn parameter_placeholders(&self, count: usize) -> Vec<String> {
        match self.input_sizes.as_deref() {
            Some(sizes) if !sizes.is_empty() => sizes
                .iter()
                .enumerate()
                .map(|(i, tag)| match tag {
                    Some(tag) => format!("${}::{}", i + 1, tag.cast_name()),
                    None => format!("${}", i + 1),
                })
                .collect(),
            _ => (1..=count).map(|i| format!("${i}")).collect(),
        }
    }
}

impl<C: NativeConnection> Iterator for Cursor<C> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetch_one().transpose()
    }
}

async fn prepare_and_execute<C: NativeConnection>(
    inner: &mut ConnectionInner<C>,
    sql: &str,
    params: &[Value],
    asof: Timestamp,
    options: TransactionOptions,
    server_side: bool,
) -> Result<Executed<C::Portal>> {
    if !inner.started() {
        inner.start_transaction(options).await?;
    }

    let (statement, attributes) = inner.prepare(sql, asof).await?;

    let outcome = if server_side {
        let result = inner.native_mut().open_portal(&statement, params).await;
        Outcome::Portal(result.map_err(|err| inner.handle_exception(err))?)
    } else {
        let result = inner.native_mut().fetch(&statement, params).await;
        Outcome::Fetched(result.map_err(|err| inner.handle_exception(err))?)
    };

    Ok(Executed {
        attributes,
        outcome,
    })
}

async fn drain_portal<P: NativePortal>(portal: &mut P) -> NativeResult<Vec<Row>> {
    let mut rows = Vec::new();
    loop {
        let batch = portal.fetch(SERVER_SIDE_FETCH_ALL_BATCH).await?;
        if batch.is_empty() {
            return Ok(rows);
        }
        rows.extend(batch);
    }
}

fn describe(attributes: &[Attribute]) -> Option<Vec<ColumnDescription>> {
    if attributes.is_empty() {
        None
    } else {
        Some(attributes.iter().map(ColumnDescription::from).collect())
    }
}

/// Affected row count from a command completion tag, -1 when not applicable.
pub fn parse_rowcount(status: Option<&str>) -> i64 {
    status
        .and_then(|status| ROWCOUNT_PATTERN.captures(status))
        .and_then(|captures| captures.get(1))
        .and_then(|count| count.as_str().parse().ok())
        .unwrap_or(-1)
}

/// Replace `%s` markers with `placeholders` and `%%` with `%`.
pub fn render_operation(template: &str, placeholders: &[String]) -> Result<String> {
    let mut out = String::with_capacity(template.len() + placeholders.len() * 3);
    let mut placeholders = placeholders.iter();
    let mut chars = template.char_indices();

    while let Some((pos, c)) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some((_, '%')) => out.push('%'),
            Some((_, 's')) => {
                let placeholder = placeholders.next().ok_or_else(|| {
                    Error::programming("not enough parameters for the statement")
                })?;
                out.push_str(placeholder);
            }
            Some((_, other)) => {
                return Err(Error::programming(format!(
                    "unsupported format character '{other}' at index {}",
                    pos + 1
                )));
            }
            None => return Err(Error::programming("incomplete format at end of statement")),
        }
    }

    if placeholders.next().is_some() {
        return Err(Error::programming(
            "not all parameters were used by the statement",
        ));
    }
    Ok(out)
}
