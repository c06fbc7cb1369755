//! Scripted in-memory driver for unit tests.
//!
//! Every call is appended to a shared log so tests can assert on the exact
//! sequence of driver operations. Results are scripted per SQL text; unknown
//! statements succeed with no columns, no rows and no status.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::codec::JsonCodec;
use crate::config::ConnectParams;
use crate::driver::{
    Attribute, FetchResult, NativeConnection, NativeConnector, NativeError, NativePortal,
    NativeResult, Row, TransactionOptions, Value,
};

/// Driver operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockOp {
    Connect,
    Prepare,
    Fetch,
    OpenPortal,
    PortalFetch,
    ExecuteMany,
    Begin,
    Commit,
    Rollback,
    Reload,
}

/// Scripted outcome of one statement.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockResult {
    pub attributes: Vec<Attribute>,
    pub rows: Vec<Row>,
    pub status: Option<String>,
}

impl MockResult {
    pub fn rows(columns: &[(&str, u32)], rows: Vec<Row>) -> Self {
        Self {
            attributes: columns
                .iter()
                .map(|(name, oid)| Attribute::new(*name, *oid))
                .collect(),
            rows,
            status: None,
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_owned());
        self
    }
}

#[derive(Debug, Default)]
struct MockState {
    log: Vec<String>,
    results: HashMap<String, MockResult>,
    failures: VecDeque<(MockOp, NativeError)>,
    next_statement_id: usize,
    reloads: usize,
    closed: bool,
    portal_fetches: Vec<usize>,
    fetch_params: Vec<Vec<Value>>,
    json_codec_installed: bool,
    fetch_yields: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(self, sql: &str, result: MockResult) -> Self {
        self.set_result(sql, result);
        self
    }

    pub fn set_result(&self, sql: &str, result: MockResult) {
        self.state.lock().results.insert(sql.to_owned(), result);
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: MockOp, error: NativeError) {
        self.state.lock().failures.push_back((op, error));
    }

    pub fn set_closed(&self, closed: bool) {
        self.state.lock().closed = closed;
    }

    /// Yield to the scheduler this many times in the middle of every fetch.
    pub fn set_fetch_yields(&self, yields: usize) {
        self.state.lock().fetch_yields = yields;
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn prepare_count(&self) -> usize {
        self.state.lock().next_statement_id
    }

    pub fn reload_count(&self) -> usize {
        self.state.lock().reloads
    }

    pub fn portal_fetches(&self) -> Vec<usize> {
        self.state.lock().portal_fetches.clone()
    }

    pub fn fetch_params(&self) -> Vec<Vec<Value>> {
        self.state.lock().fetch_params.clone()
    }

    pub fn json_codec_installed(&self) -> bool {
        self.state.lock().json_codec_installed
    }
}

fn take_failure(state: &Mutex<MockState>, op: MockOp) -> NativeResult<()> {
    let mut state = state.lock();
    if let Some(index) = state.failures.iter().position(|(candidate, _)| *candidate == op)
        && let Some((_, error)) = state.failures.remove(index)
    {
        return Err(error);
    }
    if state.closed && op != MockOp::Connect {
        return Err(NativeError::connection_closed());
    }
    Ok(())
}

#[async_trait]
impl NativeConnector for MockDriver {
    type Connection = MockConnection;

    async fn connect(&self, _params: &ConnectParams) -> NativeResult<MockConnection> {
        take_failure(&self.state, MockOp::Connect)?;
        self.state.lock().log.push("connect".to_owned());
        Ok(MockConnection {
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MockStatement {
    pub id: usize,
    pub sql: String,
}

impl MockConnection {
    fn record(&self, entry: String) {
        self.state.lock().log.push(entry);
    }

    fn result_for(&self, sql: &str) -> MockResult {
        self.state.lock().results.get(sql).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl NativeConnection for MockConnection {
    type Statement = MockStatement;
    type Portal = MockPortal;

    async fn prepare(&mut self, sql: &str) -> NativeResult<MockStatement> {
        take_failure(&self.state, MockOp::Prepare)?;
        let mut state = self.state.lock();
        state.next_statement_id += 1;
        state.log.push(format!("prepare {sql}"));
        Ok(MockStatement {
            id: state.next_statement_id,
            sql: sql.to_owned(),
        })
    }

    fn attributes(&self, statement: &MockStatement) -> Vec<Attribute> {
        self.result_for(&statement.sql).attributes
    }

    async fn fetch(
        &mut self,
        statement: &MockStatement,
        params: &[Value],
    ) -> NativeResult<FetchResult> {
        take_failure(&self.state, MockOp::Fetch)?;
        let yields = {
            let mut state = self.state.lock();
            state.log.push(format!("fetch {}", statement.sql));
            state.fetch_params.push(params.to_vec());
            state.fetch_yields
        };

        if yields > 0 {
            for _ in 0..yields {
                tokio::task::yield_now().await;
            }
            self.record(format!("fetch done {}", statement.sql));
        }

        let result = self.result_for(&statement.sql);
        Ok(FetchResult {
            rows: result.rows,
            status: result.status,
        })
    }

    async fn open_portal(
        &mut self,
        statement: &MockStatement,
        params: &[Value],
    ) -> NativeResult<MockPortal> {
        take_failure(&self.state, MockOp::OpenPortal)?;
        {
            let mut state = self.state.lock();
            state.log.push(format!("portal {}", statement.sql));
            state.fetch_params.push(params.to_vec());
        }
        Ok(MockPortal {
            sql: statement.sql.clone(),
            rows: self.result_for(&statement.sql).rows.into(),
            closed: false,
            state: Arc::clone(&self.state),
        })
    }

    async fn execute_many(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> NativeResult<()> {
        take_failure(&self.state, MockOp::ExecuteMany)?;
        self.record(format!("execute_many {sql} x{}", param_sets.len()));
        Ok(())
    }

    async fn begin(&mut self, options: &TransactionOptions) -> NativeResult<()> {
        take_failure(&self.state, MockOp::Begin)?;
        self.record(options.begin_statement());
        Ok(())
    }

    async fn commit(&mut self) -> NativeResult<()> {
        self.record("COMMIT".to_owned());
        take_failure(&self.state, MockOp::Commit)
    }

    async fn rollback(&mut self) -> NativeResult<()> {
        self.record("ROLLBACK".to_owned());
        take_failure(&self.state, MockOp::Rollback)
    }

    async fn reload_schema_state(&mut self) -> NativeResult<()> {
        take_failure(&self.state, MockOp::Reload)?;
        let mut state = self.state.lock();
        state.reloads += 1;
        state.log.push("reload_schema_state".to_owned());
        Ok(())
    }

    async fn set_json_codec(&mut self, _codec: JsonCodec) -> NativeResult<()> {
        let mut state = self.state.lock();
        state.json_codec_installed = true;
        state.log.push("set_json_codec".to_owned());
        Ok(())
    }

    async fn close(&mut self) -> NativeResult<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.log.push("close".to_owned());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[derive(Debug)]
pub(crate) struct MockPortal {
    sql: String,
    rows: VecDeque<Row>,
    closed: bool,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl NativePortal for MockPortal {
    async fn fetch(&mut self, max_rows: usize) -> NativeResult<Vec<Row>> {
        take_failure(&self.state, MockOp::PortalFetch)?;
        {
            let mut state = self.state.lock();
            state.portal_fetches.push(max_rows);
            state.log.push(format!("portal fetch {max_rows} {}", self.sql));
        }
        let take = max_rows.min(self.rows.len());
        Ok(self.rows.drain(..take).collect())
    }

    async fn close(&mut self) -> NativeResult<()> {
        if !self.closed {
            self.closed = true;
            self.state.lock().log.push(format!("portal close {}", self.sql));
        }
        Ok(())
    }
}
