//! Synchronous connection over a native async connection.
//!
//! The native connection, the open transaction and the prepared statement
//! cache live in [`ConnectionInner`] behind an `Arc<tokio::sync::Mutex<_>>`.
//! That mutex is the execution mutex: every statement and every transaction
//! control call holds it for its whole duration, so at most one statement is
//! in flight per connection. Settings that never touch the network
//! (isolation, readonly, deferrable) sit in a `parking_lot::Mutex` and are
//! copied into each operation.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as TokioMutex;

use crate::bridge::{Bridge, BridgeMode};
use crate::clock::{self, SchemaInvalidation, Timestamp};
use crate::codec::JsonCodec;
use crate::config::ConnectArgs;
use crate::cursor::Cursor;
use crate::driver::{
    Attribute, IsolationLevel, NativeConnection, NativeConnector, NativeError, TransactionOptions,
};
use crate::error::{self, Error, Result};
use crate::statement_cache::{CacheStats, PreparedStatementCache};

/// Query used by [`Connection::ping`].
const PING_QUERY: &str = "SELECT 1";

pub(crate) type SharedConnection<C> = Arc<TokioMutex<ConnectionInner<C>>>;
pub(crate) type SharedSettings = Arc<Mutex<TransactionSettings>>;

/// Isolation and access mode settings of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransactionSettings {
    /// Level used for the next transaction, possibly autocommit.
    pub isolation_level: IsolationLevel,
    /// Level restored when autocommit is switched off.
    pub isolation_setting: IsolationLevel,
    pub readonly: bool,
    pub deferrable: bool,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::ReadCommitted,
            isolation_setting: IsolationLevel::ReadCommitted,
            readonly: false,
            deferrable: false,
        }
    }
}

impl TransactionSettings {
    pub const fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            isolation: self.isolation_level,
            readonly: self.readonly,
            deferrable: self.deferrable,
        }
    }
}

/// An open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transaction {
    options: TransactionOptions,
}

/// State guarded by the execution mutex.
pub(crate) struct ConnectionInner<C: NativeConnection> {
    native: C,
    transaction: Option<Transaction>,
    statement_cache: Option<PreparedStatementCache<C::Statement>>,
    invalidate_schema_cache_asof: Timestamp,
    invalidation: Arc<SchemaInvalidation>,
}

impl<C: NativeConnection> fmt::Debug for ConnectionInner<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("transaction", &self.transaction)
            .field(
                "statement_cache",
                &self.statement_cache.as_ref().map(PreparedStatementCache::stats),
            )
            .field(
                "invalidate_schema_cache_asof",
                &self.invalidate_schema_cache_asof,
            )
            .finish_non_exhaustive()
    }
}

impl<C: NativeConnection> ConnectionInner<C> {
    pub(crate) fn new(native: C, cache_size: usize, invalidation: Arc<SchemaInvalidation>) -> Self {
        Self {
            native,
            transaction: None,
            statement_cache: PreparedStatementCache::new(cache_size),
            invalidate_schema_cache_asof: clock::now(),
            invalidation,
        }
    }

    pub(crate) const fn started(&self) -> bool {
        self.transaction.is_some()
    }

    pub(crate) const fn native_mut(&mut self) -> &mut C {
        &mut self.native
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.native.is_closed()
    }

    pub(crate) const fn invalidate_schema_cache_asof(&self) -> Timestamp {
        self.invalidate_schema_cache_asof
    }

    pub(crate) fn cache_stats(&self) -> Option<CacheStats> {
        self.statement_cache.as_ref().map(PreparedStatementCache::stats)
    }

    /// Translate a native failure, applying its recovery side effects.
    pub(crate) fn handle_exception(&mut self, error: NativeError) -> Error {
        if self.native.is_closed() && self.transaction.take().is_some() {
            tracing::debug!("connection closed, transaction state dropped");
        }

        let translated = error::translate(error);
        if translated.requires_cache_invalidation() {
            let asof = self.invalidation.bump();
            tracing::warn!(
                error = %translated,
                asof = asof.as_nanos(),
                "stale schema state reported by server, invalidating statement caches"
            );
        }
        translated
    }

    /// Open a transaction unless `options` asks for autocommit.
    pub(crate) async fn start_transaction(&mut self, options: TransactionOptions) -> Result<()> {
        if options.isolation == IsolationLevel::Autocommit {
            return Ok(());
        }

        let result = self.native.begin(&options).await;
        if let Err(err) = result {
            return Err(self.handle_exception(err));
        }
        tracing::debug!(isolation = %options.isolation, "transaction started");
        self.transaction = Some(Transaction { options });
        Ok(())
    }

    /// Reload driver schema state if `asof` is newer than what this connection has seen.
    pub(crate) async fn check_type_cache_invalidation(&mut self, asof: Timestamp) -> Result<()> {
        if asof <= self.invalidate_schema_cache_asof {
            return Ok(());
        }

        let result = self.native.reload_schema_state().await;
        if let Err(err) = result {
            return Err(self.handle_exception(err));
        }
        tracing::debug!(asof = asof.as_nanos(), "driver schema state reloaded");
        self.invalidate_schema_cache_asof = asof;
        Ok(())
    }

    /// Return a compiled statement for `sql`, from the cache when it is fresh.
    pub(crate) async fn prepare(
        &mut self,
        sql: &str,
        asof: Timestamp,
    ) -> Result<(C::Statement, Arc<[Attribute]>)> {
        self.check_type_cache_invalidation(asof).await?;

        if let Some(cached) = self
            .statement_cache
            .as_mut()
            .and_then(|cache| cache.lookup(sql, asof))
        {
            return Ok((cached.statement, cached.attributes));
        }

        let result = self.native.prepare(sql).await;
        let statement = match result {
            Ok(statement) => statement,
            Err(err) => return Err(self.handle_exception(err)),
        };
        let attributes: Arc<[Attribute]> = self.native.attributes(&statement).into();
        tracing::debug!(sql, columns = attributes.len(), "statement prepared");

        if let Some(cache) = self.statement_cache.as_mut() {
            cache.insert(sql, statement.clone(), Arc::clone(&attributes));
        }
        Ok((statement, attributes))
    }

    pub(crate) async fn commit(&mut self) -> Result<()> {
        let Some(transaction) = self.transaction.take() else {
            return Ok(());
        };
        let result = self.native.commit().await;
        tracing::debug!(isolation = %transaction.options.isolation, ok = result.is_ok(), "commit");
        result.map_err(|err| self.handle_exception(err))
    }

    pub(crate) async fn rollback(&mut self) -> Result<()> {
        let Some(transaction) = self.transaction.take() else {
            return Ok(());
        };
        let result = self.native.rollback().await;
        tracing::debug!(isolation = %transaction.options.isolation, ok = result.is_ok(), "rollback");
        result.map_err(|err| self.handle_exception(err))
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        self.rollback().await?;
        let result = self.native.close().await;
        result.map_err(|err| self.handle_exception(err))
    }

    pub(crate) async fn ping(&mut self, options: TransactionOptions) -> Result<()> {
        let own_transaction = !self.started() && options.isolation != IsolationLevel::Autocommit;
        if own_transaction {
            self.start_transaction(options).await?;
        }

        let result = match self.native.prepare(PING_QUERY).await {
            Ok(statement) => self.native.fetch(&statement, &[]).await.map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            return Err(self.handle_exception(err));
        }

        if own_transaction {
            self.rollback().await?;
        }
        Ok(())
    }

    pub(crate) async fn install_json_codec(&mut self, codec: JsonCodec) -> Result<()> {
        let result = self.native.set_json_codec(codec).await;
        result.map_err(|err| self.handle_exception(err))
    }
}

/// Synchronous DBAPI-style connection.
///
/// Every method that talks to the server blocks until the driver is done.
/// A `Connection` can be shared between threads; statements from different
/// threads are serialized.
pub struct Connection<C: NativeConnection> {
    inner: SharedConnection<C>,
    bridge: Arc<Bridge>,
    settings: SharedSettings,
    invalidation: Arc<SchemaInvalidation>,
}

impl<C: NativeConnection> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("bridge", &self.bridge.mode())
            .field("settings", &*self.settings.lock())
            .finish_non_exhaustive()
    }
}

impl<C: NativeConnection> Connection<C> {
    pub(crate) fn connect<K>(
        connector: &K,
        args: &ConnectArgs,
        invalidation: Arc<SchemaInvalidation>,
    ) -> Result<Self>
    where
        K: NativeConnector<Connection = C>,
    {
        let bridge = Arc::new(Bridge::new(BridgeMode::from_async_fallback(
            args.async_fallback,
        ))?);

        let connector = connector.clone();
        let params = args.params.clone();
        let native = bridge.run(async move {
            connector
                .connect(&params)
                .await
                .map_err(error::translate)
        })?;
        tracing::debug!(
            host = args.params.host.as_deref().unwrap_or("localhost"),
            cache_size = args.prepared_statement_cache_size,
            mode = ?bridge.mode(),
            "connection established"
        );

        Ok(Self {
            inner: Arc::new(TokioMutex::new(ConnectionInner::new(
                native,
                args.prepared_statement_cache_size,
                Arc::clone(&invalidation),
            ))),
            bridge,
            settings: Arc::new(Mutex::new(TransactionSettings::default())),
            invalidation,
        })
    }

    /// Open a cursor; `server_side` cursors stream rows in batches.
    pub fn cursor(&self, server_side: bool) -> Cursor<C> {
        Cursor::new(
            Arc::clone(&self.inner),
            Arc::clone(&self.bridge),
            Arc::clone(&self.settings),
            server_side,
        )
    }

    pub fn bridge_mode(&self) -> BridgeMode {
        self.bridge.mode()
    }

    pub fn autocommit(&self) -> bool {
        self.settings.lock().isolation_level == IsolationLevel::Autocommit
    }

    /// Switch autocommit on, or back to the configured isolation level.
    ///
    /// An open transaction is left untouched.
    pub fn set_autocommit(&self, autocommit: bool) {
        let mut settings = self.settings.lock();
        settings.isolation_level = if autocommit {
            IsolationLevel::Autocommit
        } else {
            settings.isolation_setting
        };
    }

    /// Isolation level of the next transaction.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.settings.lock().isolation_level
    }

    /// Roll back any open transaction, then change the isolation level.
    ///
    /// [`IsolationLevel::Autocommit`] switches autocommit on and keeps the
    /// previous level for when it is switched off again.
    pub fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        self.rollback()?;
        let mut settings = self.settings.lock();
        settings.isolation_level = level;
        settings.isolation_setting = level;
        Ok(())
    }

    pub fn readonly(&self) -> bool {
        self.settings.lock().readonly
    }

    /// Takes effect with the next transaction.
    pub fn set_readonly(&self, readonly: bool) {
        self.settings.lock().readonly = readonly;
    }

    pub fn deferrable(&self) -> bool {
        self.settings.lock().deferrable
    }

    /// Takes effect with the next transaction.
    pub fn set_deferrable(&self, deferrable: bool) {
        self.settings.lock().deferrable = deferrable;
    }

    /// Commit the open transaction, if any. The transaction is gone afterwards
    /// even if the commit fails.
    pub fn commit(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.bridge
            .run(async move { inner.lock().await.commit().await })
    }

    /// Roll back the open transaction, if any. The transaction is gone
    /// afterwards even if the rollback fails.
    pub fn rollback(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.bridge
            .run(async move { inner.lock().await.rollback().await })
    }

    /// Roll back, then close the native connection.
    pub fn close(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.bridge
            .run(async move { inner.lock().await.close().await })
    }

    /// Check the connection with a trivial query.
    ///
    /// Outside a transaction the query runs in one of its own that is rolled
    /// back afterwards.
    pub fn ping(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let options = self.settings.lock().transaction_options();
        self.bridge
            .run(async move { inner.lock().await.ping(options).await })
    }

    pub fn in_transaction(&self) -> Result<bool> {
        let inner = Arc::clone(&self.inner);
        self.bridge
            .run(async move { Ok(inner.lock().await.started()) })
    }

    pub fn is_closed(&self) -> Result<bool> {
        let inner = Arc::clone(&self.inner);
        self.bridge
            .run(async move { Ok(inner.lock().await.is_closed()) })
    }

    /// Statement cache counters; `None` when caching is disabled.
    pub fn cache_stats(&self) -> Result<Option<CacheStats>> {
        let inner = Arc::clone(&self.inner);
        self.bridge
            .run(async move { Ok(inner.lock().await.cache_stats()) })
    }

    /// Latest invalidation timestamp this connection has acted on.
    pub fn invalidate_schema_cache_asof(&self) -> Result<Timestamp> {
        let inner = Arc::clone(&self.inner);
        self.bridge
            .run(async move { Ok(inner.lock().await.invalidate_schema_cache_asof()) })
    }

    /// Invalidation counter shared with the dialect.
    pub fn schema_invalidation(&self) -> &Arc<SchemaInvalidation> {
        &self.invalidation
    }

    pub(crate) fn install_json_codec(&self, codec: JsonCodec) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.bridge
            .run(async move { inner.lock().await.install_json_codec(codec).await })
    }
}
