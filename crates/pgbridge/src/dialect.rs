//! Dialect adapter.
//!
//! A [`Dialect`] owns the schema invalidation counter shared by every
//! connection it opens, installs the JSON codecs on new connections and
//! carries the configuration hooks a SQL toolkit calls around execution.

use std::sync::Arc;

use crate::clock::{SchemaInvalidation, Timestamp};
use crate::codec::JsonCodec;
use crate::config::ConnectArgs;
use crate::connection::Connection;
use crate::cursor::Cursor;
use crate::driver::{IsolationLevel, NativeConnection, NativeConnector};
use crate::error::{Error, Result};
use crate::types::TypeTag;

/// Isolation level names accepted by [`Dialect::parse_isolation_level`].
const ISOLATION_LOOKUP: &[(&str, IsolationLevel)] = &[
    ("AUTOCOMMIT", IsolationLevel::Autocommit),
    ("READ COMMITTED", IsolationLevel::ReadCommitted),
    ("REPEATABLE READ", IsolationLevel::RepeatableRead),
    ("SERIALIZABLE", IsolationLevel::Serializable),
];

/// Pool implementation a toolkit should use with this dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolClass {
    /// Queue pool adapted for async connections.
    AsyncAdaptedQueue,
    /// Queue pool for connections driven through the background event loop.
    FallbackAsyncAdaptedQueue,
}

/// PostgreSQL dialect over a native async driver.
#[derive(Debug, Default)]
pub struct Dialect {
    invalidation: Arc<SchemaInvalidation>,
    json_codec: JsonCodec,
}

impl Dialect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `deserializer` for JSON and JSONB columns on every new connection.
    #[must_use]
    pub fn with_json_deserializer<F>(mut self, deserializer: F) -> Self
    where
        F: Fn(&str) -> serde_json::Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.json_codec = JsonCodec::with_deserializer(deserializer);
        self
    }

    pub const fn json_codec(&self) -> &JsonCodec {
        &self.json_codec
    }

    pub const fn schema_invalidation(&self) -> &Arc<SchemaInvalidation> {
        &self.invalidation
    }

    /// Parse a database URL into connect arguments.
    pub fn create_connect_args(url: &str) -> Result<ConnectArgs> {
        ConnectArgs::from_url(url)
    }

    pub const fn pool_class(args: &ConnectArgs) -> PoolClass {
        if args.async_fallback {
            PoolClass::FallbackAsyncAdaptedQueue
        } else {
            PoolClass::AsyncAdaptedQueue
        }
    }

    /// Open a connection and install this dialect's JSON codecs on it.
    pub fn connect<K: NativeConnector>(
        &self,
        connector: &K,
        args: &ConnectArgs,
    ) -> Result<Connection<K::Connection>> {
        let connection = Connection::connect(connector, args, Arc::clone(&self.invalidation))?;
        connection.install_json_codec(self.json_codec.clone())?;
        Ok(connection)
    }

    /// Mark every cached statement of every connection as stale.
    pub fn invalidate_schema_cache(&self) -> Timestamp {
        self.invalidation.bump()
    }

    pub fn invalidate_schema_cache_asof(&self) -> Timestamp {
        self.invalidation.current()
    }

    /// Called before each statement; `is_ddl` statements invalidate caches first.
    pub fn pre_exec<C: NativeConnection>(&self, cursor: &mut Cursor<C>, is_ddl: bool) {
        if is_ddl {
            self.invalidate_schema_cache();
        }
        cursor.set_invalidate_schema_cache_asof(self.invalidation.current());
    }

    /// Declare parameter types, leaving enum positions uncast.
    pub fn set_input_sizes<C: NativeConnection>(
        &self,
        cursor: &mut Cursor<C>,
        sizes: &[Option<TypeTag>],
    ) {
        let castable: Vec<_> = sizes
            .iter()
            .map(|tag| tag.filter(|tag| tag.is_castable()))
            .collect();
        cursor.set_input_sizes(&castable);
    }

    /// Look up an isolation level by name; underscores count as spaces.
    pub fn parse_isolation_level(name: &str) -> Result<IsolationLevel> {
        let normalized = name.trim().replace('_', " ").to_uppercase();
        ISOLATION_LOOKUP
            .iter()
            .find(|(candidate, _)| *candidate == normalized)
            .map(|(_, level)| *level)
            .ok_or_else(|| {
                let valid: Vec<_> = ISOLATION_LOOKUP.iter().map(|(n, _)| *n).collect();
                Error::config(format!(
                    "invalid value '{name}' for isolation_level. Valid isolation levels are {}",
                    valid.join(", ")
                ))
            })
    }

    pub fn set_isolation_level<C: NativeConnection>(
        &self,
        connection: &Connection<C>,
        name: &str,
    ) -> Result<()> {
        connection.set_isolation_level(Self::parse_isolation_level(name)?)
    }

    pub fn get_isolation_level<C: NativeConnection>(&self, connection: &Connection<C>) -> IsolationLevel {
        connection.isolation_level()
    }

    pub fn set_readonly<C: NativeConnection>(&self, connection: &Connection<C>, readonly: bool) {
        connection.set_readonly(readonly);
    }

    pub fn get_readonly<C: NativeConnection>(&self, connection: &Connection<C>) -> bool {
        connection.readonly()
    }

    pub fn set_deferrable<C: NativeConnection>(&self, connection: &Connection<C>, deferrable: bool) {
        connection.set_deferrable(deferrable);
    }

    pub fn get_deferrable<C: NativeConnection>(&self, connection: &Connection<C>) -> bool {
        connection.deferrable()
    }

    pub fn do_ping<C: NativeConnection>(&self, connection: &Connection<C>) -> Result<()> {
        connection.ping()
    }

    /// Returns true if `err` means the connection is unusable.
    ///
    /// With a connection at hand its closed status decides; without one, an
    /// interface error about a closed connection does.
    pub fn is_disconnect<C: NativeConnection>(
        &self,
        err: &Error,
        connection: Option<&Connection<C>>,
    ) -> bool {
        match connection {
            Some(connection) => connection.is_closed().unwrap_or(true),
            None => err.is_interface() && err.message().contains("connection is closed"),
        }
    }
}
