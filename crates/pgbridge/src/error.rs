//! Error types and native error translation.
//!
//! Native driver failures are mapped onto a DBAPI-style hierarchy:
//!
//! ```text
//! Error
//! ├── InterfaceError
//! └── DatabaseError
//!     ├── InternalError
//!     │   └── InternalServerError
//!     ├── OperationalError
//!     ├── ProgrammingError
//!     ├── IntegrityError
//!     ├── DataError
//!     └── NotSupportedError
//!         └── InvalidCachedStatementError
//! ```
//!
//! Translation walks the native kind's lineage against a static table and
//! takes the first match. Native kinds with no entry (`Io`, `Timeout`) are
//! passed through unchanged as [`Error::Native`].

use std::fmt;

use thiserror::Error;

use crate::driver::{NativeError, NativeErrorKind};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Appended to translated stale-statement messages.
const INVALIDATION_NOTE: &str =
    " (pgbridge: the prepared statement caches of all connections will be invalidated)";

/// Server message fragment that signals a stale type OID.
const CACHE_LOOKUP_FAILED: &str = "cache lookup failed";

/// Generic error class in the DBAPI hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Root of the hierarchy.
    Error,
    /// Problems with the interface rather than the database.
    Interface,
    /// Errors reported by the database.
    Database,
    /// The database hit an internal inconsistency.
    Internal,
    /// The server reported an internal error.
    InternalServer,
    /// Failures outside the caller's control.
    Operational,
    /// Bad SQL, missing objects, wrong parameter counts.
    Programming,
    /// Constraint violations.
    Integrity,
    /// Values that could not be processed.
    Data,
    /// Operations the adapter or database does not support.
    NotSupported,
    /// A prepared statement no longer matches the server schema.
    InvalidCachedStatement,
}

impl ErrorKind {
    /// Parent class, `None` for [`ErrorKind::Error`].
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Error => None,
            Self::Interface | Self::Database => Some(Self::Error),
            Self::Internal
            | Self::Operational
            | Self::Programming
            | Self::Integrity
            | Self::Data
            | Self::NotSupported => Some(Self::Database),
            Self::InternalServer => Some(Self::Internal),
            Self::InvalidCachedStatement => Some(Self::NotSupported),
        }
    }

    /// Returns true if `self` is `ancestor` or descends from it.
    #[must_use]
    pub fn is_a(self, ancestor: Self) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == ancestor {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    /// DBAPI class name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Interface => "InterfaceError",
            Self::Database => "DatabaseError",
            Self::Internal => "InternalError",
            Self::InternalServer => "InternalServerError",
            Self::Operational => "OperationalError",
            Self::Programming => "ProgrammingError",
            Self::Integrity => "IntegrityError",
            Self::Data => "DataError",
            Self::NotSupported => "NotSupportedError",
            Self::InvalidCachedStatement => "InvalidCachedStatementError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Exact native kinds and the DBAPI class they translate to.
const TRANSLATION_TABLE: &[(NativeErrorKind, ErrorKind)] = &[
    (
        NativeErrorKind::IntegrityConstraintViolation,
        ErrorKind::Integrity,
    ),
    (NativeErrorKind::Postgres, ErrorKind::Error),
    (NativeErrorKind::SyntaxOrAccess, ErrorKind::Programming),
    (NativeErrorKind::Interface, ErrorKind::Interface),
    (
        NativeErrorKind::InvalidCachedStatement,
        ErrorKind::InvalidCachedStatement,
    ),
    (NativeErrorKind::InternalServer, ErrorKind::InternalServer),
    (NativeErrorKind::DataConversion, ErrorKind::Data),
];

/// pgbridge error.
#[derive(Debug, Error)]
pub enum Error {
    /// An error in the DBAPI hierarchy.
    #[error("{kind}: {message}")]
    Dbapi {
        /// DBAPI class.
        kind: ErrorKind,
        /// Human readable message.
        message: String,
        /// Server SQLSTATE, when the error came from the server.
        pgcode: Option<String>,
        /// Native error this was translated from.
        #[source]
        source: Option<NativeError>,
    },

    /// Native error with no DBAPI counterpart, returned unchanged.
    #[error(transparent)]
    Native(NativeError),

    /// Invalid connect arguments or dialect settings.
    #[error("ConfigError: {0}")]
    Config(String),
}

impl Error {
    fn dbapi(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self::Dbapi {
            kind,
            message: msg.into(),
            pgcode: None,
            source: None,
        }
    }

    /// Create an interface error.
    #[must_use]
    pub fn interface(msg: impl Into<String>) -> Self {
        Self::dbapi(ErrorKind::Interface, msg)
    }

    /// Create an operational error.
    #[must_use]
    pub fn operational(msg: impl Into<String>) -> Self {
        Self::dbapi(ErrorKind::Operational, msg)
    }

    /// Create a programming error.
    #[must_use]
    pub fn programming(msg: impl Into<String>) -> Self {
        Self::dbapi(ErrorKind::Programming, msg)
    }

    /// Create a data error.
    #[must_use]
    pub fn data(msg: impl Into<String>) -> Self {
        Self::dbapi(ErrorKind::Data, msg)
    }

    /// Create a not supported error.
    #[must_use]
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::dbapi(ErrorKind::NotSupported, msg)
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::dbapi(ErrorKind::Internal, msg)
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// DBAPI class, `None` for native pass-through and configuration errors.
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Dbapi { kind, .. } => Some(*kind),
            Self::Native(_) | Self::Config(_) => None,
        }
    }

    /// Returns true if this error is `kind` or one of its subclasses.
    #[must_use]
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind().is_some_and(|k| k.is_a(kind))
    }

    /// Server SQLSTATE, when known.
    #[must_use]
    pub fn pgcode(&self) -> Option<&str> {
        match self {
            Self::Dbapi { pgcode, .. } => pgcode.as_deref(),
            Self::Native(err) => err.sqlstate(),
            Self::Config(_) => None,
        }
    }

    /// Native error behind this one, if any.
    #[must_use]
    pub const fn native(&self) -> Option<&NativeError> {
        match self {
            Self::Dbapi { source, .. } => source.as_ref(),
            Self::Native(err) => Some(err),
            Self::Config(_) => None,
        }
    }

    /// Message without the class prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Dbapi { message, .. } | Self::Config(message) => message,
            Self::Native(err) => err.message(),
        }
    }

    /// Returns true if this is an interface error.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.is_kind(ErrorKind::Interface)
    }

    /// Returns true if this is a programming error.
    #[must_use]
    pub fn is_programming(&self) -> bool {
        self.is_kind(ErrorKind::Programming)
    }

    /// Returns true if this is an integrity error.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        self.is_kind(ErrorKind::Integrity)
    }

    /// Returns true if this is a data error.
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.is_kind(ErrorKind::Data)
    }

    /// Returns true if this is a not supported error.
    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        self.is_kind(ErrorKind::NotSupported)
    }

    /// Returns true if this is a stale prepared statement error.
    #[must_use]
    pub fn is_invalid_cached_statement(&self) -> bool {
        self.is_kind(ErrorKind::InvalidCachedStatement)
    }

    /// Returns true for a native error passed through untranslated.
    #[must_use]
    pub const fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }

    /// Returns true for a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if statement caches must be invalidated after this error.
    ///
    /// That is the case for stale prepared statements and for internal server
    /// errors about failed type cache lookups.
    #[must_use]
    pub fn requires_cache_invalidation(&self) -> bool {
        match self.kind() {
            Some(ErrorKind::InvalidCachedStatement) => true,
            Some(ErrorKind::InternalServer) => self.message().contains(CACHE_LOOKUP_FAILED),
            _ => false,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("invalid URL: {err}"))
    }
}

/// Translate a native error into the DBAPI hierarchy.
pub fn translate(err: NativeError) -> Error {
    let mapped = err.kind().lineage().iter().find_map(|native| {
        TRANSLATION_TABLE
            .iter()
            .find(|(candidate, _)| candidate == native)
            .map(|(_, kind)| *kind)
    });

    let Some(kind) = mapped else {
        return Error::Native(err);
    };

    let mut message = if err.kind().name() == kind.name() {
        err.message().to_owned()
    } else {
        format!("{}: {}", err.kind(), err.message())
    };
    if kind == ErrorKind::InvalidCachedStatement {
        message.push_str(INVALIDATION_NOTE);
    }

    Error::Dbapi {
        kind,
        message,
        pgcode: err.sqlstate().map(str::to_owned),
        source: Some(err),
    }
}
