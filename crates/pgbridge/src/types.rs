//! Type tags, cast names and builtin OIDs.

use std::fmt;

/// Builtin PostgreSQL type OIDs the adapter knows about.
pub mod oid {
    /// `bool`
    pub const BOOL: u32 = 16;
    /// `bytea`
    pub const BYTEA: u32 = 17;
    /// `name`
    pub const NAME: u32 = 19;
    /// `int8`
    pub const INT8: u32 = 20;
    /// `int2`
    pub const INT2: u32 = 21;
    /// `int4`
    pub const INT4: u32 = 23;
    /// `text`
    pub const TEXT: u32 = 25;
    /// `oid`
    pub const OID: u32 = 26;
    /// `json`
    pub const JSON: u32 = 114;
    /// `float4`
    pub const FLOAT4: u32 = 700;
    /// `float8`
    pub const FLOAT8: u32 = 701;
    /// `unknown`
    pub const UNKNOWN: u32 = 705;
    /// `bpchar`
    pub const BPCHAR: u32 = 1042;
    /// `varchar`
    pub const VARCHAR: u32 = 1043;
    /// `date`
    pub const DATE: u32 = 1082;
    /// `time`
    pub const TIME: u32 = 1083;
    /// `timestamp`
    pub const TIMESTAMP: u32 = 1114;
    /// `timestamptz`
    pub const TIMESTAMPTZ: u32 = 1184;
    /// `interval`
    pub const INTERVAL: u32 = 1186;
    /// `numeric`
    pub const NUMERIC: u32 = 1700;
    /// `uuid`
    pub const UUID: u32 = 2950;
    /// `jsonb`
    pub const JSONB: u32 = 3802;
}

/// Logical type tag used for input size hints and result descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// Character data.
    String,
    /// Timestamp without time zone.
    Timestamp,
    /// Timestamp with time zone.
    TimestampWTz,
    /// Time of day.
    Time,
    /// Calendar date.
    Date,
    /// Time interval.
    Interval,
    /// Arbitrary precision number.
    Number,
    /// Double precision float.
    Float,
    /// Boolean.
    Boolean,
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInteger,
    /// Binary data.
    Bytes,
    /// Exact decimal.
    Decimal,
    /// JSON document.
    Json,
    /// Binary JSON document.
    Jsonb,
    /// User-defined enum; has no builtin OID.
    Enum,
    /// UUID.
    Uuid,
    /// `bytea`.
    Bytea,
}

impl TypeTag {
    /// Alias of [`TypeTag::Timestamp`].
    pub const DATETIME: Self = Self::Timestamp;
    /// Alias of [`TypeTag::Bytea`].
    pub const BINARY: Self = Self::Bytea;

    /// Every tag, in declaration order.
    pub const ALL: [Self; 18] = [
        Self::String,
        Self::Timestamp,
        Self::TimestampWTz,
        Self::Time,
        Self::Date,
        Self::Interval,
        Self::Number,
        Self::Float,
        Self::Boolean,
        Self::Integer,
        Self::BigInteger,
        Self::Bytes,
        Self::Decimal,
        Self::Json,
        Self::Jsonb,
        Self::Enum,
        Self::Uuid,
        Self::Bytea,
    ];

    /// Name used in `$n::<cast>` placeholder annotations.
    #[must_use]
    pub const fn cast_name(self) -> &'static str {
        match self {
            Self::String => "varchar",
            Self::Timestamp => "timestamp",
            Self::TimestampWTz => "timestamp with time zone",
            Self::Time => "time",
            Self::Date => "date",
            Self::Interval => "interval",
            Self::Number => "numeric",
            Self::Float => "float",
            Self::Boolean => "bool",
            Self::Integer => "integer",
            Self::BigInteger => "bigint",
            Self::Bytes => "bytes",
            Self::Decimal => "decimal",
            Self::Json => "json",
            Self::Jsonb => "jsonb",
            Self::Enum => "enum",
            Self::Uuid => "uuid",
            Self::Bytea => "bytea",
        }
    }

    /// Builtin OID reported by the driver for this tag.
    #[must_use]
    pub const fn oid(self) -> Option<u32> {
        match self {
            Self::String => Some(oid::VARCHAR),
            Self::Timestamp => Some(oid::TIMESTAMP),
            Self::TimestampWTz => Some(oid::TIMESTAMPTZ),
            Self::Time => Some(oid::TIME),
            Self::Date => Some(oid::DATE),
            Self::Interval => Some(oid::INTERVAL),
            Self::Number | Self::Decimal => Some(oid::NUMERIC),
            Self::Float => Some(oid::FLOAT8),
            Self::Boolean => Some(oid::BOOL),
            Self::Integer => Some(oid::INT4),
            Self::BigInteger => Some(oid::INT8),
            Self::Bytes | Self::Bytea => Some(oid::BYTEA),
            Self::Json => Some(oid::JSON),
            Self::Jsonb => Some(oid::JSONB),
            Self::Enum => None,
            Self::Uuid => Some(oid::UUID),
        }
    }

    /// Returns true if the tag can be used as a placeholder cast.
    ///
    /// Enum labels need the concrete enum type name, which the tag lacks.
    #[must_use]
    pub const fn is_castable(self) -> bool {
        !matches!(self, Self::Enum)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cast_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_names() {
        assert_eq!(TypeTag::String.cast_name(), "varchar");
        assert_eq!(
            TypeTag::TimestampWTz.cast_name(),
            "timestamp with time zone"
        );
        assert_eq!(TypeTag::Boolean.cast_name(), "bool");
        assert_eq!(TypeTag::BigInteger.cast_name(), "bigint");
        assert_eq!(TypeTag::Jsonb.to_string(), "jsonb");
    }

    #[test]
    fn test_aliases() {
        assert_eq!(TypeTag::DATETIME, TypeTag::Timestamp);
        assert_eq!(TypeTag::BINARY, TypeTag::Bytea);
    }

    #[test]
    fn test_oids() {
        assert_eq!(TypeTag::Json.oid(), Some(114));
        assert_eq!(TypeTag::Jsonb.oid(), Some(3802));
        assert_eq!(TypeTag::Integer.oid(), Some(23));
        assert_eq!(TypeTag::Decimal.oid(), TypeTag::Number.oid());
        assert_eq!(TypeTag::Enum.oid(), None);
    }

    #[test]
    fn test_only_enum_is_not_castable() {
        let not_castable: Vec<_> = TypeTag::ALL
            .into_iter()
            .filter(|tag| !tag.is_castable())
            .collect();
        assert_eq!(not_castable, vec![TypeTag::Enum]);
    }
}
