//! Conversion between [`Value`] and the PostgreSQL binary wire format.
//!
//! Decoding is driven by the column's type OID. Types without a codec here
//! come back as raw bytes; enum labels come back as text. Encoding is driven
//! by the parameter type the server inferred for each placeholder.

use postgres_protocol::types;
use tokio_postgres::types::{FromSql, IsNull, Kind, ToSql, Type, to_sql_checked};
use tokio_util::bytes::{BufMut, BytesMut};

use super::BoxError;
use super::datetime;
use crate::codec::JsonCodec;
use crate::driver::{NativeError, NativeResult, Row, Value};
use crate::types::oid;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// A column payload borrowed from a row, not yet decoded.
#[derive(Debug)]
pub(crate) enum RawValue<'a> {
    Null,
    Enum(&'a str),
    Binary { oid: u32, raw: &'a [u8] },
}

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if matches!(ty.kind(), Kind::Enum(_)) {
            return Ok(Self::Enum(types::text_from_sql(raw)?));
        }
        Ok(Self::Binary { oid: ty.oid(), raw })
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(Self::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Decode every column of `row`.
pub(crate) fn decode_row(row: &tokio_postgres::Row, codec: &JsonCodec) -> NativeResult<Row> {
    let mut values = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let raw: RawValue<'_> = row.try_get(index).map_err(|e| {
            NativeError::data_conversion(format!("column \"{}\": {e}", column.name()))
        })?;
        let value = decode_value(raw, codec).map_err(|e| {
            NativeError::data_conversion(format!("column \"{}\": {e}", column.name()))
        })?;
        values.push(value);
    }
    Ok(Row::new(values))
}

pub(crate) fn decode_value(raw: RawValue<'_>, codec: &JsonCodec) -> Result<Value, BoxError> {
    let (oid, raw) = match raw {
        RawValue::Null => return Ok(Value::Null),
        RawValue::Enum(label) => return Ok(Value::Text(label.to_owned())),
        RawValue::Binary { oid, raw } => (oid, raw),
    };

    let value = match oid {
        oid::BOOL => Value::Bool(types::bool_from_sql(raw)?),
        oid::INT2 => Value::Int(i64::from(types::int2_from_sql(raw)?)),
        oid::INT4 => Value::Int(i64::from(types::int4_from_sql(raw)?)),
        oid::INT8 => Value::Int(types::int8_from_sql(raw)?),
        oid::OID => Value::Int(i64::from(types::oid_from_sql(raw)?)),
        oid::FLOAT4 => Value::Float(f64::from(types::float4_from_sql(raw)?)),
        oid::FLOAT8 => Value::Float(types::float8_from_sql(raw)?),
        oid::NUMERIC => Value::Decimal(decode_numeric(raw)?),
        oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::UNKNOWN => {
            Value::Text(types::text_from_sql(raw)?.to_owned())
        }
        oid::BYTEA => Value::Bytes(types::bytea_from_sql(raw).to_vec()),
        oid::UUID => Value::Text(format_uuid(types::uuid_from_sql(raw)?)),
        oid::JSON => Value::Json(codec.decode_json(raw).map_err(|e| e.message().to_owned())?),
        oid::JSONB => Value::Json(codec.decode_jsonb(raw).map_err(|e| e.message().to_owned())?),
        oid::DATE => Value::Text(datetime::decode_date(types::date_from_sql(raw)?)),
        oid::TIME => Value::Text(datetime::decode_time(types::time_from_sql(raw)?)),
        oid::TIMESTAMP => Value::Text(datetime::decode_timestamp(
            types::timestamp_from_sql(raw)?,
            false,
        )),
        oid::TIMESTAMPTZ => Value::Text(datetime::decode_timestamp(
            types::timestamp_from_sql(raw)?,
            true,
        )),
        oid::INTERVAL => Value::Text(decode_interval(raw)?),
        _ => Value::Bytes(raw.to_vec()),
    };
    Ok(value)
}

fn decode_interval(raw: &[u8]) -> Result<String, BoxError> {
    let raw: [u8; 16] = raw
        .try_into()
        .map_err(|_| format!("invalid interval payload of {} bytes", raw.len()))?;
    let (micros, rest) = raw.split_at(8);
    let (days, months) = rest.split_at(4);
    Ok(datetime::decode_interval(
        i64::from_be_bytes(micros.try_into()?),
        i32::from_be_bytes(days.try_into()?),
        i32::from_be_bytes(months.try_into()?),
    ))
}

fn format_uuid(bytes: [u8; 16]) -> String {
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    )
}

fn parse_uuid(text: &str) -> Result<[u8; 16], BoxError> {
    let hex: String = text
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .chars()
        .filter(|c| *c != '-')
        .collect();
    if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("invalid uuid '{text}'").into());
    }
    let mut out = [0u8; 16];
    for (slot, pair) in out.iter_mut().zip(hex.as_bytes().chunks_exact(2)) {
        let pair = std::str::from_utf8(pair)?;
        *slot = u8::from_str_radix(pair, 16)?;
    }
    Ok(out)
}

/// Render a binary `numeric` as decimal text.
pub(crate) fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    let Some((header, body)) = raw.split_at_checked(8) else {
        return Err("numeric payload too short".into());
    };
    let ndigits = usize::try_from(i16::from_be_bytes([header[0], header[1]]))?;
    let weight = i32::from(i16::from_be_bytes([header[2], header[3]]));
    let sign = u16::from_be_bytes([header[4], header[5]]);
    let dscale = usize::from(u16::from_be_bytes([header[6], header[7]]));

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_owned()),
        NUMERIC_PINF => return Ok("Infinity".to_owned()),
        NUMERIC_NINF => return Ok("-Infinity".to_owned()),
        _ => {}
    }
    if body.len() != ndigits * 2 {
        return Err(format!("numeric payload declares {ndigits} digits but has {} bytes", body.len()).into());
    }

    let digits: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    let digit_at = |position: i32| -> u16 {
        usize::try_from(position)
            .ok()
            .and_then(|index| digits.get(index))
            .copied()
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit_at(0).to_string());
        for position in 1..=weight {
            out.push_str(&format!("{:04}", digit_at(position)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut position = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(position)));
            position += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

/// Write decimal text as a binary `numeric`.
pub(crate) fn encode_numeric(text: &str, out: &mut BytesMut) -> Result<(), BoxError> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("nan") {
        out.put_i16(0);
        out.put_i16(0);
        out.put_u16(NUMERIC_NAN);
        out.put_u16(0);
        return Ok(());
    }

    let (negative, unsigned) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let (integer, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if (integer.is_empty() && fraction.is_empty())
        || !integer.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit())
    {
        return Err(format!("invalid numeric literal '{text}'").into());
    }

    let dscale = u16::try_from(fraction.len())?;
    let integer = integer.trim_start_matches('0');
    let integer_pad = (4 - integer.len() % 4) % 4;
    let fraction_pad = (4 - fraction.len() % 4) % 4;
    let padded = format!(
        "{}{integer}{fraction}{}",
        "0".repeat(integer_pad),
        "0".repeat(fraction_pad)
    );

    let mut groups: Vec<i16> = padded
        .as_bytes()
        .chunks(4)
        .map(|chunk| {
            chunk
                .iter()
                .fold(0i16, |acc, digit| acc * 10 + i16::from(digit - b'0'))
        })
        .collect();
    let mut weight = i16::try_from((integer_pad + integer.len()) / 4)? - 1;

    let leading = groups.iter().take_while(|group| **group == 0).count();
    groups.drain(..leading);
    weight -= i16::try_from(leading)?;
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        weight = 0;
    }

    let sign = if negative && !groups.is_empty() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };
    out.put_i16(i16::try_from(groups.len())?);
    out.put_i16(weight);
    out.put_u16(sign);
    out.put_u16(dscale);
    for group in groups {
        out.put_i16(group);
    }
    Ok(())
}

fn is_text_type(ty: &Type) -> bool {
    matches!(
        ty.oid(),
        oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::UNKNOWN
    ) || matches!(ty.kind(), Kind::Enum(_))
}

fn mismatch(value: &str, ty: &Type) -> BoxError {
    format!("cannot encode {value} as {}", ty.name()).into()
}

fn encode_int(v: i64, ty: &Type, out: &mut BytesMut) -> Result<(), BoxError> {
    match ty.oid() {
        oid::INT2 => types::int2_to_sql(i16::try_from(v)?, out),
        oid::INT4 => types::int4_to_sql(i32::try_from(v)?, out),
        oid::INT8 => types::int8_to_sql(v, out),
        oid::OID => types::oid_to_sql(u32::try_from(v)?, out),
        oid::FLOAT4 => types::float4_to_sql(v as f32, out),
        oid::FLOAT8 => types::float8_to_sql(v as f64, out),
        oid::NUMERIC => encode_numeric(&v.to_string(), out)?,
        _ if is_text_type(ty) => types::text_to_sql(&v.to_string(), out),
        _ => return Err(mismatch("an integer", ty)),
    }
    Ok(())
}

fn encode_float(v: f64, ty: &Type, out: &mut BytesMut) -> Result<(), BoxError> {
    match ty.oid() {
        oid::FLOAT4 => types::float4_to_sql(v as f32, out),
        oid::FLOAT8 => types::float8_to_sql(v, out),
        oid::NUMERIC if v.is_finite() => encode_numeric(&v.to_string(), out)?,
        _ if is_text_type(ty) => types::text_to_sql(&v.to_string(), out),
        _ => return Err(mismatch("a float", ty)),
    }
    Ok(())
}

fn encode_text(v: &str, ty: &Type, out: &mut BytesMut) -> Result<(), BoxError> {
    match ty.oid() {
        oid::JSON => out.put_slice(&JsonCodec::encode_json(v)),
        oid::JSONB => out.put_slice(&JsonCodec::encode_jsonb(v)),
        oid::UUID => types::uuid_to_sql(parse_uuid(v)?, out),
        oid::NUMERIC => encode_numeric(v, out)?,
        oid::DATE => types::date_to_sql(datetime::encode_date(v)?, out),
        oid::TIME => types::time_to_sql(datetime::encode_time(v)?, out),
        oid::TIMESTAMP => types::timestamp_to_sql(datetime::encode_timestamp(v, false)?, out),
        oid::TIMESTAMPTZ => types::timestamp_to_sql(datetime::encode_timestamp(v, true)?, out),
        oid::BYTEA => types::bytea_to_sql(v.as_bytes(), out),
        _ if is_text_type(ty) => types::text_to_sql(v, out),
        _ => return Err(mismatch("text", ty)),
    }
    Ok(())
}

fn encode_json(v: &serde_json::Value, ty: &Type, out: &mut BytesMut) -> Result<(), BoxError> {
    let text = v.to_string();
    match ty.oid() {
        oid::JSON => out.put_slice(&JsonCodec::encode_json(&text)),
        oid::JSONB => out.put_slice(&JsonCodec::encode_jsonb(&text)),
        _ if is_text_type(ty) => types::text_to_sql(&text, out),
        _ => return Err(mismatch("a json document", ty)),
    }
    Ok(())
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Self::Null => return Ok(IsNull::Yes),
            Self::Bool(v) => match ty.oid() {
                oid::BOOL => types::bool_to_sql(*v, out),
                _ if is_text_type(ty) => types::text_to_sql(if *v { "true" } else { "false" }, out),
                _ => return Err(mismatch("a boolean", ty)),
            },
            Self::Int(v) => encode_int(*v, ty, out)?,
            Self::Float(v) => encode_float(*v, ty, out)?,
            Self::Text(v) | Self::Decimal(v) => encode_text(v, ty, out)?,
            Self::Bytes(v) => match ty.oid() {
                oid::BYTEA => types::bytea_to_sql(v, out),
                _ => return Err(mismatch("bytes", ty)),
            },
            Self::Json(v) => encode_json(v, ty, out)?,
        }
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
