//! Date and time wire formats.
//!
//! PostgreSQL sends `date` as days and `time`/`timestamp` as microseconds,
//! both relative to 2000-01-01. Values are exchanged with callers in the
//! server's ISO text style; `timestamptz` is always rendered in UTC.

use super::BoxError;

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

/// Days from 1970-01-01 to 2000-01-01.
const PG_EPOCH_DAYS: i64 = 10_957;

const INFINITY: &str = "infinity";
const NEG_INFINITY: &str = "-infinity";

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month as u32, day as u32)
}

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let yoe = year.rem_euclid(400);
    let month = i64::from(month);
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn days_in_month(year: i64, month: u32) -> u32 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) => 29,
        2 => 28,
        _ => 31,
    }
}

fn format_date(pg_days: i64) -> String {
    let (year, month, day) = civil_from_days(pg_days + PG_EPOCH_DAYS);
    format!("{year:04}-{month:02}-{day:02}")
}

fn format_time_of_day(micros: i64) -> String {
    let seconds = micros / MICROS_PER_SECOND;
    let fraction = micros % MICROS_PER_SECOND;
    let mut out = format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    );
    if fraction != 0 {
        let digits = format!("{fraction:06}");
        out.push('.');
        out.push_str(digits.trim_end_matches('0'));
    }
    out
}

/// Render a `date` payload.
pub(crate) fn decode_date(days: i32) -> String {
    match days {
        i32::MAX => INFINITY.to_owned(),
        i32::MIN => NEG_INFINITY.to_owned(),
        days => format_date(i64::from(days)),
    }
}

/// Render a `time` payload.
pub(crate) fn decode_time(micros: i64) -> String {
    format_time_of_day(micros.rem_euclid(MICROS_PER_DAY))
}

/// Render a `timestamp` payload, with a `+00` suffix when `utc` is set.
pub(crate) fn decode_timestamp(micros: i64, utc: bool) -> String {
    match micros {
        i64::MAX => INFINITY.to_owned(),
        i64::MIN => NEG_INFINITY.to_owned(),
        micros => {
            let mut out = format!(
                "{} {}",
                format_date(micros.div_euclid(MICROS_PER_DAY)),
                format_time_of_day(micros.rem_euclid(MICROS_PER_DAY))
            );
            if utc {
                out.push_str("+00");
            }
            out
        }
    }
}

fn plural(count: i64, unit: &str) -> String {
    if count.abs() == 1 {
        format!("{count} {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

/// Render an `interval` payload in the server's `postgres` style.
pub(crate) fn decode_interval(micros: i64, days: i32, months: i32) -> String {
    let mut parts = Vec::new();
    let years = months / 12;
    let months = months % 12;
    if years != 0 {
        parts.push(plural(i64::from(years), "year"));
    }
    if months != 0 {
        parts.push(plural(i64::from(months), "mon"));
    }
    if days != 0 {
        parts.push(plural(i64::from(days), "day"));
    }
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let magnitude = micros.unsigned_abs();
        let hours = magnitude / 3_600_000_000;
        let rest = i64::try_from(magnitude % 3_600_000_000).unwrap_or_default();
        let clock = format_time_of_day(rest);
        parts.push(format!("{sign}{hours:02}{}", &clock[2..]));
    }
    parts.join(" ")
}

fn parse_number<T: std::str::FromStr>(text: &str, what: &str) -> Result<T, BoxError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid {what} '{text}'").into());
    }
    text.parse()
        .map_err(|_| format!("invalid {what} '{text}'").into())
}

fn parse_date(text: &str) -> Result<i64, BoxError> {
    let mut fields = text.splitn(3, '-');
    let (Some(year), Some(month), Some(day)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(format!("invalid date '{text}'").into());
    };
    let year: i64 = parse_number(year, "year")?;
    let month: u32 = parse_number(month, "month")?;
    let day: u32 = parse_number(day, "day")?;
    if !(1..=12).contains(&month) || day == 0 || day > days_in_month(year, month) {
        return Err(format!("date out of range '{text}'").into());
    }
    Ok(days_from_civil(year, month, day) - PG_EPOCH_DAYS)
}

fn parse_time(text: &str) -> Result<i64, BoxError> {
    let (clock, fraction) = text.split_once('.').unwrap_or((text, ""));
    let mut fields = clock.splitn(3, ':');
    let (Some(hours), Some(minutes)) = (fields.next(), fields.next()) else {
        return Err(format!("invalid time '{text}'").into());
    };
    let hours: i64 = parse_number(hours, "hour")?;
    let minutes: i64 = parse_number(minutes, "minute")?;
    let seconds: i64 = fields.next().map_or(Ok(0), |s| parse_number(s, "second"))?;
    if hours > 24 || minutes > 59 || seconds > 60 || fraction.len() > 6 {
        return Err(format!("time out of range '{text}'").into());
    }
    let micros = if fraction.is_empty() {
        0
    } else {
        let digits: i64 = parse_number(fraction, "fraction")?;
        digits * 10_i64.pow(6 - fraction.len() as u32)
    };
    Ok(((hours * 60 + minutes) * 60 + seconds) * MICROS_PER_SECOND + micros)
}

/// Split a trailing `Z`, `+HH`, `+HH:MM` or `+HHMM` zone suffix into seconds east of UTC.
fn split_zone(text: &str) -> Result<(&str, i64), BoxError> {
    if let Some(rest) = text.strip_suffix('Z') {
        return Ok((rest, 0));
    }
    let Some(at) = text.rfind(['+', '-']).filter(|at| text[..*at].contains(':')) else {
        return Ok((text, 0));
    };
    let (clock, zone) = text.split_at(at);
    let sign = if zone.starts_with('-') { -1 } else { 1 };
    let digits: String = zone[1..].chars().filter(|c| *c != ':').collect();
    let (hours, minutes) = match digits.len() {
        2 => (parse_number::<i64>(&digits, "zone")?, 0),
        4 => (
            parse_number::<i64>(&digits[..2], "zone")?,
            parse_number::<i64>(&digits[2..], "zone")?,
        ),
        _ => return Err(format!("invalid time zone '{zone}'").into()),
    };
    Ok((clock, sign * (hours * 3600 + minutes * 60)))
}

/// Parse `YYYY-MM-DD` into days since 2000-01-01.
pub(crate) fn encode_date(text: &str) -> Result<i32, BoxError> {
    match text.trim() {
        INFINITY => Ok(i32::MAX),
        NEG_INFINITY => Ok(i32::MIN),
        text => Ok(i32::try_from(parse_date(text)?)?),
    }
}

/// Parse `HH:MM[:SS[.ffffff]]` into microseconds since midnight.
pub(crate) fn encode_time(text: &str) -> Result<i64, BoxError> {
    parse_time(text.trim())
}

/// Parse a timestamp into microseconds since 2000-01-01 00:00 UTC.
///
/// A zone suffix is only honored when `with_zone` is set; a timestamp
/// without one is taken as UTC.
pub(crate) fn encode_timestamp(text: &str, with_zone: bool) -> Result<i64, BoxError> {
    let text = text.trim();
    match text {
        INFINITY => return Ok(i64::MAX),
        NEG_INFINITY => return Ok(i64::MIN),
        _ => {}
    }
    let (date, clock) = text
        .split_once([' ', 'T'])
        .unwrap_or((text, "00:00:00"));
    let (clock, offset) = if with_zone {
        split_zone(clock)?
    } else {
        (clock, 0)
    };
    let days = parse_date(date)?;
    let micros = parse_time(clock)?;
    Ok(days * MICROS_PER_DAY + micros - offset * MICROS_PER_SECOND)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_civil_round_trip_around_epochs() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(PG_EPOCH_DAYS), (2000, 1, 1));
        assert_eq!(days_from_civil(2000, 1, 1), PG_EPOCH_DAYS);
        assert_eq!(days_from_civil(2024, 2, 29) - days_from_civil(2024, 2, 28), 1);
    }

    #[test]
    fn test_decode_date() {
        assert_eq!(decode_date(0), "2000-01-01");
        assert_eq!(decode_date(-1), "1999-12-31");
        assert_eq!(decode_date(8825), "2024-02-29");
        assert_eq!(decode_date(i32::MAX), "infinity");
    }

    #[test]
    fn test_decode_timestamp() {
        assert_eq!(decode_timestamp(0, false), "2000-01-01 00:00:00");
        assert_eq!(
            decode_timestamp(MICROS_PER_DAY + 3_723_500_000, true),
            "2000-01-02 01:02:03.5+00"
        );
        assert_eq!(decode_timestamp(-1, false), "1999-12-31 23:59:59.999999");
        assert_eq!(decode_timestamp(i64::MIN, false), "-infinity");
    }

    #[test]
    fn test_decode_interval() {
        assert_eq!(decode_interval(0, 0, 0), "00:00:00");
        assert_eq!(
            decode_interval(3_723_000_000, 3, 14),
            "1 year 2 mons 3 days 01:02:03"
        );
        assert_eq!(decode_interval(-90_000_000, 1, 0), "1 day -00:01:30");
        assert_eq!(decode_interval(0, 0, 1), "1 mon");
    }

    #[test]
    fn test_encode_date() {
        assert_eq!(encode_date("2000-01-01").unwrap(), 0);
        assert_eq!(encode_date("2024-02-29").unwrap(), 8825);
        assert!(encode_date("2023-02-29").is_err());
        assert!(encode_date("yesterday").is_err());
    }

    #[test]
    fn test_encode_time() {
        assert_eq!(encode_time("01:02:03.25").unwrap(), 3_723_250_000);
        assert_eq!(encode_time("12:30").unwrap(), 45_000_000_000);
        assert!(encode_time("25:00:00").is_err());
    }

    #[test]
    fn test_encode_timestamp() {
        assert_eq!(encode_timestamp("2000-01-01 00:00:00", false).unwrap(), 0);
        assert_eq!(encode_timestamp("2000-01-01", false).unwrap(), 0);
        assert_eq!(
            encode_timestamp("2000-01-01T02:00:00+02:00", true).unwrap(),
            0
        );
        assert_eq!(
            encode_timestamp("2000-01-01 00:00:00Z", true).unwrap(),
            0
        );
        assert_eq!(
            encode_timestamp("1999-12-31 23:00:00-0100", true).unwrap(),
            0
        );
        let micros = encode_timestamp("2024-02-29 01:02:03.5", false).unwrap();
        assert_eq!(decode_timestamp(micros, false), "2024-02-29 01:02:03.5");
    }
}
