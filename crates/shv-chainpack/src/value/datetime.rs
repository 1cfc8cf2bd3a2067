//! Date-time value with a quarter-hour UTC offset.

use crate::config::CodecConfig;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::fmt;

/// Milliseconds since 1970-01-01T00:00:00Z plus the UTC offset the value was
/// recorded in.
///
/// The offset is kept in whole quarter hours, which is what the binary format
/// can carry. Constructors round offsets toward zero and saturate timestamps to
/// years 0001..=9999.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DateTime {
    msecs: i64,
    offset_quarters: i8,
}

impl DateTime {
    pub fn from_epoch_msec(msecs: i64) -> Self {
        Self::from_epoch_msec_tz(msecs, 0)
    }

    /// Saturating constructor.
    pub fn from_epoch_msec_tz(msecs: i64, utc_offset_min: i32) -> Self {
        let msecs = msecs.clamp(CodecConfig::MIN_EPOCH_MSEC, CodecConfig::MAX_EPOCH_MSEC);
        let quarters = (utc_offset_min / 15).clamp(
            CodecConfig::MIN_UTC_OFFSET_QUARTERS,
            CodecConfig::MAX_UTC_OFFSET_QUARTERS,
        );
        Self {
            msecs,
            offset_quarters: quarters as i8,
        }
    }

    /// Strict constructor used by decoders: out-of-range timestamps and offsets
    /// that are not whole quarter hours are rejected.
    pub fn try_from_epoch_msec_tz(msecs: i64, utc_offset_min: i32) -> Option<Self> {
        if !(CodecConfig::MIN_EPOCH_MSEC..=CodecConfig::MAX_EPOCH_MSEC).contains(&msecs) {
            return None;
        }
        if utc_offset_min % 15 != 0 {
            return None;
        }
        let quarters = utc_offset_min / 15;
        if !(CodecConfig::MIN_UTC_OFFSET_QUARTERS..=CodecConfig::MAX_UTC_OFFSET_QUARTERS)
            .contains(&quarters)
        {
            return None;
        }
        Some(Self {
            msecs,
            offset_quarters: quarters as i8,
        })
    }

    pub fn now() -> Self {
        Self::from_epoch_msec(Utc::now().timestamp_millis())
    }

    pub fn epoch_msec(&self) -> i64 {
        self.msecs
    }

    pub fn utc_offset_min(&self) -> i32 {
        i32::from(self.offset_quarters) * 15
    }

    pub(crate) fn utc_offset_quarters(&self) -> i32 {
        i32::from(self.offset_quarters)
    }

    /// Local wall-clock time of this value.
    pub fn local_naive(&self) -> NaiveDateTime {
        let local_ms = self.msecs + i64::from(self.utc_offset_min()) * 60_000;
        chrono::DateTime::from_timestamp_millis(local_ms)
            .map(|dt| dt.naive_utc())
            .unwrap_or_default()
    }

    /// ISO-8601 text, e.g. `2018-02-02T01:00:00.001+01:00`. Milliseconds are
    /// omitted when zero and UTC is written as `Z`.
    pub fn to_iso_string(&self) -> String {
        let local = self.local_naive();
        let mut out = format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            local.year(),
            local.month(),
            local.day(),
            local.hour(),
            local.minute(),
            local.second()
        );
        let ms = self.msecs.rem_euclid(1000);
        if ms != 0 {
            out.push_str(&format!(".{:03}", ms));
        }
        let offset = self.utc_offset_min();
        if offset == 0 {
            out.push('Z');
        } else {
            let sign = if offset < 0 { '-' } else { '+' };
            let abs = offset.abs();
            out.push_str(&format!("{}{:02}:{:02}", sign, abs / 60, abs % 60));
        }
        out
    }

    /// Parse ISO-8601 text as written by [`DateTime::to_iso_string`].
    ///
    /// Accepts `T` or a space between date and time, up to nine fraction
    /// digits (truncated to milliseconds) and a zone of `Z`, `+hh`, `+hhmm`,
    /// `+hh:mm` or nothing (UTC).
    pub fn parse_iso(text: &str) -> Option<Self> {
        let text = text.trim();
        let split = text.find(['T', ' '])?;
        let (date, rest) = (&text[..split], &text[split + 1..]);

        let mut parts = date.splitn(3, '-');
        let year: i32 = parse_digits(parts.next()?)?;
        let month: u32 = parse_digits(parts.next()?)?;
        let day: u32 = parse_digits(parts.next()?)?;

        let zone_at = rest.find(['Z', '+', '-']).unwrap_or(rest.len());
        let (time, zone) = rest.split_at(zone_at);
        let (hms, fraction) = match time.split_once('.') {
            Some((hms, fraction)) => (hms, Some(fraction)),
            None => (time, None),
        };
        let mut hms = hms.splitn(3, ':');
        let hour: u32 = parse_digits(hms.next()?)?;
        let minute: u32 = parse_digits(hms.next()?)?;
        let second: u32 = parse_digits(hms.next()?)?;
        let millis = match fraction {
            Some(f) if !f.is_empty() && f.len() <= 9 && f.bytes().all(|b| b.is_ascii_digit()) => {
                let padded = format!("{:0<3}", f);
                padded[..3].parse::<u32>().ok()?
            }
            Some(_) => return None,
            None => 0,
        };
        let offset_min = parse_zone(zone)?;

        let local = NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_milli_opt(hour, minute, second, millis)?;
        let msecs = local.and_utc().timestamp_millis() - i64::from(offset_min) * 60_000;
        Self::try_from_epoch_msec_tz(msecs, offset_min)
    }
}

fn parse_digits<T: std::str::FromStr>(text: &str) -> Option<T> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn parse_zone(zone: &str) -> Option<i32> {
    if zone.is_empty() || zone == "Z" {
        return Some(0);
    }
    let sign = match zone.as_bytes()[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let body = zone[1..].replace(':', "");
    if !body.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (hh, mm): (i32, i32) = match body.len() {
        2 => (parse_digits(&body)?, 0),
        4 => (parse_digits(&body[..2])?, parse_digits(&body[2..])?),
        _ => return None,
    };
    if mm >= 60 {
        return None;
    }
    Some(sign * (hh * 60 + mm))
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shv_epoch_iso() {
        let dt = DateTime::from_epoch_msec(CodecConfig::SHV_EPOCH_MSEC);
        assert_eq!(dt.to_iso_string(), "2018-02-02T00:00:00Z");
    }

    #[test]
    fn test_offset_and_millis() {
        let dt = DateTime::from_epoch_msec_tz(CodecConfig::SHV_EPOCH_MSEC + 1, 60);
        assert_eq!(dt.to_iso_string(), "2018-02-02T01:00:00.001+01:00");
        assert_eq!(DateTime::parse_iso("2018-02-02T01:00:00.001+01:00"), Some(dt));
    }

    #[test]
    fn test_offset_rounds_toward_zero() {
        assert_eq!(DateTime::from_epoch_msec_tz(0, 29).utc_offset_min(), 15);
        assert_eq!(DateTime::from_epoch_msec_tz(0, -29).utc_offset_min(), -15);
        assert_eq!(DateTime::from_epoch_msec_tz(0, 10_000).utc_offset_min(), 945);
    }

    #[test]
    fn test_saturates_range() {
        assert_eq!(
            DateTime::from_epoch_msec(i64::MAX).epoch_msec(),
            CodecConfig::MAX_EPOCH_MSEC
        );
        assert!(DateTime::try_from_epoch_msec_tz(i64::MIN, 0).is_none());
    }

    #[test]
    fn test_parse_zone_forms() {
        let expected = DateTime::from_epoch_msec_tz(0, -150);
        assert_eq!(DateTime::parse_iso("1969-12-31T21:30:00-02:30"), Some(expected));
        assert_eq!(DateTime::parse_iso("1969-12-31T21:30:00-0230"), Some(expected));
        assert_eq!(
            DateTime::parse_iso("1970-01-01 00:00:00"),
            Some(DateTime::from_epoch_msec(0))
        );
        assert_eq!(
            DateTime::parse_iso("1970-01-01T02:00:00+02"),
            Some(DateTime::from_epoch_msec_tz(0, 120))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DateTime::parse_iso("yesterday").is_none());
        assert!(DateTime::parse_iso("2018-13-01T00:00:00Z").is_none());
        assert!(DateTime::parse_iso("2018-01-01T00:00:00+01:20").is_none());
    }

    #[test]
    fn test_negative_millis_before_epoch() {
        let dt = DateTime::from_epoch_msec(-1);
        assert_eq!(dt.to_iso_string(), "1969-12-31T23:59:59.999Z");
        assert_eq!(DateTime::parse_iso(&dt.to_iso_string()), Some(dt));
    }
}
