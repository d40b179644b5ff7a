// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Time and durations for the archive's internal format.
//!
//! Timestamps throughout the storage, motion, and query layers are
//! milliseconds since the Unix epoch (`pts_ms` in the wire formats). This
//! module gives that integer a name and an ISO 8601 parser/formatter so call
//! sites don't pass around bare `i64`.

use crate::{bail_t, Error};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::combinator::{map, map_res, opt};
use nom::sequence::{preceded, tuple};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;
use std::str::FromStr;

type IResult<'a, I, O> = nom::IResult<I, O, nom::error::VerboseError<&'a str>>;

/// The zone to use when formatting timestamps and parsing zone-less input.
///
/// In normal operation this is assigned from `jiff::tz::TimeZone::system()` at
/// startup, but tests set it to a known political time zone instead.
static GLOBAL_ZONE: std::sync::OnceLock<jiff::tz::TimeZone> = std::sync::OnceLock::new();

pub fn init_zone<F: FnOnce() -> jiff::tz::TimeZone>(f: F) {
    GLOBAL_ZONE.get_or_init(f);
}

pub fn global_zone() -> jiff::tz::TimeZone {
    GLOBAL_ZONE
        .get()
        .cloned()
        .unwrap_or(jiff::tz::TimeZone::UTC)
}

/// A timestamp, milliseconds since 1970-01-01 00:00:00 UTC.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize, Hash)]
pub struct Timestamp(pub i64);

fn fixed_len_num<'a, T: FromStr>(len: usize) -> impl FnMut(&'a str) -> IResult<'a, &'a str, T> {
    map_res(
        take_while_m_n(len, len, |c: char| c.is_ascii_digit()),
        |input: &str| input.parse(),
    )
}

fn parse_datepart(input: &str) -> IResult<&str, (i16, i8, i8)> {
    tuple((
        fixed_len_num(4),
        preceded(tag("-"), fixed_len_num(2)),
        preceded(tag("-"), fixed_len_num(2)),
    ))(input)
}

fn parse_timepart(input: &str) -> IResult<&str, (i8, i8, i8, i32)> {
    let (input, (hr, _, min)) = tuple((fixed_len_num(2), tag(":"), fixed_len_num(2)))(input)?;
    let (input, stuff) = opt(tuple((
        preceded(tag(":"), fixed_len_num(2)),
        opt(preceded(tag("."), take_while_m_n(1, 9, |c: char| c.is_ascii_digit()))),
    )))(input)?;
    let (sec, opt_frac) = stuff.unwrap_or((0, None));
    let millis = opt_frac
        .map(|f: &str| {
            let mut digits = [b'0'; 3];
            for (i, b) in f.as_bytes().iter().take(3).enumerate() {
                digits[i] = *b;
            }
            std::str::from_utf8(&digits).unwrap().parse().unwrap_or(0)
        })
        .unwrap_or(0);
    Ok((input, (hr, min, sec, millis)))
}

/// Parses `Z` (UTC) or `{+,-,}HH:MM` into a time zone offset in seconds.
fn parse_zone(input: &str) -> IResult<&str, i32> {
    alt((
        nom::combinator::value(0, tag("Z")),
        map(
            tuple((
                opt(nom::character::complete::one_of(&b"+-"[..])),
                fixed_len_num::<i32>(2),
                tag(":"),
                fixed_len_num::<i32>(2),
            )),
            |(sign, hr, _, min)| {
                let off = hr * 3600 + min * 60;
                if sign == Some('-') {
                    -off
                } else {
                    off
                }
            },
        ),
    ))(input)
}

impl Timestamp {
    pub const MIN: Self = Timestamp(i64::MIN);
    pub const MAX: Self = Timestamp(i64::MAX);

    /// Parses a timestamp as either milliseconds since epoch or an ISO 8601-ish string such as
    /// `2006-01-02T15:04:05.123Z` or `2006-01-02T15:04:05-07:00`. A missing fractional part is
    /// assumed to be 0. A missing zone offset implies the local time zone.
    ///
    /// Returns whether the input carried an explicit `Z`/offset suffix, which callers may want
    /// to echo back in responses.
    pub fn parse(input: &str) -> Result<(Self, bool), Error> {
        if let Ok(i) = i64::from_str(input) {
            return Ok((Timestamp(i), false));
        }

        let (remaining, ((tm_year, tm_mon, tm_mday), opt_time, opt_zone)) = tuple((
            parse_datepart,
            opt(preceded(tag("T"), parse_timepart)),
            opt(parse_zone),
        ))(input)
        .map_err(|e| match e {
            nom::Err::Incomplete(_) => Error::new(crate::ErrorKind::InvalidArgument, "incomplete"),
            nom::Err::Error(e) | nom::Err::Failure(e) => Error::new(
                crate::ErrorKind::InvalidArgument,
                nom::error::convert_error(input, e),
            ),
        })?;
        if !remaining.is_empty() {
            bail_t!(
                InvalidArgument,
                "unexpected suffix {remaining:?} following time string"
            );
        }
        let (tm_hour, tm_min, tm_sec, millis) = opt_time.unwrap_or((0, 0, 0, 0));
        let dt = jiff::civil::DateTime::new(tm_year, tm_mon, tm_mday, tm_hour, tm_min, tm_sec, 0)
            .map_err(|e| Error::new(crate::ErrorKind::InvalidArgument, e.to_string()))?;
        let has_zone = opt_zone.is_some();
        let tz = if let Some(off) = opt_zone {
            jiff::tz::TimeZone::fixed(jiff::tz::Offset::from_seconds(off).map_err(|e| {
                Error::new(
                    crate::ErrorKind::InvalidArgument,
                    format!("invalid time zone offset: {e}"),
                )
            })?)
        } else {
            global_zone()
        };
        let sec = tz
            .into_ambiguous_zoned(dt)
            .compatible()
            .map_err(|e| Error::new(crate::ErrorKind::InvalidArgument, e.to_string()))?
            .timestamp()
            .as_second();
        Ok((Timestamp(sec * 1_000 + i64::from(millis)), has_zone))
    }

    pub fn unix_seconds(&self) -> i64 {
        self.0.div_euclid(1_000)
    }

    /// Formats as ISO 8601 basic format (no `:` or `-` separators) in UTC,
    /// e.g. `20060102T150405.123Z`, suitable for embedding in a mount path
    /// or filename where `Display`'s `%:z`-suffixed form isn't.
    pub fn to_path_component(&self) -> String {
        let tm = jiff::Zoned::new(
            jiff::Timestamp::from_millisecond(self.0).unwrap_or(jiff::Timestamp::UNIX_EPOCH),
            jiff::tz::TimeZone::UTC,
        );
        format!("{}.{:03}Z", tm.strftime("%Y%m%dT%H%M%S"), self.0.rem_euclid(1_000))
    }
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(tm: std::time::SystemTime) -> Self {
        let d = tm
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(d.as_millis() as i64)
    }
}

impl std::str::FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).map(|(t, _)| t)
    }
}

impl ops::Sub for Timestamp {
    type Output = Duration;
    fn sub(self, rhs: Timestamp) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::Add<Duration> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.0)
    }
}

impl ops::Sub<Duration> for Timestamp {
    type Output = Timestamp;
    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 - rhs.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tm = jiff::Zoned::new(
            jiff::Timestamp::from_millisecond(self.0).map_err(|_| fmt::Error)?,
            global_zone(),
        );
        write!(
            f,
            "{}.{:03}{}",
            tm.strftime("%FT%T"),
            self.0.rem_euclid(1_000),
            tm.strftime("%:z"),
        )
    }
}

/// A duration specified in milliseconds.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Duration(pub i64);

impl Duration {
    pub const fn from_secs(s: i64) -> Self {
        Duration(s * 1_000)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_millis(d.0.max(0) as u64)
    }
}

impl TryFrom<std::time::Duration> for Duration {
    type Error = std::num::TryFromIntError;

    fn try_from(value: std::time::Duration) -> Result<Self, Self::Error> {
        Ok(Duration(i64::try_from(value.as_millis())?))
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut seconds = self.0 / 1_000;
        const MINUTE: i64 = 60;
        const HOUR: i64 = 60 * MINUTE;
        const DAY: i64 = 24 * HOUR;
        let days = seconds / DAY;
        seconds %= DAY;
        let hours = seconds / HOUR;
        seconds %= HOUR;
        let minutes = seconds / MINUTE;
        seconds %= MINUTE;
        let mut wrote = if days > 0 {
            write!(f, "{} day{}", days, if days == 1 { "" } else { "s" })?;
            true
        } else {
            false
        };
        if hours > 0 {
            write!(
                f,
                "{}{} hour{}",
                if wrote { " " } else { "" },
                hours,
                if hours == 1 { "" } else { "s" }
            )?;
            wrote = true;
        }
        if minutes > 0 {
            write!(
                f,
                "{}{} minute{}",
                if wrote { " " } else { "" },
                minutes,
                if minutes == 1 { "" } else { "s" }
            )?;
            wrote = true;
        }
        if seconds > 0 || !wrote {
            write!(
                f,
                "{}{} second{}",
                if wrote { " " } else { "" },
                seconds,
                if seconds == 1 { "" } else { "s" }
            )?;
        }
        Ok(())
    }
}

impl ops::Mul<i64> for Duration {
    type Output = Self;
    fn mul(self, rhs: i64) -> Self::Output {
        Duration(self.0 * rhs)
    }
}

impl ops::Neg for Duration {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Duration(-self.0)
    }
}

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl ops::SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 -= rhs.0
    }
}

pub mod testutil {
    pub fn init_zone() {
        super::init_zone(|| {
            jiff::tz::TimeZone::get("America/Los_Angeles")
                .expect("America/Los_Angeles should exist")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Duration, Timestamp};

    #[test]
    fn parse_time() {
        super::testutil::init_zone();
        let (t, had_zone) = Timestamp::parse("2006-01-02T15:04:05Z").unwrap();
        assert!(had_zone);
        assert_eq!(t.0, 1_136_214_245_000);
        let (t2, had_zone2) = Timestamp::parse("1136214245000").unwrap();
        assert!(!had_zone2);
        assert_eq!(t2, t);
    }

    #[test]
    fn display_duration() {
        let tests = &[
            ("0 seconds", 0),
            ("1 second", 1),
            ("1 minute", 60),
            ("1 minute 1 second", 61),
            ("2 minutes", 120),
            ("1 hour", 3600),
            ("1 day", 86400),
        ];
        for (want, secs) in tests {
            assert_eq!(*want, format!("{}", Duration::from_secs(*secs)));
        }
    }

    #[test]
    fn duration_from_std() {
        assert_eq!(
            Duration::try_from(std::time::Duration::from_millis(1_500)),
            Ok(Duration(1_500))
        );
    }
}
