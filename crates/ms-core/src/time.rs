//! Presentation and decode time types.
//!
//! [`MediaTime`] is a signed microsecond count used for presentation
//! timestamps and durations. [`DecodeTimestamp`] wraps it so decode and
//! presentation times can never be mixed without an explicit conversion.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// A presentation time or duration with microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaTime(i64);

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime(0);
    /// Sentinel for "no timestamp".
    pub const NONE: MediaTime = MediaTime(i64::MIN);
    /// Sentinel for an unbounded time (e.g. live duration, open append window).
    pub const INFINITE: MediaTime = MediaTime(i64::MAX);

    pub const fn from_micros(us: i64) -> Self {
        MediaTime(us)
    }

    pub const fn from_millis(ms: i64) -> Self {
        MediaTime(ms * 1_000)
    }

    pub const fn from_secs(secs: i64) -> Self {
        MediaTime(secs * MICROS_PER_SECOND)
    }

    /// Convert from fractional seconds, rounding to the nearest microsecond.
    /// Non-finite input maps onto the sentinels.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() {
            return MediaTime::NONE;
        }
        if secs.is_infinite() {
            return if secs > 0.0 {
                MediaTime::INFINITE
            } else {
                MediaTime::NONE
            };
        }
        MediaTime((secs * MICROS_PER_SECOND as f64).round() as i64)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub const fn as_millis(self) -> i64 {
        self.0 / 1_000
    }

    pub fn as_secs_f64(self) -> f64 {
        if self.is_infinite() {
            return f64::INFINITY;
        }
        self.0 as f64 / MICROS_PER_SECOND as f64
    }

    pub const fn is_none(self) -> bool {
        self.0 == i64::MIN
    }

    pub const fn is_some(self) -> bool {
        !self.is_none()
    }

    pub const fn is_infinite(self) -> bool {
        self.0 == i64::MAX
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// `Some(self)` unless this is the [`MediaTime::NONE`] sentinel.
    pub fn get(self) -> Option<MediaTime> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }

    pub fn abs(self) -> MediaTime {
        MediaTime(self.0.saturating_abs())
    }
}

impl Add for MediaTime {
    type Output = MediaTime;

    fn add(self, rhs: MediaTime) -> MediaTime {
        MediaTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for MediaTime {
    fn add_assign(&mut self, rhs: MediaTime) {
        *self = *self + rhs;
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;

    fn sub(self, rhs: MediaTime) -> MediaTime {
        MediaTime(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for MediaTime {
    fn sub_assign(&mut self, rhs: MediaTime) {
        *self = *self - rhs;
    }
}

impl Neg for MediaTime {
    type Output = MediaTime;

    fn neg(self) -> MediaTime {
        MediaTime(self.0.saturating_neg())
    }
}

impl Mul<i64> for MediaTime {
    type Output = MediaTime;

    fn mul(self, rhs: i64) -> MediaTime {
        MediaTime(self.0.saturating_mul(rhs))
    }
}

impl Div<i64> for MediaTime {
    type Output = MediaTime;

    fn div(self, rhs: i64) -> MediaTime {
        MediaTime(self.0 / rhs)
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        if self.is_infinite() {
            return f.write_str("inf");
        }
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// A decode timestamp.
///
/// Ordering and arithmetic are defined; conversion to and from presentation
/// time is always explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecodeTimestamp(MediaTime);

impl DecodeTimestamp {
    pub const ZERO: DecodeTimestamp = DecodeTimestamp(MediaTime::ZERO);
    /// Sentinel for "no decode timestamp".
    pub const NONE: DecodeTimestamp = DecodeTimestamp(MediaTime::NONE);

    pub const fn from_presentation_time(time: MediaTime) -> Self {
        DecodeTimestamp(time)
    }

    pub const fn to_presentation_time(self) -> MediaTime {
        self.0
    }

    pub const fn from_micros(us: i64) -> Self {
        DecodeTimestamp(MediaTime::from_micros(us))
    }

    pub const fn from_millis(ms: i64) -> Self {
        DecodeTimestamp(MediaTime::from_millis(ms))
    }

    pub const fn is_none(self) -> bool {
        self.0.is_none()
    }

    pub const fn is_some(self) -> bool {
        self.0.is_some()
    }

    pub const fn is_negative(self) -> bool {
        self.0.is_negative()
    }
}

impl Default for DecodeTimestamp {
    fn default() -> Self {
        DecodeTimestamp::NONE
    }
}

impl Add<MediaTime> for DecodeTimestamp {
    type Output = DecodeTimestamp;

    fn add(self, rhs: MediaTime) -> DecodeTimestamp {
        DecodeTimestamp(self.0 + rhs)
    }
}

impl AddAssign<MediaTime> for DecodeTimestamp {
    fn add_assign(&mut self, rhs: MediaTime) {
        self.0 += rhs;
    }
}

impl Sub<MediaTime> for DecodeTimestamp {
    type Output = DecodeTimestamp;

    fn sub(self, rhs: MediaTime) -> DecodeTimestamp {
        DecodeTimestamp(self.0 - rhs)
    }
}

impl Sub for DecodeTimestamp {
    type Output = MediaTime;

    fn sub(self, rhs: DecodeTimestamp) -> MediaTime {
        self.0 - rhs.0
    }
}

impl fmt::Display for DecodeTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dts:{}", self.0)
    }
}
