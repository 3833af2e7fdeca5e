//! Session identities and hybrid logical clock timestamps.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 128-bit session identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ZenohId([u8; 16]);

impl ZenohId {
    /// Fresh random id.
    pub fn rand() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        // all-zero is reserved for "unset"
        bytes[0] |= 1;
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; 16] {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_u128(&self) -> u128 {
        u128::from_le_bytes(self.0)
    }
}

impl fmt::Display for ZenohId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.as_u128())
    }
}

impl fmt::Debug for ZenohId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ZenohId({self})")
    }
}

/// Error parsing a [`ZenohId`] from hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid session id '{0}': expected 1 to 32 hex digits, not all zero")]
pub struct ZenohIdParseError(pub String);

impl FromStr for ZenohId {
    type Err = ZenohIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ZenohIdParseError(s.to_owned());
        if s.is_empty() || s.len() > 32 {
            return Err(err());
        }
        let value = u128::from_str_radix(s, 16).map_err(|_| err())?;
        if value == 0 {
            return Err(err());
        }
        Ok(Self(value.to_le_bytes()))
    }
}

impl Serialize for ZenohId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ZenohId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 64-bit NTP time: upper 32 bits seconds since the Unix epoch, lower 32 bits fraction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ntp64(pub u64);

impl Ntp64 {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = d.as_secs() << 32;
        let frac = (u64::from(d.subsec_nanos()) << 32) / 1_000_000_000;
        Self(secs | frac)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Ntp64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 >> 32;
        let nanos = ((self.0 & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
        write!(f, "{secs}.{nanos:09}")
    }
}

/// Totally ordered `(time, id)` pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Timestamp {
    time: Ntp64,
    id: ZenohId,
}

impl Timestamp {
    #[must_use]
    pub const fn new(time: Ntp64, id: ZenohId) -> Self {
        Self { time, id }
    }

    #[inline]
    #[must_use]
    pub const fn time(&self) -> Ntp64 {
        self.time
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> ZenohId {
        self.id
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.time, self.id)
    }
}

/// Hybrid logical clock.
///
/// Never goes backwards: each call returns a time strictly greater than the
/// previous one, even if the wall clock stalls or steps back.
#[derive(Debug)]
pub struct Clock {
    id: ZenohId,
    last: AtomicU64,
}

impl Clock {
    pub fn new(id: ZenohId) -> Self {
        Self {
            id,
            last: AtomicU64::new(0),
        }
    }

    pub fn new_timestamp(&self) -> Timestamp {
        let now = Ntp64::now().0;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Timestamp::new(Ntp64(next), self.id),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Fold a remote timestamp into the clock so later local stamps order after it.
    pub fn observe(&self, ts: &Timestamp) {
        self.last.fetch_max(ts.time.0, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zid_hex_roundtrip() {
        let id = ZenohId::rand();
        let text = id.to_string();
        assert_eq!(text.parse::<ZenohId>().unwrap(), id);
        assert!("".parse::<ZenohId>().is_err());
        assert!("0".parse::<ZenohId>().is_err());
        assert!("xyz".parse::<ZenohId>().is_err());
        assert_eq!("a1".parse::<ZenohId>().unwrap().to_string(), "a1");
    }

    #[test]
    fn clock_is_strictly_monotonic() {
        let clock = Clock::new(ZenohId::rand());
        let mut prev = clock.new_timestamp();
        for _ in 0..10_000 {
            let ts = clock.new_timestamp();
            assert!(ts > prev);
            prev = ts;
        }
    }

    #[test]
    fn observe_moves_clock_forward() {
        let clock = Clock::new(ZenohId::rand());
        let far = Timestamp::new(Ntp64(u64::MAX / 2), ZenohId::rand());
        clock.observe(&far);
        assert!(clock.new_timestamp().time() > far.time());
    }

    #[test]
    fn timestamp_order_breaks_ties_by_id() {
        let lo = ZenohId::from_bytes([1; 16]);
        let hi = ZenohId::from_bytes([2; 16]);
        assert!(Timestamp::new(Ntp64(5), lo) < Timestamp::new(Ntp64(5), hi));
        assert!(Timestamp::new(Ntp64(4), hi) < Timestamp::new(Ntp64(5), lo));
    }
}
