//! Quality-of-service and routing policy enums.

use std::fmt;

/// Behaviour when an outbound link queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CongestionControl {
    /// Discard the message
    #[default]
    Drop = 0,
    /// Block the caller until space frees
    Block = 1,
}

/// Message priority, `RealTime` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    RealTime = 1,
    InteractiveHigh = 2,
    InteractiveLow = 3,
    DataHigh = 4,
    #[default]
    Data = 5,
    DataLow = 6,
    Background = 7,
}

impl Priority {
    pub const MAX: Self = Self::RealTime;
    pub const MIN: Self = Self::Background;

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RealTime => "REAL_TIME",
            Self::InteractiveHigh => "INTERACTIVE_HIGH",
            Self::InteractiveLow => "INTERACTIVE_LOW",
            Self::DataHigh => "DATA_HIGH",
            Self::Data => "DATA",
            Self::DataLow => "DATA_LOW",
            Self::Background => "BACKGROUND",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Priority {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => Self::RealTime,
            2 => Self::InteractiveHigh,
            3 => Self::InteractiveLow,
            4 => Self::DataHigh,
            5 => Self::Data,
            6 => Self::DataLow,
            7 => Self::Background,
            other => return Err(other),
        })
    }
}

/// Delivery guarantee requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Reliability {
    #[default]
    BestEffort = 0,
    Reliable = 1,
}

/// Where a publication or query may be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Locality {
    /// Only entities of this session
    SessionLocal,
    /// Only entities of other sessions
    Remote,
    #[default]
    Any,
}

impl Locality {
    #[inline]
    pub const fn allows_local(&self) -> bool {
        matches!(self, Self::SessionLocal | Self::Any)
    }

    #[inline]
    pub const fn allows_remote(&self) -> bool {
        matches!(self, Self::Remote | Self::Any)
    }
}

/// Which queryables a query is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryTarget {
    /// One complete queryable covering the whole query key, if any
    #[default]
    BestMatching,
    /// Every intersecting queryable
    All,
    /// Every complete queryable covering the whole query key
    AllComplete,
}

/// Reply consolidation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConsolidationMode {
    /// `None` when the parameters carry `_time`, `Latest` otherwise
    #[default]
    Auto,
    None,
    Monotonic,
    Latest,
}

/// Which reply keys a query accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplyKeyExpr {
    Any,
    #[default]
    MatchingQuery,
}
