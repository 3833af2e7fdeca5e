//! Per-operation options.
//!
//! Every record has documented defaults and `with_*` builders:
//!
//! ```
//! use trellis::options::GetOptions;
//! use trellis::prelude::*;
//!
//! let opts = GetOptions::default()
//!     .with_target(QueryTarget::All)
//!     .with_consolidation(ConsolidationMode::None)
//!     .with_timeout_ms(500u64);
//! assert_eq!(opts.congestion_control, CongestionControl::Block);
//! ```

use bytes::Bytes;
use trellis_core::qos::{
    CongestionControl, ConsolidationMode, Locality, Priority, QueryTarget, Reliability,
    ReplyKeyExpr,
};
use trellis_core::sample::{Encoding, SourceInfo};
use trellis_core::timestamp::Timestamp;

macro_rules! builder {
    ($ty:ident { $($field:ident : $fty:ty => $with:ident),* $(,)? }) => {
        impl $ty {
            $(
                #[must_use]
                pub fn $with(mut self, value: impl Into<$fty>) -> Self {
                    self.$field = value.into();
                    self
                }
            )*
        }
    };
}

/// Options of `Session::put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Default: `None` (`zenoh/bytes`)
    pub encoding: Option<Encoding>,
    /// Default: DROP
    pub congestion_control: CongestionControl,
    /// Default: DATA
    pub priority: Priority,
    pub is_express: bool,
    /// Default: BEST_EFFORT
    pub reliability: Reliability,
    /// Default: ANY
    pub allowed_destination: Locality,
    pub timestamp: Option<Timestamp>,
    pub source_info: Option<SourceInfo>,
    pub attachment: Option<Bytes>,
}

builder!(PutOptions {
    encoding: Option<Encoding> => with_encoding,
    congestion_control: CongestionControl => with_congestion_control,
    priority: Priority => with_priority,
    is_express: bool => with_express,
    reliability: Reliability => with_reliability,
    allowed_destination: Locality => with_allowed_destination,
    timestamp: Option<Timestamp> => with_timestamp,
    source_info: Option<SourceInfo> => with_source_info,
    attachment: Option<Bytes> => with_attachment,
});

/// Options of `Session::delete_resource`.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub congestion_control: CongestionControl,
    pub priority: Priority,
    pub is_express: bool,
    pub reliability: Reliability,
    pub allowed_destination: Locality,
    pub timestamp: Option<Timestamp>,
}

builder!(DeleteOptions {
    congestion_control: CongestionControl => with_congestion_control,
    priority: Priority => with_priority,
    is_express: bool => with_express,
    reliability: Reliability => with_reliability,
    allowed_destination: Locality => with_allowed_destination,
    timestamp: Option<Timestamp> => with_timestamp,
});

/// Options of `Session::declare_publisher`.
#[derive(Debug, Clone, Default)]
pub struct PublisherOptions {
    pub congestion_control: CongestionControl,
    pub priority: Priority,
    pub is_express: bool,
    pub reliability: Reliability,
    pub allowed_destination: Locality,
    /// Default encoding of every put
    pub encoding: Option<Encoding>,
}

builder!(PublisherOptions {
    congestion_control: CongestionControl => with_congestion_control,
    priority: Priority => with_priority,
    is_express: bool => with_express,
    reliability: Reliability => with_reliability,
    allowed_destination: Locality => with_allowed_destination,
    encoding: Option<Encoding> => with_encoding,
});

/// Options of `Publisher::put`.
#[derive(Debug, Clone, Default)]
pub struct PublisherPutOptions {
    /// Overrides the publisher's encoding
    pub encoding: Option<Encoding>,
    pub timestamp: Option<Timestamp>,
    pub source_info: Option<SourceInfo>,
    pub attachment: Option<Bytes>,
}

builder!(PublisherPutOptions {
    encoding: Option<Encoding> => with_encoding,
    timestamp: Option<Timestamp> => with_timestamp,
    source_info: Option<SourceInfo> => with_source_info,
    attachment: Option<Bytes> => with_attachment,
});

/// Options of `Publisher::delete_resource`.
#[derive(Debug, Clone, Default)]
pub struct PublisherDeleteOptions {
    pub timestamp: Option<Timestamp>,
}

builder!(PublisherDeleteOptions {
    timestamp: Option<Timestamp> => with_timestamp,
});

/// Options of `Session::declare_subscriber`.
#[derive(Debug, Clone, Default)]
pub struct SubscriberOptions {
    /// Which publications are delivered. Default: ANY
    pub allowed_origin: Locality,
}

builder!(SubscriberOptions {
    allowed_origin: Locality => with_allowed_origin,
});

/// Options of `Session::declare_queryable`.
#[derive(Debug, Clone, Default)]
pub struct QueryableOptions {
    /// Answers every key its expression matches. Default: false
    pub complete: bool,
    /// Which queries are delivered. Default: ANY
    pub allowed_origin: Locality,
}

builder!(QueryableOptions {
    complete: bool => with_complete,
    allowed_origin: Locality => with_allowed_origin,
});

/// Options of `Session::get`.
#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Default: BEST_MATCHING
    pub target: QueryTarget,
    /// Default: AUTO
    pub consolidation: ConsolidationMode,
    pub priority: Priority,
    /// Default: BLOCK
    pub congestion_control: CongestionControl,
    pub is_express: bool,
    pub payload: Option<Bytes>,
    pub encoding: Option<Encoding>,
    pub source_info: Option<SourceInfo>,
    /// Default: MATCHING_QUERY
    pub accept_replies: ReplyKeyExpr,
    pub allowed_destination: Locality,
    pub attachment: Option<Bytes>,
    /// `0` (default) uses the session's `queries_default_timeout_ms`
    pub timeout_ms: u64,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            target: QueryTarget::BestMatching,
            consolidation: ConsolidationMode::Auto,
            priority: Priority::Data,
            congestion_control: CongestionControl::Block,
            is_express: false,
            payload: None,
            encoding: None,
            source_info: None,
            accept_replies: ReplyKeyExpr::MatchingQuery,
            allowed_destination: Locality::Any,
            attachment: None,
            timeout_ms: 0,
        }
    }
}

builder!(GetOptions {
    target: QueryTarget => with_target,
    consolidation: ConsolidationMode => with_consolidation,
    priority: Priority => with_priority,
    congestion_control: CongestionControl => with_congestion_control,
    is_express: bool => with_express,
    payload: Option<Bytes> => with_payload,
    encoding: Option<Encoding> => with_encoding,
    source_info: Option<SourceInfo> => with_source_info,
    accept_replies: ReplyKeyExpr => with_accept_replies,
    allowed_destination: Locality => with_allowed_destination,
    attachment: Option<Bytes> => with_attachment,
    timeout_ms: u64 => with_timeout_ms,
});

/// Options of `Query::reply`.
#[derive(Debug, Clone)]
pub struct ReplyOptions {
    pub encoding: Option<Encoding>,
    /// Default: BLOCK
    pub congestion_control: CongestionControl,
    pub priority: Priority,
    pub is_express: bool,
    pub timestamp: Option<Timestamp>,
    pub source_info: Option<SourceInfo>,
    pub attachment: Option<Bytes>,
}

impl Default for ReplyOptions {
    fn default() -> Self {
        Self {
            encoding: None,
            congestion_control: CongestionControl::Block,
            priority: Priority::Data,
            is_express: false,
            timestamp: None,
            source_info: None,
            attachment: None,
        }
    }
}

builder!(ReplyOptions {
    encoding: Option<Encoding> => with_encoding,
    congestion_control: CongestionControl => with_congestion_control,
    priority: Priority => with_priority,
    is_express: bool => with_express,
    timestamp: Option<Timestamp> => with_timestamp,
    source_info: Option<SourceInfo> => with_source_info,
    attachment: Option<Bytes> => with_attachment,
});

/// Options of `Query::reply_err`.
#[derive(Debug, Clone, Default)]
pub struct ReplyErrOptions {
    pub encoding: Option<Encoding>,
}

builder!(ReplyErrOptions {
    encoding: Option<Encoding> => with_encoding,
});

/// Options of `Query::reply_del`.
#[derive(Debug, Clone)]
pub struct ReplyDelOptions {
    /// Default: BLOCK
    pub congestion_control: CongestionControl,
    pub priority: Priority,
    pub is_express: bool,
    pub timestamp: Option<Timestamp>,
    pub source_info: Option<SourceInfo>,
    pub attachment: Option<Bytes>,
}

impl Default for ReplyDelOptions {
    fn default() -> Self {
        Self {
            congestion_control: CongestionControl::Block,
            priority: Priority::Data,
            is_express: false,
            timestamp: None,
            source_info: None,
            attachment: None,
        }
    }
}

builder!(ReplyDelOptions {
    congestion_control: CongestionControl => with_congestion_control,
    priority: Priority => with_priority,
    is_express: bool => with_express,
    timestamp: Option<Timestamp> => with_timestamp,
    source_info: Option<SourceInfo> => with_source_info,
    attachment: Option<Bytes> => with_attachment,
});

/// Options of `Session::liveliness_declare_subscriber`.
#[derive(Debug, Clone, Default)]
pub struct LivelinessSubscriberOptions {
    /// Replay currently alive tokens on declaration. Default: false
    pub history: bool,
}

builder!(LivelinessSubscriberOptions {
    history: bool => with_history,
});

/// Options of `Session::liveliness_get`.
#[derive(Debug, Clone)]
pub struct LivelinessGetOptions {
    /// Default: 10000
    pub timeout_ms: u64,
}

impl Default for LivelinessGetOptions {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

builder!(LivelinessGetOptions {
    timeout_ms: u64 => with_timeout_ms,
});

/// Options of `Session::declare_publication_cache`.
#[derive(Debug, Clone)]
pub struct PublicationCacheOptions {
    /// Prefix prepended to the cache's key for its queryable. Default: none
    pub queryable_prefix: Option<String>,
    pub queryable_complete: bool,
    /// Samples kept per key. Default: 1
    pub history: usize,
    /// Distinct keys kept, `0` (default) for no limit
    pub resources_limit: usize,
}

impl Default for PublicationCacheOptions {
    fn default() -> Self {
        Self {
            queryable_prefix: None,
            queryable_complete: false,
            history: 1,
            resources_limit: 0,
        }
    }
}

builder!(PublicationCacheOptions {
    queryable_prefix: Option<String> => with_queryable_prefix,
    queryable_complete: bool => with_queryable_complete,
    history: usize => with_history,
    resources_limit: usize => with_resources_limit,
});
