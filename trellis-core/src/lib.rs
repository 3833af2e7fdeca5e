//! Trellis Core
//!
//! Building blocks of the trellis session engine, independent of any session:
//! - Key expressions and their matching (`keyexpr`)
//! - Declared key expression registry (`registry`)
//! - Samples, replies, encodings, timestamps and QoS (`sample`, `timestamp`, `qos`, `selector`)
//! - Delivery handlers and bounded channels (`handler`, `channel`)
//! - Network messages and the in-process transport (`message`, `fabric`)
//! - Configuration and error types (`config`, `error`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
pub mod channel;
pub mod config;
pub mod error;
pub mod fabric;
pub mod handler;
pub mod keyexpr;
pub mod message;
pub mod qos;
pub mod registry;
pub mod sample;
pub mod selector;
pub mod timestamp;

pub mod prelude {
    pub use crate::channel::{FifoChannel, Receiver, RingChannel};
    pub use crate::config::{Capabilities, Config, WhatAmI};
    pub use crate::error::{KeyExprError, Result, TrellisError};
    pub use crate::handler::{Callback, DeliverySink, Handler, IntoHandler};
    pub use crate::keyexpr::{IntoKeyExpr, KeyExpr};
    pub use crate::qos::{
        CongestionControl, ConsolidationMode, Locality, Priority, QueryTarget, Reliability,
        ReplyKeyExpr,
    };
    pub use crate::sample::{
        Encoding, EntityGlobalId, Reply, ReplyError, ReplyErrorKind, Sample, SampleKind,
        SourceInfo,
    };
    pub use crate::selector::Parameters;
    pub use crate::timestamp::{Timestamp, ZenohId};
}
