//! # Trellis
//!
//! An in-process publish/subscribe and query engine with key-expression
//! routing, in the style of zenoh sessions.
//!
//! ## Architecture
//!
//! - **`trellis-core`**: key expressions, registry, data model, handlers,
//!   channels and the in-process transport (the "fabric")
//! - **`trellis`**: sessions and their entities (this crate)
//!
//! A [`Session`] owns its declarations: subscribers, queryables,
//! publishers, liveliness tokens and declared key expressions. Sessions
//! configured to listen and connect on `inproc/<name>` endpoints exchange
//! declarations, publications, queries and replies (one hop, no forwarding).
//!
//! ## Quick Start
//!
//! ```
//! use trellis::prelude::*;
//!
//! let session = trellis::open(Config::default()).unwrap();
//!
//! let sub = session
//!     .declare_subscriber("sensors/*/temp", FifoChannel::new(16), SubscriberOptions::default())
//!     .unwrap();
//! session.put("sensors/kitchen/temp", "21.5", PutOptions::default()).unwrap();
//!
//! let sample = sub.recv().unwrap();
//! assert_eq!(sample.key_expr().as_str(), "sensors/kitchen/temp");
//! session.close().unwrap();
//! ```
//!
//! ## Delivery
//!
//! Handlers are closures (run inline on the delivering thread),
//! [`Callback`](trellis_core::handler::Callback)s with a drop notification,
//! or bounded channels: [`FifoChannel`](trellis_core::channel::FifoChannel)
//! blocks the producer when full, [`RingChannel`](trellis_core::channel::RingChannel)
//! evicts the oldest item. A panicking callback is logged and skipped.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod dev_tracing;
pub mod liveliness;
pub mod options;
pub mod publication_cache;
pub mod publisher;
pub mod query;
pub mod queryable;
pub mod resource;
pub mod session;
pub mod subscriber;

pub use bytes::Bytes;
pub use trellis_core::{channel, config, error, handler, keyexpr, qos, sample, selector, timestamp};

pub use liveliness::LivelinessToken;
pub use publication_cache::PublicationCache;
pub use publisher::Publisher;
pub use query::Query;
pub use queryable::Queryable;
pub use resource::Resource;
pub use session::Session;
pub use subscriber::Subscriber;

use trellis_core::config::Config;
use trellis_core::error::Result;

/// Open a session. Shorthand for [`Session::open`].
pub fn open(config: Config) -> Result<Session> {
    Session::open(config)
}

pub mod prelude {
    //! Everything needed for typical use.
    pub use crate::options::*;
    pub use crate::{
        LivelinessToken, PublicationCache, Publisher, Query, Queryable, Resource, Session,
        Subscriber,
    };
    pub use bytes::Bytes;
    pub use trellis_core::prelude::*;
}
