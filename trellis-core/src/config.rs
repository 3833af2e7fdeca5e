//! Session configuration.
//!
//! A [`Config`] is consulted once, when the session opens, and is immutable
//! afterwards. It can be built in code with the `with_*` methods or loaded
//! from JSON; missing fields take their defaults.
//!
//! # Examples
//!
//! ```
//! use trellis_core::config::{Config, WhatAmI};
//!
//! let cfg = Config::default()
//!     .with_mode(WhatAmI::Router)
//!     .with_listen("inproc/router-1")
//!     .with_queries_default_timeout_ms(2_000);
//! assert!(cfg.validate().is_ok());
//!
//! let cfg = Config::from_json(r#"{ "connect": ["inproc/router-1"] }"#).unwrap();
//! assert_eq!(cfg.queries_default_timeout_ms, 10_000);
//! ```

use crate::error::{Result, TrellisError};
use crate::fabric::ENDPOINT_PREFIX;
use crate::timestamp::ZenohId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Role a session plays in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhatAmI {
    Router,
    #[default]
    Peer,
    Client,
}

impl WhatAmI {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Peer => "peer",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for WhatAmI {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional features negotiated with peers at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// `get`, queryables and publication caches
    pub queries: bool,
    /// Liveliness tokens, subscribers and `liveliness_get`
    pub liveliness: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            queries: true,
            liveliness: true,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session id. `None` (default) draws a random one.
    pub id: Option<ZenohId>,

    /// Role advertised in the hello.
    /// - Default: peer
    pub mode: WhatAmI,

    /// Endpoints to bind, `inproc/<name>`.
    pub listen: Vec<String>,

    /// Endpoints to connect to at open; any failure fails the open.
    pub connect: Vec<String>,

    /// Deadline for queries issued with `timeout_ms = 0`.
    /// - Default: 10000 ms
    pub queries_default_timeout_ms: u64,

    /// Capacity of the session's inbound message queue.
    ///
    /// Senders with congestion control BLOCK wait when it is full, DROP
    /// senders discard.
    /// - Default: 256 messages
    pub link_queue_size: usize,

    pub capabilities: Capabilities,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            mode: WhatAmI::Peer,
            listen: Vec::new(),
            connect: Vec::new(),
            queries_default_timeout_ms: 10_000,
            link_queue_size: 256,
            capabilities: Capabilities::default(),
        }
    }
}

impl Config {
    /// Parse and validate a JSON document. Missing keys take their defaults;
    /// unknown keys are ignored.
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|e| TrellisError::config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| TrellisError::config(e.to_string()))
    }

    /// Check endpoint syntax and sizes.
    pub fn validate(&self) -> Result<()> {
        for ep in self.listen.iter().chain(&self.connect) {
            match ep.strip_prefix(ENDPOINT_PREFIX) {
                Some(name) if !name.is_empty() => {}
                _ => {
                    return Err(TrellisError::config(format!(
                        "endpoint '{ep}' must look like '{ENDPOINT_PREFIX}<name>'"
                    )))
                }
            }
        }
        if self.link_queue_size == 0 {
            return Err(TrellisError::config("link_queue_size must be > 0"));
        }
        if self.queries_default_timeout_ms == 0 {
            return Err(TrellisError::config("queries_default_timeout_ms must be > 0"));
        }
        Ok(())
    }

    #[inline]
    pub fn queries_default_timeout(&self) -> Duration {
        Duration::from_millis(self.queries_default_timeout_ms)
    }

    pub fn with_id(mut self, id: ZenohId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_mode(mut self, mode: WhatAmI) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_listen(mut self, endpoint: impl Into<String>) -> Self {
        self.listen.push(endpoint.into());
        self
    }

    pub fn with_connect(mut self, endpoint: impl Into<String>) -> Self {
        self.connect.push(endpoint.into());
        self
    }

    pub fn with_queries_default_timeout_ms(mut self, ms: u64) -> Self {
        self.queries_default_timeout_ms = ms;
        self
    }

    pub fn with_link_queue_size(mut self, size: usize) -> Self {
        self.link_queue_size = size;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}
