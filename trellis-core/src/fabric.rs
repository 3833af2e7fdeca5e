//! In-process transport connecting sessions of the same process.
//!
//! Each session owns one bounded inbound queue of [`LinkEvent`]s. Listening
//! on `inproc/<name>` publishes that queue in a process-wide registry;
//! connecting looks the name up and exchanges [`Hello`]s, after which each
//! side holds a [`Link`] into the other's queue.
//!
//! ```
//! use trellis_core::config::{Capabilities, WhatAmI};
//! use trellis_core::fabric::{self, LinkEvent};
//! use trellis_core::message::Hello;
//! use trellis_core::timestamp::ZenohId;
//!
//! let hello = |zid| Hello { zid, whatami: WhatAmI::Peer, capabilities: Capabilities::default() };
//! let (a, b) = (ZenohId::rand(), ZenohId::rand());
//! let (b_tx, b_rx) = flume::bounded(16);
//! fabric::listen("inproc/doc-fabric", hello(b), b_tx).unwrap();
//!
//! let (a_tx, _a_rx) = flume::bounded(16);
//! let (remote, link) = fabric::connect("inproc/doc-fabric", hello(a), &a_tx).unwrap();
//! assert_eq!(remote.zid, b);
//! assert_eq!(link.peer(), b);
//! assert!(matches!(b_rx.recv().unwrap(), LinkEvent::Open { .. }));
//! fabric::unlisten("inproc/doc-fabric");
//! ```

use crate::error::{Result, TrellisError};
use crate::message::{Hello, NetworkMessage};
use crate::qos::CongestionControl;
use crate::timestamp::ZenohId;
use dashmap::DashMap;
use flume::{Sender, TrySendError};
use once_cell::sync::Lazy;
use std::fmt;
use std::io;
use tracing::{debug, trace};

/// Scheme prefix of fabric endpoints.
pub const ENDPOINT_PREFIX: &str = "inproc/";

/// Event delivered to a session's inbound queue.
#[derive(Debug)]
pub enum LinkEvent {
    /// A peer connected; `link` sends back to it.
    Open { link: Link, hello: Hello },
    Message { from: ZenohId, msg: NetworkMessage },
    /// The peer went away.
    Close { from: ZenohId },
    /// Local request to stop the delivery thread.
    Shutdown,
}

pub type Inbox = Sender<LinkEvent>;

struct Listener {
    hello: Hello,
    inbox: Inbox,
}

static LISTENERS: Lazy<DashMap<String, Listener>> = Lazy::new(DashMap::new);

/// One-way sender into a peer session's inbound queue.
#[derive(Clone)]
pub struct Link {
    local: ZenohId,
    peer: ZenohId,
    tx: Inbox,
}

impl Link {
    pub fn new(local: ZenohId, peer: ZenohId, tx: Inbox) -> Self {
        Self { local, peer, tx }
    }

    #[inline]
    pub const fn peer(&self) -> ZenohId {
        self.peer
    }

    /// Send honoring the message's congestion control.
    ///
    /// Returns `Ok(false)` when a DROP message was discarded because the
    /// queue was full. A closed peer is a transport error.
    pub fn send(&self, msg: NetworkMessage) -> Result<bool> {
        let kind = msg.kind();
        let event = LinkEvent::Message {
            from: self.local,
            msg,
        };
        match event_congestion(&event) {
            CongestionControl::Block => self
                .tx
                .send(event)
                .map(|()| true)
                .map_err(|_| self.closed_error()),
            CongestionControl::Drop => match self.tx.try_send(event) {
                Ok(()) => Ok(true),
                Err(TrySendError::Full(_)) => {
                    trace!("[FABRIC] queue to {} full, dropping {}", self.peer, kind);
                    Ok(false)
                }
                Err(TrySendError::Disconnected(_)) => Err(self.closed_error()),
            },
        }
    }

    /// Tell the peer this side is going away. Best effort.
    pub fn close(&self) {
        if self.tx.send(LinkEvent::Close { from: self.local }).is_err() {
            trace!("[FABRIC] peer {} already gone", self.peer);
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }

    fn closed_error(&self) -> TrellisError {
        TrellisError::transport(format!("link to {} closed", self.peer))
    }
}

fn event_congestion(event: &LinkEvent) -> CongestionControl {
    match event {
        LinkEvent::Message { msg, .. } => msg.congestion_control(),
        _ => CongestionControl::Block,
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Bind `endpoint` so other sessions can connect to `inbox`.
pub fn listen(endpoint: &str, hello: Hello, inbox: Inbox) -> Result<()> {
    let name = endpoint_name(endpoint)?;
    match LISTENERS.entry(name.to_owned()) {
        dashmap::mapref::entry::Entry::Occupied(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("endpoint '{endpoint}' is already bound"),
        )
        .into()),
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            debug!("[FABRIC] {} listening on {}", hello.zid, endpoint);
            slot.insert(Listener { hello, inbox });
            Ok(())
        }
    }
}

/// Release `endpoint`. Unknown endpoints are ignored.
pub fn unlisten(endpoint: &str) {
    if let Ok(name) = endpoint_name(endpoint) {
        if LISTENERS.remove(name).is_some() {
            debug!("[FABRIC] released {}", endpoint);
        }
    }
}

/// A listener found by [`dial`] that has not heard from the dialer yet.
#[derive(Debug)]
pub struct Dial {
    endpoint: String,
    hello: Hello,
    remote: Hello,
    back: Link,
    link: Link,
}

impl Dial {
    #[inline]
    pub fn remote(&self) -> &Hello {
        &self.remote
    }

    /// Link towards the listener. Usable once [`Dial::open`] succeeded.
    #[inline]
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Deliver [`LinkEvent::Open`] to the listener, with a link back into
    /// the dialer's inbox.
    pub fn open(self) -> Result<(Hello, Link)> {
        let Self {
            endpoint,
            hello,
            remote,
            back,
            link,
        } = self;
        link.tx
            .send(LinkEvent::Open { link: back, hello })
            .map_err(|_| TrellisError::transport(format!("listener on '{endpoint}' is gone")))?;
        debug!("[FABRIC] {} connected to {} via {}", link.local, remote.zid, endpoint);
        Ok((remote, link))
    }
}

/// Look up the session listening on `endpoint`. Nothing is sent yet, so the
/// caller may register the remote side before its traffic can arrive.
pub fn dial(endpoint: &str, hello: Hello, inbox: &Inbox) -> Result<Dial> {
    let name = endpoint_name(endpoint)?;
    let (remote, remote_inbox) = {
        let entry = LISTENERS.get(name).ok_or_else(|| {
            TrellisError::from(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on '{endpoint}'"),
            ))
        })?;
        (entry.hello.clone(), entry.inbox.clone())
    };

    if remote.zid == hello.zid {
        return Err(TrellisError::transport(format!(
            "'{endpoint}' is bound by this session"
        )));
    }

    let local = hello.zid;
    Ok(Dial {
        endpoint: endpoint.to_owned(),
        back: Link::new(remote.zid, local, inbox.clone()),
        link: Link::new(local, remote.zid, remote_inbox),
        hello,
        remote,
    })
}

/// Connect to the session listening on `endpoint`.
///
/// Delivers [`LinkEvent::Open`] to the remote side (with a link back into
/// `inbox`) and returns the remote hello plus a link towards it.
pub fn connect(endpoint: &str, hello: Hello, inbox: &Inbox) -> Result<(Hello, Link)> {
    dial(endpoint, hello, inbox)?.open()
}

/// Currently bound endpoint names, without the prefix.
pub fn endpoints() -> Vec<String> {
    LISTENERS.iter().map(|e| e.key().clone()).collect()
}

fn endpoint_name(endpoint: &str) -> Result<&str> {
    match endpoint.strip_prefix(ENDPOINT_PREFIX) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(TrellisError::config(format!(
            "endpoint must look like '{ENDPOINT_PREFIX}<name>', got '{endpoint}'"
        ))),
    }
}
