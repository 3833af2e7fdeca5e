//! Publication cache.
//!
//! Keeps the last few publications seen on a key expression and answers
//! queries from them, so late joiners can fetch recent values with a `get`.
//! Built on a regular subscriber and queryable of the same session.

use crate::options::{
    PublicationCacheOptions, QueryableOptions, ReplyDelOptions, ReplyOptions, SubscriberOptions,
};
use crate::query::Query;
use crate::queryable::Queryable;
use crate::session::Session;
use crate::subscriber::Subscriber;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};
use trellis_core::error::Result;
use trellis_core::keyexpr::{IntoKeyExpr, KeyExpr};
use trellis_core::sample::{Sample, SampleKind};

#[derive(Debug)]
struct CacheStore {
    history: usize,
    resources_limit: usize,
    samples: HashMap<KeyExpr, VecDeque<Sample>>,
}

impl CacheStore {
    fn store(&mut self, sample: Sample) {
        let limit_reached = self.resources_limit != 0 && self.samples.len() >= self.resources_limit;
        if limit_reached && !self.samples.contains_key(&sample.key_expr) {
            debug!(
                "[CACHE] resources limit {} reached, not caching {}",
                self.resources_limit, sample.key_expr
            );
            return;
        }
        let queue = self.samples.entry(sample.key_expr.clone()).or_default();
        if queue.len() >= self.history {
            queue.pop_front();
        }
        queue.push_back(sample);
    }

    fn matching(&self, prefix: Option<&KeyExpr>, query: &KeyExpr) -> Vec<Sample> {
        self.samples
            .iter()
            .filter(|(key, _)| match prefix {
                Some(p) => p.join(key.as_str()).is_ok_and(|k| k.intersects(query)),
                None => key.intersects(query),
            })
            .flat_map(|(_, queue)| queue.iter().cloned())
            .collect()
    }

    fn len(&self) -> usize {
        self.samples.values().map(VecDeque::len).sum()
    }
}

fn answer(query: &Query, sample: Sample) {
    let key_expr = sample.key_expr.clone();
    let result = match sample.kind {
        SampleKind::Put => {
            let options = ReplyOptions {
                encoding: Some(sample.encoding),
                timestamp: sample.timestamp,
                source_info: sample.source_info,
                attachment: sample.attachment,
                ..ReplyOptions::default()
            };
            query.reply(&key_expr, sample.payload, options)
        }
        SampleKind::Delete => {
            let options = ReplyDelOptions {
                timestamp: sample.timestamp,
                source_info: sample.source_info,
                attachment: sample.attachment,
                ..ReplyDelOptions::default()
            };
            query.reply_del(&key_expr, options)
        }
    };
    if let Err(e) = result {
        trace!("[CACHE] reply on {} to {} not sent: {}", key_expr, query.key_expr(), e);
    }
}

/// A publication cache; undeclared explicitly or on drop.
pub struct PublicationCache {
    key_expr: KeyExpr,
    store: Arc<Mutex<CacheStore>>,
    subscriber: Subscriber<()>,
    queryable: Queryable<()>,
}

impl PublicationCache {
    #[inline]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    /// Key expression the cache answers queries on.
    #[inline]
    pub fn queryable_key_expr(&self) -> &KeyExpr {
        self.queryable.key_expr()
    }

    /// Number of samples currently cached.
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn undeclare(self) -> Result<()> {
        self.queryable.undeclare()?;
        self.subscriber.undeclare()
    }
}

impl fmt::Debug for PublicationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicationCache")
            .field("key_expr", &self.key_expr)
            .field("queryable", self.queryable.key_expr())
            .finish()
    }
}

impl Session {
    /// Cache publications on `key_expr` and serve them to queries.
    ///
    /// With a `queryable_prefix`, the cache answers on `prefix/key_expr` and
    /// replies keep the original keys, so queriers need
    /// `ReplyKeyExpr::Any` to accept them.
    pub fn declare_publication_cache<K>(
        &self,
        key_expr: K,
        options: PublicationCacheOptions,
    ) -> Result<PublicationCache>
    where
        K: IntoKeyExpr,
    {
        self.inner.ensure_open()?;
        self.inner.require_queries()?;
        let key_expr = key_expr.into_key_expr()?;
        let prefix = options
            .queryable_prefix
            .as_deref()
            .map(KeyExpr::autocanonize)
            .transpose()?;
        let queryable_key = match &prefix {
            Some(p) => p.join(key_expr.as_str())?,
            None => key_expr.clone(),
        };

        let store = Arc::new(Mutex::new(CacheStore {
            history: options.history.max(1),
            resources_limit: options.resources_limit,
            samples: HashMap::new(),
        }));

        let cache = store.clone();
        let subscriber = self.declare_subscriber(
            &key_expr,
            move |sample: Sample| cache.lock().store(sample),
            SubscriberOptions::default(),
        )?;

        let cache = store.clone();
        let queryable = self.declare_queryable(
            &queryable_key,
            move |query: Query| {
                let hits = cache.lock().matching(prefix.as_ref(), query.key_expr());
                for sample in hits {
                    answer(&query, sample);
                }
            },
            QueryableOptions::default().with_complete(options.queryable_complete),
        )?;

        debug!(
            "[CACHE] {} caching {} (history {}), answering on {}",
            self.inner.zid, key_expr, options.history, queryable_key
        );
        Ok(PublicationCache {
            key_expr,
            store,
            subscriber,
            queryable,
        })
    }
}
