//! Query/reply within one session

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use trellis::prelude::*;

fn open() -> Session {
    trellis::dev_tracing::init_tracing();
    trellis::open(Config::default()).unwrap()
}

fn payloads(replies: &Receiver<Reply>) -> Vec<String> {
    replies
        .iter()
        .filter_map(|r| r.sample().map(|s| String::from_utf8_lossy(s.payload()).into_owned()))
        .collect()
}

fn replying(
    key: &'static str,
    payload: &'static str,
    ts: Option<Timestamp>,
) -> impl Fn(Query) + Send + Sync + 'static {
    move |q: Query| {
        let mut opts = ReplyOptions::default();
        opts.timestamp = ts;
        q.reply(key, payload, opts).unwrap();
    }
}

#[test]
fn test_get_without_queryables_completes_empty() {
    let session = open();
    let replies = session
        .get("nobody/home", "", FifoChannel::default(), GetOptions::default())
        .unwrap();
    assert!(replies.recv_timeout(Duration::from_secs(1)).is_none());
    assert!(replies.is_closed());
}

#[test]
fn test_consolidation_none_keeps_every_reply() {
    let session = open();
    let _q1 = session
        .declare_queryable("q/*", replying("q/a", "one", None), QueryableOptions::default())
        .unwrap();
    let _q2 = session
        .declare_queryable("q/a", replying("q/a", "two", None), QueryableOptions::default())
        .unwrap();
    let replies = session
        .get(
            "q/a",
            "",
            FifoChannel::default(),
            GetOptions::default()
                .with_target(QueryTarget::All)
                .with_consolidation(ConsolidationMode::None),
        )
        .unwrap();
    assert_eq!(payloads(&replies), vec!["one", "two"]);
}

#[test]
fn test_latest_keeps_newest_per_key() {
    let session = open();
    let older = session.new_timestamp();
    let newer = session.new_timestamp();
    let _q1 = session
        .declare_queryable("l/*", replying("l/a", "new", Some(newer)), QueryableOptions::default())
        .unwrap();
    let _q2 = session
        .declare_queryable("l/a", replying("l/a", "old", Some(older)), QueryableOptions::default())
        .unwrap();
    for mode in [ConsolidationMode::Latest, ConsolidationMode::Auto] {
        let replies = session
            .get(
                "l/a",
                "",
                FifoChannel::default(),
                GetOptions::default()
                    .with_target(QueryTarget::All)
                    .with_consolidation(mode),
            )
            .unwrap();
        assert_eq!(payloads(&replies), vec!["new"], "{mode:?}");
    }
}

#[test]
fn test_auto_with_time_range_is_none() {
    let session = open();
    let older = session.new_timestamp();
    let newer = session.new_timestamp();
    let _q1 = session
        .declare_queryable("t/a", replying("t/a", "new", Some(newer)), QueryableOptions::default())
        .unwrap();
    let _q2 = session
        .declare_queryable("t/*", replying("t/a", "old", Some(older)), QueryableOptions::default())
        .unwrap();
    let replies = session
        .get(
            "t/a",
            "_time=[now(-1h)..]",
            FifoChannel::default(),
            GetOptions::default().with_target(QueryTarget::All),
        )
        .unwrap();
    assert_eq!(payloads(&replies), vec!["new", "old"]);
}

#[test]
fn test_monotonic_drops_older_replies() {
    let session = open();
    let older = session.new_timestamp();
    let newer = session.new_timestamp();
    let _q1 = session
        .declare_queryable("m/a", replying("m/a", "new", Some(newer)), QueryableOptions::default())
        .unwrap();
    let _q2 = session
        .declare_queryable("m/*", replying("m/a", "old", Some(older)), QueryableOptions::default())
        .unwrap();
    let replies = session
        .get(
            "m/a",
            "",
            FifoChannel::default(),
            GetOptions::default()
                .with_target(QueryTarget::All)
                .with_consolidation(ConsolidationMode::Monotonic),
        )
        .unwrap();
    assert_eq!(payloads(&replies), vec!["new"]);
}

#[test]
fn test_held_query_times_out() {
    let session = open();
    let held: Arc<Mutex<Vec<Query>>> = Arc::default();
    let h = held.clone();
    let _q = session
        .declare_queryable(
            "slow/k",
            move |q: Query| h.lock().push(q),
            QueryableOptions::default(),
        )
        .unwrap();

    let started = Instant::now();
    let replies = session
        .get(
            "slow/k",
            "",
            FifoChannel::default(),
            GetOptions::default().with_timeout_ms(100u64),
        )
        .unwrap();
    let reply = replies.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reply.error().unwrap().kind, ReplyErrorKind::Timeout);
    assert!(replies.recv_timeout(Duration::from_secs(1)).is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));

    // replies after the deadline go nowhere
    let late = held.lock().pop().unwrap();
    late.reply("slow/k", "late", ReplyOptions::default()).unwrap();
}

#[test]
fn test_reply_from_another_thread() {
    let session = open();
    let _q = session
        .declare_queryable(
            "async/k",
            |q: Query| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(50));
                    q.reply("async/k", "later", ReplyOptions::default()).unwrap();
                });
            },
            QueryableOptions::default(),
        )
        .unwrap();
    let replies = session
        .get("async/k", "", FifoChannel::default(), GetOptions::default())
        .unwrap();
    assert_eq!(payloads(&replies), vec!["later"]);
}

#[test]
fn test_reply_outside_query_is_rejected() {
    let session = open();
    let outcome: Arc<Mutex<Vec<bool>>> = Arc::default();
    let o = outcome.clone();
    let _q = session
        .declare_queryable(
            "out/**",
            move |q: Query| {
                let res = q.reply("elsewhere/k", "x", ReplyOptions::default());
                o.lock().push(matches!(
                    res,
                    Err(TrellisError::KeyExpr(KeyExprError::ReplyOutsideQuery { .. }))
                ));
            },
            QueryableOptions::default(),
        )
        .unwrap();

    let replies = session
        .get("out/k", "", FifoChannel::default(), GetOptions::default())
        .unwrap();
    assert!(payloads(&replies).is_empty());

    let replies = session
        .get(
            "out/k",
            "",
            FifoChannel::default(),
            GetOptions::default().with_accept_replies(ReplyKeyExpr::Any),
        )
        .unwrap();
    assert_eq!(payloads(&replies), vec!["x"]);
    assert_eq!(*outcome.lock(), vec![true, false]);
}

#[test]
fn test_reply_err_and_reply_del() {
    let session = open();
    let _q = session
        .declare_queryable(
            "mixed/k",
            |q: Query| {
                q.reply_err("broken", ReplyErrOptions::default()).unwrap();
                q.reply_del("mixed/k", ReplyDelOptions::default()).unwrap();
            },
            QueryableOptions::default(),
        )
        .unwrap();
    let replies = session
        .get(
            "mixed/k",
            "",
            FifoChannel::default(),
            GetOptions::default().with_consolidation(ConsolidationMode::None),
        )
        .unwrap();
    let got: Vec<Reply> = replies.iter().collect();
    assert_eq!(got.len(), 2);
    let err = got[0].error().unwrap();
    assert_eq!(err.kind, ReplyErrorKind::Replier);
    assert_eq!(err.payload.as_ref(), b"broken");
    assert_eq!(got[0].replier_id.unwrap().zid, session.zid());
    assert_eq!(got[1].sample().unwrap().kind(), SampleKind::Delete);
}

#[test]
fn test_query_carries_parameters_and_payload() {
    let session = open();
    let seen: Arc<Mutex<Option<(String, String, Option<Bytes>)>>> = Arc::default();
    let s = seen.clone();
    let _q = session
        .declare_queryable(
            "params/**",
            move |q: Query| {
                *s.lock() = Some((
                    q.selector(),
                    q.parameters().get("page").unwrap_or_default().to_owned(),
                    q.payload().cloned(),
                ));
            },
            QueryableOptions::default(),
        )
        .unwrap();
    let replies = session
        .get(
            "params/a",
            "page=3;sort=asc",
            FifoChannel::default(),
            GetOptions::default().with_payload(Bytes::from_static(b"body")),
        )
        .unwrap();
    assert!(replies.recv().is_none());
    let (selector, page, payload) = seen.lock().take().unwrap();
    assert_eq!(selector, "params/a?page=3;sort=asc");
    assert_eq!(page, "3");
    assert_eq!(payload.as_deref(), Some(&b"body"[..]));
}

fn counting(
    session: &Session,
    key: &str,
    complete: bool,
) -> (Queryable<()>, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let q = session
        .declare_queryable(
            key,
            move |_q: Query| {
                h.fetch_add(1, Ordering::SeqCst);
            },
            QueryableOptions::default().with_complete(complete),
        )
        .unwrap();
    (q, hits)
}

#[test]
fn test_query_targets() {
    let session = open();
    let (_partial, partial) = counting(&session, "tg/*", false);
    let (_wide, wide) = counting(&session, "tg/**", true);
    let (_exact, exact) = counting(&session, "tg/a", true);
    let hits = || {
        [
            partial.swap(0, Ordering::SeqCst),
            wide.swap(0, Ordering::SeqCst),
            exact.swap(0, Ordering::SeqCst),
        ]
    };

    let run = |target| {
        let replies = session
            .get("tg/a", "", FifoChannel::default(), GetOptions::default().with_target(target))
            .unwrap();
        assert!(replies.recv().is_none());
    };

    // lowest-id complete queryable including the key
    run(QueryTarget::BestMatching);
    assert_eq!(hits(), [0, 1, 0]);
    run(QueryTarget::AllComplete);
    assert_eq!(hits(), [0, 1, 1]);
    run(QueryTarget::All);
    assert_eq!(hits(), [1, 1, 1]);
}

#[test]
fn test_best_matching_without_complete_behaves_as_all() {
    let session = open();
    let (_a, a) = counting(&session, "bm/*", false);
    let (_b, b) = counting(&session, "bm/x", false);
    let replies = session
        .get("bm/x", "", FifoChannel::default(), GetOptions::default())
        .unwrap();
    assert!(replies.recv().is_none());
    assert_eq!(a.load(Ordering::SeqCst), 1);
    assert_eq!(b.load(Ordering::SeqCst), 1);
}

#[test]
fn test_local_only_queryable_and_destination() {
    let session = open();
    let (_q, hits) = counting(&session, "dst/k", false);
    let replies = session
        .get(
            "dst/k",
            "",
            FifoChannel::default(),
            GetOptions::default().with_allowed_destination(Locality::Remote),
        )
        .unwrap();
    assert!(replies.recv().is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_undeclared_queryable_gets_nothing() {
    let session = open();
    let (q, hits) = counting(&session, "gone/k", false);
    q.undeclare().unwrap();
    let replies = session
        .get("gone/k", "", FifoChannel::default(), GetOptions::default())
        .unwrap();
    assert!(replies.recv().is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

fn unconsolidated() -> GetOptions {
    GetOptions::default()
        .with_target(QueryTarget::All)
        .with_consolidation(ConsolidationMode::None)
}

#[test]
fn test_wildcard_get_reaches_each_queryable_once() {
    let session = open();
    let _b = session
        .declare_queryable("wq/b", replying("wq/b", "b", None), QueryableOptions::default())
        .unwrap();
    let _c = session
        .declare_queryable("wq/c", replying("wq/c", "c", None), QueryableOptions::default())
        .unwrap();
    let replies = session
        .get("wq/*", "", FifoChannel::default(), unconsolidated())
        .unwrap();
    let mut got = payloads(&replies);
    got.sort();
    assert_eq!(got, vec!["b", "c"]);
}

#[test]
fn test_ring_reply_channel_keeps_newest() {
    let session = open();
    let _q = session
        .declare_queryable(
            "ringq/*",
            |q: Query| {
                for i in 0..5 {
                    q.reply(format!("ringq/{i}"), i.to_string(), ReplyOptions::default())
                        .unwrap();
                }
            },
            QueryableOptions::default(),
        )
        .unwrap();
    let replies = session
        .get("ringq/*", "", RingChannel::new(2), unconsolidated())
        .unwrap();
    assert_eq!(payloads(&replies), vec!["3", "4"]);
}

#[test]
fn test_full_fifo_reply_channel_blocks_replier() {
    let session = open();
    let queries = session
        .declare_queryable("fifoq/k", FifoChannel::default(), QueryableOptions::default())
        .unwrap();
    let replies = session
        .get("fifoq/k", "", FifoChannel::new(1), unconsolidated())
        .unwrap();
    let query = queries.recv_timeout(Duration::from_secs(1)).unwrap();

    let sent = Arc::new(AtomicUsize::new(0));
    let s = sent.clone();
    let responder = thread::spawn(move || {
        for v in ["1", "2", "3"] {
            query.reply("fifoq/k", v, ReplyOptions::default()).unwrap();
            s.fetch_add(1, Ordering::SeqCst);
        }
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while sent.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sent.load(Ordering::SeqCst), 1);

    assert_eq!(payloads(&replies), vec!["1", "2", "3"]);
    responder.join().unwrap();
    assert_eq!(sent.load(Ordering::SeqCst), 3);
}

#[test]
fn test_close_releases_blocked_reply() {
    let session = open();
    let queries = session
        .declare_queryable("fifoq/close", FifoChannel::default(), QueryableOptions::default())
        .unwrap();
    let replies = session
        .get("fifoq/close", "", FifoChannel::new(1), unconsolidated())
        .unwrap();
    let query = queries.recv_timeout(Duration::from_secs(1)).unwrap();
    let responder = thread::spawn(move || {
        query.reply("fifoq/close", "1", ReplyOptions::default()).unwrap();
        let _ = query.reply("fifoq/close", "2", ReplyOptions::default());
    });
    thread::sleep(Duration::from_millis(50));

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let closer = session.clone();
    thread::spawn(move || {
        closer.close().unwrap();
        done_tx.send(()).unwrap();
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok());
    responder.join().unwrap();
    assert_eq!(payloads(&replies), vec!["1"]);
}
