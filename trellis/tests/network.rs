//! Two or more sessions linked over the in-process fabric

use std::sync::Arc;
use std::time::{Duration, Instant};
use trellis::prelude::*;

const PATIENCE: Duration = Duration::from_secs(5);

fn pair(name: &str) -> (Session, Session) {
    trellis::dev_tracing::init_tracing();
    let endpoint = format!("inproc/{name}");
    let a = trellis::open(Config::default().with_listen(endpoint.clone())).unwrap();
    let b = trellis::open(Config::default().with_connect(endpoint)).unwrap();
    (a, b)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Keep querying until `key` answers with at least one sample.
fn first_answer(session: &Session, key: &str) -> Vec<Reply> {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        let replies: Vec<Reply> = session
            .get(key, "", FifoChannel::default(), GetOptions::default())
            .unwrap()
            .iter()
            .collect();
        if !replies.is_empty() {
            return replies;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Vec::new()
}

#[test]
fn test_put_reaches_remote_subscriber() {
    let (a, b) = pair("net-put");
    let sub = a
        .declare_subscriber("net/put/**", FifoChannel::default(), SubscriberOptions::default())
        .unwrap();
    let publisher = b
        .declare_publisher("net/put/x", PublisherOptions::default())
        .unwrap();
    assert!(wait_until(|| publisher.matching_status()));

    let ts = b.new_timestamp();
    publisher
        .put(
            "hello",
            PublisherPutOptions::default()
                .with_timestamp(ts)
                .with_attachment(Bytes::from_static(b"meta")),
        )
        .unwrap();
    b.put(
        "net/put/y",
        "local only",
        PutOptions::default().with_allowed_destination(Locality::SessionLocal),
    )
    .unwrap();
    b.delete_resource("net/put/y", DeleteOptions::default()).unwrap();

    let first = sub.recv_timeout(PATIENCE).unwrap();
    assert_eq!(first.key_expr().as_str(), "net/put/x");
    assert_eq!(first.payload().as_ref(), b"hello");
    assert_eq!(first.timestamp, Some(ts));
    assert_eq!(first.attachment.as_deref(), Some(&b"meta"[..]));

    // the SessionLocal put never left b
    let second = sub.recv_timeout(PATIENCE).unwrap();
    assert_eq!(second.key_expr().as_str(), "net/put/y");
    assert_eq!(second.kind(), SampleKind::Delete);

    // a's clock moved past the remote stamp
    assert!(a.new_timestamp() > ts);
}

#[test]
fn test_declared_keyexpr_travels_by_id() {
    let (a, b) = pair("net-resource");
    let sub = a
        .declare_subscriber("net/res/*", FifoChannel::default(), SubscriberOptions::default())
        .unwrap();
    let resource = b.declare_keyexpr("net/res/a").unwrap();
    let publisher = b.declare_publisher(&resource, PublisherOptions::default()).unwrap();
    assert!(wait_until(|| publisher.matching_status()));

    b.put(&resource, "by id", PutOptions::default()).unwrap();
    let sample = sub.recv_timeout(PATIENCE).unwrap();
    assert_eq!(sample.key_expr().as_str(), "net/res/a");
    assert_eq!(sample.payload().as_ref(), b"by id");
}

#[test]
fn test_origin_filter_skips_remote_samples() {
    let (a, b) = pair("net-origin");
    let local_only = a
        .declare_subscriber(
            "net/origin",
            FifoChannel::default(),
            SubscriberOptions::default().with_allowed_origin(Locality::SessionLocal),
        )
        .unwrap();
    let any = a
        .declare_subscriber("net/origin", FifoChannel::default(), SubscriberOptions::default())
        .unwrap();
    let publisher = b.declare_publisher("net/origin", PublisherOptions::default()).unwrap();
    assert!(wait_until(|| publisher.matching_status()));

    publisher.put("remote", PublisherPutOptions::default()).unwrap();
    assert_eq!(any.recv_timeout(PATIENCE).unwrap().payload().as_ref(), b"remote");
    a.put("net/origin", "local", PutOptions::default()).unwrap();
    assert_eq!(local_only.try_recv().unwrap().payload().as_ref(), b"local");
    assert!(local_only.try_recv().is_none());
}

#[test]
fn test_get_reaches_remote_queryable() {
    let (a, b) = pair("net-get");
    let _q = a
        .declare_queryable(
            "net/get/**",
            |q: Query| {
                let key = format!("{}", q.key_expr());
                let body = format!("answer to {}", q.selector());
                q.reply(key.as_str(), body, ReplyOptions::default()).unwrap();
            },
            QueryableOptions::default().with_complete(true),
        )
        .unwrap();

    let replies = first_answer(&b, "net/get/x");
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.replier_id.map(|id| id.zid), Some(a.zid()));
    let sample = reply.sample().unwrap();
    assert_eq!(sample.key_expr().as_str(), "net/get/x");
    assert_eq!(sample.payload().as_ref(), b"answer to net/get/x");

    let with_params: Vec<Reply> = b
        .get(
            "net/get/y",
            "k=v",
            FifoChannel::default(),
            GetOptions::default().with_target(QueryTarget::BestMatching),
        )
        .unwrap()
        .iter()
        .collect();
    assert_eq!(
        with_params[0].sample().unwrap().payload().as_ref(),
        b"answer to net/get/y?k=v"
    );
}

#[test]
fn test_get_merges_local_and_remote_replies() {
    let (a, b) = pair("net-merge");
    let _remote = a
        .declare_queryable(
            "net/merge/*",
            |q: Query| {
                q.reply("net/merge/remote", "r", ReplyOptions::default()).unwrap();
            },
            QueryableOptions::default(),
        )
        .unwrap();
    let _local = b
        .declare_queryable(
            "net/merge/*",
            |q: Query| {
                q.reply("net/merge/local", "l", ReplyOptions::default()).unwrap();
            },
            QueryableOptions::default(),
        )
        .unwrap();

    let deadline = Instant::now() + PATIENCE;
    let mut keys = Vec::new();
    while Instant::now() < deadline {
        keys = b
            .get(
                "net/merge/*",
                "",
                FifoChannel::default(),
                GetOptions::default()
                    .with_target(QueryTarget::All)
                    .with_consolidation(ConsolidationMode::None),
            )
            .unwrap()
            .iter()
            .filter_map(|r| r.sample().map(|s| s.key_expr().to_string()))
            .collect::<Vec<_>>();
        if keys.len() == 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    keys.sort();
    assert_eq!(keys, vec!["net/merge/local", "net/merge/remote"]);
}

#[test]
fn test_lost_peer_fails_its_part_of_a_query() {
    let (a, b) = pair("net-lost");
    let held = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let h = held.clone();
    let _hold = a
        .declare_queryable("net/lost/hold", move |q: Query| h.lock().push(q), QueryableOptions::default())
        .unwrap();
    let _ping = a
        .declare_queryable(
            "net/lost/ping",
            |q: Query| {
                q.reply("net/lost/ping", "up", ReplyOptions::default()).unwrap();
            },
            QueryableOptions::default(),
        )
        .unwrap();
    // declarations arrive in order: once the ping answers, b knows both
    assert_eq!(first_answer(&b, "net/lost/ping").len(), 1);

    let replies = b
        .get("net/lost/hold", "", FifoChannel::default(), GetOptions::default())
        .unwrap();
    assert!(wait_until(|| held.lock().len() == 1));

    a.close().unwrap();
    let got: Vec<Reply> = replies.iter().collect();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].error().unwrap().kind, ReplyErrorKind::Transport);
    held.lock().clear();
    assert!(wait_until(|| b.get_peers_zid().is_empty()));
}

#[test]
fn test_remote_liveliness() {
    let (a, b) = pair("net-alive");
    let token = a.declare_liveliness_token("net/alive/a").unwrap();
    let sub = b
        .liveliness_declare_subscriber(
            "net/alive/**",
            FifoChannel::default(),
            LivelinessSubscriberOptions::default().with_history(true),
        )
        .unwrap();

    let up = sub.recv_timeout(PATIENCE).unwrap();
    assert_eq!(up.kind(), SampleKind::Put);
    assert_eq!(up.key_expr().as_str(), "net/alive/a");

    let alive: Vec<String> = b
        .liveliness_get("net/alive/**", FifoChannel::default(), LivelinessGetOptions::default())
        .unwrap()
        .iter()
        .filter_map(|r| r.sample().map(|s| s.key_expr().to_string()))
        .collect();
    assert_eq!(alive, vec!["net/alive/a"]);

    token.undeclare().unwrap();
    let down = sub.recv_timeout(PATIENCE).unwrap();
    assert_eq!(down.kind(), SampleKind::Delete);

    let again = a.declare_liveliness_token("net/alive/b").unwrap();
    assert_eq!(sub.recv_timeout(PATIENCE).unwrap().kind(), SampleKind::Put);
    // losing the session takes its tokens with it
    a.close().unwrap();
    let gone = sub.recv_timeout(PATIENCE).unwrap();
    assert_eq!(gone.kind(), SampleKind::Delete);
    assert_eq!(gone.key_expr().as_str(), "net/alive/b");
    assert!(sub.recv_timeout(Duration::from_millis(50)).is_none());
    drop(again);
}

#[test]
fn test_connector_sees_listener_declarations() {
    trellis::dev_tracing::init_tracing();
    for i in 0..50 {
        let endpoint = format!("inproc/net-sync-{i}");
        let a = trellis::open(Config::default().with_listen(endpoint.clone())).unwrap();
        let _sub = a
            .declare_subscriber("net/sync/**", FifoChannel::default(), SubscriberOptions::default())
            .unwrap();
        let b = trellis::open(Config::default().with_connect(endpoint)).unwrap();
        let publisher = b
            .declare_publisher("net/sync/x", PublisherOptions::default())
            .unwrap();
        assert!(wait_until(|| publisher.matching_status()), "iteration {i}");
        b.close().unwrap();
        a.close().unwrap();
    }
}
