//! Liveliness tokens and subscribers within one session

use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;
use trellis::prelude::*;

fn open() -> Session {
    trellis::dev_tracing::init_tracing();
    trellis::open(Config::default()).unwrap()
}

fn events(sub: &Subscriber<Receiver<Sample>>) -> Vec<(SampleKind, String)> {
    sub.try_iter()
        .map(|s| (s.kind(), s.key_expr().to_string()))
        .collect()
}

#[test]
fn test_token_lifecycle_is_announced() {
    let session = open();
    let sub = session
        .liveliness_declare_subscriber(
            "group/**",
            FifoChannel::default(),
            LivelinessSubscriberOptions::default(),
        )
        .unwrap();

    let t1 = session.declare_liveliness_token("group/a").unwrap();
    let t2 = session.declare_liveliness_token("group/b").unwrap();
    let _other = session.declare_liveliness_token("elsewhere/c").unwrap();
    t1.undeclare().unwrap();
    drop(t2);

    assert_eq!(
        events(&sub),
        vec![
            (SampleKind::Put, "group/a".to_owned()),
            (SampleKind::Put, "group/b".to_owned()),
            (SampleKind::Delete, "group/a".to_owned()),
            (SampleKind::Delete, "group/b".to_owned()),
        ]
    );
}

#[test]
fn test_history_replays_alive_tokens() {
    let session = open();
    let _a = session.declare_liveliness_token("hist/a").unwrap();
    let b = session.declare_liveliness_token("hist/b").unwrap();
    b.undeclare().unwrap();

    let without = session
        .liveliness_declare_subscriber(
            "hist/*",
            FifoChannel::default(),
            LivelinessSubscriberOptions::default(),
        )
        .unwrap();
    let with = session
        .liveliness_declare_subscriber(
            "hist/*",
            FifoChannel::default(),
            LivelinessSubscriberOptions::default().with_history(true),
        )
        .unwrap();

    assert!(events(&without).is_empty());
    assert_eq!(events(&with), vec![(SampleKind::Put, "hist/a".to_owned())]);
}

#[test]
fn test_liveliness_get_lists_alive_tokens() {
    let session = open();
    let _a = session.declare_liveliness_token("lg/a").unwrap();
    let _b = session.declare_liveliness_token("lg/b/c").unwrap();
    let replies = session
        .liveliness_get("lg/*", FifoChannel::default(), LivelinessGetOptions::default())
        .unwrap();
    let keys: Vec<String> = replies
        .iter()
        .filter_map(|r| r.sample().map(|s| s.key_expr().to_string()))
        .collect();
    assert_eq!(keys, vec!["lg/a"]);
}

#[test]
fn test_close_deletes_tokens_and_ends_subscribers() {
    let session = open();
    let sub = session
        .liveliness_declare_subscriber(
            "bye/**",
            FifoChannel::default(),
            LivelinessSubscriberOptions::default(),
        )
        .unwrap();
    let token = session.declare_liveliness_token("bye/x").unwrap();
    session.close().unwrap();

    let got: Vec<_> = sub.iter().map(|s| s.kind()).collect();
    assert_eq!(got, vec![SampleKind::Put, SampleKind::Delete]);
    assert!(sub.recv_timeout(Duration::from_millis(10)).is_none());
    // already gone with the session
    token.undeclare().unwrap();
}

#[test]
fn test_callback_may_declare_tokens() {
    let session = open();
    let inner = session.clone();
    let spawned = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let s = spawned.clone();
    session
        .liveliness_declare_background_subscriber(
            "chain/*",
            move |sample: Sample| {
                if sample.kind() == SampleKind::Put && sample.key_expr().as_str() == "chain/a" {
                    let token = inner.declare_liveliness_token("chain/b").unwrap();
                    s.lock().push(token);
                }
            },
            LivelinessSubscriberOptions::default(),
        )
        .unwrap();
    let _a = session.declare_liveliness_token("chain/a").unwrap();
    assert_eq!(spawned.lock().len(), 1);
    spawned.lock().clear();
    session.close().unwrap();
}

#[test]
fn test_liveliness_disabled() {
    let session = trellis::open(Config::default().with_capabilities(Capabilities {
        queries: true,
        liveliness: false,
    }))
    .unwrap();
    assert!(matches!(
        session.declare_liveliness_token("x"),
        Err(TrellisError::Unsupported("liveliness"))
    ));
    assert!(matches!(
        session.liveliness_declare_subscriber(
            "x",
            FifoChannel::default(),
            LivelinessSubscriberOptions::default()
        ),
        Err(TrellisError::Unsupported(_))
    ));
    assert!(matches!(
        session.liveliness_get("x", FifoChannel::default(), LivelinessGetOptions::default()),
        Err(TrellisError::Unsupported(_))
    ));
}

#[test]
fn test_blocked_liveliness_handler_does_not_stall_declarations() {
    let session = open();
    let slow = session
        .liveliness_declare_subscriber(
            "n/**",
            FifoChannel::new(1),
            LivelinessSubscriberOptions::default(),
        )
        .unwrap();
    let _n1 = session.declare_liveliness_token("n/1").unwrap();

    let declarer = session.clone();
    let blocked = thread::spawn(move || declarer.declare_liveliness_token("n/2").unwrap());
    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished());

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let other = session.clone();
    thread::spawn(move || {
        let sub = other
            .liveliness_declare_subscriber(
                "other/**",
                |_s: Sample| {},
                LivelinessSubscriberOptions::default().with_history(true),
            )
            .unwrap();
        let token = other.declare_liveliness_token("other/x").unwrap();
        done_tx.send((sub, token)).unwrap();
    });
    let unrelated = done_rx.recv_timeout(Duration::from_secs(2));
    assert!(unrelated.is_ok());

    assert_eq!(slow.recv().unwrap().key_expr().as_str(), "n/1");
    let _n2 = blocked.join().unwrap();
    assert_eq!(slow.recv().unwrap().key_expr().as_str(), "n/2");
    drop(slow);
    drop(unrelated);
    session.close().unwrap();
}

#[test]
fn test_history_replay_races_token_churn() {
    let session = open();
    let churner = session.clone();
    let churn = thread::spawn(move || {
        let mut kept = Vec::new();
        for i in 0..200 {
            let token = churner.declare_liveliness_token(format!("race/{i}")).unwrap();
            if i % 2 == 0 {
                kept.push(token);
            } else {
                token.undeclare().unwrap();
            }
        }
        kept
    });
    thread::sleep(Duration::from_millis(1));
    let sub = session
        .liveliness_declare_subscriber(
            "race/*",
            FifoChannel::new(10_000),
            LivelinessSubscriberOptions::default().with_history(true),
        )
        .unwrap();
    let kept = churn.join().unwrap();

    let mut alive = BTreeSet::new();
    for (kind, key) in events(&sub) {
        match kind {
            SampleKind::Put => assert!(alive.insert(key.clone()), "{key} announced twice"),
            SampleKind::Delete => assert!(alive.remove(&key), "{key} deleted while unknown"),
        }
    }
    let expected: BTreeSet<String> = kept.iter().map(|t| t.key_expr().to_string()).collect();
    assert_eq!(alive, expected);
}
