//! Publication caches answering late joiners

use std::time::{Duration, Instant};
use trellis::prelude::*;

fn payloads(replies: &Receiver<Reply>) -> Vec<String> {
    replies
        .iter()
        .filter_map(|r| {
            r.sample()
                .map(|s| String::from_utf8_lossy(s.payload()).into_owned())
        })
        .collect()
}

#[test]
fn test_cache_serves_history() {
    trellis::dev_tracing::init_tracing();
    let session = trellis::open(Config::default()).unwrap();
    let cache = session
        .declare_publication_cache("pc/a", PublicationCacheOptions::default().with_history(2usize))
        .unwrap();
    for v in ["1", "2", "3"] {
        session.put("pc/a", v, PutOptions::default()).unwrap();
    }
    assert_eq!(cache.len(), 2);

    let all = session
        .get(
            "pc/a",
            "",
            FifoChannel::default(),
            GetOptions::default().with_consolidation(ConsolidationMode::None),
        )
        .unwrap();
    assert_eq!(payloads(&all), vec!["2", "3"]);

    let latest = session
        .get("pc/a", "", FifoChannel::default(), GetOptions::default())
        .unwrap();
    assert_eq!(payloads(&latest), vec!["3"]);
}

#[test]
fn test_cache_keeps_deletes() {
    let session = trellis::open(Config::default()).unwrap();
    let _cache = session
        .declare_publication_cache("pc/del/*", PublicationCacheOptions::default())
        .unwrap();
    session.put("pc/del/x", "v", PutOptions::default()).unwrap();
    session.delete_resource("pc/del/x", DeleteOptions::default()).unwrap();

    let replies: Vec<Reply> = session
        .get("pc/del/x", "", FifoChannel::default(), GetOptions::default())
        .unwrap()
        .iter()
        .collect();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].sample().unwrap().kind(), SampleKind::Delete);
}

#[test]
fn test_prefixed_cache_needs_any_replies() {
    let session = trellis::open(Config::default()).unwrap();
    let cache = session
        .declare_publication_cache(
            "pc/pre/*",
            PublicationCacheOptions::default().with_queryable_prefix("store".to_owned()),
        )
        .unwrap();
    assert_eq!(cache.queryable_key_expr().as_str(), "store/pc/pre/*");
    session.put("pc/pre/a", "cached", PutOptions::default()).unwrap();

    let strict = session
        .get("store/pc/pre/a", "", FifoChannel::default(), GetOptions::default())
        .unwrap();
    assert!(payloads(&strict).is_empty());

    let any = session
        .get(
            "store/pc/pre/a",
            "",
            FifoChannel::default(),
            GetOptions::default().with_accept_replies(ReplyKeyExpr::Any),
        )
        .unwrap();
    assert_eq!(payloads(&any), vec!["cached"]);
}

#[test]
fn test_cache_undeclare_stops_answers() {
    let session = trellis::open(Config::default()).unwrap();
    let cache = session
        .declare_publication_cache("pc/gone", PublicationCacheOptions::default())
        .unwrap();
    session.put("pc/gone", "v", PutOptions::default()).unwrap();
    assert!(!cache.is_empty());
    cache.undeclare().unwrap();

    let replies = session
        .get("pc/gone", "", FifoChannel::default(), GetOptions::default())
        .unwrap();
    assert!(payloads(&replies).is_empty());
}

#[test]
fn test_remote_late_joiner_reads_cache() {
    let publisher_side =
        trellis::open(Config::default().with_listen("inproc/pc-remote")).unwrap();
    let _cache = publisher_side
        .declare_publication_cache("pc/remote/*", PublicationCacheOptions::default().with_history(3usize))
        .unwrap();
    for i in 0..3 {
        publisher_side
            .put(format!("pc/remote/{i}").as_str(), i.to_string(), PutOptions::default())
            .unwrap();
    }

    let joiner = trellis::open(Config::default().with_connect("inproc/pc-remote")).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut got = Vec::new();
    while Instant::now() < deadline && got.len() < 3 {
        let replies = joiner
            .get("pc/remote/*", "", FifoChannel::default(), GetOptions::default())
            .unwrap();
        got = payloads(&replies);
        std::thread::sleep(Duration::from_millis(5));
    }
    got.sort();
    assert_eq!(got, vec!["0", "1", "2"]);
}
