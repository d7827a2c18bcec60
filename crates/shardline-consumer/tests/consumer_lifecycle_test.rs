//! Consumer Lifecycle Integration Tests
//!
//! Runs full consumers against the in-memory stream and store:
//! - records from every partition reach the application
//! - acknowledged cursors are flushed on end and resumed on restart
//! - read-only and replay modes
//! - begin() failure paths

use shardline_consumer::{
    CheckpointerOptions, ConsumerError, KvCheckpointer, LeaseManager, Record, Records,
    RetryPolicy, StreamConsumer,
};
use shardline_core::{Fault, MemoryStream, Severity, StreamClient};
use shardline_store::{KvStore, MemoryKvStore};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const WAIT: Duration = Duration::from_secs(5);

fn checkpointer(store: &Arc<MemoryKvStore>, read_only: bool) -> Arc<KvCheckpointer> {
    let options = CheckpointerOptions {
        prefix: "app".to_string(),
        save_period: Duration::from_secs(3600),
        lease_ttl: Duration::from_secs(30),
        read_only,
        ack_buffer: 64,
    };
    Arc::new(KvCheckpointer::new(store.clone() as Arc<dyn KvStore>, options).unwrap())
}

fn fault_log() -> (Arc<Mutex<Vec<Fault>>>, impl Fn(&Fault) + Send + Sync + 'static) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    (log, move |fault: &Fault| sink.lock().unwrap().push(fault.clone()))
}

async fn collect(records: &mut Records, n: usize) -> Vec<Record> {
    let mut out = Vec::new();
    while out.len() < n {
        let record = tokio::time::timeout(WAIT, records.recv())
            .await
            .expect("timed out waiting for records")
            .expect("record stream closed early");
        out.push(record);
    }
    out
}

async fn assert_quiet(records: &mut Records) {
    let extra = tokio::time::timeout(Duration::from_millis(150), records.recv()).await;
    assert!(extra.is_err(), "unexpected extra record: {:?}", extra);
}

fn payloads(records: &[Record]) -> Vec<String> {
    let mut out: Vec<String> = records
        .iter()
        .map(|r| String::from_utf8(r.data.to_vec()).unwrap())
        .collect();
    out.sort();
    out
}

/// Test that records from every partition are delivered and checkpointed
#[tokio::test]
async fn test_consume_and_checkpoint_on_end() {
    let stream = Arc::new(MemoryStream::new());
    stream.create_stream("events", 2);
    let mut last = Vec::new();
    for partition in ["shard-0", "shard-1"] {
        for i in 0..3 {
            let seq = stream
                .put_record("events", partition, format!("{partition}-{i}"))
                .unwrap();
            if i == 2 {
                last.push(seq);
            }
        }
    }

    let store = Arc::new(MemoryKvStore::new());
    let (faults, handler) = fault_log();
    let consumer = StreamConsumer::builder()
        .stream("events")
        .client(stream.clone())
        .checkpointer(checkpointer(&store, false))
        .fault_handler(handler)
        .poll_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    assert_eq!(consumer.begin().await.unwrap(), 2);
    assert_eq!(
        consumer.partitions(),
        vec!["shard-0".to_string(), "shard-1".to_string()]
    );

    let mut records = consumer.records().unwrap();
    let received = collect(&mut records, 6).await;
    for record in &received {
        record.done().await.unwrap();
    }
    assert_eq!(payloads(&received).len(), 6);
    assert_quiet(&mut records).await;

    consumer.end().await.unwrap();

    let saved = store.peek_hash("app:sequence");
    assert_eq!(saved.get("shard-0"), Some(&last[0]));
    assert_eq!(saved.get("shard-1"), Some(&last[1]));
    assert!(records.recv().await.is_none(), "stream should close after end");

    let faults = faults.lock().unwrap();
    let starts = faults
        .iter()
        .filter(|f| f.severity == Severity::Info && f.message.contains("earliest"))
        .count();
    assert_eq!(starts, 2);
    assert!(faults.iter().all(|f| !f.is_fatal()));
}

/// Test that a restarted consumer resumes after the last acknowledged record
#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let stream = Arc::new(MemoryStream::new());
    stream.create_stream("events", 1);
    for i in 0..3 {
        stream.put_record("events", "shard-0", format!("old-{i}")).unwrap();
    }

    let store = Arc::new(MemoryKvStore::new());
    let leases = || {
        Arc::new(LeaseManager::new(
            store.clone() as Arc<dyn KvStore>,
            "app",
            Duration::from_secs(30),
        ))
    };

    let first = StreamConsumer::builder()
        .stream("events")
        .client(stream.clone())
        .checkpointer(checkpointer(&store, false))
        .provisioner(leases())
        .fault_handler(|_: &Fault| {})
        .poll_interval(Duration::from_millis(10))
        .build()
        .unwrap();
    first.begin().await.unwrap();
    let mut records = first.records().unwrap();
    for record in collect(&mut records, 3).await {
        record.done().await.unwrap();
    }
    first.end().await.unwrap();
    assert_eq!(store.peek("app:lock:shard-0"), None, "lease released on end");

    stream.put_record("events", "shard-0", "new-0").unwrap();
    stream.put_record("events", "shard-0", "new-1").unwrap();

    let second = StreamConsumer::builder()
        .stream("events")
        .client(stream.clone())
        .checkpointer(checkpointer(&store, false))
        .provisioner(leases())
        .fault_handler(|_: &Fault| {})
        .poll_interval(Duration::from_millis(10))
        .build()
        .unwrap();
    assert_eq!(second.begin().await.unwrap(), 1);
    let mut records = second.records().unwrap();

    let received = collect(&mut records, 2).await;
    assert_eq!(payloads(&received), vec!["new-0", "new-1"]);
    assert_quiet(&mut records).await;
    second.end().await.unwrap();
}

/// Test that unacknowledged records are redelivered after a restart
#[tokio::test]
async fn test_unacknowledged_records_redelivered() {
    let stream = Arc::new(MemoryStream::new());
    stream.create_stream("events", 1);
    stream.put_record("events", "shard-0", "a").unwrap();
    stream.put_record("events", "shard-0", "b").unwrap();

    let store = Arc::new(MemoryKvStore::new());
    let first = StreamConsumer::builder()
        .stream("events")
        .client(stream.clone())
        .checkpointer(checkpointer(&store, false))
        .fault_handler(|_: &Fault| {})
        .build()
        .unwrap();
    first.begin().await.unwrap();
    let mut records = first.records().unwrap();
    let received = collect(&mut records, 2).await;
    received[0].done().await.unwrap();
    first.end().await.unwrap();

    // checkpointer leases are left to expire
    store.remove("app:lock:shard-0");

    let second = StreamConsumer::builder()
        .stream("events")
        .client(stream.clone())
        .checkpointer(checkpointer(&store, false))
        .fault_handler(|_: &Fault| {})
        .build()
        .unwrap();
    second.begin().await.unwrap();
    let mut records = second.records().unwrap();
    let redelivered = collect(&mut records, 1).await;
    assert_eq!(payloads(&redelivered), vec!["b"]);
    second.end().await.unwrap();
}

/// Test that two consumers sharing a store never read the same partition
#[tokio::test]
async fn test_two_consumers_split_partitions() {
    let stream = Arc::new(MemoryStream::new());
    stream.create_stream("events", 4);
    let store = Arc::new(MemoryKvStore::new());

    let build = || {
        StreamConsumer::builder()
            .stream("events")
            .client(stream.clone() as Arc<dyn StreamClient>)
            .checkpointer(checkpointer(&store, false))
            .fault_handler(|_: &Fault| {})
            .build()
            .unwrap()
    };
    let a = build();
    let b = build();

    let (na, nb) = tokio::join!(a.begin(), b.begin());
    assert_eq!(na.unwrap() + nb.unwrap(), 4);

    let mut all = a.partitions();
    all.extend(b.partitions());
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 4);

    a.end().await.unwrap();
    b.end().await.unwrap();
}

/// Test that a read-only consumer starts from checkpoints and writes nothing
#[tokio::test]
async fn test_read_only_tail() {
    let stream = Arc::new(MemoryStream::new());
    stream.create_stream("events", 1);
    let seen = stream.put_record("events", "shard-0", "seen").unwrap();
    stream.put_record("events", "shard-0", "fresh").unwrap();

    let store = Arc::new(MemoryKvStore::new());
    let mut heads = std::collections::HashMap::new();
    heads.insert("shard-0".to_string(), seen);
    store.hmset("app:sequence", &heads).await.unwrap();
    store.insert("app:lock:shard-0", "fleet-worker");
    store.clear_commands();

    let consumer = StreamConsumer::builder()
        .stream("events")
        .client(stream.clone())
        .checkpointer(checkpointer(&store, true))
        .fault_handler(|_: &Fault| {})
        .build()
        .unwrap();
    assert_eq!(consumer.begin().await.unwrap(), 1);

    let mut records = consumer.records().unwrap();
    let received = collect(&mut records, 1).await;
    assert_eq!(payloads(&received), vec!["fresh"]);
    received[0].done().await.unwrap();
    consumer.end().await.unwrap();

    assert_eq!(store.commands(), vec!["HGETALL".to_string()]);
    assert_eq!(
        store.peek("app:lock:shard-0").as_deref(),
        Some("fleet-worker")
    );
}

/// Test that replay starts partitions without a checkpoint inside the window
#[tokio::test]
async fn test_replay_window() {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let stream = Arc::new(MemoryStream::new());
    stream.create_stream("events", 1);
    stream
        .put_record_at("events", "shard-0", "two-hours-ago", now_ms - 2 * 3_600_000)
        .unwrap();
    stream
        .put_record_at("events", "shard-0", "one-minute-ago", now_ms - 60_000)
        .unwrap();

    let consumer = StreamConsumer::builder()
        .stream("events")
        .client(stream.clone())
        .replay(Duration::from_secs(3600))
        .fault_handler(|_: &Fault| {})
        .build()
        .unwrap();
    consumer.begin().await.unwrap();

    let mut records = consumer.records().unwrap();
    let received = collect(&mut records, 1).await;
    assert_eq!(payloads(&received), vec!["one-minute-ago"]);
    assert!(!received[0].is_ackable());
    assert_quiet(&mut records).await;
    consumer.end().await.unwrap();
}

/// Test begin() failure paths
#[tokio::test]
async fn test_begin_fails_for_unknown_stream() {
    let stream = Arc::new(MemoryStream::new());
    let consumer = StreamConsumer::new("missing", stream).unwrap();

    match consumer.begin().await {
        Err(ConsumerError::Discovery { stream, .. }) => assert_eq!(stream, "missing"),
        other => panic!("expected Discovery, got {:?}", other),
    }
}

#[tokio::test]
async fn test_begin_fails_when_checkpoints_unreadable() {
    let stream = Arc::new(MemoryStream::new());
    stream.create_stream("events", 1);
    let store = Arc::new(MemoryKvStore::new());
    store.fail_next(1);

    let consumer = StreamConsumer::builder()
        .stream("events")
        .client(stream)
        .checkpointer(checkpointer(&store, false))
        .build()
        .unwrap();

    assert!(matches!(
        consumer.begin().await,
        Err(ConsumerError::CheckpointLoad(_))
    ));
}

#[tokio::test]
async fn test_begin_fails_without_iterator_and_releases_leases() {
    let stream = Arc::new(MemoryStream::new());
    stream.create_stream("events", 2);
    stream.fail_next_iterators(100);
    let store = Arc::new(MemoryKvStore::new());

    let consumer = StreamConsumer::builder()
        .stream("events")
        .client(stream)
        .checkpointer(checkpointer(&store, false))
        .iterator_retry(RetryPolicy::no_retry())
        .fault_handler(|_: &Fault| {})
        .build()
        .unwrap();

    match consumer.begin().await {
        Err(ConsumerError::IteratorUnavailable { partition, .. }) => {
            assert_eq!(partition, "shard-0")
        }
        other => panic!("expected IteratorUnavailable, got {:?}", other),
    }
    assert_eq!(store.peek("app:lock:shard-0"), None);
    assert!(!consumer.is_started().await);
}

#[tokio::test]
async fn test_begin_twice_and_after_end() {
    let stream = Arc::new(MemoryStream::new());
    stream.create_stream("events", 1);
    let consumer = StreamConsumer::builder()
        .stream("events")
        .client(stream)
        .fault_handler(|_: &Fault| {})
        .build()
        .unwrap();

    consumer.begin().await.unwrap();
    assert!(consumer.is_started().await);
    assert!(matches!(
        consumer.begin().await,
        Err(ConsumerError::AlreadyStarted)
    ));

    consumer.end().await.unwrap();
    assert!(matches!(consumer.begin().await, Err(ConsumerError::Stopped)));
    consumer.end().await.unwrap();
}

/// Test that end() returns promptly even when nobody reads the stream
#[tokio::test]
async fn test_end_with_undrained_records() {
    let stream = Arc::new(MemoryStream::new());
    stream.create_stream("events", 2);
    for i in 0..50 {
        stream.put_record("events", "shard-0", format!("r{i}")).unwrap();
        stream.put_record("events", "shard-1", format!("r{i}")).unwrap();
    }

    let consumer = StreamConsumer::builder()
        .stream("events")
        .client(stream)
        .output_buffer(2)
        .fault_handler(|_: &Fault| {})
        .build()
        .unwrap();
    consumer.begin().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(WAIT, consumer.end())
        .await
        .expect("end() should not wait for a reader")
        .unwrap();
}
