//! Table scenarios: changelog mirroring, tombstones, recovery replay and
//! missing-key policy, all over the in-memory transport.

mod common;

use bytes::Bytes;
use streamworks::table::{Table, TableError, TableSpec};
use streamworks::transport::memory::MemoryTransport;
use streamworks::transport::Transport;

use common::init_tracing;

fn value(v: u64) -> Bytes {
    Bytes::from(serde_json::to_vec(&v).unwrap())
}

fn bind(transport: &MemoryTransport, name: &str) -> Table {
    let producer = transport.create_producer().unwrap();
    Table::bind("app", TableSpec::new(name), producer, "memory://").unwrap()
}

#[tokio::test]
async fn mutations_mirror_onto_the_changelog() {
    init_tracing();
    let transport = MemoryTransport::new();
    let table = bind(&transport, "counts");
    assert_eq!(table.changelog_topic(), "app-counts-changelog");

    table.set(Bytes::from_static(b"x"), value(1)).unwrap();
    table.set(Bytes::from_static(b"y"), value(2)).unwrap();
    assert!(table.del(b"x").unwrap());

    let records = transport.read_to_end("app-counts-changelog").await.unwrap();
    let entries: Vec<(Option<Bytes>, Option<Bytes>)> = records
        .into_iter()
        .map(|record| (record.key, record.value))
        .collect();
    assert_eq!(
        entries,
        vec![
            (Some(Bytes::from_static(b"x")), Some(value(1))),
            (Some(Bytes::from_static(b"y")), Some(value(2))),
            (Some(Bytes::from_static(b"x")), None),
        ]
    );

    let entries: Vec<(Bytes, Bytes)> = table.iter().collect();
    assert_eq!(entries, vec![(Bytes::from_static(b"y"), value(2))]);
}

#[tokio::test]
async fn deleting_an_absent_key_publishes_nothing() {
    init_tracing();
    let transport = MemoryTransport::new();
    let table = bind(&transport, "counts");

    assert!(!table.del(b"ghost").unwrap());
    let records = transport.read_to_end("app-counts-changelog").await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn replay_rebuilds_the_final_map() {
    init_tracing();
    let transport = MemoryTransport::new();
    let table = bind(&transport, "counts");
    table.set(Bytes::from_static(b"x"), value(1)).unwrap();
    table.set(Bytes::from_static(b"y"), value(2)).unwrap();
    table.set(Bytes::from_static(b"x"), value(3)).unwrap();
    table.del(b"y").unwrap();

    // A second binding starts empty and rebuilds purely from the log.
    let rebuilt = bind(&transport, "counts");
    assert!(rebuilt.is_empty());
    let applied = rebuilt.recover(&transport).await.unwrap();
    assert_eq!(applied, 4);
    assert_eq!(rebuilt.len(), 1);
    assert_eq!(rebuilt.get(b"x").unwrap(), value(3));
    assert!(!rebuilt.contains_key(b"y"));
    assert_eq!(rebuilt.snapshot(), vec![(Bytes::from_static(b"x"), value(3))]);
}

#[tokio::test]
async fn recovery_follows_the_log_not_local_memory() {
    init_tracing();
    let transport = MemoryTransport::new();
    let table = bind(&transport, "counts");
    table.set(Bytes::from_static(b"old"), value(9)).unwrap();

    // Another writer tombstones the key directly on the changelog.
    let producer = transport.create_producer().unwrap();
    producer
        .send_and_wait(
            "app-counts-changelog",
            Some(Bytes::from_static(b"old")),
            None,
        )
        .await
        .unwrap();

    let applied = table.recover(&transport).await.unwrap();
    assert_eq!(applied, 2);
    assert!(!table.contains_key(b"old"));
    assert!(table.is_empty());
}

#[tokio::test]
async fn missing_key_without_factory_is_an_error() {
    init_tracing();
    let transport = MemoryTransport::new();
    let table = bind(&transport, "counts");
    assert!(matches!(table.get(b"nope"), Err(TableError::MissingKey)));
}

#[tokio::test]
async fn default_factory_inserts_and_publishes() {
    init_tracing();
    let transport = MemoryTransport::new();
    let producer = transport.create_producer().unwrap();
    let table = Table::bind(
        "app",
        TableSpec::new("counts").default_factory(|| value(0)),
        producer,
        "memory://",
    )
    .unwrap();

    assert_eq!(table.get(b"fresh").unwrap(), value(0));
    assert!(table.contains_key(b"fresh"));

    // The defaulted insert went through the changelog like any write.
    let records = transport.read_to_end("app-counts-changelog").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, Some(Bytes::from_static(b"fresh")));
    assert_eq!(records[0].value, Some(value(0)));

    // Subsequent reads see the stored value, not a new default.
    assert_eq!(table.get(b"fresh").unwrap(), value(0));
    let records = transport.read_to_end("app-counts-changelog").await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn on_done_writes_the_entry_and_forwards_the_value() {
    init_tracing();
    let transport = MemoryTransport::new();
    let table = bind(&transport, "counts");

    let forwarded = table
        .on_done(Bytes::from_static(b"req-1"), value(42))
        .unwrap();
    assert_eq!(forwarded, value(42));
    assert_eq!(table.get(b"req-1").unwrap(), value(42));
}

#[tokio::test]
async fn unknown_store_scheme_fails_at_bind() {
    init_tracing();
    let transport = MemoryTransport::new();
    let producer = transport.create_producer().unwrap();
    let result = Table::bind(
        "app",
        TableSpec::new("counts").store_url("rocksdb:///var/state"),
        producer,
        "memory://",
    );
    assert!(matches!(result, Err(TableError::Store(_))));
}
