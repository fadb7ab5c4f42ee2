//! Typed node helpers over the in-memory store.

use corral_coord::{
    create_node, get_node, get_node_w, set_node, CoordError, EventKind, MemoryConnection, Node,
    Version,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    value: u32,

    #[serde(skip)]
    version: Option<Version>,
}

impl Counter {
    fn new(value: u32) -> Self {
        Self {
            value,
            version: None,
        }
    }
}

impl Node for Counter {
    fn version(&self) -> Option<Version> {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = Some(version);
    }
}

#[tokio::test]
async fn test_create_stamps_version() {
    let conn = MemoryConnection::new();
    let mut counter = Counter::new(1);

    create_node(&conn, "/counters/a", &mut counter).await.unwrap();
    assert_eq!(counter.version, Some(Version::INITIAL));

    let read: Counter = get_node(&conn, "/counters/a").await.unwrap();
    assert_eq!(read.value, 1);
    assert_eq!(read.version, Some(Version::INITIAL));
}

#[tokio::test]
async fn test_stale_write_is_rejected() {
    let conn = MemoryConnection::new();
    create_node(&conn, "/counters/a", &mut Counter::new(0))
        .await
        .unwrap();

    let mut first: Counter = get_node(&conn, "/counters/a").await.unwrap();
    let mut second: Counter = get_node(&conn, "/counters/a").await.unwrap();

    first.value = 10;
    set_node(&conn, "/counters/a", &mut first).await.unwrap();
    assert_eq!(first.version, Some(Version::INITIAL.next()));

    second.value = 20;
    let err = set_node(&conn, "/counters/a", &mut second)
        .await
        .unwrap_err();
    assert!(err.is_version_conflict());

    let stored: Counter = get_node(&conn, "/counters/a").await.unwrap();
    assert_eq!(stored.value, 10);

    // A written record carries its new version and can be written again.
    first.value = 11;
    set_node(&conn, "/counters/a", &mut first).await.unwrap();
}

#[tokio::test]
async fn test_unread_record_cannot_be_written() {
    let conn = MemoryConnection::new();
    create_node(&conn, "/counters/a", &mut Counter::new(0))
        .await
        .unwrap();

    let err = set_node(&conn, "/counters/a", &mut Counter::new(5))
        .await
        .unwrap_err();
    assert_eq!(err, CoordError::Unversioned("/counters/a".to_string()));
}

#[tokio::test]
async fn test_watched_read_sees_write() {
    let conn = MemoryConnection::new();
    create_node(&conn, "/counters/a", &mut Counter::new(0))
        .await
        .unwrap();

    let (mut counter, watch) = get_node_w::<_, Counter>(&conn, "/counters/a")
        .await
        .unwrap();
    counter.value += 1;
    set_node(&conn, "/counters/a", &mut counter).await.unwrap();

    let event = watch.await;
    assert_eq!(event.kind, EventKind::Changed);
    assert_eq!(event.path, "/counters/a");
}

#[tokio::test]
async fn test_decode_failure_is_serialization_error() {
    let conn = MemoryConnection::new();
    corral_coord::Connection::create(&conn, "/counters/a", serde_json::json!("nope"))
        .await
        .unwrap();

    let err = get_node::<_, Counter>(&conn, "/counters/a")
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::Serialization(_)));
}
