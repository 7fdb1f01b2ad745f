//! Tests for the category writer and its worker thread.

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use logtest::Logger;
use rstest::{fixture, rstest};
use serde::ser::{Error as _, Serialize, Serializer};
use serial_test::serial;
use tempfile::TempDir;

use super::*;
use crate::codec::decode_fragment;
use crate::level::FemtoLevel;
use crate::store::StorePaths;

struct Opaque;

impl Serialize for Opaque {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("not representable"))
    }
}

#[fixture]
fn dir() -> TempDir {
    TempDir::new().expect("temp dir")
}

fn open(dir: &TempDir, config: WriterConfig) -> CategoryWriter {
    CategoryWriter::open(
        dir.path(),
        Category::Operational,
        SharedCapacity::new(1 << 20),
        config,
    )
    .expect("open writer")
}

fn active_messages(dir: &TempDir) -> Vec<String> {
    let paths = StorePaths::new(dir.path(), Category::Operational);
    let fragment = fs::read_to_string(paths.active).unwrap_or_default();
    decode_fragment(&fragment)
        .into_iter()
        .map(|r| r.message)
        .collect()
}

fn record(message: &str) -> EventRecord {
    EventRecord::new(FemtoLevel::Info, "core", message)
}

#[rstest]
fn appends_are_applied_in_fifo_order(dir: TempDir) {
    let writer = open(&dir, WriterConfig::default());
    for i in 0..50 {
        writer.append(record(&format!("msg{i}"))).expect("queued");
    }
    assert!(writer.flush());
    let expected: Vec<_> = (0..50).map(|i| format!("msg{i}")).collect();
    assert_eq!(active_messages(&dir), expected);
}

#[rstest]
fn concurrent_producers_do_not_interleave_records(dir: TempDir) {
    let writer = Arc::new(open(
        &dir,
        WriterConfig {
            overflow_policy: OverflowPolicy::Block,
            ..WriterConfig::default()
        },
    ));
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || {
                for i in 0..25 {
                    writer.append(record(&format!("t{t}-{i}"))).expect("queued");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer");
    }
    assert!(writer.flush());
    let messages = active_messages(&dir);
    assert_eq!(messages.len(), 200);
    for t in 0..8 {
        let own: Vec<_> = messages
            .iter()
            .filter(|m| m.starts_with(&format!("t{t}-")))
            .cloned()
            .collect();
        let expected: Vec<_> = (0..25).map(|i| format!("t{t}-{i}")).collect();
        assert_eq!(own, expected, "per-producer order must be preserved");
    }
}

#[rstest]
fn durable_append_is_on_disk_when_it_returns(dir: TempDir) {
    let writer = open(&dir, WriterConfig::default());
    writer.append(record("queued")).expect("queued");
    writer
        .append_durable(record("terminal"))
        .expect("persisted");
    assert_eq!(active_messages(&dir), vec!["queued", "terminal"]);
}

#[rstest]
fn durable_append_reports_unpersisted_records(dir: TempDir) {
    let writer = open(&dir, WriterConfig::default());
    let err = writer
        .append_durable(record("bad").with_field("handle", &Opaque))
        .expect_err("should not persist");
    assert_eq!(err, SubmitError::NotPersisted);
}

#[rstest]
#[serial]
fn malformed_metadata_is_dropped_with_diagnostic(dir: TempDir) {
    let mut logger = Logger::start();
    let writer = open(&dir, WriterConfig::default());
    writer
        .append(record("bad").with_field("handle", &Opaque))
        .expect("queued");
    writer.append(record("good")).expect("queued");
    assert!(writer.flush());
    assert_eq!(active_messages(&dir), vec!["good"]);

    let mut found = false;
    while let Some(entry) = logger.pop() {
        if entry.level() == log::Level::Warn && entry.args().contains("not representable") {
            found = true;
        }
    }
    assert!(found, "malformed metadata should be reported");
}

#[rstest]
fn drop_policy_rejects_when_queue_is_full(dir: TempDir) {
    let barrier = Arc::new(Barrier::new(2));
    let writer = CategoryWriter::open_with_barrier(
        dir.path(),
        Category::Operational,
        SharedCapacity::new(1 << 20),
        WriterConfig {
            capacity: 1,
            ..WriterConfig::default()
        },
        Some(Arc::clone(&barrier)),
    )
    .expect("open writer");

    writer.append(record("first")).expect("first queued");
    let err = writer
        .append(record("second"))
        .expect_err("second should overflow");
    assert_eq!(err, SubmitError::QueueFull);
    barrier.wait();
    assert!(writer.flush());
    assert_eq!(active_messages(&dir), vec!["first"]);
}

#[rstest]
fn timeout_policy_gives_up_after_deadline(dir: TempDir) {
    let barrier = Arc::new(Barrier::new(2));
    let wait = Duration::from_millis(20);
    let writer = CategoryWriter::open_with_barrier(
        dir.path(),
        Category::Operational,
        SharedCapacity::new(1 << 20),
        WriterConfig {
            capacity: 1,
            overflow_policy: OverflowPolicy::Timeout(wait),
            ..WriterConfig::default()
        },
        Some(Arc::clone(&barrier)),
    )
    .expect("open writer");

    writer.append(record("first")).expect("first queued");
    assert_eq!(
        writer.append(record("second")),
        Err(SubmitError::Timeout(wait))
    );
    barrier.wait();
}

#[rstest]
fn tasks_run_after_earlier_appends(dir: TempDir) {
    let writer = open(&dir, WriterConfig::default());
    writer.append(record("before")).expect("queued");
    let (tx, rx) = crossbeam_channel::bounded(1);
    writer
        .execute(move |store| {
            let _ = tx.send(store.prepare_for_send());
        })
        .expect("task queued");
    let fragment = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("task ran")
        .expect("prepare")
        .expect("data");
    assert_eq!(decode_fragment(&fragment)[0].message, "before");
}

#[rstest]
fn closed_writer_rejects_everything(dir: TempDir) {
    let writer = open(&dir, WriterConfig::default());
    writer.close();
    writer.close();
    assert_eq!(writer.append(record("late")), Err(SubmitError::Closed));
    assert_eq!(
        writer.append_durable(record("late")),
        Err(SubmitError::Closed)
    );
    assert!(writer.execute(|_| {}).is_err());
    assert!(!writer.flush());
}

#[rstest]
fn close_drains_pending_records(dir: TempDir) {
    let writer = open(&dir, WriterConfig::default());
    for i in 0..10 {
        writer.append(record(&format!("m{i}"))).expect("queued");
    }
    drop(writer);
    assert_eq!(active_messages(&dir).len(), 10);
}

#[rstest]
fn zero_capacity_is_rejected(dir: TempDir) {
    let err = CategoryWriter::open(
        dir.path(),
        Category::Analytics,
        SharedCapacity::new(1024),
        WriterConfig {
            capacity: 0,
            ..WriterConfig::default()
        },
    )
    .expect_err("zero capacity");
    assert!(matches!(err, WriterError::ZeroCapacity));
}
