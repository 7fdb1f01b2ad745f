//! Rotation, filtering and ordering of stored records.

mod test_utils;

use std::fs;

use femtotelemetry::{Category, EventRecord, FemtoLevel, test_utils::RecordingTransport};
use rstest::rstest;
use test_utils::{Engine, engine, read_fragment};

fn small_engine(max_storage_bytes: u64) -> Engine {
    Engine::with_config(RecordingTransport::holding(), |builder| {
        builder.with_max_storage_bytes(max_storage_bytes)
    })
}

#[rstest]
fn oversized_active_file_rotates_before_next_append() {
    let engine = small_engine(1_000);
    let telemetry = &engine.telemetry;
    telemetry
        .log(FemtoLevel::Info, "core", "x".repeat(600))
        .expect("queued");
    telemetry.log(FemtoLevel::Info, "core", "small").expect("queued");
    assert!(telemetry.flush());

    let paths = engine.paths(Category::Operational);
    let overflow = read_fragment(&paths.overflow);
    let active = read_fragment(&paths.active);
    assert_eq!(overflow.len(), 1);
    assert_eq!(overflow[0].message.len(), 600);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].message, "small");
}

#[rstest]
fn retained_records_keep_submission_order() {
    let engine = small_engine(4_096);
    let telemetry = &engine.telemetry;
    for i in 0..200 {
        telemetry
            .log(FemtoLevel::Info, "seq", format!("{i:04}"))
            .expect("queued");
    }
    assert!(telemetry.flush());

    let paths = engine.paths(Category::Operational);
    let mut retained = read_fragment(&paths.overflow);
    retained.extend(read_fragment(&paths.active));
    assert!(retained.len() < 200, "older records should have been evicted");
    assert_eq!(retained.last().map(|r| r.message.as_str()), Some("0199"));
    assert!(retained.windows(2).all(|w| w[0].message < w[1].message));
    assert!(retained.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let on_disk = fs::metadata(&paths.active).map(|m| m.len()).unwrap_or(0)
        + fs::metadata(&paths.overflow).map(|m| m.len()).unwrap_or(0);
    assert!(on_disk <= 4_096 + 256, "ring exceeded its budget: {on_disk}");
}

#[rstest]
fn threshold_filters_below_minimum_level() {
    let engine = Engine::with_config(RecordingTransport::holding(), |builder| {
        builder.with_min_level(FemtoLevel::Warn)
    });
    let telemetry = &engine.telemetry;
    telemetry.log(FemtoLevel::Info, "core", "quiet").expect("filtered");
    assert!(telemetry.flush());
    let paths = engine.paths(Category::Operational);
    assert!(read_fragment(&paths.active).is_empty());

    telemetry.log(FemtoLevel::Error, "core", "loud").expect("queued");
    telemetry.record(EventRecord::analytics("opened")).expect("queued");
    assert!(telemetry.flush());
    let active = read_fragment(&paths.active);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].message, "loud");
    assert_eq!(
        read_fragment(&engine.paths(Category::Analytics).active).len(),
        1
    );
}

#[rstest]
fn threshold_change_applies_to_later_records(engine: Engine) {
    let telemetry = &engine.telemetry;
    telemetry.set_min_level(FemtoLevel::None);
    telemetry.log(FemtoLevel::Fatal, "core", "dropped").expect("filtered");
    telemetry.set_min_level(FemtoLevel::Debug);
    telemetry.log(FemtoLevel::Debug, "core", "kept").expect("queued");
    assert!(telemetry.flush());
    let active = read_fragment(&engine.paths(Category::Operational).active);
    let messages: Vec<_> = active.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(messages, ["kept"]);
}

#[rstest]
fn disabled_persistence_writes_nothing(engine: Engine) {
    let telemetry = &engine.telemetry;
    telemetry.set_persistence_enabled(false);
    telemetry.log(FemtoLevel::Error, "core", "gone").expect("no-op");
    telemetry.record(EventRecord::analytics("gone")).expect("no-op");
    assert!(telemetry.flush());
    for category in Category::ALL {
        assert!(read_fragment(&engine.paths(category).active).is_empty());
    }
}

#[rstest]
fn shrinking_capacity_rotates_sooner() {
    let engine = small_engine(1 << 20);
    let telemetry = &engine.telemetry;
    telemetry
        .log(FemtoLevel::Info, "core", "y".repeat(300))
        .expect("queued");
    assert!(telemetry.flush());
    telemetry.set_max_storage_bytes(400);
    assert_eq!(telemetry.max_storage_bytes(), 400);
    telemetry.log(FemtoLevel::Info, "core", "next").expect("queued");
    assert!(telemetry.flush());

    let paths = engine.paths(Category::Operational);
    assert_eq!(read_fragment(&paths.overflow).len(), 1);
    assert_eq!(read_fragment(&paths.active)[0].message, "next");
}
