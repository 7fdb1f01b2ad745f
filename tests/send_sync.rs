//! Send/Sync guarantees for shared engine types.

use femtotelemetry::{
    CategoryWriter, CrashCapture, CrashFlag, DeliveryCoordinator, FemtoTelemetry,
    FileStateStore, MemoryStateStore, SessionTracker, TelemetryConfig, UreqTransport,
};
use rstest::rstest;
use static_assertions::assert_impl_all;

#[rstest]
fn engine_components_are_send_sync() {
    assert_impl_all!(FemtoTelemetry: Send, Sync);
    assert_impl_all!(CategoryWriter: Send, Sync);
    assert_impl_all!(DeliveryCoordinator: Send, Sync);
    assert_impl_all!(SessionTracker: Send, Sync);
    assert_impl_all!(CrashCapture: Send, Sync);
    assert_impl_all!(CrashFlag: Send, Sync);
}

#[rstest]
fn collaborators_are_send_sync() {
    assert_impl_all!(UreqTransport: Send, Sync);
    assert_impl_all!(FileStateStore: Send, Sync);
    assert_impl_all!(MemoryStateStore: Send, Sync);
    assert_impl_all!(TelemetryConfig: Send, Sync);
}
