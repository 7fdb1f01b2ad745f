//! Helpers shared by unit tests, integration tests and benchmarks.
//!
//! Compiled for unit tests and, through the `test-util` feature, for the
//! crate's own integration tests.

mod collecting_sink;
mod recording_transport;

pub use collecting_sink::CollectingSink;
pub use recording_transport::RecordingTransport;
