//! Transport double that records uploads and replies on demand.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::delivery::{Transport, TransportResponse, UploadCallback, UploadRequest};

#[derive(Default)]
struct Inner {
    requests: Vec<UploadRequest>,
    script: VecDeque<TransportResponse>,
    held: VecDeque<UploadCallback>,
}

/// Records every upload.
///
/// Scripted responses are delivered immediately, in order. Once the script
/// is exhausted callbacks are held until [`complete_next`] releases them,
/// which lets tests observe an attempt while it is in flight.
///
/// [`complete_next`]: Self::complete_next
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingTransport {
    /// A transport holding every callback.
    pub fn holding() -> Self {
        Self::default()
    }

    /// A transport replying with `responses` before it starts holding.
    pub fn replying(responses: impl IntoIterator<Item = TransportResponse>) -> Self {
        let transport = Self::default();
        transport.inner.lock().script.extend(responses);
        transport
    }

    pub fn requests(&self) -> Vec<UploadRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn upload_count(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Poll until at least `count` uploads arrived or `timeout` elapses.
    pub fn wait_for_uploads(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.upload_count() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.upload_count() >= count
    }

    /// Invoke the oldest held callback with `response`.
    pub fn complete_next(&self, response: TransportResponse) -> bool {
        let callback = self.inner.lock().held.pop_front();
        match callback {
            Some(callback) => {
                callback(response);
                true
            }
            None => false,
        }
    }

    /// Drop every held callback without invoking it.
    pub fn abandon_held(&self) {
        let held: Vec<_> = self.inner.lock().held.drain(..).collect();
        drop(held);
    }
}

impl Transport for RecordingTransport {
    fn upload(&self, request: UploadRequest, on_complete: UploadCallback) {
        let response = {
            let mut inner = self.inner.lock();
            inner.requests.push(request);
            match inner.script.pop_front() {
                Some(response) => response,
                None => {
                    inner.held.push_back(on_complete);
                    return;
                }
            }
        };
        on_complete(response);
    }
}
