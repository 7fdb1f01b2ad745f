//! Upload capability consumed by the delivery coordinator.
//!
//! The coordinator only knows the [`Transport`] trait: hand over a request and
//! receive exactly one [`TransportResponse`] through the callback, on any
//! thread. [`UreqTransport`] is the default blocking HTTP implementation.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use log::warn;
use native_tls::TlsConnector;
use ureq::{Agent, AgentBuilder};

use crate::record::Category;

/// Default connection timeout for collector requests.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default overall request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Status the collector returns when it stored a batch.
pub const STATUS_CREATED: u16 = 201;

/// One batch ready for upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRequest {
    pub category: Category,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// Outcome reported by a transport.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status, absent when no response was received.
    pub status: Option<u16>,
    pub body: Option<String>,
    /// Transport-level failure description.
    pub error: Option<String>,
}

impl TransportResponse {
    /// A response carrying `status` and an optional body.
    pub fn with_status(status: u16, body: Option<String>) -> Self {
        Self {
            status: Some(status),
            body,
            error: None,
        }
    }

    /// The collector accepted the batch.
    pub fn created() -> Self {
        Self::with_status(STATUS_CREATED, None)
    }

    /// No response was obtained.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: None,
            body: None,
            error: Some(error.into()),
        }
    }

    /// Success means no transport error and a `201 Created` status.
    pub fn is_created(&self) -> bool {
        self.error.is_none() && self.status == Some(STATUS_CREATED)
    }
}

pub type UploadCallback = Box<dyn FnOnce(TransportResponse) + Send>;

/// Asynchronous upload capability.
///
/// Implementations must invoke `on_complete` exactly once. Dropping it
/// without a call is treated as an interrupted attempt.
pub trait Transport: Send + Sync {
    fn upload(&self, request: UploadRequest, on_complete: UploadCallback);
}

/// Settings for [`UreqTransport`].
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// Collector endpoint receiving `POST` requests.
    pub url: String,
    /// Extra headers added to every request.
    pub headers: BTreeMap<String, String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Skip certificate validation; intended for tests against local servers.
    pub insecure_skip_verify: bool,
}

impl HttpTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            insecure_skip_verify: false,
        }
    }
}

/// Blocking HTTP transport backed by a pooled `ureq` agent.
///
/// `upload` performs the request on the calling thread, which is the
/// coordinator's per-send background thread.
pub struct UreqTransport {
    config: HttpTransportConfig,
    agent: Agent,
}

impl UreqTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, native_tls::Error> {
        let mut tls = TlsConnector::builder();
        if config.insecure_skip_verify {
            tls.danger_accept_invalid_certs(true);
            tls.danger_accept_invalid_hostnames(true);
        }
        let agent = AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout(config.request_timeout)
            .tls_connector(Arc::new(tls.build()?))
            .build();
        Ok(Self { config, agent })
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    fn execute(&self, request: &UploadRequest) -> TransportResponse {
        let mut req = self.agent.post(&self.config.url);
        for (key, value) in &request.headers {
            req = req.set(key, value);
        }
        for (key, value) in &self.config.headers {
            req = req.set(key, value);
        }
        match req.send_bytes(&request.body) {
            Ok(response) => {
                let status = response.status();
                TransportResponse::with_status(status, response.into_string().ok())
            }
            Err(ureq::Error::Status(status, response)) => {
                TransportResponse::with_status(status, response.into_string().ok())
            }
            Err(ureq::Error::Transport(err)) => TransportResponse::failed(err.to_string()),
        }
    }
}

impl Transport for UreqTransport {
    fn upload(&self, request: UploadRequest, on_complete: UploadCallback) {
        let response = self.execute(&request);
        if let Some(error) = &response.error {
            warn!(
                "femtotelemetry: {} upload to {} failed: {error}",
                request.category, self.config.url
            );
        }
        on_complete(response);
    }
}

impl std::fmt::Debug for UreqTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UreqTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[rstest]
    #[case(TransportResponse::created(), true)]
    #[case(TransportResponse::with_status(200, None), false)]
    #[case(TransportResponse::with_status(500, Some("boom".into())), false)]
    #[case(TransportResponse::failed("reset"), false)]
    #[case(
        TransportResponse { status: Some(201), body: None, error: Some("late".into()) },
        false
    )]
    fn only_created_without_error_is_success(
        #[case] response: TransportResponse,
        #[case] expected: bool,
    ) {
        assert_eq!(response.is_created(), expected);
    }

    /// Serve one request with `reply` and return the raw request bytes.
    fn one_shot_server(reply: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}/logs", listener.local_addr().expect("addr"));
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = vec![0_u8; 8192];
            let mut request = Vec::new();
            loop {
                let n = stream.read(&mut buf).expect("read");
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            stream.write_all(reply.as_bytes()).expect("write");
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    fn upload(transport: &UreqTransport, body: &[u8]) -> TransportResponse {
        let (tx, rx) = crossbeam_channel::bounded(1);
        transport.upload(
            UploadRequest {
                category: Category::Operational,
                body: body.to_vec(),
                headers: vec![("Content-Type".into(), "application/json".into())],
            },
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );
        rx.recv().expect("callback invoked")
    }

    #[test]
    fn posts_body_and_reports_created() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 201 Created\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        );
        let mut config = HttpTransportConfig::new(url);
        config.headers.insert("X-Api-Key".into(), "secret".into());
        let transport = UreqTransport::new(config).expect("transport");
        let response = upload(&transport, br#"{"logs":[]}"#);
        assert!(response.is_created());
        assert_eq!(response.body.as_deref(), Some("ok"));
        let request = server.join().expect("server");
        assert!(request.starts_with("POST /logs"));
        assert!(request.to_ascii_lowercase().contains("x-api-key: secret"));
        assert!(request.ends_with(r#"{"logs":[]}"#));
    }

    #[test]
    fn error_status_carries_body() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy",
        );
        let transport = UreqTransport::new(HttpTransportConfig::new(url)).expect("transport");
        let response = upload(&transport, b"{}");
        assert_eq!(response.status, Some(503));
        assert_eq!(response.body.as_deref(), Some("busy"));
        assert!(response.error.is_none());
        server.join().expect("server");
    }

    #[test]
    fn connection_failure_is_reported_as_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}/logs", listener.local_addr().expect("addr"));
        drop(listener);
        let transport = UreqTransport::new(HttpTransportConfig::new(url)).expect("transport");
        let response = upload(&transport, b"{}");
        assert_eq!(response.status, None);
        assert!(response.error.is_some());
    }
}
