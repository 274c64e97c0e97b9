//! Mock compute service for testing job handlers
//!
//! Provides a [`MockComputeServer`] that simulates the signature-computation
//! service endpoints without a real instance.

use serde_json::Value;
use similarity_shared_config::ComputeConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Mock compute service
///
/// Wraps a [`wiremock::MockServer`] with helpers for the four endpoints the
/// worker calls.
///
/// # Example
///
/// ```rust,ignore
/// use similarity_test_utils::MockComputeServer;
///
/// #[tokio::test]
/// async fn test_ping() {
///     let server = MockComputeServer::start().await;
///     server.mock_ping(200, "pong").await;
///
///     let client = ComputeClient::new(&server.config()).unwrap();
///     // ... run your test
///     assert_eq!(server.requests_to("/ping").await, 1);
/// }
/// ```
pub struct MockComputeServer {
    server: MockServer,
}

impl MockComputeServer {
    /// Start a new mock compute server
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Base URL of the running server
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Client configuration pointing at this server, with short timeouts
    pub fn config(&self) -> ComputeConfig {
        test_config(self.url())
    }

    /// Mount a fixed response for `POST /install/artist`
    pub async fn mock_install_artist(&self, status: u16) {
        self.mock_status("POST", "/install/artist", status).await;
    }

    /// Mount a fixed response for `POST /install/album`
    pub async fn mock_install_album(&self, status: u16) {
        self.mock_status("POST", "/install/album", status).await;
    }

    /// Mount a fixed response for `POST /signatures/set`
    pub async fn mock_set_signatures(&self, status: u16) {
        self.mock_status("POST", "/signatures/set", status).await;
    }

    /// Mount a text response for `GET /ping`
    pub async fn mock_ping(&self, status: u16, body: &str) {
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&self.server)
            .await;
    }

    /// Mount a fixed status for any endpoint
    pub async fn mock_status(&self, http_method: &str, endpoint: &str, status: u16) {
        Mock::given(method(http_method))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Answer successive calls with `statuses` in order; the last status
    /// repeats for any further calls.
    pub async fn mock_status_sequence(&self, http_method: &str, endpoint: &str, statuses: &[u16]) {
        let Some((last, first)) = statuses.split_last() else {
            return;
        };
        for status in first {
            Mock::given(method(http_method))
                .and(path(endpoint))
                .respond_with(ResponseTemplate::new(*status))
                .up_to_n_times(1)
                .mount(&self.server)
                .await;
        }
        self.mock_status(http_method, endpoint, *last).await;
    }

    /// Number of requests received on `endpoint`
    pub async fn requests_to(&self, endpoint: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == endpoint)
            .count()
    }

    /// JSON bodies received on `endpoint`, in arrival order
    pub async fn json_bodies(&self, endpoint: &str) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == endpoint)
            .filter_map(|request| serde_json::from_slice(&request.body).ok())
            .collect()
    }
}

/// Configuration for a compute service that is not running: the port was
/// free a moment ago and nothing listens on it.
pub fn unreachable_compute_config() -> ComputeConfig {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(9);
    test_config(format!("http://127.0.0.1:{}", port))
}

fn test_config(url: String) -> ComputeConfig {
    ComputeConfig {
        url,
        install_timeout_secs: 5,
        signatures_timeout_secs: 5,
        ping_timeout_secs: 2,
        connect_timeout_secs: 1,
    }
}
