//! Wiremock-backed fake backends

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A backend answering `GET {route}` with `status` and a JSON body
pub async fn mock_backend(route: &str, status: u16, body: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(&server)
        .await;
    server
}

/// A backend whose `/health` endpoint answers with `status`
pub async fn mock_health_backend(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

/// Split a wiremock URI into (host, port)
#[must_use]
pub fn server_authority(server: &MockServer) -> (String, u16) {
    let uri = server.uri();
    let authority = uri.trim_start_matches("http://");
    let (host, port) = authority.split_once(':').expect("wiremock uri has host:port");
    (host.to_string(), port.parse().expect("numeric port"))
}
