//! HttpProbe against a local mock server.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bluegreen_pipeline::{HealthProbe, HealthValidator, HttpProbe};

#[tokio::test]
async fn healthy_endpoint_passes_first_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let probe = Arc::new(HttpProbe::new(Duration::from_secs(2)).unwrap());
    let validator = HealthValidator::new(probe, 3, Duration::from_millis(10)).unwrap();

    let result = validator
        .validate(&format!("{}/", server.uri()), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert_eq!(result.attempts, 1);
    assert!(result.last_error.is_none());
}

#[tokio::test]
async fn server_errors_exhaust_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let probe = Arc::new(HttpProbe::new(Duration::from_secs(2)).unwrap());
    let validator = HealthValidator::new(probe, 3, Duration::from_millis(10)).unwrap();

    let result = validator
        .validate(&server.uri(), &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert!(result.last_error.as_deref().unwrap().contains("500"));
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let probe = HttpProbe::new(Duration::from_millis(100)).unwrap();
    let err = probe.probe(&server.uri()).await.unwrap_err();

    assert!(err.contains("failed"));
}

#[tokio::test]
async fn unreachable_endpoint_is_reported() {
    let probe = HttpProbe::new(Duration::from_millis(200)).unwrap();
    let err = probe.probe("http://127.0.0.1:1/").await.unwrap_err();

    assert!(err.contains("127.0.0.1:1"));
}
