// Integration tests for transport encryption on both listeners

mod common;

use baseserver::config::{with_tls, with_tls_certificate, with_tls_pem};
use baseserver::testing::{new_for_tests, start_for_tests};
use baseserver::{LifecycleState, ServerError};
use common::{CA_PEM, CERT_PEM, KEY_PEM, OTHER_KEY_PEM, fixture, get, get_tls};
use http::StatusCode;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint};
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;

#[tokio::test]
async fn test_https_with_trusted_ca() {
    let server = new_for_tests(with_tls(fixture("localhost.crt"), fixture("localhost.key"))).unwrap();
    start_for_tests(&server).await.unwrap();

    let address = server.http_address().unwrap();
    assert!(address.starts_with("https://localhost:"), "{}", address);

    let (status, body) = get_tls(server.http_socket_addr().unwrap(), "/ready", CA_PEM)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ready\n");

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_tls_material_copied_from_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("server.crt");
    let key = dir.path().join("server.key");
    std::fs::write(&cert, CERT_PEM).unwrap();
    std::fs::write(&key, KEY_PEM).unwrap();

    let server = new_for_tests(with_tls(&cert, &key)).unwrap();
    // Material is read at build time; the files are no longer needed
    drop(dir);

    start_for_tests(&server).await.unwrap();
    let (status, _) = get_tls(server.http_socket_addr().unwrap(), "/live", CA_PEM)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_untrusted_client_is_rejected() {
    let server = new_for_tests(with_tls_pem(CERT_PEM, KEY_PEM)).unwrap();
    start_for_tests(&server).await.unwrap();
    let addr = server.http_socket_addr().unwrap();

    // A client with no trusted roots cannot verify the chain
    assert!(get_tls(addr, "/ready", b"").await.is_err());
    // Plaintext against a TLS listener fails as well
    assert!(get(addr, "/ready").await.is_err());

    // The listener keeps serving after failed handshakes
    let (status, _) = get_tls(addr, "/ready", CA_PEM).await.unwrap();
    assert_eq!(status, StatusCode::OK);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_grpc_over_tls() {
    let server = new_for_tests(
        with_tls_pem(CERT_PEM, KEY_PEM)
            .into_iter()
            .chain([baseserver::config::with_grpc_health_service()]),
    )
    .unwrap();
    start_for_tests(&server).await.unwrap();

    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(CA_PEM))
        .domain_name("localhost");
    let channel = Endpoint::from_shared(format!("https://{}", server.grpc_address().unwrap()))
        .unwrap()
        .tls_config(tls)
        .unwrap()
        .connect()
        .await
        .unwrap();

    let response = HealthClient::new(channel)
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status, ServingStatus::Serving as i32);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_mismatched_key_fails_start() {
    let server = new_for_tests(with_tls_pem(CERT_PEM, OTHER_KEY_PEM)).unwrap();
    let err = server.start().await.unwrap_err();
    assert!(matches!(err, ServerError::Tls(_)), "unexpected error: {}", err);
    assert_eq!(server.state(), LifecycleState::Initialized);
    assert_eq!(server.http_address(), None);
}

#[tokio::test]
async fn test_certificate_without_key_is_configuration_error() {
    let result = new_for_tests([with_tls_certificate(fixture("localhost.crt"))]);
    assert!(matches!(result, Err(ServerError::Configuration(_))));
}

#[tokio::test]
async fn test_missing_certificate_file_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = new_for_tests(with_tls(dir.path().join("absent.crt"), fixture("localhost.key")));
    match result {
        Err(ServerError::Configuration(message)) => {
            assert!(message.contains("Failed to read TLS certificate"), "{}", message)
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("missing certificate file must be rejected"),
    }
}
