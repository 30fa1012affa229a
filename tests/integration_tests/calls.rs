use crate::common::{get, MockTokenProvider, RecordingHandler};
use authed_call::{
    AccessToken, ApiError, AuthenticatedCall, Authenticator, Credentials, Error, JsonHandler,
    RequestDescriptor,
};
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn http_client() -> ClientWithMiddleware {
    reqwest::Client::new().into()
}

#[tokio::test]
async fn successful_call_never_refreshes() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/messages/msg-1"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "msg-1" })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = MockTokenProvider::new(Some("T1"), Some("T2"));
    let handler = RecordingHandler::default();

    let body = AuthenticatedCall::new(
        provider.clone(),
        get(&http_client(), format!("{}/messages/msg-1", mock_server.uri())),
    )
    .perform(handler.clone())
    .await
    .unwrap();

    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&body).unwrap(),
        json!({ "id": "msg-1" })
    );
    assert_eq!(handler.successes(), 1);
    assert_eq!(handler.failures(), 0);
    assert_eq!(provider.get_calls(), 1);
    assert_eq!(provider.refresh_calls(), 0);
}

#[tokio::test]
async fn missing_credentials_fail_without_sending_anything() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0) // Zero network calls
        .mount(&mock_server)
        .await;

    let provider = MockTokenProvider::new(None, None);
    let handler = RecordingHandler::default();
    let notified = Arc::new(AtomicU32::new(0));
    let notified_clone = notified.clone();

    let err = AuthenticatedCall::new(
        provider.clone(),
        get(&http_client(), mock_server.uri()).on_prepare_failed(move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .notify_on_prepare_failure(true)
    .perform(handler.clone())
    .await
    .expect_err("Expected error");

    assert!(matches!(err, Error::NoCredentials));
    assert!(err.is_auth_failure());
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(handler.successes() + handler.failures(), 0);
    assert_eq!(provider.refresh_calls(), 0);
}

#[tokio::test]
async fn rejected_token_is_refreshed_and_request_retried() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "message": "The request requires a valid access token set in the Authorization request header."
        })))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "from": "retry" })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = MockTokenProvider::new(Some("T1"), Some("T2"));
    let handler = RecordingHandler::default();

    let body = AuthenticatedCall::new(provider.clone(), get(&http_client(), mock_server.uri()))
        .perform(handler.clone())
        .await
        .unwrap();

    // The caller sees the data of the retried call, not the original one
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&body).unwrap(),
        json!({ "from": "retry" })
    );
    assert_eq!(handler.successes(), 1);
    assert_eq!(handler.failures(), 0);
    assert_eq!(provider.refresh_calls(), 1);
}

#[tokio::test]
async fn second_rejection_is_final() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1) // Exactly one retried call
        .mount(&mock_server)
        .await;

    let provider = MockTokenProvider::new(Some("T1"), Some("T2"));
    let handler = RecordingHandler::default();

    let err = AuthenticatedCall::new(provider.clone(), get(&http_client(), mock_server.uri()))
        .perform(handler.clone())
        .await
        .expect_err("Expected error");

    assert!(matches!(
        err,
        Error::AuthorizationFailed(ApiError { status: 401, .. })
    ));
    assert!(!err.is_auth_failure());
    // Delivered through the handler, once
    assert_eq!(handler.failures(), 1);
    assert_eq!(handler.successes(), 0);
    assert_eq!(provider.refresh_calls(), 1);
}

#[tokio::test]
async fn failed_refresh_is_reported_without_retrying() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1) // No retried call
        .mount(&mock_server)
        .await;

    let provider = MockTokenProvider::new(Some("T1"), None);
    let handler = RecordingHandler::default();
    let notified = Arc::new(AtomicU32::new(0));
    let notified_clone = notified.clone();

    let err = AuthenticatedCall::new(
        provider.clone(),
        get(&http_client(), mock_server.uri()).on_prepare_failed(move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .notify_on_prepare_failure(true)
    .perform(handler.clone())
    .await
    .expect_err("Expected error");

    // The refresh error is surfaced, not the original response
    match &err {
        Error::RefreshFailed(inner) => assert!(matches!(
            **inner,
            Error::ApiError(ApiError { ref title, .. }) if title == "invalid_grant"
        )),
        e => panic!("Unexpected error: {}", e),
    }
    assert!(err.is_auth_failure());
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(handler.successes() + handler.failures(), 0);
    assert_eq!(provider.refresh_calls(), 1);
}

#[tokio::test]
async fn failed_refresh_is_not_notified_unless_requested() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = MockTokenProvider::new(Some("T1"), None);
    let handler = RecordingHandler::default();
    let notified = Arc::new(AtomicU32::new(0));
    let notified_clone = notified.clone();

    let err = AuthenticatedCall::new(
        provider.clone(),
        get(&http_client(), mock_server.uri()).on_prepare_failed(move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .perform(handler.clone())
    .await
    .expect_err("Expected error");

    assert!(matches!(err, Error::RefreshFailed(_)));
    assert_eq!(notified.load(Ordering::SeqCst), 0);
    assert_eq!(handler.successes() + handler.failures(), 0);
    assert_eq!(provider.refresh_calls(), 1);
}

#[tokio::test]
async fn other_failures_go_to_the_handler_without_refreshing() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "message": "The requested resource could not be found.",
            "trackingId": "tracking-id"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = MockTokenProvider::new(Some("T1"), Some("T2"));
    let handler = RecordingHandler::default();

    let err = AuthenticatedCall::new(provider.clone(), get(&http_client(), mock_server.uri()))
        .perform(handler.clone())
        .await
        .expect_err("Expected error");

    match err {
        Error::ApiError(api_error) => {
            assert_eq!(api_error.status, 404);
            assert_eq!(api_error.trace_id.as_deref(), Some("tracking-id"));
        }
        e => panic!("Unexpected error: {}", e),
    }
    assert_eq!(handler.failures(), 1);
    assert_eq!(provider.refresh_calls(), 0);
}

#[tokio::test]
async fn transport_failures_go_to_the_handler_without_refreshing() {
    // Grab a free port and release it, so nothing is listening there
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let provider = MockTokenProvider::new(Some("T1"), Some("T2"));
    let handler = RecordingHandler::default();

    let err = AuthenticatedCall::new(
        provider.clone(),
        get(&http_client(), format!("http://127.0.0.1:{}/", port)),
    )
    .perform(handler.clone())
    .await
    .expect_err("Expected error");

    assert!(matches!(err, Error::TransportFailure(_)));
    assert_eq!(handler.failures(), 1);
    assert_eq!(provider.refresh_calls(), 0);
}

#[tokio::test]
async fn spawned_call_completes_after_the_caller_walks_away() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let provider = MockTokenProvider::new(Some("T1"), Some("T2"));
    let handler = RecordingHandler::default();

    // Drop the handle straight away
    drop(
        AuthenticatedCall::new(provider.clone(), get(&http_client(), mock_server.uri()))
            .spawn(handler.clone()),
    );

    // Wait for the background call to finish
    for _ in 0..100 {
        if handler.successes() + handler.failures() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(handler.successes(), 1);
    assert_eq!(provider.refresh_calls(), 1);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_rejections_share_a_single_refresh() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "Bearer",
            "access_token": "T2",
            "expires_in": 3600
        })))
        .expect(1) // A single credential exchange for all the calls
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/people/me"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/people/me"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "me" })))
        .expect(5)
        .mount(&mock_server)
        .await;

    let authenticator = Arc::new(Authenticator::with_access_token(
        http_client(),
        Url::parse(&format!("{}/access_token", mock_server.uri())).unwrap(),
        Some(Credentials::ClientCredentials {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".into(),
            scope: "spark:all".to_string(),
        }),
        AccessToken::new("T1", None),
    ));

    let client = http_client();
    let calls = (0..5).map(|_| {
        AuthenticatedCall::new(
            authenticator.clone(),
            get(&client, format!("{}/people/me", mock_server.uri())),
        )
        .perform(JsonHandler::<serde_json::Value>::new())
    });

    for result in futures::future::join_all(calls).await {
        assert_eq!(result.unwrap(), json!({ "id": "me" }));
    }
}
