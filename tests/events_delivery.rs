//! Event delivery against a mock service: header contract, retry
//! idempotency, and permanent shutdown on authorization failures.

use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use flagkit::{Client, Config, User};

fn test_user() -> User {
    User::with_key("test-user").unwrap()
}

/// Build a client that only runs the analytics worker, pointed at the mock
/// server.
fn events_client(server_uri: &str) -> Client {
    let config = Config::builder("test-sdk-key")
        .events_uri(server_uri)
        .use_ldd(true)
        // Keep the periodic flush out of the way; tests flush explicitly.
        .flush_interval_ms(60_000)
        .build();
    Client::start(config).unwrap()
}

async fn wait_for_requests(server: &MockServer, count: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let received = server.received_requests().await.unwrap_or_default().len();
        if received >= count {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn delivery_sends_schema_and_auth_headers() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bulk"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let client = events_client(&server.uri());
    client.identify(&test_user());
    client.flush();

    assert!(wait_for_requests(&server, 1, Duration::from_secs(5)).await);
    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];

    assert_eq!(
        request.headers.get("Authorization").unwrap(),
        "test-sdk-key"
    );
    assert_eq!(
        request.headers.get("X-LaunchDarkly-Event-Schema").unwrap(),
        "3"
    );
    assert_eq!(
        request.headers.get("Content-Type").unwrap(),
        "application/json"
    );
    let agent = request.headers.get("User-Agent").unwrap().to_str().unwrap();
    assert!(agent.starts_with("CServerClient/"));

    // The body is a JSON array holding the identify event.
    let body: serde_json::Value = serde_json::from_slice(&request.body)?;
    let events = body.as_array().unwrap();
    assert_eq!(events[0]["kind"], "identify");
    assert_eq!(events[0]["key"], "test-user");

    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failure_retries_with_same_payload_id() {
    let server = MockServer::start().await;
    // First attempt fails, the retry succeeds.
    Mock::given(method("POST"))
        .and(path("/bulk"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bulk"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let client = events_client(&server.uri());
    client.track(&test_user(), "checkout", None);
    client.flush();

    assert!(wait_for_requests(&server, 2, Duration::from_secs(10)).await);
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    let first_id = requests[0]
        .headers
        .get("X-LaunchDarkly-Payload-ID")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    let second_id = requests[1]
        .headers
        .get("X-LaunchDarkly-Payload-ID")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    // Same payload, same id: the service can collapse the duplicate.
    assert_eq!(first_id, second_id);
    assert_eq!(requests[0].body, requests[1].body);

    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn unauthorized_disables_event_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bulk"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = events_client(&server.uri());
    client.identify(&test_user());
    client.flush();
    assert!(wait_for_requests(&server, 1, Duration::from_secs(5)).await);

    // Give the worker time to notice, then try again: nothing else may be
    // sent.
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.identify(&test_user());
    client.flush();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);

    client.close();
}
