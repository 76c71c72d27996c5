//! Data-source behavior against a mock service: streaming initialization
//! via SSE and polling fallback.

use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use flagkit::{Client, Config, User};

const SSE_BODY: &str = "event: put\n\
data: {\"path\":\"/\",\"data\":{\"flags\":{\"feature-a\":{\"key\":\"feature-a\",\"version\":2,\"on\":true,\"salt\":\"s\",\"fallthrough\":{\"variation\":0},\"variations\":[\"one\",\"two\"]}},\"segments\":{}}}\n\
\n\
event: patch\n\
data: {\"path\":\"/flags/feature-a\",\"data\":{\"key\":\"feature-a\",\"version\":3,\"on\":true,\"salt\":\"s\",\"fallthrough\":{\"variation\":1},\"variations\":[\"one\",\"two\"]}}\n\
\n";

async fn wait_until_ready(client: &Client, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if client.initialized() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_put_and_patch_populate_the_store() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
        .mount(&server)
        .await;

    let config = Config::builder("test-sdk-key")
        .stream_uri(server.uri())
        .send_events(false)
        .build();
    let client = Client::start(config).unwrap();

    assert!(wait_until_ready(&client, Duration::from_secs(5)).await);

    let user = User::with_key("u").unwrap();
    // The patch moved the fallthrough from "one" to "two".
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if client.string_variation(&user, "feature-a", "fallback") == "two" {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "patch was never applied"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The stream request carried the shared headers.
    let requests = server.received_requests().await.unwrap();
    assert!(!requests.is_empty());
    assert_eq!(
        requests[0].headers.get("Authorization").unwrap(),
        "test-sdk-key"
    );

    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_replaces_the_dataset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sdk/latest-all"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{
                "flags": {
                    "feature-b": {
                        "key": "feature-b", "version": 1, "on": false,
                        "offVariation": 0, "variations": [42]
                    }
                },
                "segments": {}
            }"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let config = Config::builder("test-sdk-key")
        .base_uri(server.uri())
        .stream(false)
        .send_events(false)
        .poll_interval_ms(100)
        .build();
    let client = Client::start(config).unwrap();

    assert!(wait_until_ready(&client, Duration::from_secs(5)).await);
    let user = User::with_key("u").unwrap();
    assert_eq!(client.int_variation(&user, "feature-b", 0), 42);

    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_client_makes_no_requests() {
    let server = MockServer::start().await;

    let config = Config::builder("test-sdk-key")
        .base_uri(server.uri())
        .stream_uri(server.uri())
        .events_uri(server.uri())
        .offline(true)
        .build();
    let client = Client::start(config).unwrap();

    let user = User::with_key("u").unwrap();
    assert!(!client.bool_variation(&user, "anything", false));
    client.flush();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(server.received_requests().await.unwrap().is_empty());
    client.close();
}
