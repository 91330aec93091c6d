//! Listener HTTP surface against a real bound server

use std::time::Duration;

use feditest_common::ListenerConfig;
use feditest_listener::{Listener, Matcher};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_peer_round_trip() {
    let listener = Listener::start(&ListenerConfig::default()).await.unwrap();
    let run = listener.partition("run-http", CancellationToken::new());
    let alice = run.create_identity("alice");
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}health", listener.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["partitions"], 1);

    let jrd = client
        .get(format!("{}.well-known/webfinger", listener.base_url()))
        .query(&[("resource", alice.acct.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(jrd.status(), 200);
    assert_eq!(
        jrd.headers()["content-type"].to_str().unwrap(),
        "application/jrd+json"
    );

    let actor: serde_json::Value = client
        .get(&alice.actor_uri)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(actor["inbox"], alice.inbox_uri.as_str());

    let expectation = run
        .register_expectation(&alice.name, Matcher::contains("hello"), Duration::from_secs(5))
        .unwrap();
    let posted = client
        .post(&alice.inbox_uri)
        .header("content-type", "application/activity+json")
        .body(r#"{"type":"Create","actor":"https://peer.example/u/bob","object":{"content":"hello"}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(posted.status(), 202);

    let message = run.await_message(expectation).await.unwrap();
    assert_eq!(message.sender.as_deref(), Some("https://peer.example/u/bob"));

    let malformed = client
        .post(&alice.inbox_uri)
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);
    assert_eq!(listener.rejected().len(), 1);

    drop(run);
    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_closed_run_identities_disappear() {
    let listener = Listener::start(&ListenerConfig::default()).await.unwrap();
    let run = listener.partition("run-closed", CancellationToken::new());
    let alice = run.create_identity("alice");
    drop(run);

    let response = reqwest::get(&alice.actor_uri).await.unwrap();
    assert_eq!(response.status(), 404);

    listener.shutdown().await.unwrap();
}
