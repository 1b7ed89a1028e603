//! End-to-end relay over a real TCP listener, driven by `mq-client`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use mq_broker::application::{BrokerContext, SessionPolicy, Store};
use mq_broker::domain::config::ServerConfig;
use mq_broker::domain::records::QueuedMessage;
use mq_broker::infrastructure::{MemoryStore, WsServer};
use mq_client::{ClientError, HandshakeRequest, RelayClient};
use mq_core::Address;

const SECRET: &str = "JBSWY3DPEHPK3PXP";

struct Broker {
    url: String,
    store: Arc<MemoryStore>,
    running: Arc<AtomicBool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Broker {
    async fn start(policy: SessionPolicy) -> Self {
        Self::start_polling_every(policy, 50).await
    }

    async fn start_polling_every(policy: SessionPolicy, poll_interval_ms: u64) -> Self {
        let store = Arc::new(MemoryStore::new());
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            poll_interval_ms,
            ..ServerConfig::default()
        };
        let ctx = BrokerContext::new(Arc::clone(&store) as Arc<dyn Store>, policy);
        let server = WsServer::bind(&config, ctx).await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(server.run(Arc::clone(&running)));
        Self {
            url,
            store,
            running,
            task,
        }
    }

    async fn join(&self, device_type: &str) -> RelayClient {
        let request = HandshakeRequest::for_secret(SECRET)
            .unwrap()
            .with_field("type", device_type);
        let (client, reply) = RelayClient::connect(&self.url, &request).await.unwrap();
        assert!(reply.verified());
        client
    }

    async fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

/// Waits until the broker has removed `address` from the directory.
async fn wait_until_gone(store: &MemoryStore, address: &Address) -> bool {
    for _ in 0..40 {
        if !store.device_exists(address).await.unwrap() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_message_is_relayed_between_two_peers() {
    // Arrange
    let broker = Broker::start(SessionPolicy::default()).await;
    let mut alice = broker.join("console").await;
    let mut bob = broker.join("worker").await;

    // Act
    let status = alice
        .send(json!({
            "send": alice.address(),
            "receive": bob.address(),
            "payload": "hi",
        }))
        .await
        .unwrap();
    let relayed = bob
        .next_relayed(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("bob should receive the message");

    // Assert
    assert!(status.status);
    assert_eq!(relayed["payload"], json!("hi"));
    assert_eq!(relayed["send"], json!(bob.address()));
    assert_eq!(relayed["receive"], json!(alice.address()));

    alice.close().await.unwrap();
    bob.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_message_to_unknown_peer_is_refused() {
    let broker = Broker::start(SessionPolicy::default()).await;
    let mut alice = broker.join("console").await;

    let status = alice
        .send(json!({"send": alice.address(), "receive": ["203.0.113.9", 1], "payload": 1}))
        .await
        .unwrap();

    assert!(!status.status);
    assert_eq!(status.receive, json!(["203.0.113.9", 1]));
    alice.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_directory_query_lists_connected_peers() {
    // Arrange
    let broker = Broker::start(SessionPolicy::default()).await;
    let mut alice = broker.join("console").await;
    let bob = broker.join("worker").await;

    // Act
    let everyone = alice.query(json!({})).await.unwrap();
    let workers = alice.query(json!({"parameters.type": "worker"})).await.unwrap();

    // Assert
    assert_eq!(everyone.len(), 2);
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["receive"], json!(bob.address()));

    alice.close().await.unwrap();
    bob.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_query_outside_allow_list_is_an_error_frame() {
    let policy = SessionPolicy {
        query_fields: vec!["parameters.type".to_string()],
        ..SessionPolicy::default()
    };
    let broker = Broker::start(policy).await;
    let mut alice = broker.join("console").await;

    let refused = alice.query(json!({"secret": SECRET})).await;
    let allowed = alice.query(json!({"parameters.type": "console"})).await;

    assert!(matches!(refused, Err(ClientError::Broker(_))));
    assert_eq!(allowed.unwrap().len(), 1);
    alice.close().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_wrong_code_is_rejected() {
    let broker = Broker::start(SessionPolicy::default()).await;
    let request = HandshakeRequest::for_secret(SECRET)
        .unwrap()
        .with_field("code", "not-a-code");

    let result = RelayClient::connect(&broker.url, &request).await;

    assert!(matches!(result, Err(ClientError::Rejected(_))));
    broker.stop().await;
}

#[tokio::test]
async fn test_closing_purges_directory_and_queue() {
    // Arrange: a minute-long poll keeps bob's queued message undelivered.
    let broker = Broker::start_polling_every(SessionPolicy::default(), 60_000).await;
    let mut alice = broker.join("console").await;
    let bob = broker.join("worker").await;
    let bob_address = bob.address().clone();
    // Let bob's first poll run against an empty queue.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pending = json!({"send": alice.address(), "receive": bob_address, "payload": "pending"});
    let queued = QueuedMessage::from_body(pending.as_object().unwrap().clone()).unwrap();
    assert!(broker.store.enqueue(queued, None).await.unwrap());
    assert_eq!(broker.store.count_queued(&bob_address).await.unwrap(), 1);

    // Act
    bob.close().await.unwrap();
    assert!(wait_until_gone(&broker.store, &bob_address).await);

    // Assert: the queue went with the directory row and the audit says so.
    assert_eq!(broker.store.count_queued(&bob_address).await.unwrap(), 0);
    let rows = broker.store.audit_rows().await;
    let bob_row = rows
        .iter()
        .find(|row| row["receive"] == json!(bob_address) && row.contains_key("delete"))
        .expect("bob's session should be audited");
    assert_eq!(bob_row["delete"], json!({"device": true, "mq": 1}));

    // A destination that has left accepts nothing more.
    let status = alice
        .send(json!({"send": alice.address(), "receive": bob_address, "payload": "late"}))
        .await
        .unwrap();
    assert!(!status.status);
    assert_eq!(broker.store.count_queued(&bob_address).await.unwrap(), 0);

    alice.close().await.unwrap();
    broker.stop().await;
}
