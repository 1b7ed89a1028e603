//! WebSocket connection to the relay broker.
//!
//! Architecture:
//! - [`RelayClient`] owns one WebSocket and performs the handshake on
//!   connect.
//! - Request/response calls (`send`, `query`) read frames until their answer
//!   arrives.  Relayed messages that show up first are buffered and handed
//!   out later by [`RelayClient::next_relayed`].
//! - The broker pings idle connections and drops the ones that do not
//!   answer.  Pongs are written while reading, so a long-lived client should
//!   keep calling `next_relayed`.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use mq_core::protocol::messages::{QUERY_KEY, RECEIVE_KEY, SEND_KEY};
use mq_core::{Address, HandshakeReply, HandshakeRequest, StatusReply, VerifyError};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// How long `connect`, `send` and `query` wait for each answer frame.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors that can occur in the client network layer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The WebSocket failed.
    #[error("transport error: {0}")]
    Transport(#[from] WsError),

    /// A frame was not valid JSON.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The broker closed the connection.
    #[error("connection closed by broker")]
    Closed,

    /// The handshake reply came back unverified.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The broker answered with an `{"error": ...}` frame.
    #[error("broker error: {0}")]
    Broker(String),

    /// A frame arrived that does not fit the exchange in progress.
    #[error("unexpected frame: {0}")]
    Unexpected(String),

    /// No answer within the response timeout.
    #[error("no answer within {0:?}")]
    Timeout(Duration),

    /// The handshake code could not be computed.
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// One text frame from the broker, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The bare count that opens a query response.
    Count(u64),
    /// Answer to a submitted message.
    Status(StatusReply),
    /// `{"error": "..."}`.
    Error(String),
    /// A message relayed from another peer (or a query record).
    Object(Map<String, Value>),
}

impl Frame {
    /// Classifies a text frame.
    ///
    /// A status reply is an object with exactly `status` (a boolean), `send`
    /// and `receive`; an error frame is an object whose only key is `error`.
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Number(n) => n
                .as_u64()
                .map(Frame::Count)
                .ok_or_else(|| ClientError::Unexpected(text.to_string())),
            Value::Object(map) => Ok(classify_object(map)),
            _ => Err(ClientError::Unexpected(text.to_string())),
        }
    }
}

fn classify_object(map: Map<String, Value>) -> Frame {
    if map.len() == 1 {
        if let Some(Value::String(error)) = map.get("error") {
            return Frame::Error(error.clone());
        }
    }
    let is_status = map.len() == 3
        && map.get("status").is_some_and(Value::is_boolean)
        && map.contains_key(SEND_KEY)
        && map.contains_key(RECEIVE_KEY);
    if is_status {
        if let Ok(status) = serde_json::from_value::<StatusReply>(Value::Object(map.clone())) {
            return Frame::Status(status);
        }
    }
    Frame::Object(map)
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An authenticated connection to the broker.
pub struct RelayClient {
    ws: Socket,
    reply: HandshakeReply,
    relayed: VecDeque<Value>,
}

impl RelayClient {
    /// Connects to `url` and performs the handshake.
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] if the broker did not verify the
    /// credential, or a transport/JSON error.
    pub async fn connect(
        url: &str,
        request: &HandshakeRequest,
    ) -> Result<(Self, HandshakeReply), ClientError> {
        let (mut ws, _) = connect_async(url).await?;
        info!("connected to {url}");

        ws.send(Message::Text(serde_json::to_string(request)?))
            .await?;
        let text = read_text(&mut ws).await?;
        let reply: HandshakeReply = serde_json::from_str(&text)?;

        if !reply.verified() {
            let message = reply
                .message
                .clone()
                .unwrap_or_else(|| "code did not match".to_string());
            let _ = ws.close(None).await;
            return Err(ClientError::Rejected(message));
        }

        info!(address = %reply.receive, "handshake verified");
        let client = Self {
            ws,
            reply: reply.clone(),
            relayed: VecDeque::new(),
        };
        Ok((client, reply))
    }

    /// This connection's address as the broker sees it; other peers send to
    /// it.
    pub fn address(&self) -> &Address {
        &self.reply.receive
    }

    /// The broker's side of the connection.
    pub fn broker_address(&self) -> &Address {
        &self.reply.send
    }

    /// Submits a message for another peer and returns the broker's verdict.
    ///
    /// `message` should carry `send` and `receive` addresses; the broker
    /// only stores it if `receive` is a connected peer.
    pub async fn send(&mut self, message: Value) -> Result<StatusReply, ClientError> {
        self.ws.send(Message::Text(message.to_string())).await?;
        loop {
            match self.next_frame().await? {
                Frame::Status(status) => return Ok(status),
                Frame::Error(error) => return Err(ClientError::Broker(error)),
                Frame::Object(relayed) => self.relayed.push_back(Value::Object(relayed)),
                Frame::Count(n) => return Err(ClientError::Unexpected(n.to_string())),
            }
        }
    }

    /// Sends a directory query and returns the matching records.
    pub async fn query(&mut self, filter: Value) -> Result<Vec<Value>, ClientError> {
        self.ws
            .send(Message::Text(json!({ QUERY_KEY: filter }).to_string()))
            .await?;

        let count = loop {
            match self.next_frame().await? {
                Frame::Count(n) => break n,
                Frame::Error(error) => return Err(ClientError::Broker(error)),
                Frame::Object(relayed) => self.relayed.push_back(Value::Object(relayed)),
                Frame::Status(status) => {
                    return Err(ClientError::Unexpected(serde_json::to_string(&status)?))
                }
            }
        };

        // Grown per record: the announced count is not trusted for allocation.
        let mut records = Vec::new();
        for _ in 0..count {
            let text = read_text(&mut self.ws).await?;
            records.push(serde_json::from_str(&text)?);
        }
        debug!(count, "query answered");
        Ok(records)
    }

    /// Returns the next relayed message, waiting up to `wait`.
    ///
    /// `Ok(None)` means nothing arrived in time.
    pub async fn next_relayed(&mut self, wait: Duration) -> Result<Option<Value>, ClientError> {
        if let Some(message) = self.relayed.pop_front() {
            return Ok(Some(message));
        }
        let Ok(frame) = timeout(wait, self.next_frame()).await else {
            return Ok(None);
        };
        match frame? {
            Frame::Object(relayed) => Ok(Some(Value::Object(relayed))),
            Frame::Error(error) => Err(ClientError::Broker(error)),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Closes the connection.  The broker then drops this address from its
    /// directory and discards anything still queued for it.
    pub async fn close(mut self) -> Result<(), ClientError> {
        match self.ws.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, ClientError> {
        let text = read_text(&mut self.ws).await?;
        Frame::parse(&text)
    }
}

/// Reads the next text frame, skipping control frames.
async fn read_text<S>(ws: &mut S) -> Result<String, ClientError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let read = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data)
                        .map_err(|e| ClientError::Unexpected(e.to_string()))
                }
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    };
    timeout(RESPONSE_TIMEOUT, read)
        .await
        .unwrap_or(Err(ClientError::Timeout(RESPONSE_TIMEOUT)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_async;

    // ── Frame classification ──────────────────────────────────────────────────

    #[test]
    fn test_parse_count_frame() {
        assert_eq!(Frame::parse("3").unwrap(), Frame::Count(3));
    }

    #[test]
    fn test_parse_status_frame() {
        let frame = Frame::parse(r#"{"status":true,"send":["a",1],"receive":["b",2]}"#).unwrap();
        assert!(matches!(frame, Frame::Status(StatusReply { status: true, .. })));
    }

    #[test]
    fn test_parse_error_frame() {
        assert_eq!(
            Frame::parse(r#"{"error":"boom"}"#).unwrap(),
            Frame::Error("boom".to_string())
        );
    }

    #[test]
    fn test_relayed_message_with_extra_fields_is_an_object() {
        let frame =
            Frame::parse(r#"{"status":true,"send":["a",1],"receive":["b",2],"payload":1}"#).unwrap();
        assert!(matches!(frame, Frame::Object(_)));

        let frame = Frame::parse(r#"{"error":"x","send":["a",1]}"#).unwrap();
        assert!(matches!(frame, Frame::Object(_)));
    }

    #[test]
    fn test_parse_rejects_strings_and_garbage() {
        assert!(matches!(Frame::parse(r#""hi""#), Err(ClientError::Unexpected(_))));
        assert!(matches!(Frame::parse("{oops"), Err(ClientError::Json(_))));
    }

    // ── Scripted broker ───────────────────────────────────────────────────────

    /// Accepts one connection, answers the handshake with `reply`, then sends
    /// `script` after each subsequent client frame.
    async fn scripted_broker(
        reply: Value,
        script: Vec<Vec<String>>,
    ) -> (SocketAddr, JoinHandle<Vec<Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut received = Vec::new();

            let handshake = read_text(&mut ws).await.unwrap();
            received.push(serde_json::from_str(&handshake).unwrap());
            ws.send(Message::Text(reply.to_string())).await.unwrap();

            for frames in script {
                let Ok(text) = read_text(&mut ws).await else { break };
                received.push(serde_json::from_str(&text).unwrap());
                for frame in frames {
                    ws.send(Message::Text(frame)).await.unwrap();
                }
            }
            // Hold the socket until the client goes away.
            while read_text(&mut ws).await.is_ok() {}
            received
        });
        (addr, task)
    }

    fn verified_reply() -> Value {
        json!({"verified": true, "send": ["127.0.0.1", 8500], "receive": ["127.0.0.1", 40000]})
    }

    fn request() -> HandshakeRequest {
        HandshakeRequest::for_secret("JBSWY3DPEHPK3PXP").unwrap()
    }

    #[tokio::test]
    async fn test_connect_sends_request_and_reads_identity() {
        // Arrange
        let (addr, broker) = scripted_broker(verified_reply(), vec![]).await;

        // Act
        let (client, reply) = RelayClient::connect(&format!("ws://{addr}"), &request())
            .await
            .unwrap();

        // Assert
        assert!(reply.verified());
        assert_eq!(client.address(), &Address::new("127.0.0.1", 40000));
        assert_eq!(client.broker_address().port, 8500);
        client.close().await.unwrap();
        let received = broker.await.unwrap();
        assert_eq!(received[0]["secret"], json!("JBSWY3DPEHPK3PXP"));
        assert!(received[0]["code"].is_string());
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let reply = json!({"verified": false, "send": ["h", 1], "receive": ["h", 2],
                           "message": "not verified: no secret supplied"});
        let (addr, _broker) = scripted_broker(reply, vec![]).await;

        let result = RelayClient::connect(&format!("ws://{addr}"), &request()).await;

        assert!(matches!(result, Err(ClientError::Rejected(m)) if m.contains("no secret")));
    }

    #[tokio::test]
    async fn test_send_buffers_relayed_frames_before_status() {
        // Arrange
        let relayed = json!({"send": ["127.0.0.1", 40000], "receive": ["x", 1], "n": 1});
        let status = json!({"status": true, "send": ["127.0.0.1", 40000], "receive": ["x", 1]});
        let script = vec![vec![relayed.to_string(), status.to_string()]];
        let (addr, _broker) = scripted_broker(verified_reply(), script).await;
        let (mut client, _) = RelayClient::connect(&format!("ws://{addr}"), &request())
            .await
            .unwrap();

        // Act
        let answer = client
            .send(json!({"send": ["127.0.0.1", 40000], "receive": ["x", 1]}))
            .await
            .unwrap();

        // Assert
        assert!(answer.status);
        let buffered = client
            .next_relayed(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(buffered, Some(relayed));
    }

    #[tokio::test]
    async fn test_query_reads_count_then_records() {
        let records = [json!({"receive": ["a", 1]}), json!({"receive": ["b", 2]})];
        let mut frames = vec!["2".to_string()];
        frames.extend(records.iter().map(Value::to_string));
        let (addr, broker) = scripted_broker(verified_reply(), vec![frames]).await;
        let (mut client, _) = RelayClient::connect(&format!("ws://{addr}"), &request())
            .await
            .unwrap();

        let found = client.query(json!({"parameters.type": "worker"})).await.unwrap();

        assert_eq!(found, records.to_vec());
        client.close().await.unwrap();
        let received = broker.await.unwrap();
        assert_eq!(received[1], json!({"$query": {"parameters.type": "worker"}}));
    }

    #[tokio::test]
    async fn test_query_with_inflated_count_fails_on_close() {
        // Arrange: the broker announces far more records than it sends.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            read_text(&mut ws).await.unwrap();
            ws.send(Message::Text(verified_reply().to_string())).await.unwrap();
            read_text(&mut ws).await.unwrap();
            ws.send(Message::Text(u64::MAX.to_string())).await.unwrap();
            ws.send(Message::Text(json!({"receive": ["a", 1]}).to_string()))
                .await
                .unwrap();
            let _ = ws.close(None).await;
        });
        let (mut client, _) = RelayClient::connect(&format!("ws://{addr}"), &request())
            .await
            .unwrap();

        // Act
        let result = client.query(json!({})).await;

        // Assert
        assert!(matches!(result, Err(ClientError::Closed)));
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_error_frame() {
        let script = vec![vec![json!({"error": "invalid query"}).to_string()]];
        let (addr, _broker) = scripted_broker(verified_reply(), script).await;
        let (mut client, _) = RelayClient::connect(&format!("ws://{addr}"), &request())
            .await
            .unwrap();

        let result = client.query(json!({"x": {"$bogus": 1}})).await;

        assert!(matches!(result, Err(ClientError::Broker(e)) if e == "invalid query"));
    }

    #[tokio::test]
    async fn test_next_relayed_times_out_quietly() {
        let (addr, _broker) = scripted_broker(verified_reply(), vec![vec![]]).await;
        let (mut client, _) = RelayClient::connect(&format!("ws://{addr}"), &request())
            .await
            .unwrap();

        let next = client.next_relayed(Duration::from_millis(50)).await.unwrap();

        assert!(next.is_none());
    }
}
