use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{ChangeEvent, RealtimeConnection, RealtimeTransport};
use crate::error::{Error, Result};
use crate::gateway::Table;

/// Change notifications over a websocket.
///
/// Outgoing frames are `{"type": "subscribe", "table": "<name>"}`; incoming
/// change frames are `{"table", "operation", "record"}`. Anything else is
/// skipped.
pub struct WebSocketTransport {
    url: String,
    api_key: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> Result<Url> {
        Url::parse_with_params(&self.url, &[("apikey", self.api_key.as_str())])
            .map_err(|e| Error::Config(format!("invalid realtime url {}: {e}", self.url)))
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>> {
        let endpoint = self.endpoint()?;
        let (stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| Error::Network(format!("realtime connect failed: {e}")))?;
        tracing::debug!(url = %self.url, "Realtime socket open");
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeConnection for WebSocketConnection {
    async fn subscribe(&mut self, table: Table) -> Result<()> {
        let frame = json!({"type": "subscribe", "table": table.name()}).to_string();
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| Error::Network(format!("subscribe to {table} failed: {e}")))
    }

    async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        loop {
            let message = match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(Error::Network(format!("realtime receive failed: {e}"))),
                Some(Ok(message)) => message,
            };

            match message {
                Message::Text(text) => {
                    if let Some(event) = parse_frame(&text) {
                        return Ok(Some(event));
                    }
                }
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }
}

/// Decodes a change frame. Control frames and malformed frames yield `None`.
pub(crate) fn parse_frame(text: &str) -> Option<ChangeEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Skipping non-JSON realtime frame: {e}");
            return None;
        }
    };

    if value.get("table").is_none() {
        tracing::trace!(frame = %value, "Realtime control frame");
        return None;
    }

    match serde_json::from_value(value.clone()) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(frame = %value, "Skipping malformed realtime frame: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::Operation;

    #[test]
    fn test_parse_change_frame() {
        let event =
            parse_frame(r#"{"table": "roster", "operation": "UPDATE", "record": {"id": "r1"}}"#)
                .unwrap();
        assert_eq!(event.table, Table::Roster);
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.record["id"], "r1");

        let event = parse_frame(r#"{"table": "sync_metadata", "operation": "insert"}"#).unwrap();
        assert_eq!(event.operation, Operation::Insert);
        assert!(event.record.is_null());
    }

    #[test]
    fn test_parse_skips_control_and_malformed_frames() {
        assert!(parse_frame(r#"{"type": "subscribed", "table_count": 2}"#).is_none());
        assert!(parse_frame(r#"{"table": "nope", "operation": "INSERT"}"#).is_none());
        assert!(parse_frame(r#"{"table": "roster", "operation": "TRUNCATE"}"#).is_none());
        assert!(parse_frame("not json").is_none());
    }

    #[test]
    fn test_endpoint_carries_api_key() {
        let transport = WebSocketTransport::new("wss://example.test/realtime/v1/websocket", "k&y");
        let url = transport.endpoint().unwrap();
        assert_eq!(url.query(), Some("apikey=k%26y"));
    }
}
