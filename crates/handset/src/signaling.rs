use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use switchboard_proto::{ClientEnvelope, ServerEnvelope};

use crate::error::HandsetError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Persistent, ordered, message-framed connection to the relay. Owns a
/// writer task, a reader task, and a heartbeat task; all are aborted
/// when the link is dropped.
pub struct SignalingLink {
    outbound: mpsc::UnboundedSender<ClientEnvelope>,
    inbound: AsyncMutex<Option<mpsc::UnboundedReceiver<ServerEnvelope>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SignalingLink {
    pub async fn connect(relay_url: &str) -> Result<Arc<Self>, HandsetError> {
        let ws_url = derive_call_url(relay_url)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|err| HandsetError::Setup(format!("websocket connect failed: {err}")))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientEnvelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEnvelope>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if let Ok(json) = serde_json::to_string(&envelope) {
                    if ws_write.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        forward_envelope(text.as_str(), &inbound_tx);
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            forward_envelope(text, &inbound_tx);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(target: "handset", "signaling websocket error: {err}");
                        break;
                    }
                }
            }
        });

        let heartbeat_tx = outbound.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            // The immediate first tick would ping before registration.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientEnvelope::Ping).is_err() {
                    break;
                }
            }
        });

        let link = Arc::new(Self {
            outbound,
            inbound: AsyncMutex::new(Some(inbound_rx)),
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        });
        Ok(link)
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientEnvelope> {
        self.outbound.clone()
    }

    /// Take the inbound envelope stream. Single-consumer; a second take
    /// fails.
    pub async fn envelopes(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<ServerEnvelope>, HandsetError> {
        let mut guard = self.inbound.lock().await;
        guard
            .take()
            .ok_or_else(|| HandsetError::Setup("envelope stream already taken".into()))
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

fn forward_envelope(text: &str, inbound: &mpsc::UnboundedSender<ServerEnvelope>) {
    match serde_json::from_str::<ServerEnvelope>(text) {
        Ok(envelope) => {
            let _ = inbound.send(envelope);
        }
        Err(err) => {
            tracing::debug!(target: "handset", "unparseable frame skipped: {err}");
        }
    }
}

/// Accept `ws://`, `wss://`, `http://`, or `https://` relay URLs and
/// derive the signaling endpoint at the fixed `/call` path.
fn derive_call_url(relay_url: &str) -> Result<Url, HandsetError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| HandsetError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        other => {
            return Err(HandsetError::Setup(format!(
                "unsupported relay url scheme: {other}"
            )))
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| HandsetError::Setup("invalid websocket scheme".into()))?;
    }
    url.set_path("/call");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
