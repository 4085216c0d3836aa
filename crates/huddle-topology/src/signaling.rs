use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_proto::{ClientMessage, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{error::ProtocolError, Error as WsError, Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::SignalingError;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket connection to the session server. Outbound messages are queued
/// on [`sender`](Self::sender); decoded server messages arrive on the
/// receiver returned by [`connect`](Self::connect).
pub struct SignalingClient {
    url: Url,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    shutdown: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    pub async fn connect(
        signaling_url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), SignalingError> {
        let url = websocket_url(signaling_url)?;
        let (stream, _) = connect_async(url.as_str()).await?;
        debug!(url = %url, "signaling websocket connected");
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(async move {
            let mut closing = false;
            loop {
                let message = if closing {
                    outbound_rx.recv().await
                } else {
                    tokio::select! {
                        message = outbound_rx.recv() => message,
                        _ = &mut shutdown_rx => {
                            // Stop accepting new frames but flush what is queued.
                            outbound_rx.close();
                            closing = true;
                            continue;
                        }
                    }
                };
                let Some(message) = message else {
                    break;
                };
                let text = match message.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode signaling message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("signaling websocket closed: {err}");
                            }
                            _ => warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                trace!(len = text.len(), "signaling frame received");
                match ServerMessage::from_text(&text) {
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!(error = %err, "unrecognized signaling frame dropped"),
                }
            }
        });

        let client = Self {
            url,
            outbound,
            shutdown: Some(shutdown),
            writer,
            reader,
        };
        Ok((client, inbound_rx))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.outbound
            .send(message)
            .map_err(|_| SignalingError::Closed)
    }

    /// Sends every frame queued so far, then closes the socket. Senders
    /// handed out by [`sender`](Self::sender) stop working.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut self.writer)
            .await
            .is_err()
        {
            debug!(url = %self.url, "signaling writer did not flush in time");
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Accepts ws/wss directly and maps http/https onto them.
pub(crate) fn websocket_url(raw: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(raw)?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(SignalingError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::UnsupportedScheme(raw.to_string()))?;
    Ok(url)
}
