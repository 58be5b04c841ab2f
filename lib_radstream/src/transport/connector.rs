//! # Transport Connection
//!
//! A [`Connector`] knows how to open one physical connection and hand it back
//! as a [`Link`]: an outbound queue of text frames plus an inbound stream of
//! [`LinkEvent`]s. The supervisor owns the link for as long as it is current;
//! dropping the link closes the socket.
//!
//! `WsConnector` is the production WebSocket implementation. Each link runs
//! two small tasks, a writer draining the outbound queue into the socket and
//! a reader forwarding text frames until the socket closes.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use url::Url;

use crate::errors::StreamError;

/// Events surfaced by a live link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// One inbound text frame.
    Frame(String),
    /// The connection ended, with a reason when one is known.
    Closed(Option<String>),
}

/// One open connection.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens physical connections for the supervisor.
pub trait Connector: Send + Sync + 'static {
    /// Opens a fresh connection. Failing to construct or open the socket is a
    /// [`StreamError::Transport`].
    fn connect(&self) -> impl Future<Output = Result<Link, StreamError>> + Send;
}

/// WebSocket connector built on `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Validates the endpoint URL up front. Only `ws` and `wss` are accepted.
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, StreamError> {
        let parsed = Url::parse(url).map_err(|e| StreamError::Transport(format!("Invalid URL '{}': {}", url, e)))?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(Self {
                url: parsed.to_string(),
                connect_timeout,
            }),
            other => Err(StreamError::Transport(format!("Unsupported scheme '{}' in {}", other, url))),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> impl Future<Output = Result<Link, StreamError>> + Send {
        let url = self.url.clone();
        let limit = self.connect_timeout;

        async move {
            log::info!("Connecting to stream endpoint: {}", url);

            let (ws_stream, _) = timeout(limit, connect_async(url.as_str()))
                .await
                .map_err(|_| StreamError::Transport(format!("Connect timed out after {}ms", limit.as_millis())))?
                .map_err(|e| StreamError::Transport(e.to_string()))?;

            let (mut write, mut read) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

            // Writer: runs until the supervisor drops the link.
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        log::error!("Failed to write frame: {}", e);
                        break;
                    }
                }
                let _ = write.close().await;
            });

            // Reader: forwards frames until the socket ends or the link is dropped.
            tokio::spawn(async move {
                let reason = loop {
                    match read.next().await {
                        Some(Ok(WsMessage::Text(text))) => {
                            if in_tx.send(LinkEvent::Frame(text.to_string())).is_err() {
                                return;
                            }
                        }
                        Some(Ok(WsMessage::Binary(bin))) => match String::from_utf8(bin.to_vec()) {
                            Ok(text) => {
                                if in_tx.send(LinkEvent::Frame(text)).is_err() {
                                    return;
                                }
                            }
                            Err(_) => log::warn!("Dropping non UTF-8 binary frame ({} bytes)", bin.len()),
                        },
                        Some(Ok(WsMessage::Close(frame))) => {
                            break frame.map(|f| f.reason.to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WSS Read Error: {}", e);
                            break Some(e.to_string());
                        }
                        None => {
                            log::warn!("WSS Stream closed by remote host.");
                            break None;
                        }
                    }
                };
                let _ = in_tx.send(LinkEvent::Closed(reason));
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_websocket_urls() {
        let c = WsConnector::new("wss://example.org/graphql", Duration::from_secs(5)).unwrap();
        assert_eq!(c.url(), "wss://example.org/graphql");
        assert!(WsConnector::new("ws://127.0.0.1:9000", Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert!(matches!(
            WsConnector::new("http://example.org", Duration::from_secs(5)),
            Err(StreamError::Transport(_))
        ));
        assert!(matches!(
            WsConnector::new("not a url", Duration::from_secs(5)),
            Err(StreamError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        // Bind and drop to get a local port with nothing listening.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let c = WsConnector::new(&format!("ws://127.0.0.1:{}", port), Duration::from_secs(2)).unwrap();
        let result = c.connect().await;
        assert!(matches!(result, Err(StreamError::Transport(_))));
    }
}
