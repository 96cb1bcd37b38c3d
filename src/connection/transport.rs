use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::error::ConnectError;

/// An open bidirectional text channel. The peer closing (or the link
/// dropping) shows up as `inbound` returning `None`; dropping `outbound`
/// closes the channel from our side.
pub struct Channel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens channels. Resolves once the handshake has completed.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Channel, ConnectError>> + Send;
}

/// WebSocket connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Channel, ConnectError>> + Send {
        let url = url.to_string();
        async move {
            let (stream, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| ConnectError::Handshake(e.to_string()))?;
            let (mut sink, mut source) = stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        log::warn!("websocket send failed: {}", e);
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            log::warn!("websocket read failed: {}", e);
                            break;
                        }
                    };
                    if in_tx.send(text).is_err() {
                        break;
                    }
                }
            });

            Ok(Channel {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}
