use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::http::ConsoleClient;
use crate::core::{GatewayError, Result};
use crate::engine::transport::{Connector, TransportEvent, TransportLink};

/// Shell transport over the console's WebSocket endpoint. Every connect
/// fetches a fresh capability token first.
#[derive(Debug, Clone)]
pub struct WsConnector {
    client: ConsoleClient,
}

impl WsConnector {
    pub fn new(client: ConsoleClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<TransportLink> {
        let token = self.client.capability_token().await?;
        let url = self.client.ws_url(&token)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(GatewayError::connection_failed)?;
        tracing::info!(
            "WebSocket connected to {}",
            url.host_str().unwrap_or("console")
        );

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // Engine -> WebSocket. Ends when the engine drops its sender.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
                    tracing::debug!("WebSocket send failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // WebSocket -> engine
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        tracing::trace!("WebSocket received {} bytes", data.len());
                        if inbound_tx
                            .send(TransportEvent::Frame(Bytes::from(data)))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        tracing::warn!("Ignoring {} byte text message on binary transport", text.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|reason| !reason.is_empty());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break Some(e.to_string());
                    }
                    None => break None,
                }
            };
            let _ = inbound_tx.send(TransportEvent::Closed(reason));
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
