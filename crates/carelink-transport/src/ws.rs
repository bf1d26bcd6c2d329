use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use carelink_core::{ClientFrame, ConnectionStatus, ProviderFrame};

use crate::adapter::Link;
use crate::error::{Result, TransportError};

/// WebSocket link to the pub/sub gateway.
///
/// One writer task drains the outgoing frame queue; one reader task parses
/// inbound frames onto the intake channel. Reconnection is the gateway
/// client's responsibility — on close or error the link only reports
/// `Disconnected` and goes quiet.
pub struct WsLink {
    frame_tx: mpsc::UnboundedSender<ClientFrame>,
}

impl WsLink {
    pub async fn connect(url: &str, intake: mpsc::UnboundedSender<ProviderFrame>) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| TransportError::Connect(e.to_string()))?;
        let (ws_stream, _) = connect_async(parsed.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(url = %parsed, "Connected to messaging gateway");

        let (mut write, mut read) = ws_stream.split();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();

        let _ = intake.send(ProviderFrame::Status {
            state: ConnectionStatus::Connected,
        });

        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Dropping unserializable frame");
                        continue;
                    }
                };
                if write.send(WsMessage::Text(json.into())).await.is_err() {
                    warn!("Gateway write failed, stopping writer");
                    break;
                }
            }
            let _ = write.send(WsMessage::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ProviderFrame>(&text) {
                        Ok(frame) => {
                            if intake.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Unparseable gateway frame"),
                    },
                    Ok(WsMessage::Close(_)) => {
                        info!("Gateway closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Gateway read error");
                        break;
                    }
                    _ => {}
                }
            }
            let _ = intake.send(ProviderFrame::Status {
                state: ConnectionStatus::Disconnected,
            });
            debug!("Gateway reader stopped");
        });

        Ok(Self { frame_tx })
    }
}

impl Link for WsLink {
    fn send(&self, frame: ClientFrame) -> Result<()> {
        self.frame_tx
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed)
    }
}
