//! Wire seam: the dialer trait plus the WebSocket implementation.
//!
//! A live wire is a pair of channels — outbound frames in, wire events out —
//! pumped by background tasks. The driver never touches the socket types
//! directly, so tests can hand it an in-memory wire.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::debug;

use crew_protocol::SessionId;

use super::state::CloseReason;
use crate::error::TransportError;

/// Events produced by a live wire.
#[derive(Debug)]
pub enum WireEvent {
    /// One text frame from the orchestrator.
    Frame(String),
    /// The wire closed; `Normal` means an explicit closure (no retry).
    Closed(CloseReason),
}

/// One live wire to the orchestrator.
///
/// Dropping the sender closes the underlying socket.
pub struct WireConn {
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<WireEvent>,
}

/// Opens wires to the orchestrator. The session id addresses the endpoint.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, session: &SessionId) -> BoxFuture<'static, Result<WireConn, TransportError>>;
}

/// WebSocket dialer: one socket per session at
/// `{endpoint}/ws/session/{session_id}`.
pub struct WsDialer {
    endpoint: String,
}

impl WsDialer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self { endpoint }
    }

    fn session_url(&self, session: &SessionId) -> String {
        format!("{}/ws/session/{}", self.endpoint, session)
    }
}

impl Dialer for WsDialer {
    fn dial(&self, session: &SessionId) -> BoxFuture<'static, Result<WireConn, TransportError>> {
        let url = self.session_url(session);
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::Dial(e.to_string()))?;
            let (mut ws_write, mut ws_read) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
            let (in_tx, in_rx) = mpsc::channel::<WireEvent>(256);

            // Writer pump: driver frames → socket. Ends when the driver
            // drops its sender, which closes the socket.
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    if let Err(e) = ws_write.send(tungstenite::Message::Text(frame.into())).await {
                        debug!(error = %e, "websocket write failed");
                        break;
                    }
                }
                let _ = ws_write.close().await;
            });

            // Reader pump: socket → driver events, mapping close codes to
            // a CloseReason so the driver can tell "done" from "dropped".
            tokio::spawn(async move {
                while let Some(msg) = ws_read.next().await {
                    match msg {
                        Ok(tungstenite::Message::Text(text)) => {
                            if in_tx.send(WireEvent::Frame(text.to_string())).await.is_err() {
                                return;
                            }
                        }
                        Ok(tungstenite::Message::Close(frame)) => {
                            let reason = match frame {
                                Some(f)
                                    if f.code
                                        == tungstenite::protocol::frame::coding::CloseCode::Normal =>
                                {
                                    CloseReason::Normal
                                }
                                Some(f) => CloseReason::Abnormal(format!("close code {:?}", f.code)),
                                None => CloseReason::Abnormal("close without frame".into()),
                            };
                            let _ = in_tx.send(WireEvent::Closed(reason)).await;
                            return;
                        }
                        // websocket-level ping/pong and binary frames are
                        // handled (or ignored) below the protocol
                        Ok(_) => {}
                        Err(e) => {
                            let _ = in_tx
                                .send(WireEvent::Closed(CloseReason::Abnormal(e.to_string())))
                                .await;
                            return;
                        }
                    }
                }
                let _ = in_tx
                    .send(WireEvent::Closed(CloseReason::Abnormal(
                        "stream ended".into(),
                    )))
                    .await;
            });

            Ok(WireConn {
                tx: out_tx,
                rx: in_rx,
            })
        })
    }
}
