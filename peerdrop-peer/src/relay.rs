//! WebSocket client for the signaling relay.

use futures::stream::{SplitStream, StreamExt};
use peerdrop_core::{ClientMessage, ServerMessage, decode_server, encode_client};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read half of a relay connection plus the writer task feeding the
/// socket from an unbounded queue. Dropping the connection stops the
/// writer.
pub struct RelayConnection {
    read: SplitStream<WsStream>,
    send_task: tokio::task::JoinHandle<()>,
}

impl RelayConnection {
    /// Connects and returns the connection together with the outbound
    /// message queue. Callers announce their display name first; the
    /// relay drops sockets whose first message is anything else.
    pub async fn connect(
        relay_url: &str,
    ) -> Result<(Self, mpsc::UnboundedSender<ClientMessage>), crate::PeerError> {
        let url = Url::parse(relay_url)
            .map_err(|err| crate::PeerError::InvalidUrl(format!("{relay_url}: {err}")))?;
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| crate::PeerError::Relay(err.to_string()))?;
        let (mut write, read) = stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        let send_task = tokio::spawn(async move {
            use futures::SinkExt;
            while let Some(message) = rx.recv().await {
                let text = match encode_client(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode outbound message");
                        continue;
                    }
                };
                if write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        Ok((Self { read, send_task }, tx))
    }

    /// The next relayed server message. `None` once the relay closes the
    /// socket.
    pub async fn next(&mut self) -> Option<Result<ServerMessage, crate::PeerError>> {
        loop {
            let frame = self.read.next().await?;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(
                        decode_server(text.as_str())
                            .map_err(|err| crate::PeerError::Relay(err.to_string())),
                    );
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {
                    // Ping/pong and binary frames carry no protocol content.
                    debug!("ignoring non-text relay frame");
                }
                Err(err) => return Some(Err(crate::PeerError::Relay(err.to_string()))),
            }
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.send_task.abort();
    }
}
