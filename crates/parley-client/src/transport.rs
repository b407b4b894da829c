use std::time::Duration;

use futures::{stream::SplitStream, SinkExt, StreamExt};
use parley_common::{ConnectionId, ServerFrame};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::ClientError;

const OUTBOUND_CAPACITY: usize = 256;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsReader = SplitStream<WsStream>;

/// A hub connection that has received its WELCOME.
pub(crate) struct Transport {
    pub connection_id: ConnectionId,
    pub outbound: mpsc::Sender<Message>,
    pub reader: WsReader,
}

pub(crate) fn parse_url(raw: &str) -> Result<Url, ClientError> {
    let url = Url::parse(raw).map_err(|err| ClientError::Config(format!("{raw}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ClientError::Config(format!(
            "unsupported scheme {other:?}, expected ws or wss"
        ))),
    }
}

pub(crate) async fn open(url: &Url, timeout: Duration) -> Result<Transport, ClientError> {
    match tokio::time::timeout(timeout, handshake(url)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(format!(
            "no WELCOME from {} within {:?}",
            url, timeout
        ))),
    }
}

async fn handshake(url: &Url) -> Result<Transport, ClientError> {
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|err| ClientError::TransportFailure(err.to_string()))?;
    let (mut sink, mut reader) = ws_stream.split();

    let connection_id = loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => match ServerFrame::decode(text.as_str()) {
                Ok(ServerFrame::Welcome { connection_id }) => break connection_id,
                Ok(ServerFrame::Error { message }) => {
                    return Err(ClientError::TransportFailure(message))
                }
                Ok(other) => {
                    return Err(ClientError::Protocol(format!(
                        "expected WELCOME, got {:?}",
                        other
                    )))
                }
                Err(err) => return Err(ClientError::Protocol(err.to_string())),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::TransportFailure(
                    "connection closed during handshake".into(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(ClientError::TransportFailure(err.to_string())),
        }
    };

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    Ok(Transport {
        connection_id,
        outbound: tx,
        reader,
    })
}
