use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::sockjs::{self, SockJsError, SockJsFrame};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("sockjs error: {0}")]
    SockJs(#[from] SockJsError),
    #[error("socket closed: {0}")]
    Closed(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

// an empty inbound string is keepalive traffic
pub struct Duplex {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<Result<String, TransportError>>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Duplex, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Raw,
    SockJs,
}

pub struct WsConnector {
    framing: Framing,
}

impl WsConnector {
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Duplex, TransportError> {
        let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_sink, mut ws_stream) = ws.split();

        if self.framing == Framing::SockJs {
            match ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame = sockjs::decode(&text)?;
                    if frame != SockJsFrame::Open {
                        return Err(TransportError::Closed(format!(
                            "expected sockjs open frame, got {frame:?}"
                        )));
                    }
                }
                Some(Ok(other)) => {
                    return Err(TransportError::Closed(format!(
                        "expected sockjs open frame, got {other:?}"
                    )))
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TransportError::Closed("closed before sockjs open".into())),
            }
        }

        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let framing = self.framing;

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_stream.next().await {
                let forwarded = match msg {
                    Ok(Message::Text(text)) => match framing {
                        Framing::Raw => vec![Ok(text)],
                        Framing::SockJs => match sockjs::decode(&text) {
                            Ok(SockJsFrame::Messages(messages)) => {
                                messages.into_iter().map(Ok).collect()
                            }
                            Ok(SockJsFrame::Heartbeat) => vec![Ok(String::new())],
                            Ok(SockJsFrame::Open) => Vec::new(),
                            Ok(SockJsFrame::Close { code, reason }) => {
                                vec![Err(TransportError::Closed(format!("{code} {reason}")))]
                            }
                            Err(e) => vec![Err(e.into())],
                        },
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| format!("{} {}", f.code, f.reason))
                            .unwrap_or_else(|| "no close frame".into());
                        vec![Err(TransportError::Closed(reason))]
                    }
                    Ok(Message::Ping(_) | Message::Pong(_)) => vec![Ok(String::new())],
                    Ok(_) => continue,
                    Err(e) => vec![Err(e.into())],
                };

                let terminal = forwarded.iter().any(Result::is_err);
                for item in forwarded {
                    if in_tx.send(item).await.is_err() {
                        return;
                    }
                }
                if terminal {
                    return;
                }
            }
            let _ = in_tx
                .send(Err(TransportError::Closed("stream ended".into())))
                .await;
        });

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                let payload = match framing {
                    Framing::Raw => text,
                    Framing::SockJs => sockjs::encode(&text),
                };
                if let Err(e) = ws_sink.send(Message::Text(payload)).await {
                    warn!(error = %e, "websocket send failed");
                    break;
                }
            }
            let _ = ws_sink.send(Message::Close(None)).await;
            reader.abort();
            debug!("websocket writer finished");
        });

        Ok(Duplex {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::{net::TcpListener, task::JoinHandle};
    use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};

    use super::*;

    const CONNECTED: &str = "CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0";

    // Accepts one socket, sends `script`, returns the first text the client
    // sends, then closes with `close`.
    async fn server(script: Vec<Message>, close: Message) -> (Url, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/ws", listener.local_addr().unwrap())).unwrap();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for msg in script {
                ws.send(msg).await.unwrap();
            }
            let received = loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => break text,
                    _ => continue,
                }
            };
            ws.send(close).await.unwrap();
            received
        });
        (url, handle)
    }

    fn text(s: &str) -> Message {
        Message::Text(s.to_string())
    }

    #[tokio::test]
    async fn raw_framing_passes_text_through() {
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }));
        let (url, server) = server(vec![text(CONNECTED)], close).await;

        let mut duplex = WsConnector::new(Framing::Raw).open(&url).await.unwrap();
        assert_eq!(duplex.inbound.recv().await.unwrap().unwrap(), CONNECTED);

        duplex.outbound.send("SUBSCRIBE\n\n\0".into()).await.unwrap();
        assert_eq!(server.await.unwrap(), "SUBSCRIBE\n\n\0");

        let closed = duplex.inbound.recv().await.unwrap();
        assert!(matches!(closed, Err(TransportError::Closed(reason)) if reason.contains("bye")));
    }

    #[tokio::test]
    async fn sockjs_framing_unwraps_arrays_and_maps_close() {
        let script = vec![
            text("o"),
            text(r#"a["CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\u0000"]"#),
            text("h"),
        ];
        let (url, server) = server(script, text(r#"c[3000,"Go away!"]"#)).await;

        let mut duplex = WsConnector::new(Framing::SockJs).open(&url).await.unwrap();
        assert_eq!(duplex.inbound.recv().await.unwrap().unwrap(), CONNECTED);
        assert_eq!(duplex.inbound.recv().await.unwrap().unwrap(), "");

        duplex.outbound.send("SEND\n\n\0".into()).await.unwrap();
        assert_eq!(server.await.unwrap(), r#"["SEND\n\n\u0000"]"#);

        let closed = duplex.inbound.recv().await.unwrap();
        assert!(matches!(closed, Err(TransportError::Closed(reason)) if reason == "3000 Go away!"));
    }

    #[tokio::test]
    async fn sockjs_requires_open_frame_first() {
        let (url, _server) = server(vec![text(r#"a["x"]"#)], Message::Close(None)).await;

        let err = WsConnector::new(Framing::SockJs)
            .open(&url)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Closed(reason) if reason.contains("open frame")));
    }
}
