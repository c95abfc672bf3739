// =============================================================================
// Transport — Socket seam between the connection state machine and the wire
// =============================================================================
//
// The connection never touches a socket directly.  It opens a transport,
// pushes text frames through it and receives inbound text frames on a
// channel.  Liveness is a synchronous probe so that the monitor can poll it
// without awaiting anything.
//
// `TungsteniteTransport` is the production implementation; tests substitute
// an in-memory fake.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

/// Where a transport pushes inbound text frames.
pub type InboundSender = mpsc::UnboundedSender<String>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform the socket handshake.  Inbound text frames are forwarded to
    /// `inbound` until the socket drops.
    async fn open(&self, endpoint: &str, inbound: InboundSender) -> Result<(), ConnectionError>;

    async fn send(&self, frame: String) -> Result<(), ConnectionError>;

    /// Whether the underlying socket is still connected.
    fn is_live(&self) -> bool;

    /// Tear the socket down.  Safe to call when already closed.
    async fn shutdown(&self);
}

// -----------------------------------------------------------------------------
// tokio-tungstenite implementation
// -----------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

pub struct TungsteniteTransport {
    sink: tokio::sync::Mutex<Option<WsSink>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    live: Arc<AtomicBool>,
    io_timeout: Duration,
}

impl TungsteniteTransport {
    /// `io_timeout` bounds the handshake and every send.
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
            live: Arc::new(AtomicBool::new(false)),
            io_timeout,
        }
    }
}

fn map_ws_error(e: tungstenite::Error) -> ConnectionError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::Closed
        }
        other => ConnectionError::Transport(other.to_string()),
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, endpoint: &str, inbound: InboundSender) -> Result<(), ConnectionError> {
        self.shutdown().await;

        info!(url = %endpoint, "opening websocket");
        let (ws_stream, _response) = tokio::time::timeout(self.io_timeout, connect_async(endpoint))
            .await
            .map_err(|_| ConnectionError::Timeout("websocket handshake"))?
            .map_err(map_ws_error)?;

        let (write, mut read) = ws_stream.split();
        *self.sink.lock().await = Some(write);
        self.live.store(true, Ordering::SeqCst);

        let live = self.live.clone();
        let handle = tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(text).is_err() {
                            debug!("inbound receiver dropped, stopping reader");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "websocket closed by peer");
                        break;
                    }
                    // Ping / Pong / Binary frames carry nothing we route.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                    None => {
                        warn!("websocket stream ended");
                        break;
                    }
                }
            }
            live.store(false, Ordering::SeqCst);
        });
        *self.reader.lock() = Some(handle);

        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), ConnectionError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ConnectionError::Closed)?;

        match tokio::time::timeout(self.io_timeout, sink.send(Message::Text(frame))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                let err = map_ws_error(e);
                if err == ConnectionError::Closed {
                    self.live.store(false, Ordering::SeqCst);
                }
                Err(err)
            }
            Err(_) => Err(ConnectionError::Timeout("websocket send")),
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.live.store(false, Ordering::SeqCst);

        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "websocket close handshake failed");
            }
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}
