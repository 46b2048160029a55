//! WebSocket session to the master.
//!
//! One connection owns exactly two tasks: a read loop (typed dispatch, 60 s
//! read deadline refreshed by any inbound message) and a write loop (sole
//! producer on the socket, 54 s keepalive ping, 10 s per-message write
//! budget). When the read loop exits for any reason a single reconnect
//! supervisor takes over, doubling its delay from 1 s up to a 60 s cap
//! until a dial succeeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xfleet_protocol::{
    AckPayload, AckStatus, Frame, MessageType, ReportIpPayload, SyncRequestPayload,
    TrafficReportPayload, TrafficSample, XrayStatusPayload,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SEND_QUEUE_CAPACITY: usize = 256;
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_PERIOD: Duration = Duration::from_secs(54);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected to master")]
    NotConnected,

    #[error("send queue stalled")]
    SendTimeout,

    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The agent's reaction to session events. Implemented once by the slave
/// binary; the client drives it.
#[async_trait]
pub trait ClientHandler: Send + Sync {
    /// Runs after every successful dial (first connect and reconnects).
    async fn on_connected(&self);

    /// One inbound frame, already parsed.
    async fn on_frame(&self, frame: Frame);
}

pub struct MasterClient {
    url: String,
    token: String,
    send: RwLock<Option<mpsc::Sender<Frame>>>,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    handler: RwLock<Option<Arc<dyn ClientHandler>>>,
    shutdown: CancellationToken,
}

impl MasterClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            token: token.into(),
            send: RwLock::new(None),
            connected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            handler: RwLock::new(None),
            shutdown,
        })
    }

    /// Must be called before [`MasterClient::connect`]; frames arriving
    /// with no handler installed are dropped with a warning.
    pub fn set_handler(&self, handler: Arc<dyn ClientHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Dial the master, presenting the token as a query parameter, and
    /// start the read/write task pair.
    pub async fn connect(self: &Arc<Self>) -> ClientResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }

        let separator = if self.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}token={}", self.url, separator, self.token);
        info!(url = %self.url, "connecting to master");
        let (socket, _) = connect_async(url.as_str()).await?;
        info!("connected to master");

        let (sink, stream) = socket.split();
        let (sender, queue) = mpsc::channel(SEND_QUEUE_CAPACITY);
        *self.send.write() = Some(sender);
        self.connected.store(true, Ordering::SeqCst);

        tokio::spawn(write_loop(sink, queue, self.shutdown.clone()));
        let client = self.clone();
        tokio::spawn(async move { client.read_loop(stream).await });

        if let Some(handler) = self.handler.read().clone() {
            tokio::spawn(async move { handler.on_connected().await });
        }
        Ok(())
    }

    /// Enqueue a frame for the write loop, waiting at most the send
    /// timeout for queue space.
    pub async fn send(&self, frame: Frame) -> ClientResult<()> {
        let sender = self
            .send
            .read()
            .clone()
            .ok_or(ClientError::NotConnected)?;
        match timeout(SEND_TIMEOUT, sender.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::SendTimeout),
        }
    }

    pub async fn request_sync(&self, local_version: i64) -> ClientResult<()> {
        info!(local_version, "requesting configuration sync");
        self.send(Frame::with_payload(
            MessageType::SyncRequest,
            &SyncRequestPayload { local_version },
        ))
        .await
    }

    pub async fn send_ack(
        &self,
        version: i64,
        status: AckStatus,
        message: impl Into<String>,
    ) -> ClientResult<()> {
        self.send(Frame::with_payload(
            MessageType::Ack,
            &AckPayload::status(status)
                .with_version(version)
                .with_message(message),
        ))
        .await
    }

    pub async fn report_ip(&self, ip: impl Into<String>) -> ClientResult<()> {
        self.send(Frame::with_payload(
            MessageType::ReportIp,
            &ReportIpPayload { ip: ip.into() },
        ))
        .await
    }

    pub async fn report_xray_status(&self, status: impl Into<String>) -> ClientResult<()> {
        self.send(Frame::with_payload(
            MessageType::XrayStatus,
            &XrayStatusPayload {
                status: status.into(),
            },
        ))
        .await
    }

    pub async fn send_traffic_report(
        &self,
        traffic: std::collections::HashMap<String, TrafficSample>,
    ) -> ClientResult<()> {
        self.send(Frame::with_payload(
            MessageType::TrafficReport,
            &TrafficReportPayload { traffic },
        ))
        .await
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        loop {
            let next = timeout(READ_DEADLINE, stream.next()).await;
            let message = match next {
                Err(_) => {
                    warn!("read deadline exceeded");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    debug!(%err, "websocket read failed");
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };
            match message {
                Message::Text(text) => match Frame::parse(&text) {
                    Ok(frame) => self.dispatch(frame).await,
                    // drop the offending frame, keep the session
                    Err(err) => warn!(%err, "unparseable frame from master"),
                },
                // deadline already refreshed; tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        self.send.write().take();
        if self.shutdown.is_cancelled() {
            info!("session closed");
        } else {
            warn!("connection to master lost");
            self.spawn_reconnect();
        }
    }

    async fn dispatch(&self, frame: Frame) {
        debug!(frame_type = %frame.frame_type, "frame received");
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler.on_frame(frame).await,
            None => warn!(frame_type = %frame.frame_type, "no handler installed, dropping frame"),
        }
    }

    /// Start the reconnect supervisor unless one is already running. The
    /// guard matters: the read loop can end twice in quick succession
    /// around a flappy link, and two supervisors would race each other.
    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                let delay = reconnect_backoff(attempt);
                info!(attempt, delay_secs = delay.as_secs(), "reconnect scheduled");
                tokio::select! {
                    _ = client.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match client.connect().await {
                    Ok(()) => {
                        info!(attempt, "reconnected to master");
                        break;
                    }
                    Err(err) => warn!(attempt, %err, "reconnect failed"),
                }
            }
            client.reconnecting.store(false, Ordering::SeqCst);
        });
    }
}

/// delay = min(base * 2^(attempt-1), max)
fn reconnect_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let factor = 2u64.saturating_pow(exponent);
    let millis = (RECONNECT_BASE.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis.min(RECONNECT_MAX.as_millis() as u64))
}

/// Sole producer of outbound socket frames: drains the send queue and owns
/// the keepalive timer.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut queue: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) {
    let mut keepalive = tokio::time::interval(PING_PERIOD);
    keepalive.tick().await; // the first tick completes immediately
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            frame = queue.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                };
                match timeout(WRITE_DEADLINE, sink.send(Message::Text(frame.to_json()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(%err, "websocket write failed");
                        return;
                    }
                    Err(_) => {
                        warn!("write deadline exceeded");
                        return;
                    }
                }
            }
            _ = keepalive.tick() => {
                match timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        warn!("keepalive failed");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        assert_eq!(reconnect_backoff(1), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(2), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(5), Duration::from_secs(16));
        assert_eq!(reconnect_backoff(7), Duration::from_secs(60));
        // far past the cap, still the cap (no overflow)
        assert_eq!(reconnect_backoff(200), Duration::from_secs(60));
    }
}
