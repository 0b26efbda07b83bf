// ABOUTME: IRC-over-WebSocket ChatTransport: handshake, channel joins, reader and writer tasks
// ABOUTME: Publishes lifecycle, chat and PING/PONG events; credential rejections surface as Authentication errors

use super::protocol::{self, Inbound};
use async_trait::async_trait;
use chirp_core::config::ChatConfig;
use chirp_core::events::EventBus;
use chirp_core::{ChatTransport, ConnectionError, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

type WebSocketStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WebSocketStream, Message>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream>;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_PAYLOAD: &str = "chirp";
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// One live socket: outbound queue plus the tasks serving it
struct Session {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct IrcTransport {
    settings: ChatConfig,
    events: EventBus<TransportEvent>,
    open: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
    handshake_timeout: Duration,
}

fn transient(e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::transient(e.to_string())
}

impl IrcTransport {
    pub fn new(settings: ChatConfig) -> Self {
        Self {
            settings,
            events: EventBus::new(),
            open: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    async fn close_session(&self) {
        self.open.store(false, Ordering::SeqCst);
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.cancel.cancel();
            for task in session.tasks {
                if let Err(e) = task.await {
                    tracing::debug!(error = %e, "Session task ended abnormally");
                }
            }
        }
    }

    async fn queue(&self, line: String) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::transient("not connected"));
        }
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(session) => session
                .outbound
                .send(line)
                .map_err(|_| ConnectionError::transient("writer stopped")),
            None => Err(ConnectionError::transient("not connected")),
        }
    }

    /// Read until the server welcomes us or rejects the credentials
    async fn await_welcome(&self, sink: &mut WsSink, source: &mut WsSource) -> Result<(), ConnectionError> {
        while let Some(frame) = source.next().await {
            let text = match frame.map_err(transient)? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            for raw in text.as_str().lines() {
                match protocol::classify(raw, &self.settings.nick, &self.settings.owners) {
                    Inbound::Welcome => return Ok(()),
                    Inbound::AuthFailed(reason) => return Err(ConnectionError::authentication(reason)),
                    Inbound::Ping(payload) => {
                        sink.send(Message::Text(protocol::pong(&payload).into()))
                            .await
                            .map_err(transient)?;
                    }
                    _ => {}
                }
            }
        }
        Err(ConnectionError::transient("connection closed during registration"))
    }

    async fn open_session(&self) -> Result<(String, u16, Session), ConnectionError> {
        let url = url::Url::parse(&self.settings.server_url).map_err(|e| transient(format!("invalid server url: {}", e)))?;
        let address = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(443);

        let (ws_stream, _) = tokio::time::timeout(self.handshake_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectionError::transient("connect timed out"))?
            .map_err(transient)?;
        let (mut sink, mut source) = ws_stream.split();

        for line in protocol::handshake(&self.settings.nick, self.settings.token.as_deref()) {
            sink.send(Message::Text(line.into())).await.map_err(transient)?;
        }
        tokio::time::timeout(self.handshake_timeout, self.await_welcome(&mut sink, &mut source))
            .await
            .map_err(|_| ConnectionError::transient("registration timed out"))??;

        if !self.settings.channels.is_empty() {
            sink.send(Message::Text(protocol::join(&self.settings.channels).into()))
                .await
                .map_err(transient)?;
        }

        let (outbound, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(write_loop(sink, rx, cancel.clone()));
        let reader = tokio::spawn(read_loop(
            source,
            ReaderContext {
                events: self.events.clone(),
                open: Arc::clone(&self.open),
                nick: self.settings.nick.clone(),
                owners: self.settings.owners.clone(),
            },
            cancel.clone(),
        ));

        Ok((
            address,
            port,
            Session {
                outbound,
                cancel,
                tasks: vec![writer, reader],
            },
        ))
    }
}

async fn write_line(sink: &mut WsSink, line: String) -> bool {
    tracing::trace!(line = %line, "IRC >>");
    match sink.send(Message::Text(line.into())).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket write failed");
            false
        }
    }
}

/// Send whatever was queued before the session closed
async fn flush_queued(sink: &mut WsSink, rx: &mut mpsc::UnboundedReceiver<String>) {
    rx.close();
    let mut flushed = 0usize;
    while let Ok(line) = rx.try_recv() {
        if !write_line(sink, line).await {
            break;
        }
        flushed += 1;
    }
    if flushed > 0 {
        tracing::debug!(flushed, "Flushed queued lines on close");
    }
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<String>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            line = rx.recv() => match line {
                Some(line) => {
                    if !write_line(&mut sink, line).await {
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                if tokio::time::timeout(FLUSH_TIMEOUT, flush_queued(&mut sink, &mut rx)).await.is_err() {
                    tracing::warn!("Timed out flushing queued lines");
                }
                break;
            }
        }
    }
    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "WebSocket close failed");
    }
}

struct ReaderContext {
    events: EventBus<TransportEvent>,
    open: Arc<AtomicBool>,
    nick: String,
    owners: Vec<String>,
}

async fn read_loop(mut source: WsSource, ctx: ReaderContext, cancel: CancellationToken) {
    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = source.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e.to_string(),
        };

        let mut stop = None;
        for raw in text.as_str().lines() {
            tracing::trace!(line = %raw, "IRC <<");
            match protocol::classify(raw, &ctx.nick, &ctx.owners) {
                Inbound::Message(message) => {
                    ctx.events.publish(TransportEvent::Message(message));
                }
                Inbound::Ping(payload) => {
                    ctx.events.publish(TransportEvent::LivenessPing { payload });
                }
                Inbound::Pong => {
                    ctx.events.publish(TransportEvent::LivenessAck);
                }
                Inbound::Reconnect => stop = Some("server requested reconnect".to_string()),
                Inbound::AuthFailed(notice) => {
                    tracing::error!(notice = %notice, "Credentials rejected mid-session");
                    stop = Some(notice);
                }
                Inbound::Welcome | Inbound::Other => {}
            }
        }
        if let Some(reason) = stop {
            break reason;
        }
    };

    ctx.open.store(false, Ordering::SeqCst);
    cancel.cancel();
    tracing::warn!(reason = %reason, "Chat socket closed");
    ctx.events.publish(TransportEvent::Disconnected { reason });
}

#[async_trait]
impl ChatTransport for IrcTransport {
    async fn connect(&self) -> Result<(), ConnectionError> {
        self.close_session().await;
        self.events.publish(TransportEvent::Connecting);

        let (address, port, session) = self.open_session().await?;
        *self.session.lock().await = Some(session);
        self.open.store(true, Ordering::SeqCst);
        tracing::info!(
            address = %address,
            port,
            channels = ?self.settings.channels,
            "Joined chat"
        );
        self.events.publish(TransportEvent::Connected { address, port });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.close_session().await;
        Ok(())
    }

    async fn send(&self, target: &str, text: &str) -> Result<(), ConnectionError> {
        self.queue(protocol::privmsg(target, text)).await
    }

    async fn send_liveness_ping(&self) -> Result<(), ConnectionError> {
        self.queue(protocol::ping(PING_PAYLOAD)).await
    }

    async fn send_liveness_ack(&self, payload: &str) -> Result<(), ConnectionError> {
        self.queue(protocol::pong(payload)).await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn events(&self) -> &EventBus<TransportEvent> {
        &self.events
    }

    fn endpoint(&self) -> String {
        self.settings.server_url.clone()
    }
}
