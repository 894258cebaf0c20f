//! WebSocket implementation of [`Transport`].
//!
//! One driver task owns the socket. It forwards outgoing frames, resolves
//! pending invocations from completions, turns hub events into
//! [`TransportEvent::Message`], and renegotiates dropped connections on the
//! two-tier [`TransportRetryPolicy`].

use super::backoff::TransportRetryPolicy;
use super::protocol::HubFrame;
use super::transport::{TokenProvider, Transport, TransportError, TransportEvent, TransportEvents};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, String>>>>>;

/// Handle on a live driver task.
struct Link {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct WsTransport {
    retry: TransportRetryPolicy,
    /// Upper bound on one handshake
    connect_timeout: Duration,
    invoke_timeout: Duration,
    link: Mutex<Option<Link>>,
}

impl WsTransport {
    pub fn new(
        retry: TransportRetryPolicy,
        connect_timeout: Duration,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            retry,
            connect_timeout,
            invoke_timeout,
            link: Mutex::new(None),
        }
    }

    /// Whether the socket is currently open (false while renegotiating).
    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|link| link.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &str,
        tokens: TokenProvider,
    ) -> Result<TransportEvents, TransportError> {
        // A second connect replaces the previous link
        self.disconnect().await;

        let socket = open_bounded(url, &tokens, self.connect_timeout).await?;
        info!(url = %url, "Realtime socket open");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let pending: Pending = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        let driver = Driver {
            url: url.to_string(),
            tokens,
            retry: self.retry.clone(),
            connect_timeout: self.connect_timeout,
            events: events_tx,
            outgoing: outgoing_rx,
            pending: Arc::clone(&pending),
            connected: Arc::clone(&connected),
        };
        let task = tokio::spawn(driver.run(socket, stop_rx));

        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(Link {
            outgoing: outgoing_tx,
            pending,
            connected,
            stop: stop_tx,
            task,
        });

        Ok(events_rx)
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, TransportError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let pending = {
            let link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
            let link = link.as_ref().ok_or(TransportError::NotConnected)?;
            if !link.connected.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }

            let frame = HubFrame::Invocation {
                id: id.clone(),
                method: method.to_string(),
                args,
            };
            let text = serde_json::to_string(&frame).map_err(|e| TransportError::Invocation {
                method: method.to_string(),
                reason: e.to_string(),
            })?;

            link.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id.clone(), tx);
            if link.outgoing.send(Message::text(text)).is_err() {
                link.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                return Err(TransportError::NotConnected);
            }
            Arc::clone(&link.pending)
        };

        match tokio::time::timeout(self.invoke_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(reason))) => Err(TransportError::Invocation {
                method: method.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                Err(TransportError::Timeout(format!("invocation of {}", method)))
            }
        }
    }

    async fn disconnect(&self) {
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(link) = link {
            let _ = link.stop.send(true);
            if let Err(e) = link.task.await {
                warn!(error = %e, "Realtime driver task ended abnormally");
            }
        }
    }
}

/// Appends the bearer token as the `access_token` query parameter.
fn with_access_token(url: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!(
                "{}{}access_token={}",
                url,
                separator,
                urlencoding::encode(token)
            )
        }
        None => url.to_string(),
    }
}

async fn open(url: &str, tokens: &TokenProvider) -> Result<WsStream, TransportError> {
    let token = tokens().await;
    if token.is_none() {
        debug!("No bearer token available, connecting without one");
    }

    match connect_async(with_access_token(url, token.as_deref())).await {
        Ok((socket, _response)) => Ok(socket),
        Err(tungstenite::Error::Http(response)) if response.status().as_u16() == 401 => {
            Err(TransportError::Unauthorized)
        }
        Err(e) => Err(TransportError::Connect(e.to_string())),
    }
}

async fn open_bounded(
    url: &str,
    tokens: &TokenProvider,
    limit: Duration,
) -> Result<WsStream, TransportError> {
    match tokio::time::timeout(limit, open(url, tokens)).await {
        Ok(opened) => opened,
        Err(_) => Err(TransportError::Timeout(format!(
            "handshake after {}ms",
            limit.as_millis()
        ))),
    }
}

enum Outcome {
    Stopped,
    Dropped(String),
}

enum Renegotiation {
    Open(WsStream),
    Stopped,
    Unauthorized,
    Exhausted(String),
}

struct Driver {
    url: String,
    tokens: TokenProvider,
    retry: TransportRetryPolicy,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    outgoing: mpsc::UnboundedReceiver<Message>,
    pending: Pending,
    connected: Arc<AtomicBool>,
}

impl Driver {
    async fn run(mut self, mut socket: WsStream, mut stop: watch::Receiver<bool>) {
        loop {
            let outcome = self.pump(&mut socket, &mut stop).await;
            self.connected.store(false, Ordering::SeqCst);
            self.fail_pending("connection lost");

            let reason = match outcome {
                Outcome::Stopped => {
                    let _ = socket.close(None).await;
                    info!("Realtime socket closed");
                    self.emit(TransportEvent::Closed { error: None });
                    return;
                }
                Outcome::Dropped(reason) => reason,
            };

            warn!(error = %reason, "Realtime socket dropped, renegotiating");
            self.emit(TransportEvent::Reconnecting {
                error: Some(reason),
            });

            match self.renegotiate(&mut stop).await {
                Renegotiation::Open(reopened) => {
                    socket = reopened;
                    self.connected.store(true, Ordering::SeqCst);
                    info!("Realtime socket reopened");
                    self.emit(TransportEvent::Reconnected);
                }
                Renegotiation::Stopped => {
                    self.emit(TransportEvent::Closed { error: None });
                    return;
                }
                Renegotiation::Unauthorized => {
                    warn!("Reconnect handshake rejected, credential no longer valid");
                    self.emit(TransportEvent::Unauthorized);
                    return;
                }
                Renegotiation::Exhausted(last_error) => {
                    warn!(error = %last_error, "Realtime reconnect budget spent");
                    self.emit(TransportEvent::Closed {
                        error: Some(last_error),
                    });
                    return;
                }
            }
        }
    }

    async fn pump(&mut self, socket: &mut WsStream, stop: &mut watch::Receiver<bool>) -> Outcome {
        loop {
            tokio::select! {
                _ = stop.changed() => return Outcome::Stopped,

                outgoing = self.outgoing.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = socket.send(message).await {
                            return Outcome::Dropped(e.to_string());
                        }
                    }
                    None => return Outcome::Stopped,
                },

                incoming = socket.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by hub: {} {}", u16::from(f.code), f.reason.as_str()))
                            .unwrap_or_else(|| "closed by hub".to_string());
                        return Outcome::Dropped(reason);
                    }
                    Some(Ok(_)) => {
                        // binary, ping and pong frames carry nothing for us
                    }
                    Some(Err(e)) => return Outcome::Dropped(e.to_string()),
                    None => return Outcome::Dropped("stream ended".to_string()),
                },
            }
        }
    }

    async fn renegotiate(&self, stop: &mut watch::Receiver<bool>) -> Renegotiation {
        let mut attempt = 0;
        let mut last_error = String::from("connection lost");

        loop {
            attempt += 1;
            let delay = match self.retry.delay_for(attempt) {
                Some(delay) => delay,
                None => return Renegotiation::Exhausted(last_error),
            };
            debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => return Renegotiation::Stopped,
            }

            let opened = tokio::select! {
                opened = open_bounded(&self.url, &self.tokens, self.connect_timeout) => opened,
                _ = stop.changed() => return Renegotiation::Stopped,
            };

            match opened {
                Ok(socket) => return Renegotiation::Open(socket),
                // 401 is not retried
                Err(TransportError::Unauthorized) => return Renegotiation::Unauthorized,
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Reconnect attempt failed");
                    last_error = e.to_string();
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<HubFrame>(text) {
            Ok(HubFrame::Completion { id, result, error }) => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(match error {
                            Some(reason) => Err(reason),
                            None => Ok(result.unwrap_or(Value::Null)),
                        });
                    }
                    None => debug!(id = %id, "Completion for unknown invocation"),
                }
            }
            Ok(HubFrame::Event { target, args }) => {
                self.emit(TransportEvent::Message { target, args });
            }
            Ok(HubFrame::Ping) => {}
            Ok(HubFrame::Invocation { method, .. }) => {
                debug!(method = %method, "Ignoring invocation from hub");
            }
            Err(e) => warn!(error = %e, "Malformed hub frame"),
        }
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(reason.to_string()));
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Transport event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_access_token_appended() {
        assert_eq!(
            with_access_token("wss://hub.example.com/notifications", Some("a b+c")),
            "wss://hub.example.com/notifications?access_token=a%20b%2Bc"
        );
        assert_eq!(
            with_access_token("ws://localhost/hub?v=2", Some("tok")),
            "ws://localhost/hub?v=2&access_token=tok"
        );
        assert_eq!(with_access_token("ws://localhost/hub", None), "ws://localhost/hub");
    }

    #[tokio::test]
    async fn test_invoke_without_connection() {
        let transport = WsTransport::new(
            TransportRetryPolicy::default(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(!transport.is_connected());
        assert_eq!(
            transport.invoke("JoinGroup", vec![]).await,
            Err(TransportError::NotConnected)
        );
        // disconnect without a link is a no-op
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let transport = WsTransport::new(
            TransportRetryPolicy::default(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let tokens: TokenProvider = Arc::new(|| async { None::<String> }.boxed());
        // port 9 (discard) on localhost is not expected to accept websockets
        let result = transport.connect("ws://127.0.0.1:9/hub", tokens).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
