//! Realtime connection manager.
//!
//! Ties the pieces together: asks the session authority for a token, opens the
//! transport with the outer retry budget, replays the desired subscriptions on
//! every (re)connect and feeds inbound notifications to the dispatcher.
//!
//! Transport events are buffered in the transport's channel until the replay
//! for the current connection has finished, so no notification is dispatched
//! against a half-restored subscription set.

use super::state::{ConnectionState, ConnectionStateMachine, InvalidTransition, StateChange};
use super::subscriptions::{self, SubscriptionRegistry, Topic};
use super::transport::{Transport, TransportError, TransportEvent, TransportEvents};
use crate::auth::SessionAuthority;
use crate::config::RealtimeConfig;
use crate::error::{ClientError, ClientResult};
use crate::notifications::{Lifecycle, NotificationDispatcher, NotificationEnvelope};
use reqwest::StatusCode;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct RealtimeConnection {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    session: Arc<SessionAuthority>,
    dispatcher: Arc<NotificationDispatcher>,
    config: RealtimeConfig,
    machine: Mutex<ConnectionStateMachine>,
    registry: Mutex<SubscriptionRegistry>,
    /// Bumped by `disconnect()`. Work started under an older epoch stops.
    epoch: watch::Sender<u64>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeConnection {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<SessionAuthority>,
        dispatcher: Arc<NotificationDispatcher>,
        config: RealtimeConfig,
    ) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                transport,
                session,
                dispatcher,
                config,
                machine: Mutex::new(ConnectionStateMachine::new()),
                registry: Mutex::new(SubscriptionRegistry::new()),
                epoch,
                event_loop: Mutex::new(None),
            }),
        }
    }

    /// Opens the connection.
    ///
    /// Resolves once connected, or once the retry budget is spent. Calling it
    /// while a connection is already live (or being negotiated) is a no-op.
    pub async fn connect(&self) -> ClientResult<()> {
        let inner = &self.inner;
        if inner.already_live() {
            return Ok(());
        }

        // Never open the transport without a credential
        inner.session.get_token().await?;

        let epoch = {
            let mut machine = inner.machine();
            // Another connect() may have started while the token was fetched
            if machine.current().is_live() {
                debug!(state = ?machine.current(), "Realtime connection already live");
                return Ok(());
            }
            machine
                .begin_connect()
                .map_err(|e| ClientError::TransientTransportFailure(e.to_string()))?;
            let epoch = *inner.epoch.borrow();
            epoch
        };

        inner.dispatcher.lifecycle(Lifecycle::Connecting);
        inner.open_with_retry(epoch).await
    }

    /// Closes the connection. No reconnection follows.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        {
            let mut machine = inner.machine();
            if let Err(e) = machine.begin_disconnect() {
                debug!(error = %e, "Nothing to disconnect");
                return;
            }
            inner.epoch.send_modify(|epoch| *epoch += 1);
        }

        let task = inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        inner.transport.disconnect().await;
        if let Some(task) = task {
            task.abort();
        }

        if let Err(e) = inner.machine().disconnected() {
            warn!(error = %e, "Unexpected state after disconnect");
        }
        inner.dispatcher.lifecycle(Lifecycle::Stopped);
        info!("Realtime connection closed");
    }

    /// Adds `topic` to the desired set, joining right away when connected.
    ///
    /// A failed join is logged and the topic stays desired; the next
    /// reconnect replays it.
    pub async fn subscribe(&self, topic: Topic) {
        if !self.inner.registry().insert(topic.clone()) {
            debug!(topic = %topic, "Already subscribed");
            return;
        }

        if self.state() == ConnectionState::Connected {
            let _ = subscriptions::join(self.inner.transport.as_ref(), &topic).await;
        } else {
            debug!(topic = %topic, "Not connected, join deferred to next connect");
        }
    }

    /// Removes `topic` from the desired set, leaving right away when connected.
    pub async fn unsubscribe(&self, topic: &Topic) {
        if !self.inner.registry().remove(topic) {
            debug!(topic = %topic, "Not subscribed");
            return;
        }

        if self.state() == ConnectionState::Connected {
            let _ = subscriptions::leave(self.inner.transport.as_ref(), topic).await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine().current()
    }

    /// True once the retry budget has been spent.
    pub fn is_terminal(&self) -> bool {
        self.inner.machine().is_terminal()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.inner.machine().subscribe()
    }

    /// Topics replayed on the next (re)connect.
    pub fn desired_topics(&self) -> Vec<Topic> {
        self.inner.registry().snapshot()
    }
}

impl Inner {
    fn machine(&self) -> MutexGuard<'_, ConnectionStateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn already_live(&self) -> bool {
        let state = self.machine().current();
        if state.is_live() {
            debug!(state = ?state, "Realtime connection already live");
        }
        state.is_live()
    }

    /// Applies a transition for work started under `epoch`.
    ///
    /// Returns `None` when a `disconnect()` has superseded that work or the
    /// transition no longer applies.
    fn transition<T>(
        &self,
        epoch: u64,
        step: impl FnOnce(&mut ConnectionStateMachine) -> Result<T, InvalidTransition>,
    ) -> Option<T> {
        let mut machine = self.machine();
        if *self.epoch.borrow() != epoch {
            debug!("Superseded by disconnect");
            return None;
        }
        match step(&mut machine) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Ignoring stale connection event");
                None
            }
        }
    }

    async fn open_with_retry(self: &Arc<Self>, epoch: u64) -> ClientResult<()> {
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_seconds);
        let mut cancelled = self.epoch.subscribe();

        loop {
            let attempt = tokio::time::timeout(
                connect_timeout,
                self.transport
                    .connect(&self.config.hub_url, self.session.token_provider()),
            )
            .await;

            let reason = match attempt {
                Ok(Ok(events)) => return self.on_open(events, epoch).await,
                Ok(Err(TransportError::Unauthorized)) => {
                    warn!("Realtime handshake rejected, credential no longer valid");
                    self.end_session(epoch);
                    return Err(ClientError::Unauthorized);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("connect timed out after {}s", connect_timeout.as_secs()),
            };

            let failures = match self.transition(epoch, |m| m.open_failed()) {
                Some(failures) => failures,
                None => return Ok(()),
            };
            warn!(attempt = failures, error = %reason, "Realtime connect attempt failed");

            match self.config.outer_retry.delay_after(failures) {
                Some(delay) => {
                    if self.transition(epoch, |m| m.schedule_retry()).is_none() {
                        return Ok(());
                    }
                    self.dispatcher.lifecycle(Lifecycle::Retrying);
                    debug!(delay_ms = delay.as_millis() as u64, "Retrying realtime connect");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled.changed() => return Ok(()),
                    }
                }
                None => {
                    if self.transition(epoch, |m| m.give_up()).is_none() {
                        return Ok(());
                    }
                    error!(attempts = failures, error = %reason, "Realtime connection failed, giving up");
                    self.dispatcher.lifecycle(Lifecycle::TerminalFailure);
                    return Err(ClientError::TerminalTransportFailure { attempts: failures });
                }
            }
        }
    }

    /// The hub refused the credential: the session ends and no retry follows.
    fn end_session(&self, epoch: u64) {
        self.session.on_unauthorized(StatusCode::UNAUTHORIZED);
        if self.transition(epoch, |m| m.open_failed()).is_some() {
            self.dispatcher.lifecycle(Lifecycle::Stopped);
        }
    }

    async fn on_open(self: &Arc<Self>, events: TransportEvents, epoch: u64) -> ClientResult<()> {
        let arrival = match self.transition(epoch, |m| m.opened()) {
            Some(arrival) => arrival,
            None => {
                // disconnect() ran while the open was in flight
                self.transport.disconnect().await;
                return Ok(());
            }
        };
        info!(url = %self.config.hub_url, "Realtime connection established");

        self.replay().await;
        self.dispatcher.lifecycle(Lifecycle::Connected(arrival));
        self.spawn_event_loop(events, epoch);
        Ok(())
    }

    async fn replay(&self) {
        let topics = self.registry().snapshot();
        if topics.is_empty() {
            return;
        }
        let failures = subscriptions::replay(self.transport.as_ref(), &topics).await;
        if !failures.is_empty() {
            warn!(
                failed = failures.len(),
                total = topics.len(),
                "Some subscriptions were not restored"
            );
        }
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events: TransportEvents, epoch: u64) {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !inner.handle_event(event, epoch).await {
                    break;
                }
            }
            debug!("Realtime event loop finished");
        });

        let previous = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Returns false once no further events are expected.
    async fn handle_event(&self, event: TransportEvent, epoch: u64) -> bool {
        match event {
            TransportEvent::Message { target, args } => {
                if target != self.config.notification_target {
                    debug!(target = %target, "Ignoring hub event");
                    return true;
                }
                for arg in args {
                    match serde_json::from_value::<NotificationEnvelope>(arg) {
                        Ok(envelope) => self.dispatcher.dispatch(envelope),
                        Err(e) => warn!(error = %e, "Malformed notification envelope"),
                    }
                }
            }
            TransportEvent::Reconnecting { error } => {
                if self.transition(epoch, |m| m.dropped()).is_none() {
                    return false;
                }
                warn!(error = ?error, "Realtime connection lost, reconnecting");
                self.dispatcher.lifecycle(Lifecycle::Reconnecting);
            }
            TransportEvent::Reconnected => {
                let arrival = match self.transition(epoch, |m| m.opened()) {
                    Some(arrival) => arrival,
                    None => return false,
                };
                info!("Realtime connection restored");
                self.replay().await;
                self.dispatcher.lifecycle(Lifecycle::Connected(arrival));
            }
            TransportEvent::Unauthorized => {
                warn!("Realtime reconnect rejected, credential no longer valid");
                self.end_session(epoch);
                return false;
            }
            TransportEvent::Closed { error: None } => return false,
            TransportEvent::Closed { error: Some(reason) } => {
                if self.transition(epoch, |m| m.give_up()).is_some() {
                    error!(error = %reason, "Realtime reconnect budget spent, giving up");
                    self.dispatcher.lifecycle(Lifecycle::TerminalFailure);
                }
                return false;
            }
        }
        true
    }
}

impl Drop for RealtimeConnection {
    fn drop(&mut self) {
        if let Some(task) = self
            .inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
