//! Connection lifecycle as an explicit finite-state machine.
//!
//! ```text
//!            connect()                 open ok
//!   Idle ─────────────▶ Connecting ─────────────▶ Connected
//!                          │  ▲                    │    ▲
//!                open fail │  │ connect()     drop │    │ reopen ok
//!                          ▼  │                    ▼    │
//!                      Disconnected ◀────────── Reconnecting
//!                          │        budget spent    ▲
//!                          └────────────────────────┘
//!                               retry scheduled
//!
//!   any live state ── disconnect() ──▶ Disconnecting ──▶ Disconnected
//! ```
//!
//! Transitions are the only way to change the state. Every accepted
//! transition is published as a [`StateChange`].

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Disconnected, Reconnecting)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
                | (Idle, Disconnecting)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Reconnecting, Disconnecting)
                | (Disconnected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    /// True while a connection exists or is being negotiated.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal connection transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// How a successful open relates to earlier connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// First connection of this session
    First,
    /// Recovered after an unexpected drop
    AfterDrop,
    /// Any other reopen (e.g. manual connect after an explicit disconnect)
    Repeat,
}

pub struct ConnectionStateMachine {
    state: ConnectionState,
    /// Failed opens since the last successful one
    failures: u32,
    /// Budget exhausted; only a manual connect() leaves this
    terminal: bool,
    ever_connected: bool,
    dropped: bool,
    changes: broadcast::Sender<StateChange>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: ConnectionState::Idle,
            failures: 0,
            terminal: false,
            ever_connected: false,
            dropped: false,
            changes,
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// `connect()` requested.
    pub fn begin_connect(&mut self) -> Result<StateChange, InvalidTransition> {
        let change = self.transition(ConnectionState::Connecting)?;
        self.failures = 0;
        self.terminal = false;
        Ok(change)
    }

    /// Transport open (or reopen) succeeded.
    pub fn opened(&mut self) -> Result<Arrival, InvalidTransition> {
        self.transition(ConnectionState::Connected)?;
        self.failures = 0;

        let arrival = if !self.ever_connected {
            Arrival::First
        } else if self.dropped {
            Arrival::AfterDrop
        } else {
            Arrival::Repeat
        };
        self.ever_connected = true;
        self.dropped = false;
        Ok(arrival)
    }

    /// Transport open failed. Returns the failure count so far.
    pub fn open_failed(&mut self) -> Result<u32, InvalidTransition> {
        self.transition(ConnectionState::Disconnected)?;
        self.failures += 1;
        Ok(self.failures)
    }

    /// A retry has been scheduled after a failed open.
    pub fn schedule_retry(&mut self) -> Result<StateChange, InvalidTransition> {
        self.transition(ConnectionState::Reconnecting)
    }

    /// The connection dropped without `disconnect()`.
    pub fn dropped(&mut self) -> Result<StateChange, InvalidTransition> {
        let change = self.transition(ConnectionState::Reconnecting)?;
        self.dropped = true;
        Ok(change)
    }

    /// The retry budget is spent.
    pub fn give_up(&mut self) -> Result<(), InvalidTransition> {
        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected)?;
        }
        self.terminal = true;
        Ok(())
    }

    /// `disconnect()` requested.
    pub fn begin_disconnect(&mut self) -> Result<StateChange, InvalidTransition> {
        self.transition(ConnectionState::Disconnecting)
    }

    /// The explicit disconnect finished.
    pub fn disconnected(&mut self) -> Result<StateChange, InvalidTransition> {
        self.transition(ConnectionState::Disconnected)
    }

    fn transition(&mut self, to: ConnectionState) -> Result<StateChange, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }

        self.state = to;
        let change = StateChange { from, to };
        debug!(from = ?from, to = ?to, "Connection state changed");
        let _ = self.changes.send(change);
        Ok(change)
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    #[test]
    fn test_starts_idle() {
        let machine = ConnectionStateMachine::new();
        assert_eq!(machine.current(), Idle);
        assert!(!machine.is_terminal());
    }

    #[test]
    fn test_first_connect_then_drop_then_recover() {
        let mut machine = ConnectionStateMachine::new();
        machine.begin_connect().unwrap();
        assert_eq!(machine.opened().unwrap(), Arrival::First);

        machine.dropped().unwrap();
        assert_eq!(machine.current(), Reconnecting);
        assert_eq!(machine.opened().unwrap(), Arrival::AfterDrop);
        assert_eq!(machine.current(), Connected);
    }

    #[test]
    fn test_reconnect_after_explicit_disconnect_is_repeat() {
        let mut machine = ConnectionStateMachine::new();
        machine.begin_connect().unwrap();
        machine.opened().unwrap();
        machine.begin_disconnect().unwrap();
        machine.disconnected().unwrap();

        machine.begin_connect().unwrap();
        assert_eq!(machine.opened().unwrap(), Arrival::Repeat);
    }

    #[test]
    fn test_failed_opens_count_and_reset() {
        let mut machine = ConnectionStateMachine::new();
        machine.begin_connect().unwrap();
        assert_eq!(machine.open_failed().unwrap(), 1);
        machine.schedule_retry().unwrap();
        assert_eq!(machine.open_failed().unwrap(), 2);
        machine.schedule_retry().unwrap();

        // first success after failures is still the first connection
        assert_eq!(machine.opened().unwrap(), Arrival::First);
        assert_eq!(machine.failures(), 0);
    }

    #[test]
    fn test_give_up_is_terminal_until_manual_connect() {
        let mut machine = ConnectionStateMachine::new();
        machine.begin_connect().unwrap();
        machine.open_failed().unwrap();
        machine.give_up().unwrap();
        assert_eq!(machine.current(), Disconnected);
        assert!(machine.is_terminal());

        machine.begin_connect().unwrap();
        assert!(!machine.is_terminal());
        assert_eq!(machine.failures(), 0);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut machine = ConnectionStateMachine::new();
        assert_eq!(
            machine.opened(),
            Err(InvalidTransition {
                from: Idle,
                to: Connected
            })
        );
        assert!(machine.dropped().is_err());
        assert!(machine.disconnected().is_err());
        assert_eq!(machine.current(), Idle);

        machine.begin_connect().unwrap();
        assert!(machine.begin_connect().is_err());
    }

    #[test]
    fn test_changes_are_published_in_order() {
        let mut machine = ConnectionStateMachine::new();
        let mut rx = machine.subscribe();

        machine.begin_connect().unwrap();
        machine.opened().unwrap();
        machine.begin_disconnect().unwrap();
        machine.disconnected().unwrap();

        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|change| (change.from, change.to))
            .collect();
        assert_eq!(
            seen,
            vec![
                (Idle, Connecting),
                (Connecting, Connected),
                (Connected, Disconnecting),
                (Disconnecting, Disconnected),
            ]
        );
    }

    #[test]
    fn test_is_live() {
        assert!(Connecting.is_live());
        assert!(Connected.is_live());
        assert!(Reconnecting.is_live());
        assert!(!Idle.is_live());
        assert!(!Disconnecting.is_live());
        assert!(!Disconnected.is_live());
    }
}
