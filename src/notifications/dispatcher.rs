//! Turns envelopes and connection lifecycle events into presentation calls.
//!
//! The dispatcher is the only component that talks to the [`Presenter`] for
//! realtime-originated events. It styles by severity and nothing more; views
//! that want to correlate envelopes with their own content subscribe to the
//! envelope stream.

use super::{NotificationEnvelope, Severity};
use crate::config::NotificationConfig;
use crate::realtime::Arrival;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Stable id of the connecting/reconnecting indicator.
pub const CONNECTION_INDICATOR_ID: &str = "realtime-connection";

/// Id of the terminal "please reload" notification.
pub const TERMINAL_FAILURE_ID: &str = "realtime-terminal";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresentOptions {
    /// Presentations sharing an id replace each other
    pub id: Option<String>,
    /// `None` keeps the presentation on screen until dismissed
    pub duration: Option<Duration>,
}

/// UI sink for notifications (toast area, log panel, ...).
pub trait Presenter: Send + Sync {
    fn present(&self, severity: Severity, message: &str, options: PresentOptions);

    fn dismiss(&self, id: &str);
}

/// Presenter that renders into the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPresenter;

impl Presenter for LogPresenter {
    fn present(&self, severity: Severity, message: &str, options: PresentOptions) {
        let id = options.id.as_deref().unwrap_or("-");
        match severity {
            Severity::Info | Severity::Success => info!(id = %id, severity = ?severity, "{}", message),
            Severity::Warning => warn!(id = %id, "{}", message),
            Severity::Error => error!(id = %id, "{}", message),
        }
    }

    fn dismiss(&self, id: &str) {
        debug!(id = %id, "Notification dismissed");
    }
}

/// Connection lifecycle as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    /// An open attempt failed and another is scheduled
    Retrying,
    /// An established connection dropped
    Reconnecting,
    Connected(Arrival),
    /// Closed on purpose; nothing to announce
    Stopped,
    TerminalFailure,
}

pub struct NotificationDispatcher {
    presenter: Arc<dyn Presenter>,
    config: NotificationConfig,
    envelopes: broadcast::Sender<NotificationEnvelope>,
    indicator_shown: AtomicBool,
}

impl NotificationDispatcher {
    pub fn new(presenter: Arc<dyn Presenter>, config: NotificationConfig) -> Self {
        let (envelopes, _) = broadcast::channel(256);
        Self {
            presenter,
            config,
            envelopes,
            indicator_shown: AtomicBool::new(false),
        }
    }

    /// Presents one envelope and publishes it to view subscribers.
    pub fn dispatch(&self, envelope: NotificationEnvelope) {
        self.presenter.present(
            envelope.severity,
            &envelope.display_text(),
            PresentOptions {
                id: Some(envelope.id.clone()),
                duration: Some(self.duration_for(envelope.severity)),
            },
        );

        if self.envelopes.send(envelope).is_err() {
            debug!("No view subscribed to notifications");
        }
    }

    pub fn lifecycle(&self, event: Lifecycle) {
        match event {
            Lifecycle::Connecting => {
                self.show_indicator(Severity::Info, "Connecting to live updates...")
            }
            Lifecycle::Retrying => {
                self.show_indicator(Severity::Warning, "Retrying connection to live updates...")
            }
            Lifecycle::Reconnecting => {
                self.show_indicator(Severity::Warning, "Connection lost. Reconnecting...")
            }
            Lifecycle::Connected(arrival) => {
                self.dismiss_indicator();
                let message = match arrival {
                    Arrival::First => "Connected to live updates",
                    Arrival::AfterDrop => "Reconnected to live updates",
                    Arrival::Repeat => return,
                };
                self.presenter.present(
                    Severity::Success,
                    message,
                    PresentOptions {
                        id: None,
                        duration: Some(Duration::from_millis(self.config.connected_ms)),
                    },
                );
            }
            Lifecycle::Stopped => self.dismiss_indicator(),
            Lifecycle::TerminalFailure => {
                self.dismiss_indicator();
                self.presenter.present(
                    Severity::Error,
                    "Live updates are unavailable. Please reload the page.",
                    PresentOptions {
                        id: Some(TERMINAL_FAILURE_ID.to_string()),
                        duration: None,
                    },
                );
            }
        }
    }

    /// Envelope stream for the view layer.
    pub fn subscribe(&self) -> BroadcastStream<NotificationEnvelope> {
        BroadcastStream::new(self.envelopes.subscribe())
    }

    fn show_indicator(&self, severity: Severity, message: &str) {
        self.indicator_shown.store(true, Ordering::SeqCst);
        self.presenter.present(
            severity,
            message,
            PresentOptions {
                id: Some(CONNECTION_INDICATOR_ID.to_string()),
                duration: None,
            },
        );
    }

    fn dismiss_indicator(&self) {
        if self.indicator_shown.swap(false, Ordering::SeqCst) {
            self.presenter.dismiss(CONNECTION_INDICATOR_ID);
        }
    }

    fn duration_for(&self, severity: Severity) -> Duration {
        let ms = match severity {
            Severity::Info => self.config.info_ms,
            Severity::Success => self.config.success_ms,
            Severity::Warning => self.config.warning_ms,
            Severity::Error => self.config.error_ms,
        };
        Duration::from_millis(ms)
    }
}
