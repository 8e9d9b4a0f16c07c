//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to subscribe to telemetry and
//! upload progress without tight coupling to the core logic.

use std::sync::{Arc, Mutex};

use crate::protocol::Telemetry;
use crate::state::UploadState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the command client and the firmware loader.
#[derive(Debug, Clone, PartialEq)]
pub enum TncEvent {
    /// Receive loop started.
    Connected,
    /// Receive loop ended (transport closed or explicit disconnect).
    Disconnected,
    /// Decoded response from the TNC.
    Telemetry(Telemetry),
    /// Text from a log packet.
    Notice(String),
    /// Transport or decoding failure reported by the receive loop.
    Error { message: String },
    /// Upload phase changed.
    PhaseChanged { from: UploadState, to: UploadState },
    /// One block written or verified.
    Progress { current: usize, total: usize },
    UploadSucceeded,
    UploadFailed { message: String },
    /// Log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving TNC events.
///
/// Implement this trait in your UI layer to receive updates. Callbacks run
/// on the receive-loop or upload worker thread.
pub trait TncObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &TncEvent);
}

impl<T: TncObserver + ?Sized> TncObserver for Arc<T> {
    fn on_event(&self, event: &TncEvent) {
        (**self).on_event(event)
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl TncObserver for NullObserver {
    fn on_event(&self, _event: &TncEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl TncObserver for TracingObserver {
    fn on_event(&self, event: &TncEvent) {
        match event {
            TncEvent::Connected => {
                tracing::info!("TNC connected");
            }
            TncEvent::Disconnected => {
                tracing::warn!("TNC disconnected");
            }
            TncEvent::Telemetry(value) => {
                tracing::debug!(telemetry = ?value, "Telemetry");
            }
            TncEvent::Notice(text) => {
                tracing::info!(notice = %text, "TNC notice");
            }
            TncEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            TncEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            TncEvent::Progress { current, total } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(block = current, of = total, progress = %format!("{}%", pct), "Progress");
            }
            TncEvent::UploadSucceeded => {
                tracing::info!("Firmware upload complete");
            }
            TncEvent::UploadFailed { message } => {
                tracing::error!("Firmware upload failed: {}", message);
            }
            TncEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}

/// Observer that records every event, for tests and scripted front ends.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<TncEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TncEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn telemetry(&self) -> Vec<Telemetry> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TncEvent::Telemetry(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&TncEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl TncObserver for RecordingObserver {
    fn on_event(&self, event: &TncEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
