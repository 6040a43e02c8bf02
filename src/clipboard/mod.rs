//! Clipboard abstraction used by the sync engine
//!
//! Providers expose plain text get/set plus a change feed. Whether a `set`
//! shows up on the change feed is provider specific; the engine's cooldown
//! copes with both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

pub mod system;

pub use system::SystemClipboard;

/// Capacity of each watcher's event queue
const WATCH_QUEUE: usize = 64;

/// Clipboard provider trait
#[async_trait]
pub trait ClipboardProvider: Send + Sync {
    /// Begin observing the clipboard
    async fn start(&self) -> Result<(), ClipboardError>;

    /// Stop observing; open watchers see the end of their stream
    async fn stop(&self) -> Result<(), ClipboardError>;

    /// Current clipboard text, empty when there is none
    async fn get_text(&self) -> Result<String, ClipboardError>;

    /// Replace the clipboard text
    async fn set_text(&self, text: &str) -> Result<(), ClipboardError>;

    /// Subscribe to local clipboard changes
    async fn watch(&self) -> Result<ClipboardWatcher, ClipboardError>;

    /// Get provider name
    fn name(&self) -> &str;
}

/// Clipboard change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardEvent {
    pub text: String,
    pub observed_at: DateTime<Utc>,
}

/// Clipboard watcher for monitoring changes
pub struct ClipboardWatcher {
    receiver: mpsc::Receiver<ClipboardEvent>,
}

impl ClipboardWatcher {
    pub async fn recv(&mut self) -> Option<ClipboardEvent> {
        self.receiver.recv().await
    }
}

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// The clipboard backend is gone
    #[error("Clipboard unavailable: {0}")]
    Unavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fan-out of change events to every open watcher
#[derive(Default)]
pub(crate) struct Watchers {
    senders: Mutex<Vec<mpsc::Sender<ClipboardEvent>>>,
}

impl Watchers {
    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::Sender<ClipboardEvent>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self) -> ClipboardWatcher {
        let (tx, receiver) = mpsc::channel(WATCH_QUEUE);
        self.lock().push(tx);
        ClipboardWatcher { receiver }
    }

    pub(crate) fn notify(&self, text: &str) {
        let event = ClipboardEvent {
            text: text.to_string(),
            observed_at: Utc::now(),
        };

        self.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("clipboard watcher is lagging, dropping change event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

/// In-process clipboard for headless runs and tests
pub struct MemoryClipboard {
    content: Mutex<String>,
    watchers: Watchers,
    notify_on_set: bool,
    running: AtomicBool,
}

impl MemoryClipboard {
    /// A clipboard whose `set_text` is silent on the change feed
    pub fn new() -> Self {
        Self::with_set_notifications(false)
    }

    /// A clipboard that reports its own `set_text` calls as changes
    pub fn notifying_on_set() -> Self {
        Self::with_set_notifications(true)
    }

    fn with_set_notifications(notify_on_set: bool) -> Self {
        Self {
            content: Mutex::new(String::new()),
            watchers: Watchers::default(),
            notify_on_set,
            running: AtomicBool::new(false),
        }
    }

    /// Simulate the user copying `text`
    pub fn copy(&self, text: impl Into<String>) {
        let text = text.into();
        self.store(&text);
        self.publish(&text);
    }

    /// Current contents without going through the async trait
    pub fn contents(&self) -> String {
        self.content.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn store(&self, text: &str) {
        *self.content.lock().unwrap_or_else(PoisonError::into_inner) = text.to_string();
    }

    fn publish(&self, text: &str) {
        if self.running.load(Ordering::Acquire) {
            self.watchers.notify(text);
        }
    }
}

impl Default for MemoryClipboard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClipboardProvider for MemoryClipboard {
    async fn start(&self) -> Result<(), ClipboardError> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClipboardError> {
        self.running.store(false, Ordering::Release);
        self.watchers.clear();
        Ok(())
    }

    async fn get_text(&self) -> Result<String, ClipboardError> {
        Ok(self.contents())
    }

    async fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        self.store(text);
        if self.notify_on_set {
            self.publish(text);
        }
        Ok(())
    }

    async fn watch(&self) -> Result<ClipboardWatcher, ClipboardError> {
        Ok(self.watchers.subscribe())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
