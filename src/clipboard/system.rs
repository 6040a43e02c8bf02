//! Desktop clipboard backed by `arboard`
//!
//! The platform handle lives on a dedicated thread since some backends are
//! not `Send`. Changes are detected by polling; text written through
//! [`SystemClipboard::set_text`] is recorded as already seen and never shows
//! up on the change feed.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClipboardError, ClipboardProvider, ClipboardWatcher, Watchers};

/// Default polling period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const SET_ATTEMPTS: u32 = 3;
const SET_BACKOFF: Duration = Duration::from_millis(100);

enum Request {
    Get(oneshot::Sender<Result<String, ClipboardError>>),
    Set(String, oneshot::Sender<Result<(), ClipboardError>>),
}

#[derive(Clone)]
struct Worker {
    requests: std_mpsc::Sender<Request>,
}

impl Worker {
    fn spawn() -> Result<Self, ClipboardError> {
        let (requests, inbox) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        thread::Builder::new()
            .name("crossclip-clipboard".to_string())
            .spawn(move || serve(inbox, ready_tx))?;

        ready_rx
            .recv()
            .map_err(|_| ClipboardError::Unavailable("clipboard thread exited".to_string()))??;
        Ok(Self { requests })
    }

    async fn get(&self) -> Result<String, ClipboardError> {
        let (reply, response) = oneshot::channel();
        self.submit(Request::Get(reply))?;
        response.await.map_err(|_| gone())?
    }

    async fn set(&self, text: &str) -> Result<(), ClipboardError> {
        let (reply, response) = oneshot::channel();
        self.submit(Request::Set(text.to_string(), reply))?;
        response.await.map_err(|_| gone())?
    }

    fn submit(&self, request: Request) -> Result<(), ClipboardError> {
        self.requests.send(request).map_err(|_| gone())
    }
}

fn gone() -> ClipboardError {
    ClipboardError::Unavailable("clipboard thread stopped".to_string())
}

fn platform(err: arboard::Error) -> ClipboardError {
    ClipboardError::Platform(err.to_string())
}

fn serve(inbox: std_mpsc::Receiver<Request>, ready: std_mpsc::Sender<Result<(), ClipboardError>>) {
    let mut clipboard = match arboard::Clipboard::new() {
        Ok(clipboard) => {
            let _ = ready.send(Ok(()));
            clipboard
        }
        Err(err) => {
            let _ = ready.send(Err(platform(err)));
            return;
        }
    };

    while let Ok(request) = inbox.recv() {
        match request {
            Request::Get(reply) => {
                let text = match clipboard.get_text() {
                    Ok(text) => Ok(text),
                    Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
                    Err(err) => Err(platform(err)),
                };
                let _ = reply.send(text);
            }
            Request::Set(text, reply) => {
                let _ = reply.send(clipboard.set_text(text).map_err(platform));
            }
        }
    }
}

/// System clipboard provider
pub struct SystemClipboard {
    worker: Worker,
    poll_interval: Duration,
    last_seen: Arc<Mutex<Option<String>>>,
    watchers: Arc<Watchers>,
    poller: Mutex<Option<CancellationToken>>,
}

impl SystemClipboard {
    /// Connect to the desktop clipboard
    pub fn new(poll_interval: Duration) -> Result<Self, ClipboardError> {
        Ok(Self {
            worker: Worker::spawn()?,
            poll_interval,
            last_seen: Arc::new(Mutex::new(None)),
            watchers: Arc::new(Watchers::default()),
            poller: Mutex::new(None),
        })
    }

    fn remember(&self, text: &str) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(text.to_string());
    }
}

#[async_trait]
impl ClipboardProvider for SystemClipboard {
    async fn start(&self) -> Result<(), ClipboardError> {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        *poller = Some(token.clone());

        let worker = self.worker.clone();
        let last_seen = self.last_seen.clone();
        let watchers = self.watchers.clone();
        let period = self.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let text = match worker.get().await {
                    Ok(text) => text,
                    Err(err) => {
                        debug!("clipboard poll failed: {}", err);
                        continue;
                    }
                };

                let changed = {
                    let mut seen = last_seen.lock().unwrap_or_else(PoisonError::into_inner);
                    // First read establishes the baseline only
                    let baseline = seen.is_none();
                    let differs = seen.as_deref() != Some(text.as_str());
                    if differs {
                        *seen = Some(text.clone());
                    }
                    differs && !baseline
                };

                if changed && !text.is_empty() {
                    watchers.notify(&text);
                }
            }
        });

        info!("watching system clipboard every {:?}", self.poll_interval);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClipboardError> {
        if let Some(token) = self.poller.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.cancel();
        }
        self.watchers.clear();
        Ok(())
    }

    async fn get_text(&self) -> Result<String, ClipboardError> {
        self.worker.get().await
    }

    async fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        self.remember(text);

        let mut attempt = 1;
        loop {
            match self.worker.set(text).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < SET_ATTEMPTS => {
                    warn!("clipboard write attempt {} failed: {}", attempt, err);
                    attempt += 1;
                    tokio::time::sleep(SET_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn watch(&self) -> Result<ClipboardWatcher, ClipboardError> {
        Ok(self.watchers.subscribe())
    }

    fn name(&self) -> &str {
        "system"
    }
}
