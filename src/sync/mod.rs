//! Clipboard propagation engine
//!
//! [`SyncEngine`] ties the pieces together: discovery sightings drive the
//! dialer, local clipboard changes are broadcast to every registered peer,
//! inbound updates are applied to the clipboard, and a periodic sweep prunes
//! dead peers and reconnects to them.
//!
//! Feedback loops are broken in two ways. Updates carrying our own device id
//! are dropped, and every clipboard write stamps `last_local_update` first so
//! the change notification it may trigger falls inside the cooldown window.

pub mod dialer;
pub mod intake;
pub mod listener;
pub mod registry;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub use dialer::Dialer;
pub use intake::{Intake, PeerEvent};
pub use listener::Listener;
pub use registry::{Admission, BroadcastReport, DuplicateConnection, Peer, PeerRegistry};

use crate::clipboard::{ClipboardError, ClipboardProvider, ClipboardWatcher};
use crate::config::Config;
use crate::discovery::{DiscoveredDevice, Discovery};
use crate::transport::codec;
use crate::transport::{
    ChannelFactory, ConnectionId, ConnectionState, Direction, HandshakeError, LocalIdentity, Message, MessageKind,
    ProtocolError, TransportConfig, TransportError,
};

/// Capacity of the engine's peer event queue
const EVENT_QUEUE: usize = 256;

/// Consecutive failed redials before a device is forgotten
const MAX_FAILED_DIALS: u32 = 3;

/// Sweeps a peer may stay silent through before it is treated as dead
const MAX_SILENT_SWEEPS: u32 = 3;

const MAX_DISCOVERY_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("clipboard error: {0}")]
    Clipboard(#[from] ClipboardError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("clipboard content of {size} bytes exceeds the {max} byte limit")]
    ContentTooLarge { size: usize, max: usize },

    #[error("sync engine already started")]
    AlreadyStarted,
}

/// Runtime parameters of a [`SyncEngine`]
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub device_id: String,
    pub listen_addr: SocketAddr,
    pub transport: TransportConfig,
    pub cooldown: Duration,
    pub sweep_interval: Duration,
    pub max_content_size: usize,
    /// First delay when discovery is unavailable; doubles up to a minute
    pub discovery_retry: Duration,
}

impl EngineSettings {
    pub fn new(device_id: impl Into<String>, listen_addr: SocketAddr) -> Self {
        let sync = crate::config::SyncConfig::default();
        Self {
            device_id: device_id.into(),
            listen_addr,
            transport: TransportConfig::default(),
            cooldown: sync.cooldown(),
            sweep_interval: sync.sweep_interval(),
            max_content_size: sync.max_content_size,
            discovery_retry: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &Config, device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port)),
            transport: config.network.transport_config(),
            cooldown: config.sync.cooldown(),
            sweep_interval: config.sync.sweep_interval(),
            max_content_size: config.sync.max_content_size,
            discovery_retry: Duration::from_secs(1),
        }
    }
}

/// What the engine knows about a remote device
///
/// Devices never seen, or forgotten after a goodbye, are `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unknown,
    Dialing,
    Connected,
    Lost,
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    state: DeviceState,
    /// Last known listener address
    address: Option<SocketAddr>,
    failed_dials: u32,
}

impl DeviceEntry {
    fn new() -> Self {
        Self {
            state: DeviceState::Unknown,
            address: None,
            failed_dials: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    local_broadcasts: AtomicU64,
    suppressed: AtomicU64,
    remote_applied: AtomicU64,
    echoes_dropped: AtomicU64,
    rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counters since start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Local changes sent to peers
    pub local_broadcasts: u64,
    /// Local changes dropped inside the cooldown window
    pub suppressed: u64,
    /// Remote updates written to the clipboard
    pub remote_applied: u64,
    /// Updates that carried our own device id
    pub echoes_dropped: u64,
    /// Oversized updates and unknown message kinds
    pub rejected: u64,
}

/// How an inbound clipboard update was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    Echo,
}

/// Result of one liveness sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub pruned: Vec<String>,
    pub redialed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub device_id: String,
    pub address: SocketAddr,
    pub direction: Direction,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub device_id: String,
    pub listen_addr: Option<SocketAddr>,
    pub peers: Vec<PeerStatus>,
    pub devices: Vec<(String, DeviceState)>,
    pub stats: SyncStats,
}

struct Inner {
    settings: EngineSettings,
    clipboard: Arc<dyn ClipboardProvider>,
    discovery: Arc<dyn Discovery>,
    factory: Arc<dyn ChannelFactory>,
    registry: PeerRegistry,
    devices: Mutex<HashMap<String, DeviceEntry>>,
    last_local_update: Mutex<Option<Instant>>,
    /// Pings sent on each connection since it last delivered a frame
    unanswered: Mutex<HashMap<ConnectionId, u32>>,
    counters: Counters,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
    dialer: OnceLock<Dialer>,
    listen_addr: OnceLock<SocketAddr>,
}

/// Peer clipboard synchronization engine
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        settings: EngineSettings,
        clipboard: Arc<dyn ClipboardProvider>,
        discovery: Arc<dyn Discovery>,
        factory: Arc<dyn ChannelFactory>,
    ) -> Self {
        let registry = PeerRegistry::new(settings.device_id.clone());
        Self {
            inner: Arc::new(Inner {
                settings,
                clipboard,
                discovery,
                factory,
                registry,
                devices: Mutex::new(HashMap::new()),
                last_local_update: Mutex::new(None),
                unanswered: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                started: AtomicBool::new(false),
                dialer: OnceLock::new(),
                listen_addr: OnceLock::new(),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.settings.device_id
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    /// Bound listener address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listen_addr.get().copied()
    }

    pub fn stats(&self) -> SyncStats {
        let c = &self.inner.counters;
        SyncStats {
            local_broadcasts: c.local_broadcasts.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            remote_applied: c.remote_applied.load(Ordering::Relaxed),
            echoes_dropped: c.echoes_dropped.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    pub async fn device_state(&self, device_id: &str) -> DeviceState {
        self.inner
            .devices
            .lock()
            .await
            .get(device_id)
            .map_or(DeviceState::Unknown, |entry| entry.state)
    }

    /// Bind the listener and start every background task
    ///
    /// Returns the bound address. A bind failure is the only network error
    /// that aborts startup.
    pub async fn start(&self) -> Result<SocketAddr, SyncError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyStarted);
        }

        let inner = &self.inner;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let intake = Intake::new(
            inner.registry.clone(),
            events_tx,
            inner.tasks.clone(),
            inner.shutdown.clone(),
        );

        let listener = Listener::bind(
            inner.settings.listen_addr,
            inner.factory.clone(),
            inner.settings.transport.clone(),
            intake.clone(),
        )
        .await?;
        let local_addr = listener.local_addr();

        let identity = Arc::new(LocalIdentity::new(
            inner.settings.device_id.clone(),
            local_addr.port(),
        ));
        let dialer = Dialer::new(
            inner.factory.clone(),
            identity.clone(),
            inner.settings.transport.clone(),
            intake,
        );
        // Both cells are empty: `started` admits a single caller
        let _ = inner.dialer.set(dialer);
        let _ = inner.listen_addr.set(local_addr);

        inner.clipboard.start().await?;
        let watcher = inner.clipboard.watch().await?;

        inner.tasks.spawn(listener.run(identity));
        inner.tasks.spawn(self.clone().dispatch_loop(events_rx));
        inner.tasks.spawn(self.clone().local_change_loop(watcher));
        inner.tasks.spawn(self.clone().discovery_loop(local_addr.port()));
        inner.tasks.spawn(self.clone().sweep_loop());

        info!(
            device = %inner.settings.device_id,
            clipboard = inner.clipboard.name(),
            "sync engine started on {}",
            local_addr
        );
        Ok(local_addr)
    }

    /// Say goodbye to every peer, stop all tasks and wait for them
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("shutting down sync engine");

        let peers = self.inner.registry.drain_all().await;
        let bye = Message::device_bye(self.device_id());
        for peer in &peers {
            peer.connection.drain(bye.clone());
        }
        let flushed = futures_util::future::join_all(peers.iter().map(|peer| peer.connection.closed()));
        if tokio::time::timeout(self.inner.settings.transport.write_timeout, flushed)
            .await
            .is_err()
        {
            warn!("some peers did not flush their goodbye in time");
        }

        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        if let Err(err) = self.inner.discovery.unregister().await {
            warn!("failed to unregister from discovery: {}", err);
        }
        if let Err(err) = self.inner.clipboard.stop().await {
            warn!("failed to stop clipboard watcher: {}", err);
        }
        info!("sync engine stopped");
    }

    /// Broadcast a local clipboard change unless it falls in the cooldown
    ///
    /// Returns `None` when the change was not sent.
    pub async fn publish_local_change(&self, text: String) -> Option<BroadcastReport> {
        if text.is_empty() {
            return None;
        }
        let max = self.inner.settings.max_content_size;
        if text.len() > max {
            warn!("not syncing clipboard text of {} bytes (limit {})", text.len(), max);
            bump(&self.inner.counters.rejected);
            return None;
        }

        // Escaping can grow the body well past the raw text length
        let message = Message::clipboard_update(self.device_id(), text);
        if let Err(err) = codec::encode(&message, self.inner.settings.transport.max_frame_size) {
            warn!("not syncing clipboard text of {} bytes: {}", message.content_len(), err);
            bump(&self.inner.counters.rejected);
            return None;
        }

        {
            let now = Instant::now();
            let mut last = self.inner.last_local_update.lock().await;
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.inner.settings.cooldown {
                    debug!("local change inside cooldown, not broadcasting");
                    bump(&self.inner.counters.suppressed);
                    return None;
                }
            }
            *last = Some(now);
        }

        let report = self.inner.registry.broadcast(&message).await;
        bump(&self.inner.counters.local_broadcasts);
        info!(
            delivered = report.delivered.len(),
            skipped = report.skipped.len(),
            "broadcast clipboard update of {} bytes",
            message.content_len()
        );
        Some(report)
    }

    /// Apply a clipboard update received from `source`
    pub async fn apply_remote(&self, source: &str, message: Message) -> Result<RemoteOutcome, SyncError> {
        if message.device_id == self.device_id() {
            debug!("dropping our own update echoed by {}", source);
            bump(&self.inner.counters.echoes_dropped);
            return Ok(RemoteOutcome::Echo);
        }

        let content = message
            .content
            .ok_or(SyncError::Protocol(ProtocolError::MissingField("content")))?;
        let max = self.inner.settings.max_content_size;
        if content.len() > max {
            bump(&self.inner.counters.rejected);
            return Err(SyncError::ContentTooLarge {
                size: content.len(),
                max,
            });
        }

        // Stamp first so the provider's own change notification is suppressed
        *self.inner.last_local_update.lock().await = Some(Instant::now());
        self.inner.clipboard.set_text(&content).await?;
        bump(&self.inner.counters.remote_applied);
        info!(device = %source, "applied clipboard update of {} bytes", content.len());

        if let Some(message_id) = message.message_id {
            self.reply(source, Message::ack(self.device_id(), message_id))
                .await;
        }
        Ok(RemoteOutcome::Applied)
    }

    /// React to a discovery sighting
    pub async fn handle_discovered(&self, device: DiscoveredDevice) {
        if device.device_id == self.device_id() {
            return;
        }
        let addr = device.socket_addr();
        let connected = self.inner.registry.contains(&device.device_id).await;

        {
            let mut devices = self.inner.devices.lock().await;
            let entry = devices
                .entry(device.device_id.clone())
                .or_insert_with(DeviceEntry::new);
            entry.address = Some(addr);

            if connected {
                entry.state = DeviceState::Connected;
                return;
            }
            if entry.state == DeviceState::Dialing {
                return;
            }
            entry.state = DeviceState::Dialing;
        }

        debug!(device = %device.device_id, %addr, "discovered device");
        self.spawn_dial(device.device_id, addr);
    }

    /// Prune dead peers, ping live ones and redial lost devices
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let handshake_limit = self.inner.settings.transport.handshake_timeout;

        let peers = self.inner.registry.snapshot().await;
        let silent: Vec<ConnectionId> = {
            let mut unanswered = self.inner.unanswered.lock().await;
            unanswered.retain(|id, _| peers.iter().any(|peer| peer.connection.id() == *id));
            peers
                .iter()
                .map(|peer| peer.connection.id())
                .filter(|id| unanswered.get(id).is_some_and(|&missed| missed >= MAX_SILENT_SWEEPS))
                .collect()
        };

        for peer in peers {
            let stuck = peer.state() == ConnectionState::Handshaking
                && (Utc::now() - peer.connection.established_at())
                    .to_std()
                    .is_ok_and(|age| age > handshake_limit);
            let quiet = silent.contains(&peer.connection.id());

            if peer.connection.is_alive() && !stuck && !quiet {
                match peer.connection.send(Message::ping(self.device_id())) {
                    Ok(()) => {
                        *self
                            .inner
                            .unanswered
                            .lock()
                            .await
                            .entry(peer.connection.id())
                            .or_insert(0) += 1;
                    }
                    Err(err) => debug!(device = %peer.device_id, "cannot ping: {}", err),
                }
                report.pinged += 1;
                continue;
            }
            if quiet {
                info!(device = %peer.device_id, "no reply to {} pings", MAX_SILENT_SWEEPS);
            }

            if let Some(removed) = self
                .inner
                .registry
                .remove_connection(&peer.device_id, peer.connection.id())
                .await
            {
                removed.connection.close();
                info!(device = %removed.device_id, "pruned dead peer");
                self.mark_lost(&removed.device_id, removed.reconnect_addr)
                    .await;
                report.pruned.push(removed.device_id);
            }
        }

        let connected = self.inner.registry.device_ids().await;
        let targets: Vec<(String, SocketAddr)> = {
            let mut devices = self.inner.devices.lock().await;
            let mut targets = Vec::new();
            for (device_id, entry) in devices.iter_mut() {
                let stale = entry.state == DeviceState::Connected && !connected.contains(device_id);
                if entry.state != DeviceState::Lost && !stale {
                    continue;
                }
                entry.state = DeviceState::Lost;
                if let Some(addr) = entry.address {
                    entry.state = DeviceState::Dialing;
                    targets.push((device_id.clone(), addr));
                }
            }
            targets
        };

        for (device_id, addr) in targets {
            info!(device = %device_id, %addr, "reconnecting");
            report.redialed.push(device_id.clone());
            self.spawn_dial(device_id, addr);
        }

        report
    }

    pub async fn status(&self) -> EngineStatus {
        let peers = self
            .inner
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|peer| PeerStatus {
                address: peer.address(),
                direction: peer.direction(),
                state: peer.state(),
                connected_at: peer.connected_at,
                device_id: peer.device_id,
            })
            .collect();

        let mut devices: Vec<(String, DeviceState)> = self
            .inner
            .devices
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state))
            .collect();
        devices.sort_by(|a, b| a.0.cmp(&b.0));

        EngineStatus {
            device_id: self.device_id().to_string(),
            listen_addr: self.local_addr(),
            peers,
            devices,
            stats: self.stats(),
        }
    }

    fn spawn_dial(&self, device_id: String, addr: SocketAddr) {
        let Some(dialer) = self.inner.dialer.get().cloned() else {
            debug!(device = %device_id, "engine not started, not dialing");
            return;
        };

        let engine = self.clone();
        self.inner.tasks.spawn(async move {
            let result = dialer.dial(&device_id, addr).await;
            engine.dial_finished(&device_id, result).await;
        });
    }

    async fn dial_finished(&self, device_id: &str, result: Result<(), HandshakeError>) {
        let err = match result {
            // The Connected event updates the device table
            Ok(()) => return,
            Err(HandshakeError::Cancelled) => return,
            Err(HandshakeError::Duplicate { .. }) => {
                debug!(device = %device_id, "already connected, dropped our dial");
                if self.inner.registry.contains(device_id).await {
                    self.set_state(device_id, DeviceState::Connected).await;
                }
                return;
            }
            Err(err) => err,
        };

        warn!(device = %device_id, "dial failed: {}", err);
        let mut devices = self.inner.devices.lock().await;
        let Some(entry) = devices.get_mut(device_id) else {
            return;
        };
        if entry.state != DeviceState::Dialing {
            return;
        }
        entry.failed_dials += 1;
        if entry.failed_dials >= MAX_FAILED_DIALS {
            info!(device = %device_id, "giving up until the device is rediscovered");
            devices.remove(device_id);
        } else {
            entry.state = DeviceState::Lost;
        }
    }

    async fn set_state(&self, device_id: &str, state: DeviceState) {
        let mut devices = self.inner.devices.lock().await;
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(DeviceEntry::new);
        entry.state = state;
        if state == DeviceState::Connected {
            entry.failed_dials = 0;
        }
    }

    async fn mark_lost(&self, device_id: &str, reconnect_addr: Option<SocketAddr>) {
        let mut devices = self.inner.devices.lock().await;
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(DeviceEntry::new);
        entry.state = DeviceState::Lost;
        if reconnect_addr.is_some() {
            entry.address = reconnect_addr;
        }
    }

    async fn forget(&self, device_id: &str) {
        self.inner.devices.lock().await.remove(device_id);
    }

    async fn reply(&self, device_id: &str, message: Message) {
        let Some(peer) = self.inner.registry.get(device_id).await else {
            return;
        };
        if let Err(err) = peer.connection.send(message) {
            debug!(device = %device_id, "cannot reply: {}", err);
        }
    }

    async fn drop_connection(&self, device_id: &str, connection_id: ConnectionId) {
        if let Some(peer) = self
            .inner
            .registry
            .remove_connection(device_id, connection_id)
            .await
        {
            peer.connection.close();
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { device_id, .. } => {
                let reconnect_addr = self
                    .inner
                    .registry
                    .get(&device_id)
                    .await
                    .and_then(|peer| peer.reconnect_addr);
                let mut devices = self.inner.devices.lock().await;
                let entry = devices.entry(device_id).or_insert_with(DeviceEntry::new);
                entry.state = DeviceState::Connected;
                entry.failed_dials = 0;
                if reconnect_addr.is_some() {
                    entry.address = reconnect_addr;
                }
            }
            PeerEvent::Message {
                device_id,
                connection_id,
                message,
            } => {
                self.inner.unanswered.lock().await.remove(&connection_id);
                self.handle_message(&device_id, connection_id, message).await
            }
            PeerEvent::Disconnected {
                device_id,
                connection_id,
            } => {
                if let Some(peer) = self
                    .inner
                    .registry
                    .remove_connection(&device_id, connection_id)
                    .await
                {
                    peer.connection.close();
                    info!(device = %device_id, "peer disconnected");
                    self.mark_lost(&device_id, peer.reconnect_addr).await;
                }
            }
        }
    }

    async fn handle_message(&self, device_id: &str, connection_id: ConnectionId, message: Message) {
        match message.kind.clone() {
            MessageKind::DeviceHello => {
                if message.device_id != device_id {
                    warn!(
                        device = %device_id,
                        "hello announced '{}', closing connection",
                        message.device_id
                    );
                    // Forget first so a concurrent sweep sees no device to redial
                    self.forget(device_id).await;
                    self.drop_connection(device_id, connection_id).await;
                } else {
                    debug!(device = %device_id, "hello received");
                }
            }
            MessageKind::ClipboardUpdate => {
                if let Err(err) = self.apply_remote(device_id, message).await {
                    warn!(device = %device_id, "rejected clipboard update: {}", err);
                }
            }
            MessageKind::Ping => {
                if let Some(message_id) = message.message_id {
                    self.reply(device_id, Message::pong(self.device_id(), message_id))
                        .await;
                }
            }
            MessageKind::Pong | MessageKind::Ack => {
                debug!(device = %device_id, "{}", message);
            }
            MessageKind::DeviceBye => {
                info!(device = %device_id, "peer said goodbye");
                self.forget(device_id).await;
                self.drop_connection(device_id, connection_id).await;
            }
            MessageKind::Unknown(tag) => {
                bump(&self.inner.counters.rejected);
                warn!(device = %device_id, "ignoring unknown message type '{}'", tag);
            }
        }
    }

    async fn dispatch_loop(self, mut events: mpsc::Receiver<PeerEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_peer_event(event).await;
        }
    }

    async fn local_change_loop(self, mut watcher: ClipboardWatcher) {
        loop {
            let event = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                event = watcher.recv() => event,
            };
            match event {
                Some(event) => {
                    self.publish_local_change(event.text).await;
                }
                None => {
                    debug!("clipboard watcher closed");
                    break;
                }
            }
        }
    }

    async fn discovery_loop(self, port: u16) {
        let base = self.inner.settings.discovery_retry;
        let mut backoff = base;
        let mut offline = false;

        loop {
            match self.inner.discovery.register(self.device_id(), port).await {
                Ok(()) => break,
                Err(err) => {
                    self.report_offline(&mut offline, &err);
                    if !self.pause(jittered(backoff)).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_DISCOVERY_BACKOFF);
                }
            }
        }
        backoff = base;

        loop {
            let mut sightings = match self.inner.discovery.browse().await {
                Ok(sightings) => sightings,
                Err(err) => {
                    self.report_offline(&mut offline, &err);
                    if !self.pause(jittered(backoff)).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_DISCOVERY_BACKOFF);
                    continue;
                }
            };
            if offline {
                info!("discovery is back");
                offline = false;
            }

            loop {
                let device = tokio::select! {
                    _ = self.inner.shutdown.cancelled() => return,
                    device = sightings.recv() => device,
                };
                match device {
                    Some(device) => {
                        backoff = base;
                        self.handle_discovered(device).await;
                    }
                    None => break,
                }
            }

            debug!("discovery stream ended, restarting");
            if !self.pause(jittered(backoff)).await {
                return;
            }
            backoff = (backoff * 2).min(MAX_DISCOVERY_BACKOFF);
        }
    }

    fn report_offline(&self, offline: &mut bool, err: &dyn std::fmt::Display) {
        if *offline {
            debug!("discovery still unavailable: {}", err);
        } else {
            warn!("discovery unavailable, running without it: {}", err);
            *offline = true;
        }
    }

    async fn sweep_loop(self) {
        let period = self.inner.settings.sweep_interval;
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.pruned.is_empty() || !report.redialed.is_empty() {
                        debug!(?report, "liveness sweep");
                    }
                }
            }
        }
    }

    /// Sleep unless shutdown comes first; false on shutdown
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// `base` plus up to 25% random jitter
fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() / 4) as u64;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}
