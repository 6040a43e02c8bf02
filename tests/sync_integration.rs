use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crossclip::clipboard::MemoryClipboard;
use crossclip::discovery::{DiscoveredDevice, Discovery, DiscoveryError};
use crossclip::sync::{DeviceState, EngineSettings, SyncEngine};
use crossclip::transport::codec::{encode, DEFAULT_MAX_FRAME_SIZE};
use crossclip::transport::{
    BoxedStream, ChannelFactory, Direction, LocalIdentity, Message, MessageCodec, MessageKind, TcpChannel,
};

/// Discovery fed by the test through a channel
struct TestDiscovery {
    sightings: Mutex<Option<mpsc::Receiver<DiscoveredDevice>>>,
}

impl TestDiscovery {
    fn new() -> (Arc<Self>, mpsc::Sender<DiscoveredDevice>) {
        let (tx, rx) = mpsc::channel(16);
        let discovery = Arc::new(Self {
            sightings: Mutex::new(Some(rx)),
        });
        (discovery, tx)
    }
}

#[async_trait]
impl Discovery for TestDiscovery {
    async fn register(&self, _: &str, _: u16) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn browse(&self) -> Result<mpsc::Receiver<DiscoveredDevice>, DiscoveryError> {
        self.sightings
            .lock()
            .unwrap()
            .take()
            .ok_or(DiscoveryError::NotRegistered)
    }

    async fn unregister(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }
}

struct Node {
    engine: SyncEngine,
    clipboard: Arc<MemoryClipboard>,
    addr: SocketAddr,
    sightings: mpsc::Sender<DiscoveredDevice>,
}

/// Channel whose accept side never finishes setting up
struct StalledAccept;

#[async_trait]
impl ChannelFactory for StalledAccept {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedStream> {
        TcpChannel.connect(addr).await
    }

    async fn accept(&self, stream: TcpStream) -> io::Result<BoxedStream> {
        std::future::pending::<()>().await;
        Ok(Box::new(stream))
    }
}

fn settings(device_id: &str) -> EngineSettings {
    let mut settings = EngineSettings::new(device_id, SocketAddr::from(([127, 0, 0, 1], 0)));
    settings.sweep_interval = Duration::from_millis(200);
    settings.discovery_retry = Duration::from_millis(50);
    settings
}

/// Settings whose sweep never fires during a test
fn quiet_settings(device_id: &str) -> EngineSettings {
    let mut settings = settings(device_id);
    settings.sweep_interval = Duration::from_secs(60);
    settings
}

async fn start_with(
    settings: EngineSettings,
    clipboard: MemoryClipboard,
    factory: Arc<dyn ChannelFactory>,
) -> Result<Node> {
    let clipboard = Arc::new(clipboard);
    let (discovery, sightings) = TestDiscovery::new();
    let engine = SyncEngine::new(settings, clipboard.clone(), discovery, factory);
    let addr = engine.start().await?;

    Ok(Node {
        engine,
        clipboard,
        addr,
        sightings,
    })
}

async fn start_node(device_id: &str, clipboard: MemoryClipboard) -> Result<Node> {
    start_with(settings(device_id), clipboard, Arc::new(TcpChannel)).await
}

/// Raw peer that has sent its hello and read the engine's
struct RawPeer {
    reader: FramedRead<tokio::net::tcp::OwnedReadHalf, MessageCodec>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl RawPeer {
    async fn connect(addr: SocketAddr, hello: Message) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        let mut peer = Self {
            reader: FramedRead::new(read_half, MessageCodec::default()),
            writer,
        };
        peer.send(&hello).await?;
        let greeting = next_message(&mut peer.reader).await?;
        assert_eq!(greeting.kind, MessageKind::DeviceHello);
        Ok(peer)
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        self.writer
            .write_all(&encode(message, DEFAULT_MAX_FRAME_SIZE)?)
            .await?;
        Ok(())
    }

    /// Next frame that is not one of the engine's own pings
    async fn reply(&mut self) -> Result<Message> {
        loop {
            let message = next_message(&mut self.reader).await?;
            if message.kind != MessageKind::Ping {
                return Ok(message);
            }
        }
    }

    /// Wait for the engine to hang up
    async fn closed(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match tokio::time::timeout_at(deadline, self.reader.next()).await? {
                None | Some(Err(_)) => return Ok(()),
                Some(Ok(_)) => continue,
            }
        }
    }
}

/// Poll `check` until it holds or five seconds pass
async fn wait_for<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(anyhow!("timed out waiting for {}", what))
}

async fn next_message<R: AsyncRead + Unpin>(reader: &mut FramedRead<R, MessageCodec>) -> Result<Message> {
    let item = tokio::time::timeout(Duration::from_secs(5), reader.next())
        .await?
        .ok_or_else(|| anyhow!("stream ended"))??;
    Ok(item?)
}

#[tokio::test]
async fn test_update_propagates_without_echo() -> Result<()> {
    let alpha = start_node("alpha", MemoryClipboard::new()).await?;
    let beta = start_node("beta", MemoryClipboard::notifying_on_set()).await?;

    alpha
        .sightings
        .send(DiscoveredDevice::new("beta", beta.addr))
        .await?;
    wait_for("both sides connected", || async {
        alpha.engine.registry().contains("beta").await && beta.engine.registry().contains("alpha").await
    })
    .await?;

    alpha.clipboard.copy("hello from alpha");
    wait_for("beta to apply the update", || async {
        beta.clipboard.contents() == "hello from alpha"
    })
    .await?;

    // Beta's clipboard write fires a change notification that the cooldown swallows
    wait_for("beta to suppress its echo", || async {
        beta.engine.stats().suppressed == 1
    })
    .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let alpha_stats = alpha.engine.stats();
    let beta_stats = beta.engine.stats();
    assert_eq!(alpha_stats.local_broadcasts, 1);
    assert_eq!(alpha_stats.remote_applied, 0);
    assert_eq!(beta_stats.remote_applied, 1);
    assert_eq!(beta_stats.local_broadcasts, 0);

    alpha.engine.shutdown().await;
    beta.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_truncated_frame_drops_peer() -> Result<()> {
    let alpha = start_node("alpha", MemoryClipboard::new()).await?;

    let mut stream = TcpStream::connect(alpha.addr).await?;
    let hello = Message::device_hello("mallory", Default::default());
    stream.write_all(&encode(&hello, DEFAULT_MAX_FRAME_SIZE)?).await?;

    wait_for("mallory to register", || async {
        alpha.engine.registry().contains("mallory").await
    })
    .await?;

    // Declares 100 bytes, delivers 10, then hangs up
    stream.write_all(&100u32.to_be_bytes()).await?;
    stream.write_all(b"{\"type\":\"c").await?;
    stream.shutdown().await?;

    wait_for("mallory to be removed", || async {
        !alpha.engine.registry().contains("mallory").await
            && alpha.engine.device_state("mallory").await == DeviceState::Lost
    })
    .await?;

    alpha.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_simultaneous_dial_keeps_one_connection() -> Result<()> {
    let alpha = start_node("alpha", MemoryClipboard::new()).await?;
    let beta = start_node("beta", MemoryClipboard::new()).await?;

    tokio::join!(
        alpha
            .engine
            .handle_discovered(DiscoveredDevice::new("beta", beta.addr)),
        beta.engine
            .handle_discovered(DiscoveredDevice::new("alpha", alpha.addr)),
    );

    let (a_engine, b_engine) = (&alpha.engine, &beta.engine);
    let converged = move || async move {
        let (Some(a), Some(b)) = (
            a_engine.registry().get("beta").await,
            b_engine.registry().get("alpha").await,
        ) else {
            return false;
        };
        a_engine.registry().len().await == 1
            && b_engine.registry().len().await == 1
            && a.connection.is_alive()
            && b.connection.is_alive()
            && a.direction() != b.direction()
    };
    wait_for("a single connection per side", converged).await?;

    // Survives the sweep and any redials it triggers
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(converged().await);

    // The smaller id's dial is the one that survives
    let kept = alpha.engine.registry().get("beta").await.unwrap();
    assert_eq!(kept.direction(), Direction::Outbound);

    alpha.clipboard.copy("after the race");
    wait_for("beta to apply the update", || async {
        beta.clipboard.contents() == "after the race"
    })
    .await?;

    alpha.engine.shutdown().await;
    beta.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_lost_peer_is_redialed() -> Result<()> {
    let alpha = start_node("alpha", MemoryClipboard::new()).await?;
    let fake_listener = TcpListener::bind("127.0.0.1:0").await?;
    let fake_port = fake_listener.local_addr()?.port();

    let stream = TcpStream::connect(alpha.addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let hello = LocalIdentity::new("mallory", fake_port).hello();
    write_half
        .write_all(&encode(&hello, DEFAULT_MAX_FRAME_SIZE)?)
        .await?;

    wait_for("mallory to register", || async {
        alpha.engine.registry().contains("mallory").await
    })
    .await?;

    drop(read_half);
    drop(write_half);

    let (redial, _) = tokio::time::timeout(Duration::from_secs(5), fake_listener.accept()).await??;
    let mut reader = FramedRead::new(redial, MessageCodec::default());
    let greeting = next_message(&mut reader).await?;
    assert_eq!(greeting.kind, MessageKind::DeviceHello);
    assert_eq!(greeting.device_id, "alpha");

    alpha.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_says_goodbye() -> Result<()> {
    let alpha = start_node("alpha", MemoryClipboard::new()).await?;

    let stream = TcpStream::connect(alpha.addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let hello = Message::device_hello("mallory", Default::default());
    write_half
        .write_all(&encode(&hello, DEFAULT_MAX_FRAME_SIZE)?)
        .await?;

    let mut reader = FramedRead::new(read_half, MessageCodec::default());
    let greeting = next_message(&mut reader).await?;
    assert_eq!(greeting.kind, MessageKind::DeviceHello);

    alpha.engine.shutdown().await;

    // Sweep pings may be queued ahead of the goodbye
    let bye = loop {
        let message = next_message(&mut reader).await?;
        if message.kind != MessageKind::Ping {
            break message;
        }
    };
    assert_eq!(bye.kind, MessageKind::DeviceBye);
    assert_eq!(bye.device_id, "alpha");
    Ok(())
}

#[tokio::test]
async fn test_escaped_text_too_big_for_a_frame_is_not_sent() -> Result<()> {
    let alpha = start_node("alpha", MemoryClipboard::new()).await?;
    let beta = start_node("beta", MemoryClipboard::new()).await?;

    alpha
        .sightings
        .send(DiscoveredDevice::new("beta", beta.addr))
        .await?;
    wait_for("both sides connected", || async {
        alpha.engine.registry().contains("beta").await && beta.engine.registry().contains("alpha").await
    })
    .await?;

    // Fits the content limit raw, but each control byte escapes to six
    let report = alpha
        .engine
        .publish_local_change("\u{1}".repeat(200_000))
        .await;
    assert!(report.is_none());
    assert_eq!(alpha.engine.stats().rejected, 1);
    assert_eq!(alpha.engine.stats().local_broadcasts, 0);

    // Doubles when escaped and still fits
    let quoted = "\"".repeat(400_000);
    let report = alpha
        .engine
        .publish_local_change(quoted.clone())
        .await
        .ok_or_else(|| anyhow!("quoted text was not sent"))?;
    assert_eq!(report.delivered, vec!["beta".to_string()]);

    wait_for("beta to apply the quoted text", || async {
        beta.clipboard.contents() == quoted
    })
    .await?;
    assert_eq!(beta.engine.stats().remote_applied, 1);

    alpha.engine.shutdown().await;
    beta.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_kind_is_counted_and_ignored() -> Result<()> {
    let alpha = start_with(quiet_settings("alpha"), MemoryClipboard::new(), Arc::new(TcpChannel)).await?;
    let mut mallory = RawPeer::connect(alpha.addr, Message::device_hello("mallory", Default::default())).await?;

    mallory
        .send(&Message::new(MessageKind::from("file_offer".to_string()), "mallory"))
        .await?;
    wait_for("the frame to be rejected", || async {
        alpha.engine.stats().rejected == 1
    })
    .await?;

    // Still usable afterwards
    let ping = Message::ping("mallory");
    mallory.send(&ping).await?;
    let pong = mallory.reply().await?;
    assert_eq!(pong.kind, MessageKind::Pong);
    assert!(alpha.engine.registry().contains("mallory").await);

    alpha.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_ping_is_answered_with_matching_pong() -> Result<()> {
    let alpha = start_with(quiet_settings("alpha"), MemoryClipboard::new(), Arc::new(TcpChannel)).await?;
    let mut mallory = RawPeer::connect(alpha.addr, Message::device_hello("mallory", Default::default())).await?;

    let ping = Message::ping("mallory");
    mallory.send(&ping).await?;

    let pong = mallory.reply().await?;
    assert_eq!(pong.kind, MessageKind::Pong);
    assert_eq!(pong.device_id, "alpha");
    assert_eq!(pong.message_id, ping.message_id);

    alpha.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_applied_update_is_acked() -> Result<()> {
    let alpha = start_with(quiet_settings("alpha"), MemoryClipboard::new(), Arc::new(TcpChannel)).await?;
    let mut mallory = RawPeer::connect(alpha.addr, Message::device_hello("mallory", Default::default())).await?;

    let update = Message::clipboard_update("mallory", "from a raw peer");
    mallory.send(&update).await?;

    let ack = mallory.reply().await?;
    assert_eq!(ack.kind, MessageKind::Ack);
    assert_eq!(ack.message_id, update.message_id);
    assert_eq!(alpha.clipboard.contents(), "from a raw peer");
    assert_eq!(alpha.engine.stats().remote_applied, 1);

    alpha.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_goodbye_forgets_device() -> Result<()> {
    let alpha = start_node("alpha", MemoryClipboard::new()).await?;
    let fake_listener = TcpListener::bind("127.0.0.1:0").await?;
    let hello = LocalIdentity::new("mallory", fake_listener.local_addr()?.port()).hello();
    let mut mallory = RawPeer::connect(alpha.addr, hello).await?;

    wait_for("mallory to be connected", || async {
        alpha.engine.device_state("mallory").await == DeviceState::Connected
    })
    .await?;

    mallory.send(&Message::device_bye("mallory")).await?;
    mallory.closed().await?;

    wait_for("mallory to be forgotten", || async {
        !alpha.engine.registry().contains("mallory").await
            && alpha.engine.device_state("mallory").await == DeviceState::Unknown
    })
    .await?;

    // Several sweeps pass without a redial to the advertised port
    let redial = tokio::time::timeout(Duration::from_millis(700), fake_listener.accept()).await;
    assert!(redial.is_err());
    assert_eq!(alpha.engine.device_state("mallory").await, DeviceState::Unknown);

    alpha.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_dialed_hello_from_other_device_is_dropped() -> Result<()> {
    let alpha = start_with(quiet_settings("alpha"), MemoryClipboard::new(), Arc::new(TcpChannel)).await?;
    let fake_listener = TcpListener::bind("127.0.0.1:0").await?;
    let fake_addr = fake_listener.local_addr()?;

    alpha
        .engine
        .handle_discovered(DiscoveredDevice::new("mallory", fake_addr))
        .await;

    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), fake_listener.accept()).await??;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, MessageCodec::default());
    let greeting = next_message(&mut reader).await?;
    assert_eq!(greeting.device_id, "alpha");

    let hello = Message::device_hello("impostor", Default::default());
    write_half
        .write_all(&encode(&hello, DEFAULT_MAX_FRAME_SIZE)?)
        .await?;

    // Alpha hangs up
    let end = tokio::time::timeout(Duration::from_secs(5), reader.next()).await?;
    assert!(!matches!(end, Some(Ok(Ok(_)))));

    wait_for("mallory to be forgotten", || async {
        !alpha.engine.registry().contains("mallory").await
            && alpha.engine.device_state("mallory").await == DeviceState::Unknown
    })
    .await?;

    alpha.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_silent_peer_is_pruned() -> Result<()> {
    let mut settings = settings("alpha");
    settings.sweep_interval = Duration::from_millis(100);
    let alpha = start_with(settings, MemoryClipboard::new(), Arc::new(TcpChannel)).await?;

    // Reads nothing and answers nothing, but keeps the socket open
    let mut mallory = RawPeer::connect(alpha.addr, Message::device_hello("mallory", Default::default())).await?;
    wait_for("mallory to register", || async {
        alpha.engine.registry().contains("mallory").await
    })
    .await?;

    wait_for("mallory to be pruned", || async {
        !alpha.engine.registry().contains("mallory").await
            && alpha.engine.device_state("mallory").await == DeviceState::Lost
    })
    .await?;
    mallory.closed().await?;

    alpha.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_peer_answering_pings_is_kept() -> Result<()> {
    let mut settings = settings("alpha");
    settings.sweep_interval = Duration::from_millis(100);
    let alpha = start_with(settings, MemoryClipboard::new(), Arc::new(TcpChannel)).await?;

    let mut mallory = RawPeer::connect(alpha.addr, Message::device_hello("mallory", Default::default())).await?;
    let responder = tokio::spawn(async move {
        while let Ok(ping) = next_message(&mut mallory.reader).await {
            if let (MessageKind::Ping, Some(id)) = (&ping.kind, ping.message_id) {
                if mallory.send(&Message::pong("mallory", id)).await.is_err() {
                    break;
                }
            }
        }
    });

    // Well past three unanswered sweeps
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(alpha.engine.registry().contains("mallory").await);
    assert_eq!(alpha.engine.device_state("mallory").await, DeviceState::Connected);

    alpha.engine.shutdown().await;
    responder.abort();
    Ok(())
}

#[tokio::test]
async fn test_stalled_channel_setup_times_out() -> Result<()> {
    let mut settings = settings("alpha");
    settings.transport.handshake_timeout = Duration::from_millis(100);
    let alpha = start_with(settings, MemoryClipboard::new(), Arc::new(StalledAccept)).await?;

    let mut stream = TcpStream::connect(alpha.addr).await?;
    let hello = Message::device_hello("mallory", Default::default());
    stream.write_all(&encode(&hello, DEFAULT_MAX_FRAME_SIZE)?).await?;

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await?;
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(!alpha.engine.registry().contains("mallory").await);

    alpha.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_interrupts_stalled_channel_setup() -> Result<()> {
    let mut settings = settings("alpha");
    settings.transport.handshake_timeout = Duration::from_secs(60);
    let alpha = start_with(settings, MemoryClipboard::new(), Arc::new(StalledAccept)).await?;

    let _stream = TcpStream::connect(alpha.addr).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(2), alpha.engine.shutdown()).await?;
    Ok(())
}
