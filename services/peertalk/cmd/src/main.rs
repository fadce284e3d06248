//! Peertalk node binary.
//!
//! Runs the transport engine over POSIX sockets: UDP broadcast for peer
//! discovery, TCP for the reliable transport, and a second UDP socket
//! for unreliable datagrams. A tokio interval drives the engine's poll
//! loop; network readers run as tasks feeding one channel back into the
//! loop that owns the engine.

use clap::Parser;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use peertalk_engine::{Engine, EngineEvent, Platform, PlatformError};
use peertalk_peer::{PeerId, PeerState};
use peertalk_wire::DiscoveryPacket;

mod config;
mod logging;

use config::PeertalkConfig;
use logging::PeertalkLogFormatter;

// Component logging macros are defined in logging.rs and available via #[macro_export]

/// Peer-to-peer message transport node
#[derive(Parser, Debug)]
#[command(name = "peertalk", version, about = "Peer-to-peer message transport node")]
struct Args {
    /// Node name announced to peers (overrides config file)
    #[arg(long)]
    name: Option<String>,

    /// TCP port for reliable transport (overrides config file)
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP port for unreliable datagrams (overrides config file)
    #[arg(long)]
    udp_port: Option<u16>,

    /// UDP port for discovery broadcasts (overrides config file)
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Connect directly to a peer, e.g. 127.0.0.1:7354 (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Engine poll interval, e.g. 20ms
    #[arg(long, default_value = "20ms")]
    poll_interval: humantime::Duration,

    /// Discovery announce interval, e.g. 5s
    #[arg(long, default_value = "5s")]
    announce_interval: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "peertalk.yaml")]
    config: PathBuf,
}

/// Connection state shared between the engine's platform and the main loop
#[derive(Default)]
struct PlatformShared {
    /// Per-peer TCP writer channels
    writers: HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>,
    /// Per-peer datagram destinations
    datagram_targets: HashMap<PeerId, SocketAddr>,
}

/// Socket-backed transport handed to the engine
struct NodePlatform {
    started: Instant,
    udp: Arc<UdpSocket>,
    shared: Arc<Mutex<PlatformShared>>,
}

impl Platform for NodePlatform {
    fn send(&mut self, peer: PeerId, bytes: &[u8]) -> Result<(), PlatformError> {
        let shared = self.shared.lock().map_err(|_| PlatformError::Closed)?;
        match shared.writers.get(&peer) {
            Some(tx) => tx.send(bytes.to_vec()).map_err(|_| PlatformError::Closed),
            None => Err(PlatformError::Closed),
        }
    }

    fn send_unreliable(&mut self, peer: PeerId, bytes: &[u8]) -> Result<(), PlatformError> {
        let target = {
            let shared = self.shared.lock().map_err(|_| PlatformError::Closed)?;
            shared.datagram_targets.get(&peer).copied()
        };
        let target = target.ok_or(PlatformError::Unsupported)?;
        match self.udp.try_send_to(bytes, target) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                Err(PlatformError::WouldBlock)
            }
            Err(err) => Err(PlatformError::Transport(err.to_string())),
        }
    }

    fn ticks(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }
}

/// Network activity fed back into the loop that owns the engine
enum NetMsg {
    Discovery { from: SocketAddr, packet: Bytes },
    Datagram { from: SocketAddr, payload: Bytes },
    Accepted { stream: TcpStream },
    Dialed { addr: SocketAddr, stream: TcpStream },
    DialFailed { addr: SocketAddr },
    TcpData { peer: PeerId, chunk: Bytes },
    TcpClosed { peer: PeerId },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing with the custom component formatter
    let env_filter = EnvFilter::new("info")
        .add_directive(format!("peertalk={}", args.log_level).parse()?)
        .add_directive(format!("peertalk_engine={}", args.log_level).parse()?)
        .add_directive(format!("peertalk_peer={}", args.log_level).parse()?)
        .add_directive(format!("peertalk_queue={}", args.log_level).parse()?)
        .add_directive(format!("peertalk_wire={}", args.log_level).parse()?);

    let formatter = PeertalkLogFormatter::new("peertalk".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting peertalk node v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = PeertalkConfig::load_from_file(&args.config)?;
    if let Some(name) = args.name {
        node_config.name = name;
    }
    if let Some(port) = args.tcp_port {
        node_config.tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        node_config.udp_port = port;
    }
    if let Some(port) = args.discovery_port {
        node_config.discovery_port = port;
    }

    let (net_tx, mut net_rx) = mpsc::unbounded_channel::<NetMsg>();

    // Discovery socket: broadcast announces, receive announces and queries
    let discovery = Arc::new(
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, node_config.discovery_port)).await?,
    );
    discovery.set_broadcast(true)?;
    let broadcast_addr =
        SocketAddr::from((Ipv4Addr::BROADCAST, node_config.discovery_port));
    {
        let socket = Arc::clone(&discovery);
        let tx = net_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let packet = Bytes::copy_from_slice(&buf[..n]);
                        if tx.send(NetMsg::Discovery { from, packet }).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("discovery socket receive failed: {}", err);
                        break;
                    }
                }
            }
        });
    }

    // Datagram socket: unreliable transport, shared with the platform
    let udp = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, node_config.udp_port)).await?);
    {
        let socket = Arc::clone(&udp);
        let tx = net_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let payload = Bytes::copy_from_slice(&buf[..n]);
                        if tx.send(NetMsg::Datagram { from, payload }).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("datagram socket receive failed: {}", err);
                        break;
                    }
                }
            }
        });
    }

    // TCP listener for the reliable transport
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, node_config.tcp_port)).await?;
    {
        let tx = net_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if tx.send(NetMsg::Accepted { stream }).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("accept failed: {}", err);
                    }
                }
            }
        });
    }

    let shared = Arc::new(Mutex::new(PlatformShared::default()));
    let platform = NodePlatform {
        started: Instant::now(),
        udp: Arc::clone(&udp),
        shared: Arc::clone(&shared),
    };

    let mut engine = Engine::new(node_config.engine_config(), Box::new(platform))?;
    let node_name = node_config.name.clone();

    component_info!(
        "node",
        "Listening: tcp={}, udp={}, discovery={}",
        node_config.tcp_port,
        node_config.udp_port,
        node_config.discovery_port
    );

    // Dial any peers named on the command line
    for addr in &args.connect {
        let id = engine.discover_peer(*addr, "")?;
        engine.connect_peer(id)?;
        dial(*addr, net_tx.clone());
    }

    let mut poll_interval = tokio::time::interval(args.poll_interval.into());
    let mut announce_interval = tokio::time::interval(args.announce_interval.into());
    let mut read_buffers: HashMap<PeerId, BytesMut> = HashMap::new();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, announcing goodbye");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, announcing goodbye");
                break;
            }
            _ = poll_interval.tick() => {
                for event in engine.poll() {
                    handle_event(
                        &mut engine,
                        event,
                        &node_name,
                        &shared,
                        &discovery,
                        &net_tx,
                        &mut read_buffers,
                    );
                }
            }
            _ = announce_interval.tick() => {
                match engine.announce_packet() {
                    Ok(packet) => {
                        if let Err(err) = discovery.try_send_to(&packet, broadcast_addr) {
                            debug!("announce broadcast failed: {}", err);
                        }
                    }
                    Err(err) => warn!("could not build announce packet: {}", err),
                }
            }
            Some(msg) = net_rx.recv() => {
                handle_net_msg(
                    msg,
                    &mut engine,
                    &node_name,
                    &shared,
                    &net_tx,
                    &mut read_buffers,
                );
            }
        }
    }

    // Best-effort goodbye so peers drop us before their timeout fires
    if let Ok(packet) = engine.goodbye_packet() {
        let _ = discovery.try_send_to(&packet, broadcast_addr);
    }
    for peer in engine.peers().iter_live().map(|p| p.id()).collect::<Vec<_>>() {
        let _ = engine.disconnect(peer);
    }
    info!("Peertalk node stopped");

    Ok(())
}

/// Spawn an outbound connection attempt
fn dial(addr: SocketAddr, tx: mpsc::UnboundedSender<NetMsg>) {
    tokio::spawn(async move {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = tx.send(NetMsg::Dialed { addr, stream });
            }
            Err(err) => {
                debug!("dial {} failed: {}", addr, err);
                let _ = tx.send(NetMsg::DialFailed { addr });
            }
        }
    });
}

fn handle_net_msg(
    msg: NetMsg,
    engine: &mut Engine,
    node_name: &str,
    shared: &Arc<Mutex<PlatformShared>>,
    net_tx: &mpsc::UnboundedSender<NetMsg>,
    read_buffers: &mut HashMap<PeerId, BytesMut>,
) {
    match msg {
        NetMsg::Discovery { from, packet } => {
            // Broadcasts loop back; drop our own announces by name
            let mut peek = packet.clone();
            if let Ok(parsed) = DiscoveryPacket::decode(&mut peek) {
                if parsed.name == node_name {
                    return;
                }
            }
            let mut buf = packet;
            if let Err(err) = engine.handle_discovery(from, &mut buf) {
                debug!("discovery packet from {} rejected: {}", from, err);
            }
        }
        NetMsg::Datagram { from, payload } => {
            let mut buf = payload;
            if let Err(err) = engine.handle_datagram(from, &mut buf) {
                debug!("datagram from {} rejected: {}", from, err);
            }
        }
        NetMsg::Accepted { stream } => {
            let addr = match stream.peer_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    warn!("inbound connection lost before attach: {}", err);
                    return;
                }
            };
            if let Err(err) = attach_connection(engine, shared, net_tx, stream, addr, true) {
                warn!("inbound connection from {} rejected: {}", addr, err);
            }
        }
        NetMsg::Dialed { addr, stream } => {
            if let Err(err) = attach_connection(engine, shared, net_tx, stream, addr, false) {
                warn!("outbound connection to {} rejected: {}", addr, err);
            }
        }
        NetMsg::DialFailed { addr } => {
            if let Some(id) = engine.peers().find_by_addr(addr) {
                let _ = engine.peer_failed(id);
            }
        }
        NetMsg::TcpData { peer, chunk } => {
            let pending = read_buffers.entry(peer).or_default();
            pending.extend_from_slice(&chunk);
            let mut buf = pending.split().freeze();
            match engine.handle_bytes(peer, &mut buf) {
                // An incomplete trailing frame waits for the next read
                Ok(()) => pending.extend_from_slice(&buf),
                Err(err) => {
                    // A frame error poisons the byte stream; retained
                    // bytes would replay it on every read
                    warn!(
                        "protocol violation from peer {}, dropping connection: {}",
                        peer, err
                    );
                    read_buffers.remove(&peer);
                    detach_connection(shared, peer);
                    let _ = engine.peer_failed(peer);
                }
            }
        }
        NetMsg::TcpClosed { peer } => {
            component_info!("node", "Connection to peer {} closed", peer);
            read_buffers.remove(&peer);
            detach_connection(shared, peer);
            let _ = engine.peer_failed(peer);
        }
    }
}

fn handle_event(
    engine: &mut Engine,
    event: EngineEvent,
    node_name: &str,
    shared: &Arc<Mutex<PlatformShared>>,
    discovery: &Arc<UdpSocket>,
    net_tx: &mpsc::UnboundedSender<NetMsg>,
    read_buffers: &mut HashMap<PeerId, BytesMut>,
) {
    match event {
        EngineEvent::PeerDiscovered { peer } => {
            let addr = engine.peer(peer).ok().and_then(|p| p.addr());
            if let Some(addr) = addr {
                component_info!("node", "Discovered peer {} at {}", peer, addr);
                if engine.connect_peer(peer).is_ok() {
                    dial(addr, net_tx.clone());
                }
            }
        }
        EngineEvent::PeerConnected { peer } => {
            component_info!("node", "Peer {} connected", peer);
            let greeting = format!("hello from {}", node_name);
            if let Err(err) = engine.send(peer, greeting.as_bytes()) {
                debug!("greeting for peer {} not queued: {}", peer, err);
            }
        }
        EngineEvent::PeerDisconnected { peer } | EngineEvent::PeerLost { peer } => {
            component_info!("node", "Peer {} gone", peer);
            read_buffers.remove(&peer);
            detach_connection(shared, peer);
        }
        EngineEvent::MessageReceived { peer, payload } => {
            component_info!(
                "node",
                "Message from peer {}: {} bytes ({})",
                peer,
                payload.len(),
                String::from_utf8_lossy(&payload)
            );
        }
        EngineEvent::DatagramReceived { peer, payload } => {
            component_debug!(
                "node",
                "Datagram ({} bytes) from {:?}",
                payload.len(),
                peer
            );
        }
        EngineEvent::DiscoveryQuery { from } => {
            if let Ok(packet) = engine.announce_packet() {
                let _ = discovery.try_send_to(&packet, from);
            }
        }
        EngineEvent::MessageSent { peer, bytes } => {
            component_debug!("node", "Sent {} bytes to peer {}", bytes, peer);
        }
        EngineEvent::SendFailed { peer, error } => {
            component_warn!("node", "Send to peer {} failed: {}", peer, error);
        }
        EngineEvent::StreamComplete { peer, bytes } => {
            component_info!("node", "Stream to peer {} complete ({} bytes)", peer, bytes);
        }
        EngineEvent::StreamCancelled { peer, bytes_sent } => {
            component_info!(
                "node",
                "Stream to peer {} cancelled after {} bytes",
                peer,
                bytes_sent
            );
        }
        EngineEvent::StreamFailed { peer, bytes_sent, error } => {
            component_warn!(
                "node",
                "Stream to peer {} failed after {} bytes: {}",
                peer,
                bytes_sent,
                error
            );
        }
    }
}

/// Register a live TCP connection with the engine and the platform
fn attach_connection(
    engine: &mut Engine,
    shared: &Arc<Mutex<PlatformShared>>,
    net_tx: &mpsc::UnboundedSender<NetMsg>,
    stream: TcpStream,
    addr: SocketAddr,
    inbound: bool,
) -> anyhow::Result<PeerId> {
    let id = match engine.peers().find_by_addr(addr) {
        Some(id) => id,
        None if inbound => {
            // Inbound source ports are ephemeral; match the peer by address
            let by_ip = engine
                .peers()
                .iter_live()
                .find(|p| p.addr().map(|a| a.ip()) == Some(addr.ip()))
                .map(|p| p.id());
            match by_ip {
                Some(id) => id,
                None => engine.discover_peer(addr, "")?,
            }
        }
        None => engine.discover_peer(addr, "")?,
    };

    match engine.peer(id)?.state() {
        PeerState::Discovered => {
            engine.connect_peer(id)?;
            engine.peer_connected(id)?;
        }
        PeerState::Connecting => engine.peer_connected(id)?,
        PeerState::Connected => {}
        state => anyhow::bail!("peer {} in state {:?} cannot take a connection", id, state),
    }

    let (mut reader, mut writer) = stream.into_split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    {
        let mut shared = shared
            .lock()
            .map_err(|_| anyhow::anyhow!("platform state poisoned"))?;
        shared.writers.insert(id, write_tx);
        // Datagram socket sits one port above the peer's reliable port
        shared
            .datagram_targets
            .insert(id, SocketAddr::new(addr.ip(), addr.port().wrapping_add(1)));
    }

    tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            if let Err(err) = writer.write_all(&bytes).await {
                debug!("write to peer {} failed: {}", id, err);
                break;
            }
        }
    });

    let tx = net_tx.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if tx.send(NetMsg::TcpData { peer: id, chunk }).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!("read from peer {} failed: {}", id, err);
                    break;
                }
            }
        }
        let _ = tx.send(NetMsg::TcpClosed { peer: id });
    });

    Ok(id)
}

/// Drop the connection state for a peer that went away
fn detach_connection(shared: &Arc<Mutex<PlatformShared>>, peer: PeerId) {
    if let Ok(mut shared) = shared.lock() {
        shared.writers.remove(&peer);
        shared.datagram_targets.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn node_parts() -> (
        Engine,
        Arc<Mutex<PlatformShared>>,
        mpsc::UnboundedSender<NetMsg>,
        mpsc::UnboundedReceiver<NetMsg>,
    ) {
        let udp = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).await.unwrap());
        let shared = Arc::new(Mutex::new(PlatformShared::default()));
        let platform = NodePlatform {
            started: Instant::now(),
            udp,
            shared: Arc::clone(&shared),
        };
        let config = peertalk_engine::EngineConfig {
            name: "node".into(),
            ..Default::default()
        };
        let engine = Engine::new(config, Box::new(platform)).unwrap();
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        (engine, shared, net_tx, net_rx)
    }

    #[tokio::test]
    async fn test_bad_frame_drops_connection() {
        let (mut engine, shared, net_tx, _net_rx) = node_parts().await;

        let addr: SocketAddr = "127.0.0.1:7354".parse().unwrap();
        let id = engine.discover_peer(addr, "remote").unwrap();
        engine.connect_peer(id).unwrap();
        let (write_tx, _write_rx) = mpsc::unbounded_channel();
        {
            let mut shared = shared.lock().unwrap();
            shared.writers.insert(id, write_tx);
            shared.datagram_targets.insert(id, addr);
        }
        engine.peer_connected(id).unwrap();

        let mut read_buffers = HashMap::new();
        handle_net_msg(
            NetMsg::TcpData {
                peer: id,
                chunk: Bytes::from_static(b"this is not a frame"),
            },
            &mut engine,
            "node",
            &shared,
            &net_tx,
            &mut read_buffers,
        );

        // Nothing retained: the connection is gone, not wedged
        assert!(read_buffers.is_empty());
        assert!(!shared.lock().unwrap().writers.contains_key(&id));
        assert_eq!(engine.peer(id).unwrap().state(), PeerState::Failed);
    }

    #[tokio::test]
    async fn test_truncated_frame_waits_in_read_buffer() {
        let (mut engine, shared, net_tx, _net_rx) = node_parts().await;

        let addr: SocketAddr = "127.0.0.1:7354".parse().unwrap();
        let id = engine.discover_peer(addr, "remote").unwrap();
        engine.connect_peer(id).unwrap();
        let (write_tx, _write_rx) = mpsc::unbounded_channel();
        shared.lock().unwrap().writers.insert(id, write_tx);
        engine.peer_connected(id).unwrap();

        // Half a frame: the magic and nothing else
        let mut read_buffers = HashMap::new();
        handle_net_msg(
            NetMsg::TcpData {
                peer: id,
                chunk: Bytes::from_static(b"PT"),
            },
            &mut engine,
            "node",
            &shared,
            &net_tx,
            &mut read_buffers,
        );

        assert_eq!(read_buffers.get(&id).map(|b| b.len()), Some(2));
        assert!(shared.lock().unwrap().writers.contains_key(&id));
    }
}
