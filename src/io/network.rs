// src/io/network.rs
//
// TCP/UDP network driver.
//
// Socket kinds:
// - TCP client: connects out, reconnects sequentially after the peer closes
// - TCP server: listens and serves one peer at a time
// - UDP: binds host:udp_port, sends to host:udp_port
// - UDP multicast: joins the group, sends to group:udp_port

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::driver::{Driver, DriverContext, DriverCore, DriverEvent};
use super::error::{ConfigErrors, IoError, ValidationResult};
use super::BusType;

/// Read timeout; also the idle interval after which the aggregator flushes
const READ_IDLE_MS: u64 = 50;
const READ_CHUNK: usize = 16384;
/// Smallest accepted connect timeout / reconnect interval
const MIN_TIMEOUT_MS: u64 = 1000;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkProtocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketType {
    #[default]
    TcpClient,
    TcpServer,
    Udp,
    UdpMulticast,
}

impl SocketType {
    pub fn protocol(&self) -> NetworkProtocol {
        match self {
            SocketType::TcpClient | SocketType::TcpServer => NetworkProtocol::Tcp,
            SocketType::Udp | SocketType::UdpMulticast => NetworkProtocol::Udp,
        }
    }
}

/// Network socket configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub protocol: NetworkProtocol,
    pub socket_type: SocketType,
    pub tcp_port: u32,
    pub udp_port: u32,
    pub multicast_address: Option<String>,
    pub multicast_ttl: u32,
    pub connect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub keep_alive: bool,
    pub no_delay: bool,
    pub auto_reconnect: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            protocol: NetworkProtocol::Tcp,
            socket_type: SocketType::TcpClient,
            tcp_port: 23,
            udp_port: 53,
            multicast_address: None,
            multicast_ttl: 1,
            connect_timeout_ms: 5000,
            reconnect_interval_ms: 3000,
            keep_alive: true,
            no_delay: true,
            auto_reconnect: true,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        let mut errors = ConfigErrors::new();

        if self.host.trim().is_empty() {
            errors.push("Host address is required");
        }
        if self.socket_type.protocol() != self.protocol {
            errors.push(format!(
                "Socket type {:?} does not match protocol {:?}",
                self.socket_type, self.protocol
            ));
        }

        match self.protocol {
            NetworkProtocol::Tcp => {
                if !(1..=65535).contains(&self.tcp_port) {
                    errors.push("Valid TCP port (1-65535) is required");
                }
            }
            NetworkProtocol::Udp => {
                if !(1..=65535).contains(&self.udp_port) {
                    errors.push("Valid UDP port (1-65535) is required");
                }
            }
        }

        if self.socket_type == SocketType::UdpMulticast {
            match self.multicast_address.as_deref() {
                None | Some("") => errors.push("Multicast address is required for multicast mode"),
                Some(addr) => {
                    if parse_multicast(addr).is_none() {
                        errors.push("Invalid multicast address format");
                    }
                }
            }
        }

        if self.connect_timeout_ms < MIN_TIMEOUT_MS {
            errors.push(format!("Connection timeout must be at least {}ms", MIN_TIMEOUT_MS));
        }
        if self.reconnect_interval_ms < MIN_TIMEOUT_MS {
            errors.push(format!(
                "Reconnection interval must be at least {}ms",
                MIN_TIMEOUT_MS
            ));
        }

        errors.into_result()
    }

    /// e.g. `tcp(10.0.0.2:23)`, `udp-multicast(239.1.2.3:5000)`
    pub fn describe(&self) -> String {
        match self.socket_type {
            SocketType::TcpClient => format!("tcp({}:{})", self.host, self.tcp_port),
            SocketType::TcpServer => format!("tcp-server({}:{})", self.host, self.tcp_port),
            SocketType::Udp => format!("udp({}:{})", self.host, self.udp_port),
            SocketType::UdpMulticast => format!(
                "udp-multicast({}:{})",
                self.multicast_address.as_deref().unwrap_or("?"),
                self.udp_port
            ),
        }
    }

    fn tcp_port(&self) -> u16 {
        self.tcp_port as u16
    }

    fn udp_port(&self) -> u16 {
        self.udp_port as u16
    }
}

/// Parse an IPv4 multicast group (224.0.0.0 - 239.255.255.255)
fn parse_multicast(addr: &str) -> Option<Ipv4Addr> {
    let ip: Ipv4Addr = addr.trim().parse().ok()?;
    (224..=239).contains(&ip.octets()[0]).then_some(ip)
}

/// Snapshot of the socket state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub socket_type: SocketType,
    pub host: String,
    pub port: u16,
    pub connected: bool,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
    pub peer_attached: bool,
}

// ============================================================================
// Driver
// ============================================================================

struct NetShared {
    config: NetworkConfig,
    core: Arc<DriverCore>,
    tcp_writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    connected: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
}

impl NetShared {
    fn set_local(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = addr;
    }

    fn set_peer(&self, addr: Option<SocketAddr>) {
        *self.peer_addr.lock().unwrap_or_else(|e| e.into_inner()) = addr;
    }

    async fn attach_stream(&self, stream: TcpStream) -> tokio::net::tcp::OwnedReadHalf {
        self.set_local(stream.local_addr().ok());
        self.set_peer(stream.peer_addr().ok());
        let (reader, writer) = stream.into_split();
        *self.tcp_writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        reader
    }

    async fn detach_stream(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.tcp_writer.lock().await = None;
        self.set_peer(None);
    }
}

pub struct NetworkDriver {
    shared: Arc<NetShared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NetworkDriver {
    pub fn new(config: NetworkConfig, ctx: &DriverContext) -> Self {
        let core = DriverCore::new(config.describe(), ctx);
        NetworkDriver {
            shared: Arc::new(NetShared {
                config,
                core,
                tcp_writer: tokio::sync::Mutex::new(None),
                udp: Mutex::new(None),
                connected: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                peer_addr: Mutex::new(None),
            }),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    fn name(&self) -> &str {
        self.shared.core.name()
    }

    pub fn network_status(&self) -> NetworkStatus {
        let config = &self.shared.config;
        let port = match config.protocol {
            NetworkProtocol::Tcp => config.tcp_port(),
            NetworkProtocol::Udp => config.udp_port(),
        };
        let local = *self.shared.local_addr.lock().unwrap_or_else(|e| e.into_inner());
        let peer = *self.shared.peer_addr.lock().unwrap_or_else(|e| e.into_inner());
        NetworkStatus {
            socket_type: config.socket_type,
            host: config.host.clone(),
            port,
            connected: self.is_open(),
            local_address: local.map(|a| a.to_string()),
            remote_address: peer.map(|a| a.to_string()),
            peer_attached: peer.is_some(),
        }
    }

    async fn open_udp(&mut self) -> Result<(), IoError> {
        let config = &self.shared.config;
        let name = self.shared.core.name().to_string();

        let socket = match config.socket_type {
            SocketType::UdpMulticast => {
                let group = config
                    .multicast_address
                    .as_deref()
                    .and_then(parse_multicast)
                    .ok_or_else(|| IoError::configuration(&name, "invalid multicast address"))?;
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.udp_port()))
                    .await
                    .map_err(|e| IoError::connection(&name, format!("bind: {}", e)))?;
                socket
                    .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                    .map_err(|e| IoError::connection(&name, format!("join {}: {}", group, e)))?;
                socket
                    .set_multicast_ttl_v4(config.multicast_ttl)
                    .map_err(|e| IoError::connection(&name, format!("multicast ttl: {}", e)))?;
                socket
            }
            _ => UdpSocket::bind((config.host.as_str(), config.udp_port()))
                .await
                .map_err(|e| IoError::connection(&name, format!("bind: {}", e)))?,
        };

        let socket = Arc::new(socket);
        self.shared.set_local(socket.local_addr().ok());
        *self.shared.udp.lock().unwrap_or_else(|e| e.into_inner()) = Some(socket.clone());
        self.shared.connected.store(true, Ordering::SeqCst);
        self.task = Some(tokio::spawn(udp_loop(
            self.shared.clone(),
            socket,
            self.cancel.clone(),
        )));
        Ok(())
    }
}

#[async_trait]
impl Driver for NetworkDriver {
    fn bus_type(&self) -> BusType {
        BusType::Network
    }

    fn core(&self) -> &DriverCore {
        &self.shared.core
    }

    async fn open(&mut self) -> Result<(), IoError> {
        if self.task.is_some() {
            return Ok(());
        }
        self.shared
            .config
            .validate()
            .map_err(|e| IoError::configuration(self.name(), e.to_string()))?;
        self.cancel = CancellationToken::new();

        match self.shared.config.socket_type {
            SocketType::TcpClient => {
                let stream = connect_tcp(&self.shared.config, self.name()).await?;
                let reader = self.shared.attach_stream(stream).await;
                self.task = Some(tokio::spawn(tcp_client_loop(
                    self.shared.clone(),
                    reader,
                    self.cancel.clone(),
                )));
            }
            SocketType::TcpServer => {
                let config = &self.shared.config;
                let listener = TcpListener::bind((config.host.as_str(), config.tcp_port()))
                    .await
                    .map_err(|e| IoError::connection(self.name(), format!("bind: {}", e)))?;
                self.shared.set_local(listener.local_addr().ok());
                self.task = Some(tokio::spawn(tcp_server_loop(
                    self.shared.clone(),
                    listener,
                    self.cancel.clone(),
                )));
            }
            SocketType::Udp | SocketType::UdpMulticast => self.open_udp().await?,
        }

        self.shared.core.mark_opened();
        info!("[network] Opened {}", self.name());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IoError> {
        self.cancel.cancel();
        if let Some(handle) = self.task.take() {
            if let Err(e) = handle.await {
                warn!("[network] Socket task ended abnormally: {}", e);
            }
        }

        if let Some(mut writer) = self.shared.tcp_writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        *self.shared.udp.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.set_local(None);
        self.shared.set_peer(None);
        self.shared.core.mark_closed();
        debug!("[network] Closed {}", self.name());
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, IoError> {
        let config = &self.shared.config;
        let result = match config.protocol {
            NetworkProtocol::Tcp => {
                let mut guard = self.shared.tcp_writer.lock().await;
                let writer = guard.as_mut().ok_or_else(|| IoError::not_open(self.name()))?;
                match writer.write_all(data).await {
                    Ok(()) => writer.flush().await.map(|_| data.len()),
                    Err(e) => Err(e),
                }
            }
            NetworkProtocol::Udp => {
                let socket = self
                    .shared
                    .udp
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .ok_or_else(|| IoError::not_open(self.name()))?;
                let target = config.multicast_address.as_deref().unwrap_or(&config.host);
                socket.send_to(data, (target, config.udp_port())).await
            }
        };

        match result {
            Ok(n) => {
                self.shared.core.record_sent(n);
                Ok(n)
            }
            Err(e) => {
                self.shared.core.record_error();
                Err(IoError::write(self.name(), e.to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        match self.shared.config.socket_type {
            // Listening counts as open; writable only with a peer
            SocketType::TcpServer => self.task.is_some(),
            _ => self.shared.connected.load(Ordering::SeqCst),
        }
    }

    fn is_writable(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn validate_configuration(&self) -> ValidationResult {
        self.shared.config.validate().into()
    }
}

impl Drop for NetworkDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Socket tasks
// ============================================================================

async fn connect_tcp(config: &NetworkConfig, name: &str) -> Result<TcpStream, IoError> {
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

    let addr = lookup_host((config.host.as_str(), config.tcp_port()))
        .await
        .map_err(|e| IoError::connection(name, format!("resolve {}: {}", config.host, e)))?
        .next()
        .ok_or_else(|| IoError::connection(name, format!("no address for {}", config.host)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| IoError::connection(name, e.to_string()))?;
    socket
        .set_keepalive(config.keep_alive)
        .map_err(|e| IoError::connection(name, format!("keepalive: {}", e)))?;

    let stream = timeout(connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| IoError::timeout(name, "connect"))?
        .map_err(|e| IoError::connection(name, e.to_string()))?;
    stream
        .set_nodelay(config.no_delay)
        .map_err(|e| IoError::connection(name, format!("nodelay: {}", e)))?;
    Ok(stream)
}

enum StreamEnd {
    Stopped,
    Closed(Option<IoError>),
}

/// Read until the peer closes, an error occurs or the driver is closed.
async fn read_stream<R: AsyncRead + Unpin>(
    core: &DriverCore,
    reader: &mut R,
    cancel: &CancellationToken,
) -> StreamEnd {
    let mut buf = match core.scratch(READ_CHUNK) {
        Ok(buf) => buf,
        Err(e) => return StreamEnd::Closed(Some(e)),
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                core.flush().await;
                return StreamEnd::Stopped;
            }
            res = timeout(Duration::from_millis(READ_IDLE_MS), reader.read(&mut buf)) => match res {
                Err(_) => core.flush().await,
                Ok(Ok(0)) => {
                    core.flush().await;
                    return StreamEnd::Closed(None);
                }
                Ok(Ok(n)) => core.ingest(&buf[..n]).await,
                Ok(Err(e)) => {
                    core.flush().await;
                    return StreamEnd::Closed(Some(IoError::read(core.name(), e.to_string())));
                }
            }
        }
    }
}

async fn tcp_client_loop(
    shared: Arc<NetShared>,
    reader: tokio::net::tcp::OwnedReadHalf,
    cancel: CancellationToken,
) {
    let core = &shared.core;
    let interval = Duration::from_millis(shared.config.reconnect_interval_ms);
    let mut reader = reader;

    loop {
        let end = read_stream(core, &mut reader, &cancel).await;
        shared.detach_stream().await;

        match end {
            StreamEnd::Stopped => return,
            StreamEnd::Closed(Some(err)) => {
                warn!("[network] {}", err);
                core.emit(DriverEvent::Error(err)).await;
            }
            StreamEnd::Closed(None) => info!("[network] {} closed by peer", core.name()),
        }

        if !shared.config.auto_reconnect {
            core.mark_closed();
            core.emit(DriverEvent::Disconnected).await;
            return;
        }

        // One delayed attempt at a time, rescheduled after each failure
        reader = loop {
            core.emit(DriverEvent::Reconnecting).await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match connect_tcp(&shared.config, core.name()).await {
                Ok(stream) => break shared.attach_stream(stream).await,
                Err(e) => debug!("[network] Reconnect attempt failed: {}", e),
            }
        };

        info!("[network] Reconnected {}", core.name());
        core.discard_pending();
        core.mark_opened();
        core.emit(DriverEvent::Connected).await;
    }
}

async fn tcp_server_loop(shared: Arc<NetShared>, listener: TcpListener, cancel: CancellationToken) {
    let core = &shared.core;

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                core.emit(DriverEvent::Error(IoError::connection(
                    core.name(),
                    format!("accept: {}", e),
                )))
                .await;
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(shared.config.no_delay) {
            debug!("[network] nodelay on {}: {}", peer, e);
        }
        info!("[network] {} accepted peer {}", core.name(), peer);
        let mut reader = shared.attach_stream(stream).await;

        let end = read_stream(core, &mut reader, &cancel).await;
        shared.detach_stream().await;
        match end {
            StreamEnd::Stopped => return,
            StreamEnd::Closed(Some(err)) => core.emit(DriverEvent::Error(err)).await,
            StreamEnd::Closed(None) => info!("[network] Peer {} disconnected", peer),
        }
    }
}

async fn udp_loop(shared: Arc<NetShared>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let core = &shared.core;
    let mut buf = match core.scratch(READ_CHUNK) {
        Ok(buf) => buf,
        Err(e) => {
            core.emit(DriverEvent::Error(e)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                core.flush().await;
                return;
            }
            res = timeout(Duration::from_millis(READ_IDLE_MS), socket.recv_from(&mut buf)) => match res {
                Err(_) => core.flush().await,
                Ok(Ok((n, from))) => {
                    shared.set_peer(Some(from));
                    core.ingest(&buf[..n]).await;
                }
                Ok(Err(e)) => {
                    // Connectionless: report and keep listening
                    core.emit(DriverEvent::Error(IoError::read(core.name(), e.to_string()))).await;
                }
            }
        }
    }
}
