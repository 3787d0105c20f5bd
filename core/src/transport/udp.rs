//! Unreliable datagram transport
//!
//! [`DatagramSocket`] wraps a single unconnected, dual-stack UDP socket with
//! optional IPv6 multicast membership. [`UdpTransport`] exposes it as a
//! [`NetIo`] without any delivery guarantee, fragmentation or connection
//! concept; the reliable transport rides on the same socket type.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::config::UdpConfig;
use super::packet::{Body, Packet};
use super::{CallbackSlot, ConnStatistic, NetIo, NetPacket, TransportCallback, TransportError};
use crate::address::{EndpointAddress, HostAddress};

/// Per-datagram overhead added to the byte statistics
pub const UDP_HEADER_SIZE: u64 = 32;

/// Upper bound on datagrams collected by one `recv_batch`
const MAX_BATCH: usize = 256;

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

fn bind_family(domain: Domain, port: u16, config: &UdpConfig) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    let any = if domain == Domain::IPV6 {
        socket.set_only_v6(false)?;
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
    };
    if config.reuse_address {
        socket.set_reuse_address(true)?;
    }
    if let Err(e) = socket.bind(&any.into()) {
        if port == 0 || e.kind() != io::ErrorKind::AddrInUse {
            return Err(e);
        }
        tracing::warn!("UDP port {} in use, binding an automatic port", port);
        let mut auto = any;
        auto.set_port(0);
        socket.bind(&auto.into())?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[derive(Debug, Clone, Copy)]
struct Membership {
    group: EndpointAddress,
    /// Source address our own multicast datagrams arrive with
    loopback: Option<EndpointAddress>,
}

/// Unconnected UDP socket with optional multicast group membership.
#[derive(Debug)]
pub struct DatagramSocket {
    socket: UdpSocket,
    ipv6: bool,
    port: u16,
    config: UdpConfig,
    wake: Arc<Notify>,
    /// Datagrams read while waiting for something else
    stash: Mutex<VecDeque<NetPacket>>,
    multicast: Mutex<Option<Membership>>,
}

impl DatagramSocket {
    /// Binds a dual-stack socket on all interfaces, falling back to IPv4.
    /// A port already in use is replaced by an automatically assigned one.
    pub fn bind(port: u16, config: &UdpConfig, wake: Arc<Notify>) -> Result<Self, TransportError> {
        let (std_socket, ipv6) = match bind_family(Domain::IPV6, port, config) {
            Ok(socket) => (socket, true),
            Err(e) => {
                tracing::debug!("IPv6 UDP socket unavailable ({}), using IPv4", e);
                let socket = bind_family(Domain::IPV4, port, config)
                    .map_err(TransportError::socket("socket bind failed"))?;
                (socket, false)
            }
        };
        let socket =
            UdpSocket::from_std(std_socket).map_err(TransportError::socket("socket setup failed"))?;
        let port = socket
            .local_addr()
            .map_err(TransportError::socket("getsockname failed"))?
            .port();
        tracing::info!("UDP socket bound to port {} (ipv6: {})", port, ipv6);

        Ok(DatagramSocket {
            socket,
            ipv6,
            port,
            config: config.clone(),
            wake,
            stash: Mutex::new(VecDeque::new()),
            multicast: Mutex::new(None),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn multicast_group(&self) -> Option<EndpointAddress> {
        self.multicast.lock().map(|m| m.group)
    }

    pub fn loopback_addr(&self) -> Option<EndpointAddress> {
        self.multicast.lock().and_then(|m| m.loopback)
    }

    fn target(&self, addr: &EndpointAddress) -> Option<SocketAddr> {
        if self.ipv6 {
            addr.as_ipv6().to_socket_addr()
        } else {
            addr.canonical()
                .to_socket_addr()
                .filter(|a| a.is_ipv4())
        }
    }

    /// Sends without blocking. A full socket buffer drops the datagram.
    pub fn send_to(&self, data: &[u8], addr: &EndpointAddress) -> Result<(), TransportError> {
        let target = self
            .target(addr)
            .ok_or_else(|| TransportError::UnknownPeer(*addr))?;
        match self.socket.try_send_to(data, target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!("Send buffer full, dropping datagram to {}", addr);
                Ok(())
            }
            Err(e) => Err(TransportError::socket("send failed")(e)),
        }
    }

    pub fn send_multicast(&self, data: &[u8]) -> Result<(), TransportError> {
        let group = self
            .multicast_group()
            .ok_or(TransportError::NoBroadcastGroup)?;
        self.send_to(data, &group)
    }

    /// Puts datagrams back to be returned by the next `recv_batch`.
    pub fn stash(&self, packets: impl IntoIterator<Item = NetPacket>) {
        self.stash.lock().extend(packets);
    }

    fn received(&self, buf: &[u8], from: SocketAddr) -> NetPacket {
        NetPacket::new(
            EndpointAddress::from(from).canonical(),
            Bytes::copy_from_slice(buf),
        )
    }

    /// Waits up to `timeout` (forever if `None`) for datagrams or a wake-up,
    /// then returns everything readable without blocking.
    pub async fn recv_batch(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<NetPacket>, TransportError> {
        let stashed: Vec<NetPacket> = self.stash.lock().drain(..).collect();
        if !stashed.is_empty() {
            return Ok(stashed);
        }

        let mut buf = vec![0u8; self.config.max_datagram_size];
        let mut batch = Vec::new();
        let first = {
            let recv = self.socket.recv_from(&mut buf);
            let woken = self.wake.notified();
            match timeout {
                Some(timeout) => tokio::select! {
                    result = recv => Some(result),
                    _ = woken => None,
                    _ = tokio::time::sleep(timeout) => None,
                },
                None => tokio::select! {
                    result = recv => Some(result),
                    _ = woken => None,
                },
            }
        };
        match first {
            Some(Ok((len, from))) => batch.push(self.received(&buf[..len], from)),
            Some(Err(e)) if is_transient(&e) => {}
            Some(Err(e)) => return Err(TransportError::socket("receive failed")(e)),
            None => return Ok(batch),
        }

        while batch.len() < MAX_BATCH {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, from)) => batch.push(self.received(&buf[..len], from)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    tracing::debug!("UDP receive error: {}", e);
                    break;
                }
            }
        }
        Ok(batch)
    }

    /// Joins `group` and verifies that our own multicast datagrams come back.
    /// On failure the group is left again.
    pub async fn join_multicast(&self, group: EndpointAddress) -> Result<(), TransportError> {
        self.leave_multicast()?;

        let addr = match group.host {
            HostAddress::V6 { addr, .. } if addr.is_multicast() => addr,
            _ => {
                return Err(TransportError::InvalidBroadcastAddress(format!(
                    "{} (only IPv6 multicast addresses are supported)",
                    group
                )))
            }
        };
        if !self.ipv6 {
            return Err(TransportError::InvalidBroadcastAddress(
                "IPv6 socket unavailable".to_string(),
            ));
        }
        if group.port != self.port {
            return Err(TransportError::InvalidBroadcastAddress(format!(
                "{} (different port)",
                group
            )));
        }

        SockRef::from(&self.socket)
            .set_multicast_hops_v6(self.config.multicast_hops)
            .map_err(TransportError::socket("could not set multicast hops"))?;
        self.socket
            .join_multicast_v6(&addr, 0)
            .map_err(TransportError::socket("could not join multicast group"))?;
        *self.multicast.lock() = Some(Membership {
            group,
            loopback: None,
        });

        match self.loopback_test().await {
            Ok(loopback) => {
                if let Some(membership) = self.multicast.lock().as_mut() {
                    membership.loopback = Some(loopback);
                }
                tracing::info!("Joined multicast group {} (loopback {})", group, loopback);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Multicast group {} unusable: {}", group, e);
                if let Err(leave) = self.leave_multicast() {
                    tracing::warn!("Could not leave multicast group {}: {}", group, leave);
                }
                Err(e)
            }
        }
    }

    async fn loopback_test(&self) -> Result<EndpointAddress, TransportError> {
        self.socket
            .set_multicast_loop_v6(true)
            .map_err(TransportError::socket("could not enable multicast loopback"))?;
        let enabled = self
            .socket
            .multicast_loop_v6()
            .map_err(TransportError::socket("could not query multicast loopback"))?;
        if !enabled {
            return Err(TransportError::LoopbackTestFailed);
        }

        let probe = Packet::new(rand::random(), true, Body::Test).to_bytes();
        self.send_multicast(&probe)?;

        let deadline = Instant::now() + self.config.loopback_timeout();
        let mut buf = vec![0u8; self.config.max_datagram_size];
        let mut others = Vec::new();
        let result = loop {
            if Instant::now() >= deadline {
                break Err(TransportError::LoopbackTestFailed);
            }
            let recv = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await;
            match recv {
                Err(_) => break Err(TransportError::LoopbackTestFailed),
                Ok(Err(e)) if is_transient(&e) => continue,
                Ok(Err(e)) => break Err(TransportError::socket("receive failed")(e)),
                Ok(Ok((len, from))) if buf[..len] == probe[..] => {
                    break Ok(EndpointAddress::from(from).canonical())
                }
                Ok(Ok((len, from))) => others.push(self.received(&buf[..len], from)),
            }
        };
        self.stash(others);

        if let Err(e) = self.socket.set_multicast_loop_v6(false) {
            tracing::debug!("Could not disable multicast loopback: {}", e);
        }
        result
    }

    pub fn leave_multicast(&self) -> Result<(), TransportError> {
        let Some(membership) = self.multicast.lock().take() else {
            return Ok(());
        };
        if let HostAddress::V6 { addr, .. } = membership.group.host {
            self.socket
                .leave_multicast_v6(&addr, 0)
                .map_err(TransportError::socket("could not leave multicast group"))?;
        }
        tracing::info!("Left multicast group {}", membership.group);
        Ok(())
    }
}

/// Plain UDP transport: no connections, no delivery guarantee.
pub struct UdpTransport {
    config: UdpConfig,
    socket: RwLock<Option<Arc<DatagramSocket>>>,
    callback: CallbackSlot,
    wake: Arc<Notify>,
    exec_lock: tokio::sync::Mutex<()>,
    broadcast_bytes: AtomicU64,
}

impl UdpTransport {
    pub fn new(config: UdpConfig) -> Self {
        UdpTransport {
            config,
            socket: RwLock::new(None),
            callback: CallbackSlot::default(),
            wake: Arc::new(Notify::new()),
            exec_lock: tokio::sync::Mutex::new(()),
            broadcast_bytes: AtomicU64::new(0),
        }
    }

    fn socket(&self) -> Result<Arc<DatagramSocket>, TransportError> {
        self.socket.read().clone().ok_or(TransportError::NotInitialized)
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new(UdpConfig::default())
    }
}

#[async_trait]
impl NetIo for UdpTransport {
    async fn init(&self, port: u16) -> Result<(), TransportError> {
        self.close().await?;
        let socket = DatagramSocket::bind(port, &self.config, self.wake.clone())?;
        *self.socket.write() = Some(Arc::new(socket));
        Ok(())
    }

    async fn init_broadcast(
        &self,
        group: Option<EndpointAddress>,
    ) -> Result<EndpointAddress, TransportError> {
        let socket = self.socket()?;
        let group = group.ok_or_else(|| {
            TransportError::InvalidBroadcastAddress("no multicast group given".to_string())
        })?;
        // keep the executor off the socket while the loopback test reads
        self.unblock();
        let _exec = self.exec_lock.lock().await;
        socket.join_multicast(group).await?;
        self.broadcast_bytes.store(0, Ordering::Relaxed);
        Ok(group)
    }

    async fn close_broadcast(&self) -> Result<(), TransportError> {
        self.socket()?.leave_multicast()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(socket) = self.socket.write().take() else {
            return Ok(());
        };
        if let Err(e) = socket.leave_multicast() {
            tracing::debug!("{}", e);
        }
        self.unblock();
        tracing::info!("UDP transport on port {} closed", socket.local_port());
        Ok(())
    }

    async fn execute(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        let _exec = self.exec_lock.lock().await;
        let socket = self.socket()?;
        let packets = socket.recv_batch(timeout).await?;
        if let Some(callback) = self.callback.get() {
            for packet in &packets {
                callback.on_packet(packet, self);
            }
        }
        Ok(())
    }

    fn unblock(&self) {
        self.wake.notify_one();
    }

    fn connect(&self, _addr: &EndpointAddress) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    fn close_peer(&self, _addr: &EndpointAddress) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    fn send(&self, packet: NetPacket) -> Result<(), TransportError> {
        self.socket()?.send_to(&packet.data, &packet.addr)
    }

    fn broadcast(&self, packet: NetPacket) -> Result<(), TransportError> {
        self.socket()?.send_multicast(&packet.data)?;
        self.broadcast_bytes
            .fetch_add(packet.data.len() as u64 + UDP_HEADER_SIZE, Ordering::Relaxed);
        Ok(())
    }

    fn set_broadcast(&self, _addr: &EndpointAddress, _broadcast: bool) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    fn broadcast_rate(&self) -> u64 {
        self.broadcast_bytes.load(Ordering::Relaxed)
    }

    fn conn_statistic(&self, _addr: &EndpointAddress) -> Option<ConnStatistic> {
        None
    }

    fn clear_statistic(&self) {
        self.broadcast_bytes.store(0, Ordering::Relaxed);
    }

    fn set_callback(&self, callback: Arc<dyn TransportCallback>) {
        self.callback.set(callback);
    }

    fn local_port(&self) -> Option<u16> {
        self.socket.read().as_ref().map(|s| s.local_port())
    }
}
