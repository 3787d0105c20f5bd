//! TCP Transport
//!
//! One stream per peer. Each packet travels as a frame:
//!
//! ```text
//! [marker: u8 = 0xff][length: u32 LE][payload]
//! ```
//!
//! Every peer gets a reader task that splits the byte stream into frames and
//! a writer task fed through an unbounded channel, so `send` never blocks.
//! Listener, connect, reader and writer tasks report to one event channel
//! which `execute` drains.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::TcpConfig;
use super::{CallbackSlot, ConnStatistic, NetIo, NetPacket, TransportCallback, TransportError};
use crate::address::EndpointAddress;

pub const FRAME_MARKER: u8 = 0xff;
pub const FRAME_HEADER_SIZE: usize = 1 + 4;
/// Per-packet overhead added to the byte statistics
pub const TCP_HEADER_SIZE: u64 = 52;

const LISTEN_BACKLOG: i32 = 128;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("protocol violation: frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

pub fn encode_frame(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + data.len());
    buf.put_u8(FRAME_MARKER);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Removes all complete frames from `buf`. A corrupt marker discards the
/// buffered bytes.
pub fn decode_frames(buf: &mut BytesMut, max_frame_size: usize) -> Result<Vec<Bytes>, FrameError> {
    let mut frames = Vec::new();
    while buf.len() >= FRAME_HEADER_SIZE {
        if buf[0] != FRAME_MARKER {
            tracing::debug!(
                "Invalid frame marker 0x{:02x}, discarding {} bytes",
                buf[0],
                buf.len()
            );
            buf.clear();
            break;
        }
        let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > max_frame_size {
            return Err(FrameError::TooLarge(len));
        }
        if buf.len() < FRAME_HEADER_SIZE + len {
            break;
        }
        buf.advance(FRAME_HEADER_SIZE);
        frames.push(buf.split_to(len).freeze());
    }
    Ok(frames)
}

fn listen_family(domain: Domain, port: u16, config: &TcpConfig) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
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
        if e.kind() != io::ErrorKind::AddrInUse {
            return Err(e);
        }
        tracing::warn!("TCP port {} in use, binding an automatic port", port);
        let mut auto = any;
        auto.set_port(0);
        socket.bind(&auto.into())?;
    }
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn bind_listener(port: u16, config: &TcpConfig) -> Result<TcpListener, TransportError> {
    let std_listener = match listen_family(Domain::IPV6, port, config) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::debug!("IPv6 listener unavailable ({}), using IPv4", e);
            listen_family(Domain::IPV4, port, config)
                .map_err(TransportError::socket("listen failed"))?
        }
    };
    TcpListener::from_std(std_listener).map_err(TransportError::socket("listener setup failed"))
}

enum TcpEvent {
    Accepted {
        session: u64,
        stream: TcpStream,
        addr: EndpointAddress,
    },
    Connected {
        id: u64,
        result: io::Result<TcpStream>,
    },
    Frame {
        id: u64,
        data: Bytes,
    },
    Closed {
        id: u64,
        reason: String,
    },
    /// Pending connect withdrawn by `close_peer`
    Cancelled {
        addr: EndpointAddress,
    },
    Wake,
}

type EventSender = mpsc::UnboundedSender<TcpEvent>;

async fn accept_loop(listener: TcpListener, session: u64, events: EventSender) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let addr = EndpointAddress::from(addr).canonical();
                if events
                    .send(TcpEvent::Accepted {
                        session,
                        stream,
                        addr,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_frames(mut reader: OwnedReadHalf, id: u64, config: TcpConfig, events: EventSender) {
    let mut buf = BytesMut::with_capacity(config.read_chunk);
    let reason = loop {
        buf.reserve(config.read_chunk);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break "connection closed".to_string(),
            Ok(_) => match decode_frames(&mut buf, config.max_frame_size) {
                Ok(frames) => {
                    for data in frames {
                        if events.send(TcpEvent::Frame { id, data }).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => break e.to_string(),
            },
            Err(e) => break e.to_string(),
        }
    };
    let _ = events.send(TcpEvent::Closed { id, reason });
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    id: u64,
    events: EventSender,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            let _ = events.send(TcpEvent::Closed {
                id,
                reason: e.to_string(),
            });
            return;
        }
    }
    // sender dropped: the peer is being closed
    let _ = writer.shutdown().await;
}

/// Outbound connect in progress
struct ConnectWait {
    addr: EndpointAddress,
    task: JoinHandle<()>,
}

struct TcpPeer {
    addr: EndpointAddress,
    /// Gone once the peer is closing
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    reader: JoinHandle<()>,
    broadcast: bool,
    stats: ConnStatistic,
}

impl TcpPeer {
    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn shutdown(&mut self) {
        self.reader.abort();
        self.writer = None;
    }

    fn queue(&mut self, frame: Bytes) -> bool {
        let len = frame.len() as u64;
        let Some(writer) = &self.writer else {
            return false;
        };
        if writer.send(frame).is_err() {
            return false;
        }
        self.stats.out_rate += len + TCP_HEADER_SIZE;
        true
    }
}

#[derive(Default)]
struct TcpState {
    runtime: Option<Handle>,
    session: u64,
    port: Option<u16>,
    listener: Option<JoinHandle<()>>,
    next_id: u64,
    waits: HashMap<u64, ConnectWait>,
    peers: HashMap<u64, TcpPeer>,
    broadcast_bytes: u64,
}

impl TcpState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn find_peer(&self, addr: &EndpointAddress) -> Option<u64> {
        self.peers
            .iter()
            .find(|(_, p)| p.addr == *addr && p.is_open())
            .map(|(id, _)| *id)
    }

    fn find_wait(&self, addr: &EndpointAddress) -> Option<u64> {
        self.waits
            .iter()
            .find(|(_, w)| w.addr == *addr)
            .map(|(id, _)| *id)
    }
}

/// TCP transport: reliable and ordered, no multicast
pub struct TcpTransport {
    config: TcpConfig,
    state: Mutex<TcpState>,
    callback: CallbackSlot,
    events_tx: EventSender,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TcpEvent>>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        TcpTransport {
            config,
            state: Mutex::new(TcpState::default()),
            callback: CallbackSlot::default(),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    /// Registers an established stream and starts its reader and writer.
    fn open_peer(&self, stream: TcpStream, addr: EndpointAddress) -> u64 {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not disable Nagle for {}: {}", addr, e);
        }
        let (reader, writer) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        let id = state.next_id();
        let reader = tokio::spawn(read_frames(
            reader,
            id,
            self.config.clone(),
            self.events_tx.clone(),
        ));
        tokio::spawn(write_frames(writer, frames_rx, id, self.events_tx.clone()));
        state.peers.insert(
            id,
            TcpPeer {
                addr,
                writer: Some(frames_tx),
                reader,
                broadcast: false,
                stats: ConnStatistic::default(),
            },
        );
        id
    }

    /// Announces a new peer. A rejected peer is closed right away.
    fn announce(
        &self,
        callback: &Option<Arc<dyn TransportCallback>>,
        id: u64,
        peer: EndpointAddress,
        connect_addr: EndpointAddress,
        own_addr: Option<EndpointAddress>,
    ) {
        tracing::info!("TCP connection to {} established", peer);
        let Some(callback) = callback else {
            return;
        };
        if callback.on_conn(&peer, &connect_addr, own_addr.as_ref(), self) {
            return;
        }
        tracing::info!("TCP connection to {} rejected", peer);
        if let Some(mut removed) = self.state.lock().peers.remove(&id) {
            removed.shutdown();
        }
        callback.on_disconn(&peer, self, "connection rejected");
    }

    fn handle(&self, event: TcpEvent, callback: &Option<Arc<dyn TransportCallback>>) {
        match event {
            TcpEvent::Wake => {}
            TcpEvent::Accepted {
                session,
                stream,
                addr,
            } => {
                if self.state.lock().session != session {
                    return;
                }
                tracing::info!("Accepted TCP connection from {}", addr);
                let own_addr = stream
                    .local_addr()
                    .ok()
                    .map(|a| EndpointAddress::from(a).canonical());
                let id = self.open_peer(stream, addr);
                self.announce(callback, id, addr, addr, own_addr);
            }
            TcpEvent::Connected { id, result } => {
                let Some(wait) = self.state.lock().waits.remove(&id) else {
                    return;
                };
                match result {
                    Ok(stream) => {
                        let peer = stream
                            .peer_addr()
                            .map(|a| EndpointAddress::from(a).canonical())
                            .unwrap_or(wait.addr);
                        let own_addr = stream
                            .local_addr()
                            .ok()
                            .map(|a| EndpointAddress::from(a).canonical());
                        let id = self.open_peer(stream, peer);
                        self.announce(callback, id, peer, wait.addr, own_addr);
                    }
                    Err(e) => {
                        tracing::info!("TCP connect to {} failed: {}", wait.addr, e);
                        if let Some(callback) = callback {
                            callback.on_disconn(&wait.addr, self, &e.to_string());
                        }
                    }
                }
            }
            TcpEvent::Frame { id, data } => {
                let addr = {
                    let mut state = self.state.lock();
                    match state.peers.get_mut(&id) {
                        Some(peer) if peer.is_open() => {
                            peer.stats.in_rate +=
                                (data.len() + FRAME_HEADER_SIZE) as u64 + TCP_HEADER_SIZE;
                            peer.addr
                        }
                        _ => return,
                    }
                };
                if let Some(callback) = callback {
                    callback.on_packet(&NetPacket::new(addr, data), self);
                }
            }
            TcpEvent::Cancelled { addr } => {
                tracing::info!("TCP connect to {} cancelled", addr);
                if let Some(callback) = callback {
                    callback.on_disconn(&addr, self, "closed");
                }
            }
            TcpEvent::Closed { id, reason } => {
                let addr = {
                    let mut state = self.state.lock();
                    if let Some(wait) = state.waits.remove(&id) {
                        wait.task.abort();
                        wait.addr
                    } else if let Some(mut peer) = state.peers.remove(&id) {
                        peer.shutdown();
                        peer.addr
                    } else {
                        return;
                    }
                };
                tracing::info!("TCP connection to {} closed: {}", addr, reason);
                if let Some(callback) = callback {
                    callback.on_disconn(&addr, self, &reason);
                }
            }
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(TcpConfig::default())
    }
}

#[async_trait]
impl NetIo for TcpTransport {
    /// Port 0 means outbound connections only.
    async fn init(&self, port: u16) -> Result<(), TransportError> {
        self.close().await?;

        let (listener, local_port) = if port == 0 {
            (None, None)
        } else {
            let listener = bind_listener(port, &self.config)?;
            let local_port = listener
                .local_addr()
                .map_err(TransportError::socket("getsockname failed"))?
                .port();
            tracing::info!("TCP listening on port {}", local_port);
            (Some(listener), Some(local_port))
        };

        let mut state = self.state.lock();
        state.session += 1;
        let session = state.session;
        state.runtime = Some(Handle::current());
        state.port = local_port;
        state.listener =
            listener.map(|l| tokio::spawn(accept_loop(l, session, self.events_tx.clone())));
        Ok(())
    }

    /// Broadcasts go to the peers selected with `set_broadcast`; there is no group.
    async fn init_broadcast(
        &self,
        group: Option<EndpointAddress>,
    ) -> Result<EndpointAddress, TransportError> {
        Ok(group.unwrap_or_default())
    }

    async fn close_broadcast(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (waits, peers) = {
            let mut state = self.state.lock();
            if state.runtime.take().is_none() {
                return Ok(());
            }
            if let Some(listener) = state.listener.take() {
                listener.abort();
            }
            state.port = None;
            // invalidates queued accepts
            state.session += 1;
            state.broadcast_bytes = 0;
            (
                std::mem::take(&mut state.waits),
                std::mem::take(&mut state.peers),
            )
        };

        let callback = self.callback.get();
        for wait in waits.into_values() {
            wait.task.abort();
            if let Some(callback) = &callback {
                callback.on_disconn(&wait.addr, self, "owner class closed");
            }
        }
        for mut peer in peers.into_values() {
            peer.shutdown();
            if let Some(callback) = &callback {
                callback.on_disconn(&peer.addr, self, "owner class closed");
            }
        }
        self.unblock();
        tracing::info!("TCP transport closed");
        Ok(())
    }

    async fn execute(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        let mut events_rx = self.events_rx.lock().await;
        if self.state.lock().runtime.is_none() {
            return Err(TransportError::NotInitialized);
        }
        let first = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, events_rx.recv()).await {
                Ok(event) => event,
                Err(_) => return Ok(()),
            },
            None => events_rx.recv().await,
        };
        let mut batch: Vec<TcpEvent> = first.into_iter().collect();
        while let Ok(event) = events_rx.try_recv() {
            batch.push(event);
        }
        drop(events_rx);

        let callback = self.callback.get();
        for event in batch {
            self.handle(event, &callback);
        }
        Ok(())
    }

    fn unblock(&self) {
        let _ = self.events_tx.send(TcpEvent::Wake);
    }

    fn connect(&self, addr: &EndpointAddress) -> Result<(), TransportError> {
        let addr = addr.canonical();
        let target = addr
            .to_socket_addr()
            .ok_or(TransportError::UnknownPeer(addr))?;
        let mut state = self.state.lock();
        let runtime = state.runtime.clone().ok_or(TransportError::NotInitialized)?;
        if state.find_peer(&addr).is_some() {
            tracing::debug!("Already connected to {}", addr);
            return Ok(());
        }
        if state.find_wait(&addr).is_some() {
            tracing::debug!("Connect to {} already pending", addr);
            return Ok(());
        }

        let id = state.next_id();
        let events = self.events_tx.clone();
        let connect_timeout = self.config.connect_timeout();
        let task = runtime.spawn(async move {
            let result = match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await
            {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timeout",
                )),
            };
            let _ = events.send(TcpEvent::Connected { id, result });
        });
        state.waits.insert(id, ConnectWait { addr, task });
        tracing::info!("Connecting to {} via TCP", addr);
        Ok(())
    }

    fn close_peer(&self, addr: &EndpointAddress) -> Result<(), TransportError> {
        let addr = addr.canonical();
        let mut state = self.state.lock();
        let event = if let Some(id) = state.find_peer(&addr) {
            if let Some(peer) = state.peers.get_mut(&id) {
                peer.shutdown();
            }
            TcpEvent::Closed {
                id,
                reason: "closed".to_string(),
            }
        } else if let Some(wait) = state
            .find_wait(&addr)
            .and_then(|id| state.waits.remove(&id))
        {
            // a Connected event already queued for this wait finds nothing
            // and drops its stream
            wait.task.abort();
            TcpEvent::Cancelled { addr: wait.addr }
        } else {
            return Err(TransportError::UnknownPeer(addr));
        };
        let _ = self.events_tx.send(event);
        Ok(())
    }

    fn send(&self, packet: NetPacket) -> Result<(), TransportError> {
        let addr = packet.addr.canonical();
        let frame = encode_frame(&packet.data);
        let mut state = self.state.lock();
        let id = state
            .find_peer(&addr)
            .ok_or(TransportError::UnknownPeer(addr))?;
        let queued = state
            .peers
            .get_mut(&id)
            .map_or(false, |peer| peer.queue(frame));
        if queued {
            Ok(())
        } else {
            Err(TransportError::UnknownPeer(addr))
        }
    }

    fn broadcast(&self, packet: NetPacket) -> Result<(), TransportError> {
        let frame = encode_frame(&packet.data);
        let mut state = self.state.lock();
        let mut sent = 0u64;
        for peer in state.peers.values_mut().filter(|p| p.broadcast) {
            if peer.queue(frame.clone()) {
                sent += frame.len() as u64 + TCP_HEADER_SIZE;
            }
        }
        state.broadcast_bytes += sent;
        Ok(())
    }

    fn set_broadcast(&self, addr: &EndpointAddress, broadcast: bool) -> Result<(), TransportError> {
        let addr = addr.canonical();
        let mut state = self.state.lock();
        let id = state
            .find_peer(&addr)
            .ok_or(TransportError::UnknownPeer(addr))?;
        if let Some(peer) = state.peers.get_mut(&id) {
            peer.broadcast = broadcast;
        }
        Ok(())
    }

    fn broadcast_rate(&self) -> u64 {
        self.state.lock().broadcast_bytes
    }

    fn conn_statistic(&self, addr: &EndpointAddress) -> Option<ConnStatistic> {
        let state = self.state.lock();
        let id = state.find_peer(&addr.canonical())?;
        state.peers.get(&id).map(|p| p.stats)
    }

    fn clear_statistic(&self) {
        let mut state = self.state.lock();
        state.broadcast_bytes = 0;
        for peer in state.peers.values_mut() {
            peer.stats = ConnStatistic::default();
        }
    }

    fn set_callback(&self, callback: Arc<dyn TransportCallback>) {
        self.callback.set(callback);
    }

    fn local_port(&self) -> Option<u16> {
        self.state.lock().port
    }
}
