//! Reliable Datagram Transport
//!
//! Coordinates the datagram socket, the per-peer [`Connection`] state machines
//! and the outgoing multicast stream. All protocol state sits behind one
//! mutex; datagrams and events produced under it are sent and dispatched
//! after it is released, so callbacks may call back into the transport.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::config::ReliableConfig;
use super::connection::{until, Connection, Link, Outbox, Outgoing};
use super::fragment::{FragmentedPacket, PacketBacklog};
use super::packet::{Body, Packet, PacketType, MULTICAST_FLAG};
use super::udp::DatagramSocket;
use super::{
    CallbackSlot, ConnStatistic, NetIo, NetPacket, TransportCallback, TransportError,
    TransportEvent,
};
use crate::address::{local_addresses, EndpointAddress, HostAddress};

type ConnId = u64;

/// Connections by id, with an address index that may hold aliases.
#[derive(Debug, Default)]
struct PeerTable {
    next_id: ConnId,
    conns: HashMap<ConnId, Connection>,
    index: HashMap<EndpointAddress, ConnId>,
}

impl PeerTable {
    /// Live connection known under `addr`
    fn find(&self, addr: &EndpointAddress) -> Option<ConnId> {
        self.index
            .get(addr)
            .copied()
            .filter(|id| self.conns.get(id).map_or(false, |c| !c.is_closed()))
    }

    fn insert(&mut self, conn: Connection) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        self.index.insert(conn.addr(), id);
        self.conns.insert(id, conn);
        id
    }

    fn add_alias(&mut self, addr: EndpointAddress, id: ConnId) {
        self.index.insert(addr, id);
    }

    fn get(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    fn values(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    fn values_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    /// Drops closed connections and index entries pointing at them.
    fn sweep(&mut self) {
        self.conns.retain(|_, c| !c.is_closed());
        let conns = &self.conns;
        self.index.retain(|_, id| conns.contains_key(id));
    }
}

struct ArqState {
    port: u16,
    multicast: Option<EndpointAddress>,
    /// Group offered by a peer that failed to join, not tried again
    declined_group: Option<EndpointAddress>,
    peers: PeerTable,
    mc_out: PacketBacklog,
    mc_out_counter: u32,
    next_check: Instant,
    broadcast_bytes: u64,
    /// Events raised outside `execute`, dispatched by its next pass
    pending_events: Vec<TransportEvent>,
}

impl ArqState {
    fn new(port: u16, config: &ReliableConfig) -> Self {
        ArqState {
            port,
            multicast: None,
            declined_group: None,
            peers: PeerTable::default(),
            mc_out: PacketBacklog::new(config.max_backlog),
            mc_out_counter: 0,
            next_check: Instant::now() + config.check_interval(),
            broadcast_bytes: 0,
            pending_events: Vec::new(),
        }
    }

    fn with_peer<R>(
        &mut self,
        id: ConnId,
        now: Instant,
        config: &ReliableConfig,
        outbox: &mut Outbox,
        f: impl FnOnce(&mut Connection, &mut Link<'_>) -> R,
    ) -> Option<R> {
        let ArqState {
            peers,
            mc_out,
            mc_out_counter,
            multicast,
            port,
            ..
        } = self;
        let conn = peers.get_mut(id)?;
        let mut link = Link {
            now,
            config,
            multicast_group: *multicast,
            local_port: *port,
            mc_out,
            mc_out_counter: *mc_out_counter,
            outbox,
        };
        Some(f(conn, &mut link))
    }

    fn for_each_peer(
        &mut self,
        now: Instant,
        config: &ReliableConfig,
        outbox: &mut Outbox,
        mut f: impl FnMut(&mut Connection, &mut Link<'_>),
    ) {
        let ArqState {
            peers,
            mc_out,
            mc_out_counter,
            multicast,
            port,
            ..
        } = self;
        for conn in peers.values_mut() {
            let mut link = Link {
                now,
                config,
                multicast_group: *multicast,
                local_port: *port,
                mc_out: &*mc_out,
                mc_out_counter: *mc_out_counter,
                outbox: &mut *outbox,
            };
            f(conn, &mut link);
        }
    }

    fn has_multicast_peer(&self) -> bool {
        self.peers.values().any(|c| c.is_open() && c.multicast())
    }

    fn on_datagram(
        &mut self,
        datagram: NetPacket,
        loopback: Option<EndpointAddress>,
        now: Instant,
        config: &ReliableConfig,
        outbox: &mut Outbox,
    ) {
        let from = datagram.addr;
        if loopback == Some(from) {
            return;
        }
        let wire_len = datagram.data.len();
        let packet = match Packet::decode(datagram.data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Dropping malformed datagram from {}: {}", from, e);
                return;
            }
        };

        match (packet.body.packet_type(), self.peers.find(&from)) {
            (PacketType::Test, _) => {}
            (PacketType::AddAddr, Some(_)) => {
                if let Body::AddAddr { addr, new_addr } = packet.body {
                    self.on_add_addr(from, addr, new_addr, now, config, outbox);
                }
            }
            (_, Some(id)) => {
                self.with_peer(id, now, config, outbox, |conn, link| {
                    conn.on_recv(packet, wire_len, link)
                });
            }
            (PacketType::Ping, None) => {
                let reply = Packet::new(0, packet.multicast, Body::Ping);
                if packet.multicast && self.multicast.is_some() {
                    outbox.multicast(&reply);
                } else {
                    outbox.unicast(from, &reply);
                }
            }
            (PacketType::Conn, None) if !packet.multicast => {
                tracing::info!("Incoming connection from {}", from);
                let id = self.peers.insert(Connection::new(from, now, config));
                self.with_peer(id, now, config, outbox, |conn, link| {
                    conn.connect(false, link);
                    conn.on_recv(packet, wire_len, link);
                });
            }
            (packet_type, None) => {
                tracing::trace!("Ignoring {:?} from unknown peer {}", packet_type, from);
            }
        }
    }

    /// The peer tells us that `addr` and `new_addr` reach the same host.
    fn on_add_addr(
        &mut self,
        from: EndpointAddress,
        addr: EndpointAddress,
        new_addr: EndpointAddress,
        now: Instant,
        config: &ReliableConfig,
        outbox: &mut Outbox,
    ) {
        if from != addr && from != new_addr {
            tracing::debug!("AddAddr from {} names neither address", from);
            return;
        }
        let Some(first) = self.peers.find(&addr) else {
            return;
        };
        let second = self.peers.find(&new_addr);
        if second == Some(first) {
            return;
        }
        if let Some(second) = second {
            self.with_peer(second, now, config, outbox, |conn, link| {
                conn.close("address equivalence detected", link)
            });
        }
        if let Some(conn) = self.peers.get_mut(first) {
            conn.set_alt_addr(new_addr);
        }
        self.peers.add_alias(new_addr, first);
        tracing::info!("{} is also reachable as {}", addr, new_addr);
    }

    /// Periodic acknowledgement round.
    fn do_check(&mut self, now: Instant, config: &ReliableConfig, outbox: &mut Outbox) {
        if self.multicast.is_some() && self.has_multicast_peer() {
            // lets receivers notice loss at the tail of the multicast stream
            let packet = Packet::new(
                self.mc_out_counter,
                true,
                Body::Check {
                    ack: 0,
                    mc_ack: 0,
                    asks: Vec::new(),
                    mc_asks: Vec::new(),
                },
            );
            outbox.multicast(&packet);
        }
        self.for_each_peer(now, config, outbox, |conn, link| conn.check(true, link));
        self.next_check = now + config.check_interval();
    }

    /// Drops multicast packets every multicast peer has acknowledged.
    fn prune_mc_out(&mut self) {
        let min_ack = self
            .peers
            .values()
            .filter(|c| c.is_open() && c.multicast())
            .map(|c| c.mc_ack())
            .min();
        match min_ack {
            Some(ack) => self.mc_out.clear_until(ack),
            None => self.mc_out.clear(),
        }
    }

    fn close_all(&mut self, reason: &str, config: &ReliableConfig, outbox: &mut Outbox) {
        self.for_each_peer(Instant::now(), config, outbox, |conn, link| {
            conn.close(reason, link)
        });
        self.peers.sweep();
    }
}

/// Builds an RFC 3306 unicast-prefix based multicast group:
/// `ff3e:0040:<64-bit network prefix>:<random group id>`.
fn derive_group(prefix: &Ipv6Addr, port: u16) -> EndpointAddress {
    let mut octets = [0u8; 16];
    octets[..4].copy_from_slice(&[0xff, 0x3e, 0x00, 0x40]);
    octets[4..12].copy_from_slice(&prefix.octets()[..8]);
    let mut group_id: [u8; 4] = rand::random();
    group_id[0] |= 0x80;
    octets[12..].copy_from_slice(&group_id);
    EndpointAddress::new(HostAddress::v6(Ipv6Addr::from(octets)), port)
}

fn global_ipv6_prefix() -> Option<Ipv6Addr> {
    local_addresses().into_iter().find_map(|host| match host {
        HostAddress::V6 { addr, .. } if !host.is_local() && !host.is_ipv4_mapped() => Some(addr),
        _ => None,
    })
}

/// Reliable, connection oriented transport over UDP with optional multicast
pub struct ReliableUdpTransport {
    config: ReliableConfig,
    socket: RwLock<Option<Arc<DatagramSocket>>>,
    state: Mutex<ArqState>,
    callback: CallbackSlot,
    wake: Arc<Notify>,
    exec_lock: tokio::sync::Mutex<()>,
}

impl ReliableUdpTransport {
    pub fn new(config: ReliableConfig) -> Self {
        let state = ArqState::new(0, &config);
        ReliableUdpTransport {
            config,
            socket: RwLock::new(None),
            state: Mutex::new(state),
            callback: CallbackSlot::default(),
            wake: Arc::new(Notify::new()),
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReliableConfig {
        &self.config
    }

    /// Multicast group currently in use
    pub fn multicast_group(&self) -> Option<EndpointAddress> {
        self.state.lock().multicast
    }

    /// Whether the connection to `addr` delivers broadcasts via multicast
    pub fn is_multicast_peer(&self, addr: &EndpointAddress) -> bool {
        let state = self.state.lock();
        state
            .peers
            .find(&addr.canonical())
            .and_then(|id| state.peers.get(id))
            .map_or(false, |c| c.is_open() && c.multicast())
    }

    fn socket(&self) -> Result<Arc<DatagramSocket>, TransportError> {
        self.socket.read().clone().ok_or(TransportError::NotInitialized)
    }

    /// Runs `f` on the locked state, then sends what it produced. Events are
    /// left for `execute` to dispatch.
    fn run<R>(
        &self,
        f: impl FnOnce(&mut ArqState, &mut Outbox) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let socket = self.socket()?;
        let mut outbox = Outbox::default();
        let (result, has_events) = {
            let mut state = self.state.lock();
            let result = f(&mut state, &mut outbox);
            state.broadcast_bytes += outbox.multicast_bytes;
            state.pending_events.append(&mut outbox.events);
            (result, !state.pending_events.is_empty())
        };
        self.flush(&socket, outbox.datagrams);
        if has_events {
            self.unblock();
        }
        result
    }

    fn flush(&self, socket: &DatagramSocket, datagrams: Vec<Outgoing>) {
        for datagram in datagrams {
            let result = match &datagram {
                Outgoing::Unicast(to, data) => socket.send_to(data, to),
                Outgoing::Multicast(data) => socket.send_multicast(data),
            };
            if let Err(e) = result {
                tracing::debug!("Datagram dropped: {}", e);
            }
        }
    }

    /// Fires callbacks. A connection rejected by `on_conn` is closed and its
    /// queued packets are discarded.
    fn dispatch(&self, mut events: Vec<TransportEvent>) {
        let Some(callback) = self.callback.get() else {
            return;
        };
        while !events.is_empty() {
            let mut rejected: Vec<EndpointAddress> = Vec::new();
            for event in events.drain(..) {
                match event {
                    TransportEvent::Connected {
                        peer,
                        connect_addr,
                        own_addr,
                    } => {
                        if !callback.on_conn(&peer, &connect_addr, own_addr.as_ref(), self) {
                            tracing::info!("Connection to {} rejected", peer);
                            rejected.push(peer);
                        }
                    }
                    TransportEvent::Packet(packet) => {
                        if !rejected.contains(&packet.addr) {
                            callback.on_packet(&packet, self);
                        }
                    }
                    TransportEvent::Disconnected { peer, reason } => {
                        callback.on_disconn(&peer, self, &reason)
                    }
                }
            }
            if rejected.is_empty() {
                break;
            }
            let config = &self.config;
            events = self
                .run(|state, outbox| {
                    let now = Instant::now();
                    for peer in &rejected {
                        if let Some(id) = state.peers.find(peer) {
                            state.with_peer(id, now, config, outbox, |conn, link| {
                                conn.close("connection rejected", link)
                            });
                        }
                    }
                    state.pending_events.append(&mut outbox.events);
                    Ok(std::mem::take(&mut state.pending_events))
                })
                .unwrap_or_default();
        }
    }

    /// Time until the next protocol timer, capped by `timeout`.
    fn wait_time(&self, timeout: Option<Duration>) -> Duration {
        let state = self.state.lock();
        let deadline = state
            .peers
            .values()
            .filter_map(|c| c.next_timeout(&self.config))
            .fold(state.next_check, Instant::min);
        let wait = until(Instant::now(), deadline);
        timeout.map_or(wait, |t| t.min(wait))
    }

    /// Joins a group a connecting peer offered, so our answer can offer
    /// multicast in turn.
    async fn adopt_offered_group(&self, socket: &DatagramSocket, datagrams: &[NetPacket]) {
        if socket.multicast_group().is_some() {
            return;
        }
        let declined = self.state.lock().declined_group;
        let offered = datagrams.iter().find_map(|d| {
            let packet = Packet::decode(d.data.clone()).ok()?;
            match packet.body {
                Body::Conn {
                    multicast_group: Some(group),
                    ..
                } if !packet.multicast
                    && group.port == socket.local_port()
                    && Some(group) != declined =>
                {
                    Some((d.addr, group))
                }
                _ => None,
            }
        });
        let Some((from, group)) = offered else {
            return;
        };

        match socket.join_multicast(group).await {
            Ok(()) => {
                tracing::info!("Using multicast group {} offered by {}", group, from);
                let mut state = self.state.lock();
                state.multicast = Some(group);
                state.mc_out.clear();
            }
            Err(e) => {
                tracing::debug!("Multicast group {} offered by {} unusable: {}", group, from, e);
                self.state.lock().declined_group = Some(group);
            }
        }
    }

    /// Derives groups until one nobody else answers on.
    async fn probe_group(&self, socket: &DatagramSocket) -> Result<EndpointAddress, TransportError> {
        let prefix = global_ipv6_prefix().ok_or(TransportError::NoIpv6Address)?;
        for _ in 0..self.config.group_probe_attempts {
            let group = derive_group(&prefix, socket.local_port());
            socket.join_multicast(group).await?;
            if self.group_is_unused(socket).await? {
                return Ok(group);
            }
            tracing::debug!("Multicast group {} in use, trying another", group);
            socket.leave_multicast()?;
        }
        Err(TransportError::MulticastExhausted)
    }

    async fn group_is_unused(&self, socket: &DatagramSocket) -> Result<bool, TransportError> {
        socket.send_multicast(&Packet::new(0, true, Body::Ping).to_bytes())?;
        let loopback = socket.loopback_addr();
        let deadline = Instant::now() + self.config.std_timeout();
        let mut kept = Vec::new();
        let mut in_use = false;

        while !in_use {
            let remaining = until(Instant::now(), deadline);
            if remaining.is_zero() {
                break;
            }
            for datagram in socket.recv_batch(Some(remaining)).await? {
                if Some(datagram.addr) == loopback {
                    continue;
                }
                let flagged = datagram
                    .data
                    .first()
                    .map_or(false, |b| b & MULTICAST_FLAG != 0);
                if flagged {
                    in_use = true;
                } else {
                    kept.push(datagram);
                }
            }
        }
        socket.stash(kept);
        Ok(!in_use)
    }
}

impl Default for ReliableUdpTransport {
    fn default() -> Self {
        Self::new(ReliableConfig::default())
    }
}

#[async_trait]
impl NetIo for ReliableUdpTransport {
    async fn init(&self, port: u16) -> Result<(), TransportError> {
        self.close().await?;
        let socket = DatagramSocket::bind(port, &self.config.udp, self.wake.clone())?;
        *self.state.lock() = ArqState::new(socket.local_port(), &self.config);
        *self.socket.write() = Some(Arc::new(socket));
        Ok(())
    }

    async fn init_broadcast(
        &self,
        group: Option<EndpointAddress>,
    ) -> Result<EndpointAddress, TransportError> {
        let socket = self.socket()?;
        // the executor must not read the socket during the probes
        self.unblock();
        let _exec = self.exec_lock.lock().await;

        self.close_broadcast().await?;
        let group = match group {
            Some(group) => {
                socket.join_multicast(group).await?;
                group
            }
            None => self.probe_group(&socket).await?,
        };
        let mut state = self.state.lock();
        state.multicast = Some(group);
        state.mc_out.clear();
        tracing::info!("Multicast active on {}", group);
        Ok(group)
    }

    async fn close_broadcast(&self) -> Result<(), TransportError> {
        let socket = self.socket()?;
        {
            let mut state = self.state.lock();
            state.multicast = None;
            state.mc_out.clear();
        }
        socket.leave_multicast()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(socket) = self.socket.read().clone() else {
            return Ok(());
        };
        let mut outbox = Outbox::default();
        let events = {
            let mut state = self.state.lock();
            state.close_all("owner class closed", &self.config, &mut outbox);
            state.multicast = None;
            state.pending_events.append(&mut outbox.events);
            std::mem::take(&mut state.pending_events)
        };
        self.flush(&socket, outbox.datagrams);
        if let Err(e) = socket.leave_multicast() {
            tracing::debug!("{}", e);
        }
        *self.socket.write() = None;
        self.unblock();
        tracing::info!("Reliable transport on port {} closed", socket.local_port());
        self.dispatch(events);
        Ok(())
    }

    async fn execute(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        let _exec = self.exec_lock.lock().await;
        let socket = self.socket()?;
        let datagrams = socket.recv_batch(Some(self.wait_time(timeout))).await?;
        self.adopt_offered_group(&socket, &datagrams).await;

        let config = &self.config;
        let loopback = socket.loopback_addr();
        let events = self.run(|state, outbox| {
            let now = Instant::now();
            for datagram in datagrams {
                state.on_datagram(datagram, loopback, now, config, outbox);
            }
            if now >= state.next_check {
                state.do_check(now, config, outbox);
            }
            state.for_each_peer(now, config, outbox, |conn, link| {
                if let Some(reason) = conn.take_close_request() {
                    conn.close(&reason, link);
                }
                conn.check_timeout(link);
            });
            state.prune_mc_out();
            state.pending_events.append(&mut outbox.events);
            Ok(std::mem::take(&mut state.pending_events))
        })?;

        self.dispatch(events);
        self.state.lock().peers.sweep();
        Ok(())
    }

    fn unblock(&self) {
        self.wake.notify_one();
    }

    fn connect(&self, addr: &EndpointAddress) -> Result<(), TransportError> {
        let addr = addr.canonical();
        let config = &self.config;
        self.run(|state, outbox| {
            let now = Instant::now();
            let id = match state.peers.find(&addr) {
                Some(id) if state.peers.get(id).map_or(false, |c| c.is_open()) => {
                    tracing::debug!("Already connected to {}", addr);
                    return Ok(());
                }
                Some(id) => id,
                None => state.peers.insert(Connection::new(addr, now, config)),
            };
            tracing::info!("Connecting to {}", addr);
            state.with_peer(id, now, config, outbox, |conn, link| conn.connect(true, link));
            Ok(())
        })?;
        // timers changed
        self.unblock();
        Ok(())
    }

    fn close_peer(&self, addr: &EndpointAddress) -> Result<(), TransportError> {
        let addr = addr.canonical();
        self.run(|state, _| {
            let id = state
                .peers
                .find(&addr)
                .ok_or(TransportError::UnknownPeer(addr))?;
            if let Some(conn) = state.peers.get_mut(id) {
                conn.request_close("closed");
            }
            Ok(())
        })?;
        self.unblock();
        Ok(())
    }

    fn send(&self, packet: NetPacket) -> Result<(), TransportError> {
        let addr = packet.addr.canonical();
        let config = &self.config;
        self.run(|state, outbox| {
            let id = state
                .peers
                .find(&addr)
                .filter(|id| state.peers.get(*id).map_or(false, |c| !c.is_closing()))
                .ok_or(TransportError::UnknownPeer(addr))?;
            state
                .with_peer(id, Instant::now(), config, outbox, |conn, link| {
                    conn.send(&packet.data, link)
                })
                .unwrap_or(Err(TransportError::UnknownPeer(addr)))
        })
    }

    fn broadcast(&self, packet: NetPacket) -> Result<(), TransportError> {
        let config = &self.config;
        self.run(|state, outbox| {
            let via_group = state.multicast.is_some()
                && state
                    .peers
                    .values()
                    .any(|c| c.is_open() && c.multicast() && c.broadcast());
            if via_group {
                let fragmented = FragmentedPacket::outgoing(
                    state.mc_out_counter,
                    &packet.data,
                    config.fragment_size,
                );
                if fragmented.fragment_count() as usize > config.max_backlog {
                    return Err(TransportError::PacketTooLarge(packet.data.len()));
                }
                for fragment in fragmented.fragments(true) {
                    outbox.multicast(&fragment);
                }
                state.mc_out_counter = fragmented.end_nr();
                if !state.mc_out.insert(fragmented) {
                    return Err(TransportError::BacklogFull);
                }
            }

            let now = Instant::now();
            let mut result = Ok(());
            state.for_each_peer(now, config, outbox, |conn, link| {
                if conn.is_open() && conn.broadcast() && !conn.multicast() {
                    if let Err(e) = conn.send(&packet.data, link) {
                        tracing::debug!("Broadcast to {} failed: {}", conn.addr(), e);
                        result = Err(e);
                    }
                }
            });
            result
        })
    }

    fn set_broadcast(&self, addr: &EndpointAddress, broadcast: bool) -> Result<(), TransportError> {
        let addr = addr.canonical();
        let mut state = self.state.lock();
        let id = state
            .peers
            .find(&addr)
            .ok_or(TransportError::UnknownPeer(addr))?;
        if let Some(conn) = state.peers.get_mut(id) {
            conn.set_broadcast(broadcast);
        }
        Ok(())
    }

    fn broadcast_rate(&self) -> u64 {
        self.state.lock().broadcast_bytes
    }

    fn conn_statistic(&self, addr: &EndpointAddress) -> Option<ConnStatistic> {
        let state = self.state.lock();
        let id = state.peers.find(&addr.canonical())?;
        state.peers.get(id).map(|c| c.statistic())
    }

    fn clear_statistic(&self) {
        let mut state = self.state.lock();
        state.broadcast_bytes = 0;
        for conn in state.peers.values_mut() {
            conn.clear_statistic();
        }
    }

    fn set_callback(&self, callback: Arc<dyn TransportCallback>) {
        self.callback.set(callback);
    }

    fn local_port(&self) -> Option<u16> {
        self.socket.read().as_ref().map(|s| s.local_port())
    }
}
