//! Connection State Management
//!
//! Per-peer state of the reliable datagram protocol. A `Connection` performs
//! no I/O: every operation receives a [`Link`] carrying the current time, the
//! transport-wide multicast state and an [`Outbox`] that collects datagrams
//! to send and events to report once the transport lock is released.
//!
//! ```text
//!   None ──connect──► Connecting ──ConnOK / Conn──► Established
//!                         │                              │
//!                   retries exceeded             Close / timeout
//!                         ▼                              ▼
//!                       Closed ◄─────────────────────────┘
//! ```

use bytes::Bytes;
use std::time::{Duration, Instant};

use super::config::ReliableConfig;
use super::fragment::{FragmentedPacket, PacketBacklog};
use super::packet::{Body, MulticastMode, Packet};
use super::udp::UDP_HEADER_SIZE;
use super::{ConnStatistic, NetPacket, TransportError, TransportEvent};
use crate::address::EndpointAddress;

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    /// Conn sent, waiting for ConnOK
    Connecting,
    /// Connection established, ready for data
    Established,
    /// Connection terminated, awaiting removal
    Closed,
}

/// A datagram produced by the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Unicast(EndpointAddress, Bytes),
    Multicast(Bytes),
}

/// Datagrams and events produced while the transport state is locked
#[derive(Debug, Default)]
pub struct Outbox {
    pub datagrams: Vec<Outgoing>,
    pub events: Vec<TransportEvent>,
    /// Bytes sent to the multicast group, headers included
    pub multicast_bytes: u64,
}

impl Outbox {
    pub fn unicast(&mut self, to: EndpointAddress, packet: &Packet) -> usize {
        let bytes = packet.to_bytes();
        let len = bytes.len();
        self.datagrams.push(Outgoing::Unicast(to, bytes));
        len
    }

    pub fn multicast(&mut self, packet: &Packet) -> usize {
        let bytes = packet.to_bytes();
        let len = bytes.len();
        self.multicast_bytes += len as u64 + UDP_HEADER_SIZE;
        self.datagrams.push(Outgoing::Multicast(bytes));
        len
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty() && self.events.is_empty()
    }
}

/// Transport-wide context handed to every connection operation
pub struct Link<'a> {
    pub now: Instant,
    pub config: &'a ReliableConfig,
    /// Multicast group of the local transport, if active
    pub multicast_group: Option<EndpointAddress>,
    pub local_port: u16,
    /// Outgoing multicast backlog, for answering multicast asks
    pub mc_out: &'a PacketBacklog,
    /// Next sequence number of the multicast stream
    pub mc_out_counter: u32,
    pub outbox: &'a mut Outbox,
}

#[derive(Debug, Default, Clone, Copy)]
struct Stats {
    in_bytes: u64,
    out_bytes: u64,
    loss: u64,
}

/// Represents a single reliable datagram connection
#[derive(Debug)]
pub struct Connection {
    addr: EndpointAddress,
    alt_addr: Option<EndpointAddress>,
    /// Our own address as used by the peer
    own_addr: Option<EndpointAddress>,
    state: ConnectionState,
    close_request: Option<String>,

    /// Peer confirmed (or is negotiating) multicast delivery
    multicast: bool,
    broadcast: bool,
    fail_callback: bool,
    /// Sequence number announced by the Conn of the current handshake phase
    conn_nr: u32,

    out: PacketBacklog,
    incoming: PacketBacklog,
    incoming_mc: PacketBacklog,

    out_counter: u32,
    /// Next unicast sequence number to deliver
    in_counter: u32,
    /// Highest unicast sequence number the peer is known to have sent
    remote_in_counter: u32,
    in_mc_counter: u32,
    remote_in_mc_counter: u32,
    /// Peer's multicast acknowledgement watermark
    mc_ack: u32,

    next_recheck: Option<Instant>,
    last_asked: Option<u32>,
    last_mc_asked: Option<u32>,

    timeout: Option<Instant>,
    retries: u32,
    last_recv: Instant,

    stats: Stats,
}

impl Connection {
    pub fn new(addr: EndpointAddress, now: Instant, config: &ReliableConfig) -> Self {
        Connection {
            addr,
            alt_addr: None,
            own_addr: None,
            state: ConnectionState::None,
            close_request: None,
            multicast: false,
            broadcast: false,
            fail_callback: false,
            conn_nr: 0,
            out: PacketBacklog::new(config.max_backlog),
            incoming: PacketBacklog::new(config.max_backlog),
            incoming_mc: PacketBacklog::new(config.max_backlog),
            out_counter: 0,
            in_counter: 0,
            remote_in_counter: 0,
            in_mc_counter: 0,
            remote_in_mc_counter: 0,
            mc_ack: 0,
            next_recheck: None,
            last_asked: None,
            last_mc_asked: None,
            timeout: None,
            retries: 0,
            last_recv: now,
            stats: Stats::default(),
        }
    }

    pub fn addr(&self) -> EndpointAddress {
        self.addr
    }

    pub fn alt_addr(&self) -> Option<EndpointAddress> {
        self.alt_addr
    }

    pub fn set_alt_addr(&mut self, addr: EndpointAddress) {
        self.alt_addr = Some(addr);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Closed, or closing as soon as the owning thread gets to it.
    pub fn is_closing(&self) -> bool {
        self.is_closed() || self.close_request.is_some()
    }

    pub fn multicast(&self) -> bool {
        self.multicast
    }

    pub fn broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn set_broadcast(&mut self, broadcast: bool) {
        self.broadcast = broadcast;
    }

    pub fn mc_ack(&self) -> u32 {
        self.mc_ack
    }

    pub fn out_counter(&self) -> u32 {
        self.out_counter
    }

    /// Marks the connection for closing on the next executor pass.
    pub fn request_close(&mut self, reason: &str) {
        if self.close_request.is_none() {
            self.close_request = Some(reason.to_string());
        }
    }

    pub fn take_close_request(&mut self) -> Option<String> {
        self.close_request.take()
    }

    pub fn statistic(&self) -> ConnStatistic {
        ConnStatistic {
            in_rate: self.stats.in_bytes,
            out_rate: self.stats.out_bytes,
            loss: self.stats.loss,
        }
    }

    pub fn clear_statistic(&mut self) {
        self.stats = Stats::default();
    }

    /// Earliest point in time this connection needs attention
    pub fn next_timeout(&self, config: &ReliableConfig) -> Option<Instant> {
        let idle = self
            .is_open()
            .then(|| self.last_recv + config.idle_timeout());
        match (self.timeout, idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn emit(&mut self, packet: Packet, link: &mut Link<'_>) {
        let len = if packet.multicast {
            link.outbox.multicast(&packet)
        } else {
            link.outbox.unicast(self.addr, &packet)
        };
        self.stats.out_bytes += len as u64 + UDP_HEADER_SIZE;
    }

    /// Starts the handshake. `fail_callback` requests a disconnect event if it fails.
    pub fn connect(&mut self, fail_callback: bool, link: &mut Link<'_>) {
        self.multicast = false;
        self.fail_callback = fail_callback;
        self.conn_nr = self.out_counter;
        self.do_conn(false, link);
    }

    fn do_conn(&mut self, multicast: bool, link: &mut Link<'_>) {
        self.state = ConnectionState::Connecting;
        self.timeout = Some(link.now + link.config.std_timeout());
        self.retries = link.config.connect_retries;
        let packet = Packet::new(
            self.conn_nr,
            multicast,
            Body::Conn {
                version: link.config.protocol_version,
                addr: self.addr,
                multicast_group: link.multicast_group,
            },
        );
        self.emit(packet, link);
    }

    /// Queues an application packet. It goes out right away once established,
    /// earlier packets are fetched by the peer's Check cycle.
    pub fn send(&mut self, data: &[u8], link: &mut Link<'_>) -> Result<(), TransportError> {
        let packet = FragmentedPacket::outgoing(self.out_counter, data, link.config.fragment_size);
        if packet.fragment_count() as usize > link.config.max_backlog {
            return Err(TransportError::PacketTooLarge(data.len()));
        }
        self.out_counter = packet.end_nr();
        if self.is_open() {
            for fragment in packet.fragments(false) {
                self.emit(fragment, link);
            }
        }
        if !self.out.insert(packet) {
            return Err(TransportError::BacklogFull);
        }
        Ok(())
    }

    /// Handles a datagram from this peer. `wire_len` feeds the statistics.
    pub fn on_recv(&mut self, packet: Packet, wire_len: usize, link: &mut Link<'_>) {
        self.stats.in_bytes += wire_len as u64 + UDP_HEADER_SIZE;
        self.last_recv = link.now;
        let multicast = packet.multicast;
        if multicast {
            self.remote_in_mc_counter = self.remote_in_mc_counter.max(packet.nr);
        } else {
            self.remote_in_counter = self.remote_in_counter.max(packet.nr);
        }

        match packet.body {
            Body::Conn {
                version,
                addr,
                multicast_group: _,
            } => {
                if version != link.config.protocol_version {
                    tracing::debug!(
                        "Ignoring Conn from {} with protocol version {}",
                        self.addr,
                        version
                    );
                    return;
                }
                if !self.on_conn_request(packet.nr, multicast, addr, link) {
                    return;
                }
            }
            Body::ConnOk { mode, addr } => self.on_conn_ok(mode, addr, link),
            Body::Data {
                start_nr,
                total_size,
                payload,
            } => self.on_data(packet.nr, multicast, start_nr, total_size, &payload, link),
            Body::Check {
                ack,
                mc_ack,
                asks,
                mc_asks,
            } => {
                if !self.on_check(ack, mc_ack, &asks, &mc_asks, link) {
                    return;
                }
            }
            Body::Close { addr } => {
                if self.own_addr.map_or(true, |own| own == addr) {
                    self.on_close("connection closed by peer", link);
                }
                return;
            }
            Body::Ping | Body::Test | Body::AddAddr { .. } => {}
        }

        // gaps may have become visible
        if self.is_open() {
            self.check(false, link);
        }
    }

    /// Returns false if the request was not taken up.
    fn on_conn_request(
        &mut self,
        nr: u32,
        multicast: bool,
        addr: EndpointAddress,
        link: &mut Link<'_>,
    ) -> bool {
        if !multicast {
            if let Some(own) = self.own_addr.filter(|own| *own != addr) {
                // Peer reaches us under a second address: tell it, but leave
                // this connection alone.
                let packet = Packet::new(
                    self.out_counter,
                    false,
                    Body::AddAddr {
                        addr: own,
                        new_addr: addr,
                    },
                );
                self.emit(packet, link);
                return false;
            }
            if self.is_open() && self.in_counter != nr {
                tracing::info!("Peer {} restarted, reconnecting", self.addr);
                self.on_close("reconnect", link);
                self.connect(false, link);
            }
            self.own_addr = Some(addr);
        }

        if multicast {
            self.remote_in_mc_counter = nr;
            self.in_mc_counter = nr;
        } else {
            self.remote_in_counter = nr;
            self.in_counter = nr;
        }
        // both streams restart; unicast fragments still missing get asked again
        self.incoming.clear();
        self.incoming_mc.clear();
        self.next_recheck = None;
        self.last_asked = None;
        self.last_mc_asked = None;

        let mode = if multicast {
            MulticastMode::MulticastOk
        } else if link.multicast_group.is_some() && self.addr.port == link.local_port {
            MulticastMode::TryMulticast
        } else {
            MulticastMode::NoMulticast
        };
        let reply = Packet::new(
            self.out_counter,
            false,
            Body::ConnOk {
                mode,
                addr: self.addr,
            },
        );
        // ConnOK goes out before any data the application sends from its callback
        self.emit(reply, link);
        if mode == MulticastMode::NoMulticast {
            self.on_established(link);
        }
        true
    }

    fn on_conn_ok(&mut self, mode: MulticastMode, addr: EndpointAddress, link: &mut Link<'_>) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.own_addr = Some(addr);
        match mode {
            MulticastMode::TryMulticast if link.multicast_group.is_some() => {
                if !self.multicast {
                    // confirm via the group with another Conn
                    self.multicast = true;
                    self.conn_nr = link.mc_out_counter;
                    self.do_conn(true, link);
                }
            }
            MulticastMode::TryMulticast | MulticastMode::NoMulticast => {
                self.multicast = false;
                self.on_established(link);
            }
            MulticastMode::MulticastOk => {
                self.multicast = true;
                self.on_established(link);
            }
        }
    }

    fn on_data(
        &mut self,
        nr: u32,
        multicast: bool,
        start_nr: u32,
        total_size: u32,
        payload: &[u8],
        link: &mut Link<'_>,
    ) {
        let (counter, backlog) = if multicast {
            (self.in_mc_counter, &mut self.incoming_mc)
        } else {
            (self.in_counter, &mut self.incoming)
        };
        // already delivered
        if nr < counter {
            return;
        }
        let result = match backlog.get_mut(start_nr) {
            Some(packet) => packet.add_fragment(nr, start_nr, total_size, payload),
            None => FragmentedPacket::incoming(
                start_nr,
                total_size,
                link.config.fragment_size,
                link.config.max_backlog,
            )
            .and_then(|mut packet| {
                let stored = packet.add_fragment(nr, start_nr, total_size, payload)?;
                if !backlog.insert(packet) {
                    tracing::debug!("Fragment {} from {} overlaps another packet", nr, self.addr);
                }
                Ok(stored)
            }),
        };
        match result {
            Ok(true) => self.deliver_complete(link),
            Ok(false) => tracing::trace!("Duplicate fragment {} from {}", nr, self.addr),
            Err(e) => tracing::debug!("Dropping fragment {} from {}: {}", nr, self.addr, e),
        }
    }

    /// Returns false if the connection was closed.
    fn on_check(
        &mut self,
        ack: u32,
        mc_ack: u32,
        asks: &[u32],
        mc_asks: &[u32],
        link: &mut Link<'_>,
    ) -> bool {
        self.out.clear_until(ack);
        self.mc_ack = self.mc_ack.max(mc_ack);

        for &nr in asks {
            match self.out.find_fragment(nr).and_then(|p| p.fragment(nr, false)) {
                Some(fragment) => {
                    tracing::trace!("Resending fragment {} to {}", nr, self.addr);
                    self.emit(fragment, link);
                }
                None => {
                    self.close("starvation", link);
                    return false;
                }
            }
        }
        for &nr in mc_asks {
            match link.mc_out.find_fragment(nr).and_then(|p| p.fragment(nr, true)) {
                Some(fragment) => {
                    tracing::trace!("Resending multicast fragment {} for {}", nr, self.addr);
                    self.emit(fragment, link);
                }
                None => {
                    self.close("starvation", link);
                    return false;
                }
            }
        }
        true
    }

    fn on_established(&mut self, link: &mut Link<'_>) {
        if self.is_open() {
            return;
        }
        self.timeout = None;
        self.state = ConnectionState::Established;
        self.last_recv = link.now;
        tracing::info!(
            "Connection to {} established (multicast: {})",
            self.addr,
            self.multicast
        );
        link.outbox.events.push(TransportEvent::Connected {
            peer: self.addr,
            connect_addr: self.addr,
            own_addr: self.own_addr,
        });
        // the peer may have sent data while the handshake was in progress
        self.deliver_complete(link);
    }

    fn deliver_complete(&mut self, link: &mut Link<'_>) {
        if !self.is_open() {
            return;
        }
        self.incoming.clear_until(self.in_counter);
        while let Some(packet) = self.incoming.pop_complete(self.in_counter) {
            self.in_counter = packet.end_nr();
            link.outbox.events.push(TransportEvent::Packet(NetPacket::new(
                self.addr,
                packet.into_data(),
            )));
        }
        self.incoming_mc.clear_until(self.in_mc_counter);
        while let Some(packet) = self.incoming_mc.pop_complete(self.in_mc_counter) {
            self.in_mc_counter = packet.end_nr();
            link.outbox.events.push(TransportEvent::Packet(NetPacket::new(
                self.addr,
                packet.into_data(),
            )));
        }
    }

    /// Asks for missing fragments. With `force` a Check goes out even if
    /// nothing is missing, carrying the acknowledgement watermarks.
    pub fn check(&mut self, force: bool, link: &mut Link<'_>) {
        if !self.is_open() {
            return;
        }
        // During the cool-down only gaps beyond the ones already asked for are requested
        let cooling = self.next_recheck.map_or(false, |t| t > link.now);
        if !cooling {
            self.last_asked = None;
            self.last_mc_asked = None;
        }
        let start = match self.last_asked {
            Some(last) if cooling => self.in_counter.max(last.saturating_add(1)),
            _ => self.in_counter,
        };
        let start_mc = match self.last_mc_asked {
            Some(last) if cooling => self.in_mc_counter.max(last.saturating_add(1)),
            _ => self.in_mc_counter,
        };

        let max = link.config.max_ask_count;
        let asks: Vec<u32> = (start..self.remote_in_counter)
            .filter(|nr| !self.incoming.fragment_present(*nr))
            .take(max)
            .collect();
        let mc_asks: Vec<u32> = (start_mc..self.remote_in_mc_counter)
            .filter(|nr| !self.incoming_mc.fragment_present(*nr))
            .take(max - asks.len())
            .collect();
        if let Some(&last) = asks.last() {
            self.last_asked = Some(last);
        }
        if let Some(&last) = mc_asks.last() {
            self.last_mc_asked = Some(last);
        }

        let asked = asks.len() + mc_asks.len();
        if !cooling {
            self.next_recheck = (asked > 0).then(|| link.now + link.config.recheck_interval());
        }
        if asked > 0 || force {
            self.stats.loss += asked as u64;
            let packet = Packet::new(
                self.out_counter,
                false,
                Body::Check {
                    ack: self.in_counter,
                    mc_ack: self.in_mc_counter,
                    asks,
                    mc_asks,
                },
            );
            self.emit(packet, link);
        }
    }

    /// Handles handshake retries and idle connections.
    pub fn check_timeout(&mut self, link: &mut Link<'_>) {
        if self.is_closed() {
            return;
        }
        if self.is_open() && link.now >= self.last_recv + link.config.idle_timeout() {
            tracing::info!("Connection to {} idle, closing", self.addr);
            self.close("connection timeout", link);
            return;
        }
        match self.timeout {
            Some(timeout) if link.now >= timeout => {}
            _ => return,
        }
        if self.state == ConnectionState::Connecting {
            if self.retries > 0 {
                let retries = self.retries - 1;
                tracing::debug!("Retrying Conn to {} ({} left)", self.addr, retries);
                self.do_conn(self.multicast, link);
                self.retries = retries;
                return;
            }
            self.close("connection timeout", link);
        }
        self.timeout = None;
    }

    /// Sends a Close packet and reports the disconnect.
    pub fn close(&mut self, reason: &str, link: &mut Link<'_>) {
        if self.is_closed() {
            return;
        }
        let packet = Packet::new(0, false, Body::Close { addr: self.addr });
        self.emit(packet, link);
        self.on_close(reason, link);
    }

    fn on_close(&mut self, reason: &str, link: &mut Link<'_>) {
        let report = self.is_open() || (self.state == ConnectionState::Connecting && self.fail_callback);
        if report {
            link.outbox.events.push(TransportEvent::Disconnected {
                peer: self.addr,
                reason: reason.to_string(),
            });
        }
        tracing::info!("Connection to {} closed: {}", self.addr, reason);
        self.state = ConnectionState::Closed;
        self.timeout = None;
    }
}

/// Remaining time until `deadline`, zero if it has passed.
pub fn until(now: Instant, deadline: Instant) -> Duration {
    deadline.saturating_duration_since(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::packet::PacketType;
    use std::collections::BTreeSet;

    /// One side of an in-memory connection pair
    struct Side {
        conn: Connection,
        outbox: Outbox,
        mc_out: PacketBacklog,
        group: Option<EndpointAddress>,
        port: u16,
        config: ReliableConfig,
    }

    impl Side {
        fn new(peer: &str, config: &ReliableConfig, now: Instant) -> Self {
            Side {
                conn: Connection::new(peer.parse().unwrap(), now, config),
                outbox: Outbox::default(),
                mc_out: PacketBacklog::new(config.max_backlog),
                group: None,
                port: 11113,
                config: config.clone(),
            }
        }

        fn run<R>(&mut self, now: Instant, f: impl FnOnce(&mut Connection, &mut Link<'_>) -> R) -> R {
            let mut link = Link {
                now,
                config: &self.config,
                multicast_group: self.group,
                local_port: self.port,
                mc_out: &self.mc_out,
                mc_out_counter: 0,
                outbox: &mut self.outbox,
            };
            f(&mut self.conn, &mut link)
        }

        fn recv(&mut self, bytes: Bytes, multicast_delivery: bool, now: Instant) {
            let packet = Packet::decode(bytes.clone()).expect("valid packet");
            assert_eq!(packet.multicast, multicast_delivery);
            self.run(now, |conn, link| conn.on_recv(packet, bytes.len(), link));
        }

        fn take_datagrams(&mut self) -> Vec<Outgoing> {
            std::mem::take(&mut self.outbox.datagrams)
        }

        fn take_events(&mut self) -> Vec<TransportEvent> {
            std::mem::take(&mut self.outbox.events)
        }
    }

    fn decode(out: &Outgoing) -> Packet {
        match out {
            Outgoing::Unicast(_, bytes) | Outgoing::Multicast(bytes) => {
                Packet::decode(bytes.clone()).expect("valid packet")
            }
        }
    }

    /// Shuttles datagrams until both sides are quiet. `deliver` may drop a
    /// datagram by returning false; it sees (sender is a, packet).
    fn pump(
        a: &mut Side,
        b: &mut Side,
        now: Instant,
        mut deliver: impl FnMut(bool, &Packet) -> bool,
    ) {
        for _ in 0..100 {
            let from_a = a.take_datagrams();
            let from_b = b.take_datagrams();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for out in from_a {
                let packet = decode(&out);
                if deliver(true, &packet) {
                    let (Outgoing::Unicast(_, bytes) | Outgoing::Multicast(bytes)) = out;
                    b.recv(bytes, packet.multicast, now);
                }
            }
            for out in from_b {
                let packet = decode(&out);
                if deliver(false, &packet) {
                    let (Outgoing::Unicast(_, bytes) | Outgoing::Multicast(bytes)) = out;
                    a.recv(bytes, packet.multicast, now);
                }
            }
        }
        panic!("datagram exchange did not settle");
    }

    fn count_connected(events: &[TransportEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, TransportEvent::Connected { .. }))
            .count()
    }

    fn packets(events: &[TransportEvent]) -> Vec<Bytes> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Packet(p) => Some(p.data.clone()),
                _ => None,
            })
            .collect()
    }

    /// A connects to B; B's side is created by the first Conn, the way the
    /// transport does it for unknown senders.
    fn handshake(config: &ReliableConfig, now: Instant) -> (Side, Side) {
        let mut a = Side::new("10.0.0.2:11113", config, now);
        let mut b = Side::new("10.0.0.1:11113", config, now);
        handshake_sides(&mut a, &mut b, now);
        (a, b)
    }

    fn handshake_sides(a: &mut Side, b: &mut Side, now: Instant) {
        a.run(now, |conn, link| conn.connect(true, link));
        let conn = a.take_datagrams();
        assert_eq!(conn.len(), 1);
        b.run(now, |conn, link| conn.connect(false, link));
        let Outgoing::Unicast(_, bytes) = &conn[0] else {
            panic!("Conn must be unicast")
        };
        b.recv(bytes.clone(), false, now);
        pump(a, b, now, |_, _| true);
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_handshake_connects_once() {
        let now = Instant::now();
        let (mut a, mut b) = handshake(&ReliableConfig::default(), now);

        assert_eq!(a.conn.state(), ConnectionState::Established);
        assert_eq!(b.conn.state(), ConnectionState::Established);
        assert_eq!(count_connected(&a.take_events()), 1);
        assert_eq!(count_connected(&b.take_events()), 1);
        assert!(!a.conn.multicast());
    }

    #[test]
    fn test_multicast_upgrade() {
        let now = Instant::now();
        let config = ReliableConfig::default();
        let group: EndpointAddress = "[ff3e:0:40::8000:1]:11113".parse().unwrap();
        let mut a = Side::new("10.0.0.2:11113", &config, now);
        let mut b = Side::new("10.0.0.1:11113", &config, now);
        a.group = Some(group);
        b.group = Some(group);
        handshake_sides(&mut a, &mut b, now);

        assert!(a.conn.is_open() && b.conn.is_open());
        assert!(a.conn.multicast());
        assert!(b.conn.multicast());
        assert_eq!(count_connected(&a.take_events()), 1);
        assert_eq!(count_connected(&b.take_events()), 1);
    }

    #[test]
    fn test_lost_multicast_fragment_is_recovered() {
        let now = Instant::now();
        let config = ReliableConfig {
            fragment_size: 512,
            ..ReliableConfig::default()
        };
        let group: EndpointAddress = "[ff3e:0:40::8000:1]:11113".parse().unwrap();
        let mut a = Side::new("10.0.0.2:11113", &config, now);
        let mut b = Side::new("10.0.0.1:11113", &config, now);
        a.group = Some(group);
        b.group = Some(group);
        handshake_sides(&mut a, &mut b, now);
        assert!(a.conn.multicast() && b.conn.multicast());
        b.take_events();

        // A broadcasts through the group: fragments 0..10 of its multicast stream
        let data = payload(5_000);
        let broadcast = FragmentedPacket::outgoing(0, &data, config.fragment_size);
        for fragment in broadcast.fragments(true) {
            a.outbox.multicast(&fragment);
        }
        assert!(a.mc_out.insert(broadcast));

        let mut dropped = false;
        let mut mc_asked = Vec::new();
        pump(&mut a, &mut b, now, |from_a, packet| match &packet.body {
            Body::Data { .. } if from_a && packet.multicast && packet.nr == 3 && !dropped => {
                dropped = true;
                false
            }
            Body::Check { mc_asks, asks, .. } if !from_a => {
                assert!(asks.is_empty());
                mc_asked.extend(mc_asks.iter().copied());
                true
            }
            _ => true,
        });

        assert_eq!(mc_asked, vec![3]);
        let delivered = packets(&b.take_events());
        assert_eq!(delivered.len(), 1);
        assert_eq!(&delivered[0][..], &data[..]);
    }

    #[test]
    fn test_lost_fragments_are_asked_for_exactly() {
        let now = Instant::now();
        let config = ReliableConfig {
            fragment_size: 512,
            ..ReliableConfig::default()
        };
        let (mut a, mut b) = handshake(&config, now);
        a.take_events();
        b.take_events();

        let data = payload(10_000);
        let base = a.conn.out_counter();
        a.run(now, |conn, link| conn.send(&data, link)).expect("send");
        assert_eq!(a.conn.out_counter(), base + 20);

        let mut dropped = BTreeSet::new();
        let mut asked = BTreeSet::new();
        let mut resent = Vec::new();
        let mut first_pass = BTreeSet::new();
        pump(&mut a, &mut b, now, |from_a, packet| match &packet.body {
            Body::Data { .. } if from_a => {
                if !first_pass.insert(packet.nr) {
                    resent.push(packet.nr);
                }
                let lost = (packet.nr == base + 3 || packet.nr == base + 7)
                    && dropped.insert(packet.nr);
                !lost
            }
            Body::Check { asks, .. } if !from_a => {
                asked.extend(asks.iter().copied());
                true
            }
            _ => true,
        });

        assert_eq!(asked, BTreeSet::from([base + 3, base + 7]));
        assert_eq!(resent, vec![base + 3, base + 7]);
        let delivered = packets(&b.take_events());
        assert_eq!(delivered.len(), 1);
        assert_eq!(&delivered[0][..], &data[..]);
    }

    #[test]
    fn test_in_order_delivery() {
        let now = Instant::now();
        let config = ReliableConfig {
            fragment_size: 512,
            ..ReliableConfig::default()
        };
        let (mut a, mut b) = handshake(&config, now);
        b.take_events();

        let first = payload(1000);
        a.run(now, |conn, link| conn.send(&first, link)).expect("send");
        a.run(now, |conn, link| conn.send(b"second", link)).expect("send");
        let datagrams = a.take_datagrams();
        assert_eq!(datagrams.len(), 3);

        // hold back the second fragment of the first packet
        let (held, rest): (Vec<_>, Vec<_>) = datagrams.into_iter().partition(|d| decode(d).nr == 1);
        for out in rest {
            let Outgoing::Unicast(_, bytes) = out else { panic!() };
            b.recv(bytes, false, now);
        }
        assert!(packets(&b.outbox.events).is_empty());

        for out in held {
            let Outgoing::Unicast(_, bytes) = out else { panic!() };
            b.recv(bytes, false, now);
        }
        let delivered = packets(&b.take_events());
        assert_eq!(delivered.len(), 2);
        assert_eq!(&delivered[0][..], &first[..]);
        assert_eq!(&delivered[1][..], b"second");
    }

    #[test]
    fn test_queued_before_established() {
        let now = Instant::now();
        let config = ReliableConfig::default();
        let mut a = Side::new("10.0.0.2:11113", &config, now);
        let mut b = Side::new("10.0.0.1:11113", &config, now);
        a.run(now, |conn, link| conn.connect(true, link));
        a.run(now, |conn, link| conn.send(b"early", link)).expect("send");
        // only the Conn went out
        assert_eq!(a.outbox.datagrams.len(), 1);

        b.run(now, |conn, link| conn.connect(false, link));
        let conn = a.take_datagrams();
        let Outgoing::Unicast(_, bytes) = &conn[0] else { panic!() };
        b.recv(bytes.clone(), false, now);
        pump(&mut a, &mut b, now, |_, _| true);

        // B learns about the packet from A's next Check and asks for it
        a.run(now, |conn, link| conn.check(true, link));
        pump(&mut a, &mut b, now, |_, _| true);
        let delivered = packets(&b.take_events());
        assert_eq!(delivered, vec![Bytes::from_static(b"early")]);
    }

    #[test]
    fn test_resend_only_what_is_asked() {
        let now = Instant::now();
        let (mut a, _b) = handshake(&ReliableConfig::default(), now);
        for i in 0..4u8 {
            a.run(now, |conn, link| conn.send(&[i; 10], link)).expect("send");
        }
        a.take_datagrams();

        let check = Packet::new(
            0,
            false,
            Body::Check {
                ack: 1,
                mc_ack: 0,
                asks: vec![2],
                mc_asks: vec![],
            },
        );
        a.recv(check.to_bytes(), false, now);
        let sent: Vec<Packet> = a.take_datagrams().iter().map(decode).collect();
        let data: Vec<u32> = sent
            .iter()
            .filter(|p| p.body.packet_type() == PacketType::Data)
            .map(|p| p.nr)
            .collect();
        assert_eq!(data, vec![2]);

        // asking for an acknowledged fragment starves the connection
        let stale = Packet::new(
            0,
            false,
            Body::Check {
                ack: 1,
                mc_ack: 0,
                asks: vec![0],
                mc_asks: vec![],
            },
        );
        a.recv(stale.to_bytes(), false, now);
        assert!(a.conn.is_closed());
        let events = a.take_events();
        assert!(matches!(
            events.last(),
            Some(TransportEvent::Disconnected { reason, .. }) if reason == "starvation"
        ));
    }

    #[test]
    fn test_connect_timeout() {
        let start = Instant::now();
        let config = ReliableConfig::default();
        let mut a = Side::new("10.0.0.2:11113", &config, start);
        a.run(start, |conn, link| conn.connect(true, link));

        let retries = config.connect_retries as u64;
        for step in 1..=retries + 2 {
            let now = start + config.std_timeout() * step as u32;
            a.run(now, |conn, link| conn.check_timeout(link));
        }

        let conns = a
            .take_datagrams()
            .iter()
            .map(decode)
            .filter(|p| p.body.packet_type() == PacketType::Conn)
            .count();
        assert_eq!(conns as u64, 1 + retries);
        let events = a.take_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TransportEvent::Disconnected { reason, .. } if reason == "connection timeout"
        ));
        assert!(a.conn.is_closed());
    }

    #[test]
    fn test_incoming_connect_failure_is_silent() {
        let start = Instant::now();
        let config = ReliableConfig::default();
        let mut b = Side::new("10.0.0.1:11113", &config, start);
        b.run(start, |conn, link| conn.connect(false, link));
        for step in 1..=config.connect_retries + 1 {
            let now = start + config.std_timeout() * step;
            b.run(now, |conn, link| conn.check_timeout(link));
        }
        assert!(b.conn.is_closed());
        assert!(b.take_events().is_empty());
    }

    #[test]
    fn test_idle_timeout_and_peer_close() {
        let now = Instant::now();
        let config = ReliableConfig::default();
        let (mut a, mut b) = handshake(&config, now);
        a.take_events();
        b.take_events();

        let later = now + config.idle_timeout();
        a.run(later, |conn, link| conn.check_timeout(link));
        assert!(a.conn.is_closed());
        assert_eq!(a.take_events().len(), 1);

        // A's Close reaches B
        let close = a.take_datagrams();
        let Outgoing::Unicast(_, bytes) = &close[0] else { panic!() };
        b.recv(bytes.clone(), false, later);
        let events = b.take_events();
        assert!(matches!(
            &events[..],
            [TransportEvent::Disconnected { reason, .. }] if reason == "connection closed by peer"
        ));
    }

    #[test]
    fn test_reconnect_after_restart() {
        let now = Instant::now();
        let config = ReliableConfig::default();
        let (mut a, mut b) = handshake(&config, now);
        a.run(now, |conn, link| conn.send(b"hello", link)).expect("send");
        pump(&mut a, &mut b, now, |_, _| true);
        a.take_events();
        b.take_events();

        // A restarts with fresh counters
        let mut a = Side::new("10.0.0.2:11113", &config, now);
        a.run(now, |conn, link| conn.connect(true, link));
        let conn = a.take_datagrams();
        let Outgoing::Unicast(_, bytes) = &conn[0] else { panic!() };
        b.recv(bytes.clone(), false, now);
        pump(&mut a, &mut b, now, |_, _| true);

        let events = b.take_events();
        assert!(matches!(
            &events[0],
            TransportEvent::Disconnected { reason, .. } if reason == "reconnect"
        ));
        assert_eq!(count_connected(&events), 1);
        assert!(b.conn.is_open());
        assert_eq!(count_connected(&a.take_events()), 1);
    }

    #[test]
    fn test_second_address_gets_add_addr() {
        let now = Instant::now();
        let (_a, mut b) = handshake(&ReliableConfig::default(), now);
        b.take_datagrams();

        let conn = Packet::new(
            0,
            false,
            Body::Conn {
                version: 2,
                addr: "192.168.0.2:11113".parse().unwrap(),
                multicast_group: None,
            },
        );
        b.recv(conn.to_bytes(), false, now);
        let sent: Vec<Packet> = b.take_datagrams().iter().map(decode).collect();
        assert!(matches!(
            &sent[..],
            [Packet { body: Body::AddAddr { .. }, .. }]
        ));
        assert!(b.conn.is_open());
    }
}
