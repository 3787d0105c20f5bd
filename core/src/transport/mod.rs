//! Transport Module
//!
//! A uniform connection-oriented packet interface over TCP, plain UDP and a
//! reliable UDP protocol with optional multicast.
//!
//! Every transport is driven by one task calling [`NetIo::execute`], which is
//! the only place callbacks fire. All other operations are synchronous, take
//! short-lived locks and may be called from any thread.

pub mod config;
pub mod connection;
pub mod fragment;
pub mod packet;
pub mod reliable;
pub mod tcp;
pub mod udp;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::address::EndpointAddress;

// Re-exports for convenience
pub use config::{ReliableConfig, TcpConfig, UdpConfig};
pub use connection::{Connection, ConnectionState};
pub use packet::{Body, Header, Packet, PacketError, PacketType};
pub use reliable::ReliableUdpTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// An addressed payload. Cloning shares the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetPacket {
    /// Destination when sending, source when received
    pub addr: EndpointAddress,
    pub data: Bytes,
}

impl NetPacket {
    pub fn new(addr: EndpointAddress, data: impl Into<Bytes>) -> Self {
        NetPacket {
            addr,
            data: data.into(),
        }
    }
}

/// Traffic of one connection since the last `clear_statistic`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStatistic {
    /// Bytes received, per-packet header overhead included
    pub in_rate: u64,
    /// Bytes sent, per-packet header overhead included
    pub out_rate: u64,
    /// Sequence numbers asked to be resent
    pub loss: u64,
}

/// Events collected under the transport lock and dispatched after it is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected {
        peer: EndpointAddress,
        connect_addr: EndpointAddress,
        own_addr: Option<EndpointAddress>,
    },
    Packet(NetPacket),
    Disconnected {
        peer: EndpointAddress,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport not initialized")]
    NotInitialized,
    #[error("{context}: {source}")]
    Socket {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Unknown peer: {0}")]
    UnknownPeer(EndpointAddress),
    #[error("Invalid broadcast address: {0}")]
    InvalidBroadcastAddress(String),
    #[error("Multicast disabled: loopback test failed")]
    LoopbackTestFailed,
    #[error("No IPv6 unicast address available")]
    NoIpv6Address,
    #[error("No unused multicast group found")]
    MulticastExhausted,
    #[error("Multicast not active")]
    NoBroadcastGroup,
    #[error("Operation not supported by this transport")]
    Unsupported,
    #[error("Outgoing backlog rejected the packet")]
    BacklogFull,
    #[error("Packet of {0} bytes is too large")]
    PacketTooLarge(usize),
}

impl TransportError {
    pub(crate) fn socket(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| TransportError::Socket { context, source }
    }
}

/// Receiver of transport events. Methods run inside `execute`.
pub trait TransportCallback: Send + Sync {
    /// A connection was established. Returning false closes it again.
    fn on_conn(
        &self,
        _peer: &EndpointAddress,
        _connect_addr: &EndpointAddress,
        _own_addr: Option<&EndpointAddress>,
        _io: &dyn NetIo,
    ) -> bool {
        true
    }

    /// Ends a connection announced by `on_conn`, or reports a failed `connect`.
    fn on_disconn(&self, _peer: &EndpointAddress, _io: &dyn NetIo, _reason: &str) {}

    fn on_packet(&self, packet: &NetPacket, io: &dyn NetIo);
}

/// Network I/O object
#[async_trait]
pub trait NetIo: Send + Sync {
    /// Binds local resources. Calling it again closes the previous session first.
    async fn init(&self, port: u16) -> Result<(), TransportError>;

    /// Joins the given multicast group, or derives one if none is given.
    async fn init_broadcast(
        &self,
        group: Option<EndpointAddress>,
    ) -> Result<EndpointAddress, TransportError>;

    async fn close_broadcast(&self) -> Result<(), TransportError>;

    /// Closes all connections and releases the sockets.
    async fn close(&self) -> Result<(), TransportError>;

    /// Waits for I/O up to `timeout` (forever if `None`) and fires callbacks.
    async fn execute(&self, timeout: Option<Duration>) -> Result<(), TransportError>;

    /// Wakes a blocked `execute`.
    fn unblock(&self);

    /// Starts connecting; the outcome is reported through the callbacks.
    fn connect(&self, addr: &EndpointAddress) -> Result<(), TransportError>;

    fn close_peer(&self, addr: &EndpointAddress) -> Result<(), TransportError>;

    fn send(&self, packet: NetPacket) -> Result<(), TransportError>;

    /// Sends to every peer selected with `set_broadcast`.
    fn broadcast(&self, packet: NetPacket) -> Result<(), TransportError>;

    fn set_broadcast(&self, addr: &EndpointAddress, broadcast: bool) -> Result<(), TransportError>;

    /// Bytes sent via broadcast since the last `clear_statistic`
    fn broadcast_rate(&self) -> u64;

    fn conn_statistic(&self, addr: &EndpointAddress) -> Option<ConnStatistic>;

    fn clear_statistic(&self);

    fn set_callback(&self, callback: Arc<dyn TransportCallback>);

    fn local_port(&self) -> Option<u16>;
}

/// Registered callback, cloned out before calling so no lock is held.
#[derive(Default)]
pub(crate) struct CallbackSlot(RwLock<Option<Arc<dyn TransportCallback>>>);

impl CallbackSlot {
    pub fn set(&self, callback: Arc<dyn TransportCallback>) {
        *self.0.write() = Some(callback);
    }

    pub fn get(&self) -> Option<Arc<dyn TransportCallback>> {
        self.0.read().clone()
    }
}
