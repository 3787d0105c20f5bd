//! NetIO Core Library
//! Peer-to-peer packet transports over TCP, UDP and reliable UDP with multicast

pub mod address;
pub mod transport;

pub use address::{EndpointAddress, HostAddress};
pub use transport::{
    ConnStatistic, NetIo, NetPacket, ReliableConfig, ReliableUdpTransport, TcpConfig,
    TcpTransport, TransportCallback, TransportError, UdpConfig, UdpTransport,
};

/// Initialize the core library (logging)
pub fn init() {
    // A host application may have installed its own subscriber already;
    // "already set" is treated as a no-op.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("NetIO Core Initialized (logger ready)");
}
