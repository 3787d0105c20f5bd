//! Transport configuration
//!
//! All structs deserialize with defaults for missing fields, so a host
//! application can load partial settings from its own config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the TCP transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Timeout for an outbound connect attempt (ms)
    pub connect_timeout_ms: u64,
    /// Frames announcing a larger payload close the peer
    pub max_frame_size: usize,
    /// Size of a single socket read
    pub read_chunk: usize,
    pub reuse_address: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            connect_timeout_ms: 10_000,
            max_frame_size: 16 * 1024 * 1024,
            read_chunk: 8192,
            reuse_address: true,
        }
    }
}

impl TcpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Configuration for the unreliable datagram transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub reuse_address: bool,
    /// Multicast hop limit ("same net")
    pub multicast_hops: u32,
    /// How long the multicast loopback test waits for its echo (ms)
    pub loopback_timeout_ms: u64,
    pub max_datagram_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            reuse_address: false,
            multicast_hops: 16,
            loopback_timeout_ms: 1000,
            max_datagram_size: 65535,
        }
    }
}

impl UdpConfig {
    pub fn loopback_timeout(&self) -> Duration {
        Duration::from_millis(self.loopback_timeout_ms)
    }
}

/// Configuration for the reliable datagram transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliableConfig {
    pub protocol_version: u32,
    /// Handshake retry timeout (ms)
    pub std_timeout_ms: u64,
    /// Period of the Check cycle (ms)
    pub check_interval_ms: u64,
    pub connect_retries: u32,
    /// Cool-down before the same gap is asked for again (ms)
    pub recheck_interval_ms: u64,
    /// Payload bytes per Data fragment; must match on both peers
    pub fragment_size: usize,
    /// Bound on each packet backlog
    pub max_backlog: usize,
    pub max_ask_count: usize,
    /// Established connections without traffic for this long are closed (ms)
    pub idle_timeout_ms: u64,
    /// Attempts at finding an unused multicast group
    pub group_probe_attempts: u32,
    pub udp: UdpConfig,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        ReliableConfig {
            protocol_version: 2,
            std_timeout_ms: 1000,
            check_interval_ms: 1000,
            connect_retries: 5,
            recheck_interval_ms: 1000,
            // 512 byte datagrams minus the data header
            fragment_size: 512 - super::packet::DATA_HEADER_SIZE,
            max_backlog: 10_000,
            max_ask_count: 10,
            idle_timeout_ms: 30_000,
            group_probe_attempts: 100,
            udp: UdpConfig::default(),
        }
    }
}

impl ReliableConfig {
    pub fn std_timeout(&self) -> Duration {
        Duration::from_millis(self.std_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
