//! Fragmentation and packet backlogs
//!
//! A packet larger than the fragment size is split into equally sized
//! fragments (the last one may be shorter). Fragment `i` of a packet starting
//! at sequence number `n` carries sequence number `n + i`, so a packet
//! occupies the range `[n, n + fragment_count)`.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use thiserror::Error;

use super::packet::{Body, Packet};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("Fragment {nr} does not belong to packet {start_nr}")]
    Mismatch { nr: u32, start_nr: u32 },
    #[error("Fragment {0} conflicts with previously received data")]
    Conflict(u32),
    #[error("Packet of {0} bytes exceeds the backlog limit")]
    TooLarge(u32),
}

fn fragment_count(size: usize, fragment_size: usize) -> u32 {
    if size == 0 {
        1
    } else {
        ((size - 1) / fragment_size + 1) as u32
    }
}

/// One application packet, possibly spread over several fragments.
#[derive(Debug, Clone)]
pub struct FragmentedPacket {
    nr: u32,
    data: BytesMut,
    fragment_size: usize,
    /// Per-fragment presence, only tracked when there is more than one fragment
    present: Option<Vec<bool>>,
    received: u32,
}

impl FragmentedPacket {
    /// Wraps a complete outgoing packet starting at sequence number `nr`.
    pub fn outgoing(nr: u32, data: &[u8], fragment_size: usize) -> Self {
        let count = fragment_count(data.len(), fragment_size);
        FragmentedPacket {
            nr,
            data: BytesMut::from(data),
            fragment_size,
            present: None,
            received: count,
        }
    }

    /// Creates an empty incoming packet from the header of one of its fragments.
    pub fn incoming(
        start_nr: u32,
        total_size: u32,
        fragment_size: usize,
        max_fragments: usize,
    ) -> Result<Self, FragmentError> {
        let count = fragment_count(total_size as usize, fragment_size);
        if count as usize > max_fragments || start_nr.checked_add(count).is_none() {
            return Err(FragmentError::TooLarge(total_size));
        }
        Ok(FragmentedPacket {
            nr: start_nr,
            data: BytesMut::zeroed(total_size as usize),
            fragment_size,
            present: (count > 1).then(|| vec![false; count as usize]),
            received: 0,
        })
    }

    /// Sequence number of the first fragment
    pub fn nr(&self) -> u32 {
        self.nr
    }

    pub fn fragment_count(&self) -> u32 {
        fragment_count(self.data.len(), self.fragment_size)
    }

    /// One past the last fragment's sequence number
    pub fn end_nr(&self) -> u32 {
        self.nr.wrapping_add(self.fragment_count())
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn contains(&self, nr: u32) -> bool {
        nr >= self.nr && nr < self.end_nr()
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.fragment_count()
    }

    pub fn fragment_present(&self, nr: u32) -> bool {
        if !self.contains(nr) {
            return false;
        }
        match &self.present {
            Some(present) => present[(nr - self.nr) as usize],
            None => self.received > 0,
        }
    }

    fn fragment_range(&self, index: u32) -> std::ops::Range<usize> {
        let start = index as usize * self.fragment_size;
        start..(start + self.fragment_size).min(self.data.len())
    }

    /// Stores one fragment. Returns `Ok(false)` for an identical duplicate.
    pub fn add_fragment(
        &mut self,
        nr: u32,
        start_nr: u32,
        total_size: u32,
        payload: &[u8],
    ) -> Result<bool, FragmentError> {
        if start_nr != self.nr || total_size as usize != self.data.len() || !self.contains(nr) {
            return Err(FragmentError::Mismatch { nr, start_nr });
        }
        let index = nr - self.nr;
        let range = self.fragment_range(index);
        if payload.len() != range.len() {
            return Err(FragmentError::Mismatch { nr, start_nr });
        }
        if self.fragment_present(nr) {
            return if &self.data[range] == payload {
                Ok(false)
            } else {
                Err(FragmentError::Conflict(nr))
            };
        }
        self.data[range].copy_from_slice(payload);
        if let Some(present) = &mut self.present {
            present[index as usize] = true;
        }
        self.received += 1;
        Ok(true)
    }

    /// Builds the Data packet for the fragment with sequence number `nr`.
    pub fn fragment(&self, nr: u32, multicast: bool) -> Option<Packet> {
        if !self.contains(nr) {
            return None;
        }
        let range = self.fragment_range(nr - self.nr);
        Some(Packet::new(
            nr,
            multicast,
            Body::Data {
                start_nr: self.nr,
                total_size: self.data.len() as u32,
                payload: Bytes::copy_from_slice(&self.data[range]),
            },
        ))
    }

    pub fn fragments(&self, multicast: bool) -> impl Iterator<Item = Packet> + '_ {
        (self.nr..self.end_nr()).filter_map(move |nr| self.fragment(nr, multicast))
    }

    pub fn into_data(self) -> Bytes {
        self.data.freeze()
    }
}

/// Packets ordered by sequence number, without overlaps, bounded in count.
#[derive(Debug)]
pub struct PacketBacklog {
    packets: VecDeque<FragmentedPacket>,
    max_packets: usize,
}

impl PacketBacklog {
    pub fn new(max_packets: usize) -> Self {
        PacketBacklog {
            packets: VecDeque::new(),
            max_packets,
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    fn position(&self, nr: u32) -> usize {
        self.packets.partition_point(|p| p.end_nr() <= nr)
    }

    /// Packet starting exactly at `nr`
    pub fn get_mut(&mut self, nr: u32) -> Option<&mut FragmentedPacket> {
        let index = self.position(nr);
        self.packets.get_mut(index).filter(|p| p.nr() == nr)
    }

    /// Packet containing fragment `nr`
    pub fn find_fragment(&self, nr: u32) -> Option<&FragmentedPacket> {
        self.packets.get(self.position(nr)).filter(|p| p.contains(nr))
    }

    pub fn fragment_present(&self, nr: u32) -> bool {
        self.find_fragment(nr)
            .map(|p| p.fragment_present(nr))
            .unwrap_or(false)
    }

    /// Inserts in order. Fails if the packet overlaps one already stored.
    /// The oldest packets are evicted once the bound is exceeded.
    pub fn insert(&mut self, packet: FragmentedPacket) -> bool {
        let index = self.position(packet.nr());
        if let Some(next) = self.packets.get(index) {
            if next.nr() < packet.end_nr() {
                return false;
            }
        }
        self.packets.insert(index, packet);
        while self.packets.len() > self.max_packets {
            self.packets.pop_front();
        }
        true
    }

    /// Removes and returns the first packet if it is complete and starts at `expected`.
    pub fn pop_complete(&mut self, expected: u32) -> Option<FragmentedPacket> {
        match self.packets.front() {
            Some(p) if p.nr() == expected && p.is_complete() => self.packets.pop_front(),
            _ => None,
        }
    }

    /// Drops all packets starting before `nr`.
    pub fn clear_until(&mut self, nr: u32) {
        while self.packets.front().map_or(false, |p| p.nr() < nr) {
            self.packets.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}
