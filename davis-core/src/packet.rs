//! Event packets and packet containers.
//!
//! A packet is an ordered, growable run of events of one kind that all share
//! a wrap-overflow epoch. A container groups at most one packet per kind and
//! is the unit handed to the consumer.

use crate::timestamp::full_timestamp;
use crate::types::{EventKind, FrameEvent, Imu6Event, PolarityEvent, SpecialEvent};
use thiserror::Error;

/// Errors that can occur while growing a packet.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("failed to grow packet from {capacity} to {requested} events")]
    Allocation { capacity: usize, requested: usize },
}

/// Default initial capacities per kind.
pub const POLARITY_DEFAULT_SIZE: usize = 4096;
pub const SPECIAL_DEFAULT_SIZE: usize = 128;
pub const FRAME_DEFAULT_SIZE: usize = 4;
pub const IMU6_DEFAULT_SIZE: usize = 64;

/// Events that carry a single stream timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> i32;
}

impl Timestamped for PolarityEvent {
    #[inline]
    fn timestamp(&self) -> i32 {
        self.timestamp
    }
}

impl Timestamped for SpecialEvent {
    #[inline]
    fn timestamp(&self) -> i32 {
        self.timestamp
    }
}

impl Timestamped for FrameEvent {
    #[inline]
    fn timestamp(&self) -> i32 {
        FrameEvent::timestamp(self)
    }
}

impl Timestamped for Imu6Event {
    #[inline]
    fn timestamp(&self) -> i32 {
        self.timestamp
    }
}

/// A growable packet of events of one kind.
///
/// The logical capacity doubles whenever an append would exceed it and never
/// shrinks.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPacket<E> {
    events: Vec<E>,
    capacity: usize,
    source_id: i16,
    ts_overflow: u32,
}

impl<E> EventPacket<E> {
    /// Creates an empty packet able to hold `capacity` events.
    pub fn with_capacity(capacity: usize, source_id: i16, ts_overflow: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            source_id,
            ts_overflow,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Current logical capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn source_id(&self) -> i16 {
        self.source_id
    }

    /// Wrap-overflow epoch shared by all events in this packet.
    #[inline]
    pub fn ts_overflow(&self) -> u32 {
        self.ts_overflow
    }

    pub fn events(&self) -> &[E] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.events.iter()
    }

    /// Makes room for `additional` more events, doubling the capacity as
    /// often as needed.
    pub fn ensure_space(&mut self, additional: usize) -> Result<(), PacketError> {
        let needed = self.events.len() + additional;
        if needed <= self.capacity {
            return Ok(());
        }

        let mut new_capacity = self.capacity;
        while new_capacity < needed {
            new_capacity *= 2;
        }

        self.events
            .try_reserve_exact(new_capacity - self.events.len())
            .map_err(|_| PacketError::Allocation {
                capacity: self.capacity,
                requested: new_capacity,
            })?;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Appends an event, growing the packet first if needed.
    #[inline]
    pub fn push(&mut self, event: E) -> Result<(), PacketError> {
        self.ensure_space(1)?;
        self.events.push(event);
        Ok(())
    }
}

impl<E: Timestamped> EventPacket<E> {
    /// 64-bit timestamp of an event, combining the packet epoch.
    #[inline]
    pub fn full_timestamp(&self, event: &E) -> i64 {
        full_timestamp(self.ts_overflow, event.timestamp())
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.events.first().map(|e| self.full_timestamp(e))
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.events.last().map(|e| self.full_timestamp(e))
    }
}

impl<'a, E> IntoIterator for &'a EventPacket<E> {
    type Item = &'a E;
    type IntoIter = std::slice::Iter<'a, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// One packet slot per event kind.
///
/// Slots are `None` when that kind had no events during the cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPacketContainer {
    pub special: Option<EventPacket<SpecialEvent>>,
    pub polarity: Option<EventPacket<PolarityEvent>>,
    pub frame: Option<EventPacket<FrameEvent>>,
    pub imu6: Option<EventPacket<Imu6Event>>,
}

impl EventPacketContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of occupied slots.
    pub fn packet_count(&self) -> usize {
        EventKind::ALL
            .iter()
            .filter(|kind| self.event_count(**kind) > 0)
            .count()
    }

    /// Number of events in the slot for `kind`.
    pub fn event_count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Special => self.special.as_ref().map_or(0, EventPacket::len),
            EventKind::Polarity => self.polarity.as_ref().map_or(0, EventPacket::len),
            EventKind::Frame => self.frame.as_ref().map_or(0, EventPacket::len),
            EventKind::Imu6 => self.imu6.as_ref().map_or(0, EventPacket::len),
        }
    }

    /// Total events over all slots.
    pub fn total_events(&self) -> usize {
        EventKind::ALL.iter().map(|kind| self.event_count(*kind)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.special.is_none() && self.polarity.is_none() && self.frame.is_none() && self.imu6.is_none()
    }

    /// Lowest 64-bit timestamp over all first events.
    pub fn lowest_timestamp(&self) -> Option<i64> {
        [
            self.special.as_ref().and_then(EventPacket::first_timestamp),
            self.polarity.as_ref().and_then(EventPacket::first_timestamp),
            self.frame.as_ref().and_then(EventPacket::first_timestamp),
            self.imu6.as_ref().and_then(EventPacket::first_timestamp),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Highest 64-bit timestamp over all last events.
    pub fn highest_timestamp(&self) -> Option<i64> {
        [
            self.special.as_ref().and_then(EventPacket::last_timestamp),
            self.polarity.as_ref().and_then(EventPacket::last_timestamp),
            self.frame.as_ref().and_then(EventPacket::last_timestamp),
            self.imu6.as_ref().and_then(EventPacket::last_timestamp),
        ]
        .into_iter()
        .flatten()
        .max()
    }
}
