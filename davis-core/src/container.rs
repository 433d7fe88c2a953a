//! Packet container generation.
//!
//! Decoded events are appended to per-kind in-progress packets. After every
//! wire unit the generator checks the size and time thresholds and, when
//! one is hit (or a commit is forced by a timestamp epoch boundary), moves
//! the non-empty packets into a container and hands it to the exchange.

use crate::device_log;
use crate::exchange::DataExchange;
use crate::logging::DeviceLog;
use crate::packet::{
    EventPacket, EventPacketContainer, PacketError, FRAME_DEFAULT_SIZE, IMU6_DEFAULT_SIZE, POLARITY_DEFAULT_SIZE,
    SPECIAL_DEFAULT_SIZE,
};
use crate::types::{FrameEvent, Imu6Event, PolarityEvent, SpecialEvent, SpecialEventType};
use log::Level;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub const DEFAULT_MAX_PACKET_SIZE: u32 = 8192;
/// Microseconds.
pub const DEFAULT_MAX_INTERVAL: u32 = 10_000;

/// Commit thresholds (host module PACKETS), read on every wire unit.
#[derive(Debug)]
pub struct PacketLimits {
    /// Events per packet that trigger a commit, 0 disables
    pub max_packet_size: AtomicU32,
    /// Microseconds of data per container
    pub max_interval: AtomicU32,
}

impl Default for PacketLimits {
    fn default() -> Self {
        Self {
            max_packet_size: AtomicU32::new(DEFAULT_MAX_PACKET_SIZE),
            max_interval: AtomicU32::new(DEFAULT_MAX_INTERVAL),
        }
    }
}

/// Packets being filled during the current container cycle.
///
/// Each slot is allocated on the first event of its kind and taken away on
/// commit, so the next cycle starts fresh.
#[derive(Debug, Default)]
pub struct CurrentPackets {
    source_id: i16,
    special: Option<EventPacket<SpecialEvent>>,
    polarity: Option<EventPacket<PolarityEvent>>,
    frame: Option<EventPacket<FrameEvent>>,
    imu6: Option<EventPacket<Imu6Event>>,
}

#[inline]
fn push_into<E>(
    slot: &mut Option<EventPacket<E>>,
    event: E,
    default_capacity: usize,
    source_id: i16,
    ts_overflow: u32,
) -> Result<(), PacketError> {
    let packet = slot.get_or_insert_with(|| EventPacket::with_capacity(default_capacity, source_id, ts_overflow));
    packet.push(event)
}

#[inline]
fn slot_len<E>(slot: &Option<EventPacket<E>>) -> usize {
    slot.as_ref().map_or(0, EventPacket::len)
}

#[inline]
fn take_non_empty<E>(slot: &mut Option<EventPacket<E>>) -> Option<EventPacket<E>> {
    if slot_len(slot) > 0 {
        slot.take()
    } else {
        None
    }
}

impl CurrentPackets {
    pub fn new(source_id: i16) -> Self {
        Self {
            source_id,
            ..Self::default()
        }
    }

    pub fn push_special(&mut self, event: SpecialEvent, ts_overflow: u32) -> Result<(), PacketError> {
        push_into(&mut self.special, event, SPECIAL_DEFAULT_SIZE, self.source_id, ts_overflow)
    }

    pub fn push_polarity(&mut self, event: PolarityEvent, ts_overflow: u32) -> Result<(), PacketError> {
        push_into(&mut self.polarity, event, POLARITY_DEFAULT_SIZE, self.source_id, ts_overflow)
    }

    pub fn push_frame(&mut self, event: FrameEvent, ts_overflow: u32) -> Result<(), PacketError> {
        push_into(&mut self.frame, event, FRAME_DEFAULT_SIZE, self.source_id, ts_overflow)
    }

    pub fn push_imu6(&mut self, event: Imu6Event, ts_overflow: u32) -> Result<(), PacketError> {
        push_into(&mut self.imu6, event, IMU6_DEFAULT_SIZE, self.source_id, ts_overflow)
    }

    /// Size of the fullest in-progress packet.
    pub fn max_len(&self) -> usize {
        slot_len(&self.special)
            .max(slot_len(&self.polarity))
            .max(slot_len(&self.frame))
            .max(slot_len(&self.imu6))
    }

    pub fn is_empty(&self) -> bool {
        self.max_len() == 0
    }

    /// Moves every non-empty packet into a new container.
    pub fn take_container(&mut self) -> EventPacketContainer {
        EventPacketContainer {
            special: take_non_empty(&mut self.special),
            polarity: take_non_empty(&mut self.polarity),
            frame: take_non_empty(&mut self.frame),
            imu6: take_non_empty(&mut self.imu6),
        }
    }

    /// Frees all in-progress packets.
    pub fn clear(&mut self) {
        self.special = None;
        self.polarity = None;
        self.frame = None;
        self.imu6 = None;
    }
}

/// Why a commit is happening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitReason {
    /// Size or time threshold reached.
    Threshold,
    /// The timestamp range was exhausted.
    BigWrap,
    /// The device reset its timestamps.
    TimestampReset,
}

impl CommitReason {
    #[inline]
    pub fn is_forced(&self) -> bool {
        !matches!(self, Self::Threshold)
    }
}

/// Decides when containers are committed and delivers them.
#[derive(Debug)]
pub struct ContainerGenerator {
    limits: Arc<PacketLimits>,
    exchange: Arc<DataExchange>,
    running: Arc<AtomicBool>,
    commit_timestamp: Option<i64>,
    source_id: i16,
    log: DeviceLog,
}

impl ContainerGenerator {
    pub fn new(
        limits: Arc<PacketLimits>,
        exchange: Arc<DataExchange>,
        running: Arc<AtomicBool>,
        source_id: i16,
        log: DeviceLog,
    ) -> Self {
        Self {
            limits,
            exchange,
            running,
            commit_timestamp: None,
            source_id,
            log,
        }
    }

    #[inline]
    pub fn commit_timestamp(&self) -> Option<i64> {
        self.commit_timestamp
    }

    /// True once a first timestamp has been seen.
    #[inline]
    pub fn has_commit_timestamp(&self) -> bool {
        self.commit_timestamp.is_some()
    }

    #[inline]
    fn interval(&self) -> i64 {
        self.limits.max_interval.load(Ordering::Relaxed).max(1) as i64
    }

    /// Starts the time window at `full_timestamp` if none is running.
    #[inline]
    pub fn init_commit_timestamp(&mut self, full_timestamp: i64) {
        if self.commit_timestamp.is_none() {
            self.commit_timestamp = Some(full_timestamp + self.interval() - 1);
        }
    }

    /// Forgets the time window, e.g. after a timestamp reset.
    #[inline]
    pub fn reset_commit_timestamp(&mut self) {
        self.commit_timestamp = None;
    }

    /// Size threshold: any in-progress packet reached the maximum.
    #[inline]
    pub fn is_size_commit(&self, packets: &CurrentPackets) -> bool {
        let max = self.limits.max_packet_size.load(Ordering::Relaxed) as usize;
        max > 0 && packets.max_len() >= max
    }

    /// Time threshold: the current time passed the end of the window.
    #[inline]
    pub fn is_time_commit(&self, full_timestamp: i64) -> bool {
        matches!(self.commit_timestamp, Some(commit) if full_timestamp > commit)
    }

    #[inline]
    pub fn should_commit(&self, packets: &CurrentPackets, full_timestamp: i64) -> bool {
        self.is_size_commit(packets) || self.is_time_commit(full_timestamp)
    }

    /// Commits the in-progress packets. Forced commits are never dropped
    /// while acquisition runs; a timestamp reset is followed by a container
    /// holding only the reset marker.
    pub fn execute(&mut self, packets: &mut CurrentPackets, reason: CommitReason, full_timestamp: i64) {
        let container = packets.take_container();

        if !container.is_empty() {
            self.deliver(container, reason.is_forced());
        }

        if reason.is_forced() {
            // The next timestamp of the new epoch opens a fresh window.
            self.commit_timestamp = None;
        } else {
            let interval = self.interval();
            if let Some(commit) = self.commit_timestamp.as_mut() {
                if full_timestamp > *commit {
                    let behind = full_timestamp - *commit;
                    *commit += (behind + interval - 1) / interval * interval;
                }
            }
        }

        if reason == CommitReason::TimestampReset {
            let mut special = EventPacket::with_capacity(1, self.source_id, 0);
            if special
                .push(SpecialEvent::new(i32::MAX, SpecialEventType::TimestampReset))
                .is_ok()
            {
                let marker = EventPacketContainer {
                    special: Some(special),
                    ..EventPacketContainer::default()
                };
                self.deliver(marker, true);
            }
        }
    }

    fn deliver(&self, container: EventPacketContainer, forced: bool) {
        if forced {
            if !self.exchange.put_forced(container, &self.running) {
                device_log!(
                    self.log,
                    Level::Error,
                    "Acquisition stopped before forced packet container could be delivered."
                );
            }
        } else if !self.exchange.put(container) {
            device_log!(
                self.log,
                Level::Info,
                "Dropped EventPacket Container because ring-buffer full! ({} dropped so far)",
                self.exchange.dropped()
            );
        }
    }
}
