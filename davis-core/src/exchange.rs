//! Bounded exchange of packet containers between the I/O thread and the
//! application.
//!
//! The producer side never blocks: ordinary containers are dropped when the
//! queue is full. Only epoch-boundary containers (timestamp reset or big
//! wrap) are retried until they fit or acquisition stops.

use crate::packet::EventPacketContainer;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Callback fired once per enqueued or dequeued container.
pub type Notify = Box<dyn Fn() + Send + Sync>;

pub const DEFAULT_BUFFER_SIZE: u32 = 64;

/// Runtime-adjustable exchange parameters (host module DATAEXCHANGE).
#[derive(Debug)]
pub struct ExchangeSettings {
    /// Queue capacity, applied at the next acquisition start
    pub buffer_size: AtomicU32,
    /// Whether `get` waits for data while acquisition runs
    pub blocking: AtomicBool,
    /// Enable device data producers on start
    pub start_producers: AtomicBool,
    /// Disable device data producers on stop
    pub stop_producers: AtomicBool,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            buffer_size: AtomicU32::new(DEFAULT_BUFFER_SIZE),
            blocking: AtomicBool::new(false),
            start_producers: AtomicBool::new(true),
            stop_producers: AtomicBool::new(true),
        }
    }
}

/// Bounded single-producer / single-consumer container queue.
pub struct DataExchange {
    queue: ArrayQueue<EventPacketContainer>,
    settings: Arc<ExchangeSettings>,
    on_increase: Option<Notify>,
    on_decrease: Option<Notify>,
    dropped: AtomicU64,
}

impl std::fmt::Debug for DataExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataExchange")
            .field("len", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl DataExchange {
    /// Creates a queue sized from `settings.buffer_size`.
    pub fn new(settings: Arc<ExchangeSettings>, on_increase: Option<Notify>, on_decrease: Option<Notify>) -> Self {
        let capacity = settings.buffer_size.load(Ordering::Relaxed).max(1) as usize;
        Self {
            queue: ArrayQueue::new(capacity),
            settings,
            on_increase,
            on_decrease,
            dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Containers dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Tries to enqueue without waiting. A full queue drops the container.
    pub fn put(&self, container: EventPacketContainer) -> bool {
        match self.queue.push(container) {
            Ok(()) => {
                self.notify_increase();
                true
            }
            Err(_dropped) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Enqueues, retrying while `running` stays set. Returns false only if
    /// acquisition stopped before space freed up.
    pub fn put_forced(&self, mut container: EventPacketContainer, running: &AtomicBool) -> bool {
        loop {
            match self.queue.push(container) {
                Ok(()) => {
                    self.notify_increase();
                    return true;
                }
                Err(rejected) => {
                    if !running.load(Ordering::Acquire) {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    container = rejected;
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Dequeues one container. In blocking mode waits while `running` stays
    /// set.
    pub fn get(&self, running: &AtomicBool) -> Option<EventPacketContainer> {
        loop {
            if let Some(container) = self.queue.pop() {
                self.notify_decrease();
                return Some(container);
            }

            if !self.settings.blocking.load(Ordering::Relaxed) || !running.load(Ordering::Acquire) {
                return None;
            }
            std::thread::yield_now();
        }
    }

    /// Drops every queued container, notifying once per container.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while self.queue.pop().is_some() {
            self.notify_decrease();
            drained += 1;
        }
        drained
    }

    #[inline]
    fn notify_increase(&self) {
        if let Some(notify) = &self.on_increase {
            notify();
        }
    }

    #[inline]
    fn notify_decrease(&self) {
        if let Some(notify) = &self.on_decrease {
            notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::EventPacket;
    use crate::types::{SpecialEvent, SpecialEventType};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn container(ts: i32) -> EventPacketContainer {
        let mut special = EventPacket::with_capacity(1, 1, 0);
        special
            .push(SpecialEvent::new(ts, SpecialEventType::ExternalInputPulse))
            .unwrap();
        EventPacketContainer {
            special: Some(special),
            ..EventPacketContainer::default()
        }
    }

    fn settings(size: u32, blocking: bool) -> Arc<ExchangeSettings> {
        let settings = ExchangeSettings::default();
        settings.buffer_size.store(size, Ordering::Relaxed);
        settings.blocking.store(blocking, Ordering::Relaxed);
        Arc::new(settings)
    }

    fn counter() -> (Arc<AtomicUsize>, Notify) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (
            count,
            Box::new(move || {
                handle.fetch_add(1, Ordering::Relaxed);
            }),
        )
    }

    #[test]
    fn test_put_get_notifies() {
        let (increases, on_increase) = counter();
        let (decreases, on_decrease) = counter();
        let exchange = DataExchange::new(settings(4, false), Some(on_increase), Some(on_decrease));
        let running = AtomicBool::new(true);

        assert!(exchange.put(container(1)));
        assert!(exchange.put(container(2)));
        assert_eq!(increases.load(Ordering::Relaxed), 2);

        let first = exchange.get(&running).unwrap();
        assert_eq!(first.lowest_timestamp(), Some(1));
        assert_eq!(decreases.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_full_queue_drops_ordinary_container() {
        let (increases, on_increase) = counter();
        let (decreases, on_decrease) = counter();
        let exchange = DataExchange::new(settings(2, false), Some(on_increase), Some(on_decrease));
        let running = AtomicBool::new(true);

        assert!(exchange.put(container(1)));
        assert!(exchange.put(container(2)));
        assert!(!exchange.put(container(3)));
        assert_eq!(exchange.dropped(), 1);
        assert_eq!(increases.load(Ordering::Relaxed), 2);

        while exchange.get(&running).is_some() {}
        assert_eq!(decreases.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_non_blocking_get_on_empty() {
        let exchange = DataExchange::new(settings(2, false), None, None);
        let running = AtomicBool::new(true);
        assert!(exchange.get(&running).is_none());
    }

    #[test]
    fn test_blocking_get_returns_when_stopped() {
        let exchange = DataExchange::new(settings(2, true), None, None);
        let running = AtomicBool::new(false);
        assert!(exchange.get(&running).is_none());
    }

    #[test]
    fn test_forced_put_waits_for_space() {
        let exchange = Arc::new(DataExchange::new(settings(1, false), None, None));
        let running = Arc::new(AtomicBool::new(true));
        assert!(exchange.put(container(1)));

        let producer = {
            let exchange = exchange.clone();
            let running = running.clone();
            thread::spawn(move || exchange.put_forced(container(2), &running))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(exchange.get(&running).unwrap().lowest_timestamp(), Some(1));

        assert!(producer.join().unwrap());
        assert_eq!(exchange.get(&running).unwrap().lowest_timestamp(), Some(2));
        assert_eq!(exchange.dropped(), 0);
    }

    #[test]
    fn test_forced_put_gives_up_when_stopped() {
        let exchange = DataExchange::new(settings(1, false), None, None);
        let running = AtomicBool::new(false);
        assert!(exchange.put(container(1)));
        assert!(!exchange.put_forced(container(2), &running));
        assert_eq!(exchange.dropped(), 1);
    }

    #[test]
    fn test_drain_notifies_each() {
        let (decreases, on_decrease) = counter();
        let exchange = DataExchange::new(settings(4, false), None, Some(on_decrease));
        exchange.put(container(1));
        exchange.put(container(2));
        exchange.put(container(3));

        assert_eq!(exchange.drain(), 3);
        assert!(exchange.is_empty());
        assert_eq!(decreases.load(Ordering::Relaxed), 3);
    }
}
