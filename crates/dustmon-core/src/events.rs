//! Radio event queues and the level-triggered signal group.
//!
//! Radio drivers complete operations from interrupt-like contexts. They post
//! an event record into a bounded channel and raise a bit in the
//! [`SignalGroup`]; the controller task dequeues and applies the state
//! transition. [`RadioEvents`] is built once at startup and handed to every
//! producer and consumer by reference.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, with_timeout};
use log::warn;

use crate::transport::{Datagram, PeerAddress};

pub const STATION_EVENT_CAPACITY: usize = 8;
pub const PEER_EVENT_CAPACITY: usize = 4;

/// A station event is queued.
pub const STATION_EVENT_BIT: u32 = 1 << 0;
/// A peer event is queued.
pub const PEER_EVENT_BIT: u32 = 1 << 1;
/// The peer round trip of this cycle resolved.
pub const ROUND_TRIP_BIT: u32 = 1 << 2;

/// Completion notifications from the station-mode radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationEvent {
    Started,
    Stopped,
    Connected,
    GotIp,
    Disconnected,
    TimeReceived { unix_micros: i64 },
    TimeFailed,
}

/// Completion notifications from the peer-to-peer link.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Received(Datagram),
    SendStatus { to: PeerAddress, delivered: bool },
}

/// Set of flags that tasks raise and wait on.
pub struct SignalGroup {
    bits: BlockingMutex<CriticalSectionRawMutex, Cell<u32>>,
    changed: Signal<CriticalSectionRawMutex, ()>,
}

impl Default for SignalGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalGroup {
    pub const fn new() -> Self {
        Self {
            bits: BlockingMutex::new(Cell::new(0)),
            changed: Signal::new(),
        }
    }

    pub fn set(&self, bits: u32) {
        self.bits.lock(|cell| cell.set(cell.get() | bits));
        self.changed.signal(());
    }

    pub fn clear(&self, bits: u32) {
        self.bits.lock(|cell| cell.set(cell.get() & !bits));
    }

    pub fn get(&self) -> u32 {
        self.bits.lock(|cell| cell.get())
    }

    /// Wait until any bit of `mask` is set or `timeout` elapses.
    ///
    /// Returns the bits of `mask` that were set, zero on timeout. Bits stay
    /// set; the owner clears them. Only one task may wait at a time.
    pub async fn wait_any(&self, mask: u32, timeout: Duration) -> u32 {
        let wait = async {
            loop {
                let hit = self.get() & mask;
                if hit != 0 {
                    return hit;
                }
                self.changed.wait().await;
            }
        };
        if timeout == Duration::from_ticks(0) {
            return self.get() & mask;
        }
        with_timeout(timeout, wait).await.unwrap_or(0)
    }
}

/// Queues shared between the radio drivers and the controller.
pub struct RadioEvents {
    station: Channel<CriticalSectionRawMutex, StationEvent, STATION_EVENT_CAPACITY>,
    peer: Channel<CriticalSectionRawMutex, PeerEvent, PEER_EVENT_CAPACITY>,
    pub signals: SignalGroup,
}

impl Default for RadioEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioEvents {
    pub const fn new() -> Self {
        Self {
            station: Channel::new(),
            peer: Channel::new(),
            signals: SignalGroup::new(),
        }
    }

    /// Queue a station event. Returns false when the queue overflowed.
    pub fn post_station(&self, event: StationEvent) -> bool {
        let queued = self.station.try_send(event).is_ok();
        if !queued {
            warn!(" Station event queue full, dropping {:?}", event);
        }
        self.signals.set(STATION_EVENT_BIT);
        queued
    }

    /// Queue a peer event. Returns false when the queue overflowed.
    pub fn post_peer(&self, event: PeerEvent) -> bool {
        let queued = self.peer.try_send(event).is_ok();
        if !queued {
            warn!(" Peer event queue full, dropping event");
        }
        self.signals.set(PEER_EVENT_BIT);
        queued
    }

    pub fn next_station(&self) -> Option<StationEvent> {
        let event = self.station.try_receive().ok();
        self.signals.clear(STATION_EVENT_BIT);
        if !self.station.is_empty() {
            self.signals.set(STATION_EVENT_BIT);
        }
        event
    }

    pub fn next_peer(&self) -> Option<PeerEvent> {
        let event = self.peer.try_receive().ok();
        self.signals.clear(PEER_EVENT_BIT);
        if !self.peer.is_empty() {
            self.signals.set(PEER_EVENT_BIT);
        }
        event
    }

    /// Wait up to `timeout` for a peer event.
    pub async fn wait_peer(&self, timeout: Duration) -> Option<PeerEvent> {
        if let Some(event) = self.next_peer() {
            return Some(event);
        }
        if self.signals.wait_any(PEER_EVENT_BIT, timeout).await == 0 {
            return None;
        }
        self.next_peer()
    }

    /// Drop anything still queued, e.g. after the radio was torn down.
    pub fn flush(&self) {
        while self.next_station().is_some() {}
        while self.next_peer().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn test_signal_bits_are_level_triggered() {
        let group = SignalGroup::new();
        group.set(ROUND_TRIP_BIT);
        assert_eq!(
            block_on(group.wait_any(ROUND_TRIP_BIT | PEER_EVENT_BIT, Duration::from_millis(10))),
            ROUND_TRIP_BIT
        );
        // Still set until cleared.
        assert_eq!(group.get() & ROUND_TRIP_BIT, ROUND_TRIP_BIT);
        group.clear(ROUND_TRIP_BIT);
        assert_eq!(
            block_on(group.wait_any(ROUND_TRIP_BIT, Duration::from_ticks(0))),
            0
        );
    }

    #[test]
    fn test_wait_times_out() {
        let group = SignalGroup::new();
        assert_eq!(block_on(group.wait_any(ROUND_TRIP_BIT, Duration::from_millis(5))), 0);
    }

    #[test]
    fn test_station_queue_clears_bit_when_drained() {
        let events = RadioEvents::new();
        assert!(events.post_station(StationEvent::Started));
        assert!(events.post_station(StationEvent::GotIp));
        assert_ne!(events.signals.get() & STATION_EVENT_BIT, 0);
        assert_eq!(events.next_station(), Some(StationEvent::Started));
        assert_ne!(events.signals.get() & STATION_EVENT_BIT, 0);
        assert_eq!(events.next_station(), Some(StationEvent::GotIp));
        assert_eq!(events.signals.get() & STATION_EVENT_BIT, 0);
        assert_eq!(events.next_station(), None);
    }

    #[test]
    fn test_overflow_is_reported() {
        let events = RadioEvents::new();
        for _ in 0..PEER_EVENT_CAPACITY {
            assert!(events.post_peer(PeerEvent::SendStatus {
                to: PeerAddress::new([1; 6]),
                delivered: true
            }));
        }
        assert!(!events.post_peer(PeerEvent::SendStatus {
            to: PeerAddress::new([1; 6]),
            delivered: true
        }));
    }
}
