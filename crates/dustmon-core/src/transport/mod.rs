//! Connectionless link to the companion outdoor unit.
//!
//! The companion unit sends one [`DataMessage`] per measurement. Each
//! accepted message is answered with a [`CorrectionMessage`] so the companion
//! can correct its clock. The transport talks to exactly one peer: the first
//! sender is adopted and persisted, datagrams from anyone else are dropped.
//!
//! Delivery of the reply is the round trip the controller waits for before
//! sleeping. A failed send is retried up to [`MAX_SEND_ATTEMPTS`] times;
//! exhaustion resolves the round trip the same way success does. A send
//! whose status never arrives counts as failed once
//! [`SEND_STATUS_TIMEOUT_MICROS`] passed.

pub mod message;

pub use message::{CorrectionMessage, DataMessage, WireError};

use core::fmt;

use embassy_time::Duration;
use heapless::Deque;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::timing::{MAX_SEND_ATTEMPTS, SEND_STATUS_TIMEOUT_MICROS};
use crate::connectivity::LinkError;
use crate::events::{PeerEvent, ROUND_TRIP_BIT, RadioEvents};
use crate::storage::{PEER_ADDRESS_TAG, PersistentStorage, StorageError};

/// Largest payload the link carries.
pub const MAX_DATAGRAM_LEN: usize = 250;
const INBOX_CAPACITY: usize = 4;

/// Hardware address of a link endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress([u8; 6]);

impl PeerAddress {
    pub const fn new(raw: [u8; 6]) -> Self {
        Self(raw)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Raw datagram as delivered by the radio driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub from: PeerAddress,
    pub received_at_micros: i64,
    pub payload: heapless::Vec<u8, MAX_DATAGRAM_LEN>,
}

/// Non-blocking peer-to-peer radio commands.
pub trait PeerLink {
    fn start(&mut self) -> Result<(), LinkError>;

    fn stop(&mut self);

    fn add_peer(&mut self, address: PeerAddress) -> Result<(), LinkError>;

    /// Completes with [`PeerEvent::SendStatus`].
    fn send(&mut self, to: PeerAddress, payload: &[u8]) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NoPeer,
    /// Address known (learned or restored) but no reply delivered yet.
    Unconfirmed(PeerAddress),
    /// A reply was delivered to this address.
    Confirmed(PeerAddress),
}

impl PeerState {
    pub fn address(&self) -> Option<PeerAddress> {
        match *self {
            PeerState::NoPeer => None,
            PeerState::Unconfirmed(a) | PeerState::Confirmed(a) => Some(a),
        }
    }
}

/// Accepted measurement from the companion unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceivedMessage {
    pub from: PeerAddress,
    pub received_at_micros: i64,
    pub message: DataMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundTrip {
    Idle,
    Awaiting,
    Resolved,
}

struct PendingReply {
    to: PeerAddress,
    payload: [u8; CorrectionMessage::SIZE],
    attempts: u8,
    /// Unset for a resend until the next [`PeerTransport::expire_delivery`].
    deadline_micros: Option<i64>,
}

pub struct PeerTransport<'a, L> {
    link: L,
    events: &'a RadioEvents,
    peer: PeerState,
    active: bool,
    inbox: Deque<ReceivedMessage, INBOX_CAPACITY>,
    last_received_at: Option<i64>,
    reply: Option<PendingReply>,
    round_trip: RoundTrip,
}

impl<'a, L: PeerLink> PeerTransport<'a, L> {
    pub fn new(link: L, events: &'a RadioEvents) -> Self {
        Self {
            link,
            events,
            peer: PeerState::NoPeer,
            active: false,
            inbox: Deque::new(),
            last_received_at: None,
            reply: None,
            round_trip: RoundTrip::Idle,
        }
    }

    /// Restore the peer address learned in an earlier cycle.
    pub fn setup<S: PersistentStorage>(&mut self, storage: &S) {
        match storage.get::<PeerAddress>(PEER_ADDRESS_TAG) {
            Ok(Some(address)) => {
                debug!(" Restored peer {}", address);
                self.peer = PeerState::Unconfirmed(address);
            }
            Ok(None) => self.peer = PeerState::NoPeer,
            Err(e) => {
                warn!(" {}", e);
                self.peer = PeerState::NoPeer;
            }
        }
    }

    /// Bring the link up. Round-trip completion is reported through
    /// [`ROUND_TRIP_BIT`] of the shared signal group.
    pub fn init(&mut self) -> Result<(), LinkError> {
        self.events.signals.clear(ROUND_TRIP_BIT);
        self.round_trip = RoundTrip::Idle;
        self.link.start()?;
        self.active = true;
        if let Some(address) = self.peer.address() {
            self.link.add_peer(address)?;
        }
        info!(" Peer link up, peer {:?}", self.peer);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn peer(&self) -> PeerState {
        self.peer
    }

    #[cfg(test)]
    pub(crate) fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// The reply of this cycle was delivered or ran out of retries.
    pub fn is_completed(&self) -> bool {
        self.round_trip == RoundTrip::Resolved
    }

    /// A reply is still waiting for its delivery status.
    pub fn is_awaiting_delivery(&self) -> bool {
        self.round_trip == RoundTrip::Awaiting
    }

    /// Apply every queued peer event.
    pub fn pump(&mut self) {
        while let Some(event) = self.events.next_peer() {
            self.apply(event);
        }
    }

    /// Oldest accepted message, waiting up to `timeout` for one to arrive.
    pub async fn get_last_message(&mut self, timeout: Duration) -> Option<ReceivedMessage> {
        self.pump();
        if self.inbox.is_empty() && self.active {
            if let Some(event) = self.events.wait_peer(timeout).await {
                self.apply(event);
                self.pump();
            }
        }
        let message = self.inbox.pop_front()?;
        self.last_received_at = Some(message.received_at_micros);
        Some(message)
    }

    /// Answer the last message returned by [`Self::get_last_message`].
    pub fn send_response(&mut self, now_micros: i64) -> Result<(), LinkError> {
        let (Some(to), Some(received_at)) = (self.peer.address(), self.last_received_at.take())
        else {
            return Err(LinkError::Rejected("no message to answer"));
        };
        let payload = CorrectionMessage {
            receive_micros: received_at,
            send_micros: now_micros,
        }
        .to_bytes();
        self.round_trip = RoundTrip::Awaiting;
        self.events.signals.clear(ROUND_TRIP_BIT);
        let mut reply = PendingReply {
            to,
            payload,
            attempts: 0,
            deadline_micros: None,
        };
        let sent = self.transmit(&mut reply);
        reply.deadline_micros = Some(now_micros + SEND_STATUS_TIMEOUT_MICROS);
        self.reply = Some(reply);
        if let Err(e) = sent {
            self.on_send_failed();
            return Err(e);
        }
        Ok(())
    }

    /// Treat the pending send as failed when its status is overdue.
    pub fn expire_delivery(&mut self, now_micros: i64) {
        let Some(reply) = self.reply.as_mut() else {
            return;
        };
        let deadline = reply.deadline_micros;
        match deadline {
            None => reply.deadline_micros = Some(now_micros + SEND_STATUS_TIMEOUT_MICROS),
            Some(deadline) if now_micros >= deadline => {
                warn!(" No send status from {}, attempt {}", reply.to, reply.attempts);
                self.on_send_failed();
            }
            Some(_) => {}
        }
    }

    /// Persist the peer address and bring the link down.
    pub fn hibernate<S: PersistentStorage>(&mut self, storage: &mut S) -> Result<(), StorageError> {
        self.deinit();
        match self.peer.address() {
            Some(address) => storage.set(PEER_ADDRESS_TAG, &address),
            None => Ok(()),
        }
    }

    /// Bring the link down without forgetting the peer.
    pub fn deinit(&mut self) {
        if self.active {
            self.link.stop();
            self.active = false;
        }
        self.reply = None;
        self.inbox.clear();
    }

    fn transmit(&mut self, reply: &mut PendingReply) -> Result<(), LinkError> {
        reply.attempts += 1;
        reply.deadline_micros = None;
        debug!(" Sending correction to {}, attempt {}", reply.to, reply.attempts);
        self.link.send(reply.to, &reply.payload)
    }

    fn apply(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Received(datagram) => self.accept(datagram),
            PeerEvent::SendStatus { to, delivered } => {
                if self.reply.as_ref().is_none_or(|r| r.to != to) {
                    return;
                }
                if delivered {
                    debug!(" Correction delivered to {}", to);
                    self.peer = PeerState::Confirmed(to);
                    self.reply = None;
                    self.resolve();
                } else {
                    self.on_send_failed();
                }
            }
        }
    }

    fn on_send_failed(&mut self) {
        let Some(mut reply) = self.reply.take() else {
            return;
        };
        if reply.attempts >= MAX_SEND_ATTEMPTS {
            warn!(
                " Correction to {} not delivered after {} attempts",
                reply.to, reply.attempts
            );
            self.resolve();
            return;
        }
        if let Err(e) = self.transmit(&mut reply) {
            warn!(" Resend failed: {}", e);
            self.reply = Some(reply);
            self.on_send_failed();
            return;
        }
        self.reply = Some(reply);
    }

    fn resolve(&mut self) {
        self.round_trip = RoundTrip::Resolved;
        self.events.signals.set(ROUND_TRIP_BIT);
    }

    fn accept(&mut self, datagram: Datagram) {
        let message = match DataMessage::from_bytes(&datagram.payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(" Dropping datagram from {}: {}", datagram.from, e);
                return;
            }
        };
        match self.peer {
            PeerState::NoPeer => {
                info!(" Adopting peer {} ({})", datagram.from, message.serial_str());
                if let Err(e) = self.link.add_peer(datagram.from) {
                    warn!(" Could not register peer: {}", e);
                    return;
                }
                self.peer = PeerState::Unconfirmed(datagram.from);
            }
            PeerState::Unconfirmed(known) | PeerState::Confirmed(known) if known != datagram.from => {
                debug!(" Ignoring datagram from foreign unit {}", datagram.from);
                return;
            }
            _ => {}
        }
        let received = ReceivedMessage {
            from: datagram.from,
            received_at_micros: datagram.received_at_micros,
            message,
        };
        if self.inbox.is_full() {
            self.inbox.pop_front();
        }
        // Cannot fail after making room.
        let _ = self.inbox.push_back(received);
    }
}
