//! Network stack interface
//!
//! A channel reports everything it receives through a [`NetSink`].
//! [`EventQueue`] is a sink that forwards the notifications into an
//! `mpsc` channel for applications that poll.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::frame::CanFrame;
use crate::state::ErrorRecord;

/// Consumer of decoded traffic and queue control requests
///
/// Methods are called from the receive and transmit completion paths and
/// must not block.
pub trait NetSink: Send + Sync {
    /// A frame arrived; `timestamp_us` is host time in microseconds
    fn deliver_frame(&self, frame: CanFrame, timestamp_us: u64);

    /// Controller or bus error notification
    fn deliver_error(&self, record: ErrorRecord);

    /// Controller went bus-off
    fn on_bus_off(&self);

    /// No transmit slot left, stop handing frames to the channel
    fn request_queue_stop(&self);

    /// Transmit slots are available again
    fn request_queue_wake(&self);
}

/// Notification forwarded by [`EventQueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Frame { frame: CanFrame, timestamp_us: u64 },
    Error(ErrorRecord),
    BusOff,
    QueueStopped,
    QueueWoken,
}

/// Sink pushing every notification into an `mpsc` channel
pub struct EventQueue {
    tx: Mutex<Sender<Event>>,
}

impl EventQueue {
    /// Create the sink and the receiving end
    pub fn new() -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }

    fn push(&self, event: Event) {
        if let Ok(tx) = self.tx.lock() {
            // receiver dropped: nobody listens anymore
            let _ = tx.send(event);
        }
    }
}

impl NetSink for EventQueue {
    fn deliver_frame(&self, frame: CanFrame, timestamp_us: u64) {
        self.push(Event::Frame {
            frame,
            timestamp_us,
        });
    }

    fn deliver_error(&self, record: ErrorRecord) {
        self.push(Event::Error(record));
    }

    fn on_bus_off(&self) {
        self.push(Event::BusOff);
    }

    fn request_queue_stop(&self) {
        self.push(Event::QueueStopped);
    }

    fn request_queue_wake(&self) {
        self.push(Event::QueueWoken);
    }
}
