//! Downstream notifications raised by the registry and peers.

use std::sync::mpsc;
use std::sync::Mutex;

use crate::lock;
use crate::protocol::Value;

/// Notification for the hub (and whatever it forwards to).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A device was paired. Carries one device description per address.
    NewDevices { descriptions: Vec<Value> },
    /// Devices were removed. Addresses are `SERIAL` and `SERIAL:channel`.
    DevicesDeleted { ids: Vec<u64>, addresses: Vec<String> },
    /// Configuration of a device changed.
    UpdateDevice { peer_id: u64, channel: u32 },
    /// Live values changed.
    ValueChanged {
        peer_id: u64,
        address: String,
        channel: u32,
        keys: Vec<String>,
        values: Vec<Value>,
    },
}

/// Receiver of notifications. Called from request paths and the worker thread.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Writes every notification to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        match &event {
            Event::NewDevices { descriptions } => {
                tracing::info!(count = descriptions.len(), "New devices")
            }
            Event::DevicesDeleted { ids, addresses } => {
                tracing::info!(?ids, ?addresses, "Devices deleted")
            }
            Event::UpdateDevice { peer_id, channel } => {
                tracing::info!(peer_id, channel, "Device updated")
            }
            Event::ValueChanged {
                peer_id,
                channel,
                keys,
                values,
                ..
            } => tracing::debug!(peer_id, channel, ?keys, ?values, "Values changed"),
        }
    }
}

/// Forwards notifications into a channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Mutex<mpsc::Sender<Event>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        // receiver gone: nobody is listening any more
        let _ = lock(&self.tx).send(event);
    }
}
