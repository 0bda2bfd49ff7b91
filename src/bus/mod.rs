//! Event bus capability used by the connection and OTA state machines.
//!
//! The core only ever calls [`EventBus::publish`]. Concrete buses are picked
//! by the composition root: [`ChannelBus`] for in-process delivery,
//! [`RecordingBus`] for assertions, or `EspEventBus` on target.

#[cfg(feature = "esp-idf")]
pub mod esp;

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};

/// Lifecycle and OTA events. Discriminants are the wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Event {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
    OtaStarted = 3,
    OtaAppDesc = 4,
    OtaRead = 5,
    OtaFailed = 6,
    OtaSuccess = 7,
}

impl Event {
    pub const ALL: [Event; 8] = [
        Event::Connecting,
        Event::Connected,
        Event::Disconnected,
        Event::OtaStarted,
        Event::OtaAppDesc,
        Event::OtaRead,
        Event::OtaFailed,
        Event::OtaSuccess,
    ];

    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Event::Connecting => "CONNECTING",
            Event::Connected => "CONNECTED",
            Event::Disconnected => "DISCONNECTED",
            Event::OtaStarted => "OTA_STARTED",
            Event::OtaAppDesc => "OTA_APP_DESC",
            Event::OtaRead => "OTA_READ",
            Event::OtaFailed => "OTA_FAILED",
            Event::OtaSuccess => "OTA_SUCCESS",
        }
    }
}

/// Publish/subscribe capability. Delivery may be asynchronous; publishers
/// never wait for subscribers.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event, payload: &[u8]);
}

/// One delivered event with its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub event: Event,
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Decode the 4-byte little-endian counter carried by OTA_READ.
    pub fn bytes_read(&self) -> Option<u32> {
        let raw: [u8; 4] = self.payload.as_slice().try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }

    /// Decode the 4-byte little-endian status carried by OTA_SUCCESS / OTA_FAILED.
    pub fn status(&self) -> Option<i32> {
        let raw: [u8; 4] = self.payload.as_slice().try_into().ok()?;
        Some(i32::from_le_bytes(raw))
    }
}

pub fn encode_u32(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn encode_status(code: i32) -> [u8; 4] {
    code.to_le_bytes()
}

/// In-process bus backed by `std::sync::mpsc`, one sender per subscriber.
#[derive(Default)]
pub struct ChannelBus {
    subscribers: Mutex<Vec<Sender<BusMessage>>>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            Err(e) => log::error!("ChannelBus: subscribers lock poisoned: {}", e),
        }
        rx
    }
}

impl EventBus for ChannelBus {
    fn publish(&self, event: Event, payload: &[u8]) {
        let Ok(mut subs) = self.subscribers.lock() else {
            log::warn!("ChannelBus: dropping {} (lock poisoned)", event.as_str());
            return;
        };
        // Drop subscribers whose receiver went away
        subs.retain(|tx| {
            tx.send(BusMessage {
                event,
                payload: payload.to_vec(),
            })
            .is_ok()
        });
    }
}

/// Test double that records every publish call in order.
#[derive(Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<BusMessage>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<BusMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.messages().iter().map(|m| m.event).collect()
    }

    pub fn count(&self, event: Event) -> usize {
        self.messages().iter().filter(|m| m.event == event).count()
    }
}

impl EventBus for RecordingBus {
    fn publish(&self, event: Event, payload: &[u8]) {
        if let Ok(mut m) = self.messages.lock() {
            m.push(BusMessage {
                event,
                payload: payload.to_vec(),
            });
        }
    }
}

/// Fallback when nobody installed a default bus: events only reach the log.
struct LogBus;

impl EventBus for LogBus {
    fn publish(&self, event: Event, payload: &[u8]) {
        log::debug!("event {} ({} bytes, no bus installed)", event.as_str(), payload.len());
    }
}

static DEFAULT_BUS: OnceLock<Arc<dyn EventBus>> = OnceLock::new();

/// Install the process-wide default bus. Only the first call wins.
pub fn set_default(bus: Arc<dyn EventBus>) -> bool {
    DEFAULT_BUS.set(bus).is_ok()
}

/// The process-wide default bus, used when a config carries none.
pub fn default_bus() -> Arc<dyn EventBus> {
    DEFAULT_BUS.get_or_init(|| Arc::new(LogBus)).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_follow_wire_order() {
        for (i, e) in Event::ALL.iter().enumerate() {
            assert_eq!(e.id(), i as i32);
            assert_eq!(Event::from_id(i as i32), Some(*e));
        }
        assert_eq!(Event::from_id(8), None);
    }

    #[test]
    fn channel_bus_fans_out_and_prunes_closed_receivers() {
        let bus = ChannelBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        drop(b);

        bus.publish(Event::OtaRead, &encode_u32(2048));

        let msg = a.try_recv().expect("message delivered");
        assert_eq!(msg.event, Event::OtaRead);
        assert_eq!(msg.bytes_read(), Some(2048));
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }

    #[test]
    fn status_payload_is_little_endian() {
        let msg = BusMessage {
            event: Event::OtaFailed,
            payload: encode_status(0x111).to_vec(),
        };
        assert_eq!(msg.payload, vec![0x11, 0x01, 0, 0]);
        assert_eq!(msg.status(), Some(0x111));
    }
}
