use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Link counters for one connection instance, updated from the driver callback.
#[derive(Default)]
pub struct LinkStats {
    connected: AtomicBool,
    disconnects: AtomicU32,
    reconnect_attempts: AtomicU32,
    connects: AtomicU32,
    last_reason: AtomicU32,
}

impl LinkStats {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self, reason: u16) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        self.last_reason.store(reason as u32, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            last_reason: self.last_reason.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LinkStatsSnapshot {
    pub connected: bool,
    pub disconnects: u32,
    pub reconnect_attempts: u32,
    pub connects: u32,
    pub last_reason: u32,
}
