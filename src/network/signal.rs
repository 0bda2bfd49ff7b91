//! Connection signal set: independent flags for cross-context wake-ups.
//!
//! Two views of the same flags are kept. The *level* bits describe the link
//! right now and are what the blocking `init` waits on without clearing. The
//! *latched* bits record every set since the supervisor last looked, and are
//! consumed by it. A waiter on one view can never swallow a wake-up meant for
//! the other.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bits(u8);

impl Bits {
    pub const NONE: Bits = Bits(0);
    pub const CONNECTED: Bits = Bits(1 << 0);
    pub const DONE: Bits = Bits(1 << 1);
    pub const FAILED: Bits = Bits(1 << 2);
    pub const TERMINAL: Bits = Bits(Self::DONE.0 | Self::FAILED.0);

    pub fn contains(self, other: Bits) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn intersects(self, other: Bits) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Bits {
    type Output = Bits;
    fn bitor(self, rhs: Bits) -> Bits {
        Bits(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for Bits {
    type Output = Bits;
    fn bitand(self, rhs: Bits) -> Bits {
        Bits(self.0 & rhs.0)
    }
}

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Bits from the requested mask that were set
    Bits(Bits),
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct Flags {
    level: Bits,
    latched: Bits,
    cancelled: bool,
}

#[derive(Default)]
pub struct SignalSet {
    flags: Mutex<Flags>,
    cond: Condvar,
}

impl SignalSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Flags> {
        // A panicking waiter must not wedge the driver callback
        self.flags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, bits: Bits) {
        let mut flags = self.lock();
        flags.level = flags.level | bits;
        flags.latched = flags.latched | bits;
        self.cond.notify_all();
    }

    /// Clear level bits. Terminal bits are sticky and ignored here.
    pub fn clear(&self, bits: Bits) {
        let mut flags = self.lock();
        let keep = Bits(!(bits.0 & !Bits::TERMINAL.0));
        flags.level = flags.level & keep;
    }

    pub fn get(&self) -> Bits {
        self.lock().level
    }

    /// Wake every waiter with `Wake::Cancelled`; sticky.
    pub fn cancel(&self) {
        let mut flags = self.lock();
        flags.cancelled = true;
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Block until any level bit in `mask` is set. Nothing is cleared.
    pub fn wait_level(&self, mask: Bits, timeout: Option<Duration>) -> Wake {
        self.wait(mask, timeout, false)
    }

    /// Block until any latched bit in `mask` is set, consuming the bits returned.
    pub fn wait_latched(&self, mask: Bits, timeout: Option<Duration>) -> Wake {
        self.wait(mask, timeout, true)
    }

    fn wait(&self, mask: Bits, timeout: Option<Duration>, consume: bool) -> Wake {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut flags = self.lock();

        loop {
            let view = if consume { flags.latched } else { flags.level };
            let hit = view & mask;
            if !hit.is_empty() {
                if consume {
                    flags.latched = flags.latched & Bits(!hit.0);
                }
                return Wake::Bits(hit);
            }
            if flags.cancelled {
                return Wake::Cancelled;
            }

            flags = match deadline {
                None => self
                    .cond
                    .wait(flags)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wake::TimedOut;
                    }
                    self.cond
                        .wait_timeout(flags, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
            };
        }
    }
}

/// Cancels blocking waits on one signal set from any thread.
#[derive(Clone)]
pub struct CancelToken {
    signals: Arc<SignalSet>,
}

impl CancelToken {
    pub(crate) fn new(signals: Arc<SignalSet>) -> Self {
        Self { signals }
    }

    pub fn cancel(&self) {
        self.signals.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_terminal_bits_are_sticky() {
        let signals = SignalSet::new();
        signals.set(Bits::CONNECTED | Bits::FAILED);
        signals.clear(Bits::CONNECTED | Bits::FAILED);
        assert_eq!(signals.get(), Bits::FAILED);
    }

    #[test]
    fn test_level_wait_does_not_consume() {
        let signals = SignalSet::new();
        signals.set(Bits::CONNECTED);
        assert_eq!(signals.wait_level(Bits::CONNECTED, None), Wake::Bits(Bits::CONNECTED));
        assert_eq!(signals.wait_level(Bits::CONNECTED, None), Wake::Bits(Bits::CONNECTED));
    }

    #[test]
    fn test_latched_wait_consumes_only_its_view() {
        let signals = SignalSet::new();
        signals.set(Bits::CONNECTED);
        assert_eq!(signals.wait_latched(Bits::CONNECTED, None), Wake::Bits(Bits::CONNECTED));
        assert_eq!(
            signals.wait_latched(Bits::CONNECTED, Some(Duration::from_millis(10))),
            Wake::TimedOut
        );
        // Level view still reports the link as up
        assert!(signals.get().contains(Bits::CONNECTED));
    }

    #[test]
    fn test_latch_survives_level_clear() {
        let signals = SignalSet::new();
        signals.set(Bits::CONNECTED);
        signals.clear(Bits::CONNECTED);
        assert_eq!(
            signals.wait_latched(Bits::CONNECTED | Bits::TERMINAL, None),
            Wake::Bits(Bits::CONNECTED)
        );
    }

    #[test]
    fn test_wait_wakes_on_set_from_other_thread() {
        let signals = Arc::new(SignalSet::new());
        let setter = signals.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set(Bits::FAILED);
        });
        let wake = signals.wait_level(Bits::CONNECTED | Bits::FAILED, Some(Duration::from_secs(5)));
        assert_eq!(wake, Wake::Bits(Bits::FAILED));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_token_wakes_waiter() {
        let signals = Arc::new(SignalSet::new());
        let token = CancelToken::new(signals.clone());
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token.cancel();
        });
        assert_eq!(signals.wait_level(Bits::CONNECTED, None), Wake::Cancelled);
        handle.join().unwrap();
    }

    #[test]
    fn test_set_bits_win_over_cancel() {
        let signals = SignalSet::new();
        signals.set(Bits::CONNECTED);
        signals.cancel();
        assert_eq!(signals.wait_level(Bits::CONNECTED, None), Wake::Bits(Bits::CONNECTED));
    }
}
