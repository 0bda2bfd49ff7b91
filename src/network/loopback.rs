//! In-process station driver for host runs and tests.
//!
//! Events are delivered from a dedicated `loopback-driver` thread, in order,
//! the same way the ESP-IDF event task calls registered handlers. Each
//! `connect` consumes one scripted [`Attempt`]; once the script is empty the
//! fallback outcome is used.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::config::Credentials;
use crate::error::{Error, Result};

use super::driver::{DriverEvent, EventHandler, Subscription, WifiDriver};

/// 802.11 reason code used for scripted failures (NO_AP_FOUND).
pub const REASON_NO_AP_FOUND: u16 = 201;

/// Outcome of one association attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Fail { reason: u16 },
    Succeed { ip: Ipv4Addr },
}

impl Attempt {
    pub const fn fail() -> Self {
        Attempt::Fail {
            reason: REASON_NO_AP_FOUND,
        }
    }

    pub const fn succeed() -> Self {
        Attempt::Succeed {
            ip: Ipv4Addr::new(192, 168, 4, 2),
        }
    }

    fn event(self) -> DriverEvent {
        match self {
            Attempt::Fail { reason } => DriverEvent::StaDisconnected { reason },
            Attempt::Succeed { ip } => DriverEvent::GotIp { ip },
        }
    }
}

enum Command {
    Deliver(DriverEvent),
    Attempt,
}

#[derive(Default)]
struct Shared {
    handlers: Mutex<Vec<(Subscription, EventHandler)>>,
    script: Mutex<VecDeque<Attempt>>,
    fallback: Mutex<Option<Attempt>>,
    credentials: Mutex<Option<Credentials>>,
    next_subscription: AtomicU32,
    connect_calls: AtomicU32,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    started: AtomicBool,
    reject_connect: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Shared {
    fn dispatch(&self, event: DriverEvent) {
        // Clone out so handlers may call back into the driver
        let handlers: Vec<EventHandler> = lock(&self.handlers).iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn next_attempt(&self) -> Option<Attempt> {
        lock(&self.script).pop_front().or(*lock(&self.fallback))
    }
}

pub struct LoopbackDriver {
    shared: Arc<Shared>,
    commands: Mutex<Sender<Command>>,
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDriver {
    /// Every attempt succeeds unless scripted otherwise.
    pub fn new() -> Self {
        Self::with_fallback(Some(Attempt::succeed()))
    }

    /// `None` means unscripted attempts never report back.
    pub fn with_fallback(fallback: Option<Attempt>) -> Self {
        let shared = Arc::new(Shared::default());
        *lock(&shared.fallback) = fallback;

        let (tx, rx) = mpsc::channel::<Command>();
        let worker = shared.clone();
        let spawned = thread::Builder::new()
            .name("loopback-driver".to_string())
            .spawn(move || {
                for command in rx {
                    match command {
                        Command::Deliver(event) => worker.dispatch(event),
                        Command::Attempt => {
                            if !worker.started.load(Ordering::SeqCst) {
                                continue;
                            }
                            if let Some(attempt) = worker.next_attempt() {
                                worker.dispatch(attempt.event());
                            }
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            log::error!("loopback driver: failed to spawn event thread: {:?}", e);
        }

        Self {
            shared,
            commands: Mutex::new(tx),
        }
    }

    /// Queue outcomes for the next `connect` calls, in order.
    pub fn script<I: IntoIterator<Item = Attempt>>(&self, attempts: I) {
        lock(&self.shared.script).extend(attempts);
    }

    /// Make `connect` itself return an error.
    pub fn reject_connect(&self, reject: bool) {
        self.shared.reject_connect.store(reject, Ordering::SeqCst);
    }

    /// Deliver an arbitrary event through the driver thread.
    pub fn inject(&self, event: DriverEvent) {
        self.send(Command::Deliver(event));
    }

    fn send(&self, command: Command) {
        if lock(&self.commands).send(command).is_err() {
            log::warn!("loopback driver: event thread gone");
        }
    }

    pub fn connect_calls(&self) -> u32 {
        self.shared.connect_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.shared.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.shared.stop_calls.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.shared.handlers).len()
    }

    pub fn configured_ssid(&self) -> Option<String> {
        lock(&self.shared.credentials)
            .as_ref()
            .map(|c| c.ssid.as_str().to_string())
    }
}

impl WifiDriver for LoopbackDriver {
    fn register_handler(&self, handler: EventHandler) -> Result<Subscription> {
        let id = Subscription(self.shared.next_subscription.fetch_add(1, Ordering::SeqCst));
        lock(&self.shared.handlers).push((id, handler));
        Ok(id)
    }

    fn unregister_handler(&self, subscription: Subscription) -> Result<()> {
        let mut handlers = lock(&self.shared.handlers);
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != subscription);
        if handlers.len() == before {
            return Err(Error::InvalidState("handler not registered"));
        }
        Ok(())
    }

    fn configure(&self, credentials: &Credentials) -> Result<()> {
        *lock(&self.shared.credentials) = Some(credentials.clone());
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.shared.start_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.started.store(true, Ordering::SeqCst);
        self.send(Command::Deliver(DriverEvent::StaStarted));
        Ok(())
    }

    fn connect(&self) -> Result<()> {
        self.shared.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.shared.reject_connect.load(Ordering::SeqCst) {
            return Err(Error::transport("connect rejected", -1));
        }
        self.send(Command::Attempt);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.shared.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.started.store(false, Ordering::SeqCst);
        Ok(())
    }
}
