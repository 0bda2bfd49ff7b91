//! Station connection state machine.
//!
//! ```text
//! Init -> Connecting -> Connected
//!            ^   |          |
//!            |   v          v
//!    RetryingDisconnected <-+
//!            |
//!            v
//!         Failed            (Done after deinit)
//! ```
//!
//! The driver callback is the only writer of the retry budget and of the
//! `connected`/`failed` bits. `deinit` is the only writer of `done`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::bus::{Event, EventBus};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

use super::driver::{DriverEvent, EventHandler, Subscription, WifiDriver};
use super::signal::{Bits, CancelToken, SignalSet, Wake};
use super::stats::{LinkStats, LinkStatsSnapshot};
use super::supervisor::{self, SupervisorOutcome};

/// Reason reported when `connect()` itself is rejected by the driver.
pub const REASON_CONNECT_REJECTED: u16 = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    RetryingDisconnected,
    Failed,
    Done,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Done)
    }
}

#[derive(Default)]
struct Announced {
    connected: bool,
    disconnected: bool,
}

/// Per-instance state shared between the caller, the driver callback and
/// the supervisor.
pub(crate) struct ConnectionContext {
    pub(crate) signals: Arc<SignalSet>,
    pub(crate) stats: LinkStats,
    budget: u32,
    retries: AtomicU32,
    state: Mutex<ConnectionState>,
    bus: Arc<dyn EventBus>,
    driver: Arc<dyn WifiDriver>,
    announced: Mutex<Announced>,
    supervisor: Mutex<Option<JoinHandle<SupervisorOutcome>>>,
}

impl ConnectionContext {
    fn new(
        signals: Arc<SignalSet>,
        budget: u32,
        bus: Arc<dyn EventBus>,
        driver: Arc<dyn WifiDriver>,
    ) -> Self {
        Self {
            signals,
            stats: LinkStats::default(),
            budget,
            retries: AtomicU32::new(budget),
            state: Mutex::new(ConnectionState::Init),
            bus,
            driver,
            announced: Mutex::new(Announced::default()),
            supervisor: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != next {
            log::debug!("wifi: {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    pub(crate) fn remaining_retries(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    /// Spend one retry; `None` once the budget is exhausted.
    fn take_retry(&self) -> Option<u32> {
        self.retries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .ok()
            .map(|before| before - 1)
    }

    fn is_terminal(&self) -> bool {
        self.signals.get().intersects(Bits::TERMINAL)
    }

    fn announced(&self) -> MutexGuard<'_, Announced> {
        self.announced.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Publish CONNECTED for `init`. If the link already died terminally,
    /// follow up with DISCONNECTED so collaborators do not start on a dead link.
    fn announce_connected(&self) {
        let mut announced = self.announced();
        self.bus.publish(Event::Connected, &[]);
        announced.connected = true;
        if self.is_terminal() && !announced.disconnected {
            self.bus.publish(Event::Disconnected, &[]);
            announced.disconnected = true;
        }
    }

    /// Publish DISCONNECTED for a failed `init`, at most once.
    fn announce_failed(&self) {
        let mut announced = self.announced();
        if !announced.disconnected {
            self.bus.publish(Event::Disconnected, &[]);
            announced.disconnected = true;
        }
    }

    /// Publish DISCONNECTED after a successful `init`, at most once.
    pub(crate) fn announce_link_down(&self) -> bool {
        let mut announced = self.announced();
        if announced.connected && !announced.disconnected {
            self.bus.publish(Event::Disconnected, &[]);
            announced.disconnected = true;
            return true;
        }
        false
    }

    fn spawn_supervisor_once(self: &Arc<Self>) {
        let mut slot = self.supervisor.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            log::debug!("wifi: supervisor already running");
            return;
        }
        match supervisor::spawn(self.clone()) {
            Ok(handle) => *slot = Some(handle),
            Err(e) => log::error!("wifi: failed to spawn supervisor: {:?}", e),
        }
    }

    fn take_supervisor(&self) -> Option<JoinHandle<SupervisorOutcome>> {
        self.supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }
}

/// Driver callback. Runs on the driver's context, events in delivery order.
pub(crate) fn handle_event(ctx: &Arc<ConnectionContext>, event: DriverEvent) {
    match event {
        DriverEvent::StaStarted => {
            if ctx.is_terminal() {
                return;
            }
            ctx.set_state(ConnectionState::Connecting);
            ctx.spawn_supervisor_once();
            attempt_connect(ctx);
        }
        DriverEvent::StaDisconnected { reason } => on_link_lost(ctx, reason),
        DriverEvent::GotIp { ip } => {
            if ctx.is_terminal() {
                log::debug!("wifi: ignoring address {} after terminal state", ip);
                return;
            }
            ctx.stats.set_connected(true);
            ctx.stats.record_connect();
            ctx.set_state(ConnectionState::Connected);
            ctx.signals.set(Bits::CONNECTED);
        }
    }
}

/// Issue connects until the driver accepts one or the budget runs out. A
/// rejected connect spends a retry like any other link loss.
fn attempt_connect(ctx: &Arc<ConnectionContext>) {
    loop {
        match ctx.driver.connect() {
            Ok(()) => return,
            Err(e) => {
                log::warn!("wifi: connect rejected by driver: {}", e);
                if !spend_retry(ctx, REASON_CONNECT_REJECTED) {
                    return;
                }
            }
        }
    }
}

fn on_link_lost(ctx: &Arc<ConnectionContext>, reason: u16) {
    if spend_retry(ctx, reason) {
        attempt_connect(ctx);
    }
}

/// Record a lost link and take one retry. `true` when a reconnect is due.
fn spend_retry(ctx: &ConnectionContext, reason: u16) -> bool {
    ctx.signals.clear(Bits::CONNECTED);
    ctx.stats.set_connected(false);
    ctx.stats.record_disconnect(reason);

    if ctx.is_terminal() {
        return false;
    }

    match ctx.take_retry() {
        Some(remaining) => {
            ctx.set_state(ConnectionState::RetryingDisconnected);
            ctx.stats.record_reconnect_attempt();
            log::debug!("wifi: link lost (reason {}), retrying, {} left", reason, remaining);
            ctx.set_state(ConnectionState::Connecting);
            true
        }
        None => {
            ctx.set_state(ConnectionState::Failed);
            ctx.signals.set(Bits::FAILED);
            false
        }
    }
}

/// One station link with a bounded reconnect budget.
pub struct Connection {
    config: ConnectionConfig,
    driver: Arc<dyn WifiDriver>,
    // Signal set for the current (or next) init cycle
    signals: Arc<SignalSet>,
    ctx: Option<Arc<ConnectionContext>>,
    subscription: Option<Subscription>,
}

impl Connection {
    pub fn new(driver: Arc<dyn WifiDriver>, config: ConnectionConfig) -> Self {
        Self {
            config,
            driver,
            signals: Arc::new(SignalSet::new()),
            ctx: None,
            subscription: None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Cancels a blocked `init` of the current cycle from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(self.signals.clone())
    }

    /// Register with the driver, start the station and block until the link
    /// is up or the retry budget is spent.
    ///
    /// Publishes CONNECTING, then exactly one of CONNECTED / DISCONNECTED.
    /// After `deinit`, calling `init` again starts over with a full budget.
    pub fn init(&mut self) -> Result<()> {
        if self.subscription.is_some() {
            return Err(Error::InvalidState("connection already initialised"));
        }
        if self.ctx.is_some() {
            self.signals = Arc::new(SignalSet::new());
        }

        let bus = self.config.bus();
        let ctx = Arc::new(ConnectionContext::new(
            self.signals.clone(),
            self.config.retries,
            bus.clone(),
            self.driver.clone(),
        ));
        self.ctx = Some(ctx.clone());

        log::info!(
            "Connecting to '{}' (retry budget {})",
            self.config.credentials.ssid,
            self.config.retries
        );

        let handler_ctx = ctx.clone();
        let handler: EventHandler = Arc::new(move |event| handle_event(&handler_ctx, event));
        let subscription = self.driver.register_handler(handler)?;
        self.subscription = Some(subscription);

        if let Err(e) = self.driver.configure(&self.config.credentials) {
            log::error!("Failed to configure station: {}", e);
            self.release_handler();
            return Err(e);
        }

        bus.publish(Event::Connecting, &[]);

        if let Err(e) = self.driver.start() {
            log::error!("Failed to start station: {}", e);
            ctx.announce_failed();
            self.release_handler();
            return Err(e);
        }

        match ctx
            .signals
            .wait_level(Bits::CONNECTED | Bits::FAILED, self.config.wait_timeout)
        {
            Wake::Bits(bits) if bits.contains(Bits::CONNECTED) => {
                ctx.announce_connected();
                log::info!("WiFi connected to '{}'", self.config.credentials.ssid);
                Ok(())
            }
            Wake::Bits(_) => {
                ctx.announce_failed();
                log::error!(
                    "WiFi connection to '{}' failed after {} retries",
                    self.config.credentials.ssid,
                    ctx.budget
                );
                Err(Error::RetryExhausted { budget: ctx.budget })
            }
            Wake::TimedOut => {
                ctx.announce_failed();
                log::error!("WiFi connect timed out after {:?}", self.config.wait_timeout);
                Err(Error::Timeout)
            }
            Wake::Cancelled => {
                ctx.announce_failed();
                log::warn!("WiFi connect cancelled");
                Err(Error::Cancelled)
            }
        }
    }

    fn release_handler(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            if let Err(e) = self.driver.unregister_handler(subscription) {
                log::warn!("Failed to unregister WiFi handler: {}", e);
            }
        }
    }

    /// Unregister the handler, mark the instance done, stop the station and
    /// join the supervisor. Best effort and idempotent.
    pub fn deinit(&mut self) -> Result<()> {
        if self.subscription.is_none() {
            log::debug!("wifi: deinit on idle connection, nothing to do");
            return Ok(());
        }
        self.release_handler();

        if let Some(ctx) = &self.ctx {
            if !ctx.state().is_terminal() {
                ctx.set_state(ConnectionState::Done);
            }
            ctx.signals.set(Bits::DONE);
            ctx.announce_link_down();
        }

        if let Err(e) = self.driver.stop() {
            log::warn!("Failed to stop WiFi: {}", e);
        }

        if let Some(handle) = self.ctx.as_ref().and_then(|ctx| ctx.take_supervisor()) {
            match handle.join() {
                Ok(outcome) => log::debug!("wifi: supervisor finished: {:?}", outcome),
                Err(_) => log::warn!("wifi: supervisor panicked"),
            }
        }

        log::info!("WiFi deinitialised");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.state())
            .unwrap_or(ConnectionState::Init)
    }

    pub fn is_connected(&self) -> bool {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.signals.get().contains(Bits::CONNECTED))
            .unwrap_or(false)
    }

    /// Reconnect attempts left in the current cycle.
    pub fn remaining_retries(&self) -> u32 {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.remaining_retries())
            .unwrap_or(self.config.retries)
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.stats.snapshot())
            .unwrap_or_else(|| LinkStats::default().snapshot())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Breaks the driver -> handler -> context cycle
        if self.subscription.is_some() {
            let _ = self.deinit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RecordingBus;
    use crate::network::loopback::LoopbackDriver;
    use std::net::Ipv4Addr;

    fn context(budget: u32) -> (Arc<ConnectionContext>, Arc<LoopbackDriver>, Arc<RecordingBus>) {
        let driver = Arc::new(LoopbackDriver::new());
        let bus = Arc::new(RecordingBus::new());
        let ctx = Arc::new(ConnectionContext::new(
            Arc::new(SignalSet::new()),
            budget,
            bus.clone(),
            driver.clone(),
        ));
        (ctx, driver, bus)
    }

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 2);

    #[test]
    fn test_link_lost_spends_budget_then_fails() {
        let (ctx, driver, _) = context(2);

        handle_event(&ctx, DriverEvent::StaDisconnected { reason: 201 });
        handle_event(&ctx, DriverEvent::StaDisconnected { reason: 201 });
        assert_eq!(ctx.remaining_retries(), 0);
        assert!(!ctx.signals.get().contains(Bits::FAILED));

        handle_event(&ctx, DriverEvent::StaDisconnected { reason: 201 });
        assert!(ctx.signals.get().contains(Bits::FAILED));
        assert_eq!(ctx.state(), ConnectionState::Failed);
        assert_eq!(driver.connect_calls(), 2);
    }

    #[test]
    fn test_got_ip_after_retry_sets_connected() {
        let (ctx, _, _) = context(3);

        handle_event(&ctx, DriverEvent::StaDisconnected { reason: 8 });
        handle_event(&ctx, DriverEvent::StaDisconnected { reason: 8 });
        handle_event(&ctx, DriverEvent::GotIp { ip: IP });

        assert!(ctx.signals.get().contains(Bits::CONNECTED));
        assert_eq!(ctx.state(), ConnectionState::Connected);
        assert_eq!(ctx.remaining_retries(), 1);
    }

    #[test]
    fn test_events_after_failure_are_ignored() {
        let (ctx, driver, _) = context(0);

        handle_event(&ctx, DriverEvent::StaDisconnected { reason: 2 });
        handle_event(&ctx, DriverEvent::GotIp { ip: IP });
        handle_event(&ctx, DriverEvent::StaDisconnected { reason: 2 });

        assert_eq!(ctx.signals.get(), Bits::FAILED);
        assert_eq!(driver.connect_calls(), 0);
        assert_eq!(ctx.remaining_retries(), 0);
    }

    #[test]
    fn test_link_lost_clears_connected() {
        let (ctx, _, _) = context(1);

        handle_event(&ctx, DriverEvent::GotIp { ip: IP });
        handle_event(&ctx, DriverEvent::StaDisconnected { reason: 4 });

        assert!(!ctx.signals.get().contains(Bits::CONNECTED));
        assert!(!ctx.stats.snapshot().connected);
        assert_eq!(ctx.stats.snapshot().last_reason, 4);
    }

    #[test]
    fn test_announce_link_down_requires_prior_connected() {
        let (ctx, _, bus) = context(1);
        assert!(!ctx.announce_link_down());

        ctx.announce_connected();
        assert!(ctx.announce_link_down());
        assert!(!ctx.announce_link_down());
        assert_eq!(bus.events(), vec![Event::Connected, Event::Disconnected]);
    }

    #[test]
    fn test_rejected_connect_counts_as_link_loss() {
        let (ctx, driver, _) = context(2);
        driver.reject_connect(true);

        handle_event(&ctx, DriverEvent::StaStarted);

        assert_eq!(driver.connect_calls(), 3);
        assert_eq!(ctx.state(), ConnectionState::Failed);
        assert_eq!(
            ctx.stats.snapshot().last_reason,
            REASON_CONNECT_REJECTED as u32
        );
        let handle = ctx.take_supervisor().expect("supervisor spawned on start");
        assert_eq!(handle.join().ok(), Some(SupervisorOutcome::Failed));
    }

    #[test]
    fn test_rejected_connects_do_not_grow_the_stack() {
        let (ctx, driver, _) = context(200_000);
        driver.reject_connect(true);

        attempt_connect(&ctx);

        assert_eq!(driver.connect_calls(), 200_001);
        assert_eq!(ctx.remaining_retries(), 0);
        assert_eq!(ctx.state(), ConnectionState::Failed);
        assert_eq!(ctx.stats.snapshot().reconnect_attempts, 200_000);
    }

    #[test]
    fn test_failure_between_wake_and_announce_follows_connected_with_disconnected() {
        let (ctx, _, bus) = context(0);

        handle_event(&ctx, DriverEvent::GotIp { ip: IP });
        let woke = ctx.signals.wait_level(Bits::CONNECTED | Bits::FAILED, None);
        assert!(matches!(woke, Wake::Bits(bits) if bits.contains(Bits::CONNECTED)));
        handle_event(&ctx, DriverEvent::StaDisconnected { reason: 2 });
        ctx.announce_connected();

        assert_eq!(bus.events(), vec![Event::Connected, Event::Disconnected]);
        assert!(!ctx.announce_link_down());
        ctx.announce_failed();
        assert_eq!(bus.count(Event::Disconnected), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_retry_budget_never_underflows(
            budget in 0u32..8,
            losses in proptest::collection::vec(proptest::bool::ANY, 0..40),
        ) {
            let (ctx, driver, _) = context(budget);
            let mut lost = 0u32;
            for is_loss in losses {
                if is_loss {
                    lost += 1;
                    handle_event(&ctx, DriverEvent::StaDisconnected { reason: 8 });
                } else {
                    handle_event(&ctx, DriverEvent::GotIp { ip: IP });
                }
                proptest::prop_assert!(ctx.remaining_retries() <= budget);
            }

            proptest::prop_assert_eq!(ctx.remaining_retries(), budget.saturating_sub(lost));
            proptest::prop_assert_eq!(driver.connect_calls(), lost.min(budget));
            proptest::prop_assert_eq!(ctx.signals.get().contains(Bits::FAILED), lost > budget);
        }
    }
}
