use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::bus::{Event, RecordingBus};
use crate::config::ConnectionConfig;
use crate::error::{status, Error};
use crate::network::connection::ConnectionState;
use crate::network::loopback::{Attempt, LoopbackDriver};
use crate::network::{Connection, DriverEvent};

fn link(driver: &Arc<LoopbackDriver>, bus: &Arc<RecordingBus>, retries: u32) -> Connection {
    let config = ConnectionConfig::new("lab-ap", "password123")
        .expect("valid credentials")
        .with_retries(retries)
        .with_bus(bus.clone());
    Connection::new(driver.clone(), config)
}

/// Poll until `cond` holds or two seconds pass.
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_budget_exhaustion_fails_init() {
    let driver = Arc::new(LoopbackDriver::with_fallback(Some(Attempt::fail())));
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 5);

    let result = conn.init();

    assert!(matches!(result, Err(Error::RetryExhausted { budget: 5 })));
    assert_ne!(status(&result), 0);
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert_eq!(conn.remaining_retries(), 0);

    // First attempt plus five reconnects, nothing after the budget hit zero
    let stats = conn.stats();
    assert_eq!(stats.reconnect_attempts, 5);
    assert_eq!(stats.disconnects, 6);
    assert_eq!(driver.connect_calls(), 6);
    assert_eq!(bus.events(), vec![Event::Connecting, Event::Disconnected]);

    conn.deinit().unwrap();
    assert_eq!(driver.connect_calls(), 6);
    assert_eq!(bus.count(Event::Disconnected), 1);
}

#[test]
fn test_successful_connect_publishes_connected_once() {
    let driver = Arc::new(LoopbackDriver::new());
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 5);

    let result = conn.init();

    assert!(result.is_ok());
    assert_eq!(status(&result), 0);
    assert!(conn.is_connected());
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.remaining_retries(), 5);
    assert_eq!(driver.configured_ssid().as_deref(), Some("lab-ap"));
    assert_eq!(bus.events(), vec![Event::Connecting, Event::Connected]);

    conn.deinit().unwrap();
    assert_eq!(
        bus.events(),
        vec![Event::Connecting, Event::Connected, Event::Disconnected]
    );
    assert_eq!(conn.state(), ConnectionState::Done);
    assert_eq!(driver.stop_calls(), 1);
    assert_eq!(driver.handler_count(), 0);
}

#[test]
fn test_transient_losses_recover_within_budget() {
    let driver = Arc::new(LoopbackDriver::new());
    driver.script([Attempt::fail(), Attempt::fail(), Attempt::succeed()]);
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 3);

    assert!(conn.init().is_ok());
    assert_eq!(conn.remaining_retries(), 1);
    assert_eq!(conn.stats().reconnect_attempts, 2);
    // Transient losses never reach collaborators
    assert_eq!(bus.events(), vec![Event::Connecting, Event::Connected]);
}

#[test]
fn test_zero_budget_fails_on_first_loss() {
    let driver = Arc::new(LoopbackDriver::with_fallback(Some(Attempt::fail())));
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 0);

    assert!(matches!(conn.init(), Err(Error::RetryExhausted { budget: 0 })));
    assert_eq!(driver.connect_calls(), 1);
}

#[test]
fn test_failure_after_connect_announces_disconnected_once() {
    let driver = Arc::new(LoopbackDriver::new());
    driver.script([Attempt::succeed(), Attempt::fail(), Attempt::fail()]);
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 2);

    assert!(conn.init().is_ok());

    // Link drops; both reconnects fail and the budget runs out
    driver.inject(DriverEvent::StaDisconnected { reason: 8 });
    assert!(eventually(|| conn.state() == ConnectionState::Failed));
    assert!(eventually(|| bus.count(Event::Disconnected) == 1));
    assert!(!conn.is_connected());

    conn.deinit().unwrap();
    assert_eq!(
        bus.events(),
        vec![Event::Connecting, Event::Connected, Event::Disconnected]
    );
    // Failed stays the terminal state, deinit does not overwrite it
    assert_eq!(conn.state(), ConnectionState::Failed);
}

#[test]
fn test_deinit_is_idempotent() {
    let driver = Arc::new(LoopbackDriver::new());
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 1);

    assert!(conn.deinit().is_ok());
    assert!(conn.init().is_ok());
    assert!(conn.deinit().is_ok());
    assert!(conn.deinit().is_ok());

    assert_eq!(driver.stop_calls(), 1);
    assert_eq!(bus.count(Event::Disconnected), 1);
}

#[test]
fn test_double_init_is_rejected() {
    let driver = Arc::new(LoopbackDriver::new());
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 1);

    assert!(conn.init().is_ok());
    assert!(matches!(conn.init(), Err(Error::InvalidState(_))));
    assert_eq!(driver.start_calls(), 1);
    assert_eq!(bus.count(Event::Connecting), 1);
}

#[test]
fn test_reinit_after_deinit_restores_budget() {
    let driver = Arc::new(LoopbackDriver::with_fallback(Some(Attempt::fail())));
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 2);

    assert!(conn.init().is_err());
    assert_eq!(conn.remaining_retries(), 0);
    conn.deinit().unwrap();

    driver.script([Attempt::fail(), Attempt::succeed()]);
    assert!(conn.init().is_ok());
    assert_eq!(conn.remaining_retries(), 1);
    assert_eq!(
        bus.events(),
        vec![
            Event::Connecting,
            Event::Disconnected,
            Event::Connecting,
            Event::Connected
        ]
    );
}

#[test]
fn test_wait_timeout() {
    // Attempts never report back
    let driver = Arc::new(LoopbackDriver::with_fallback(None));
    let bus = Arc::new(RecordingBus::new());
    let config = ConnectionConfig::new("lab-ap", "password123")
        .unwrap()
        .with_wait_timeout(Duration::from_millis(50))
        .with_bus(bus.clone());
    let mut conn = Connection::new(driver.clone(), config);

    let started = Instant::now();
    let result = conn.init();

    assert!(matches!(result, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(bus.events(), vec![Event::Connecting, Event::Disconnected]);

    conn.deinit().unwrap();
    assert_eq!(bus.count(Event::Disconnected), 1);
}

#[test]
fn test_cancel_unblocks_init() {
    let driver = Arc::new(LoopbackDriver::with_fallback(None));
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 3);

    let token = conn.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        token.cancel();
    });

    let result = conn.init();
    canceller.join().unwrap();

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(bus.events(), vec![Event::Connecting, Event::Disconnected]);
    assert!(conn.deinit().is_ok());
}

#[test]
fn test_address_after_terminal_failure_is_ignored() {
    let driver = Arc::new(LoopbackDriver::with_fallback(Some(Attempt::fail())));
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 1);

    assert!(conn.init().is_err());
    driver.inject(DriverEvent::GotIp {
        ip: std::net::Ipv4Addr::new(10, 0, 0, 9),
    });
    thread::sleep(Duration::from_millis(20));

    assert!(!conn.is_connected());
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert_eq!(bus.count(Event::Connected), 0);
}

#[test]
fn test_drop_releases_driver_handler() {
    let driver = Arc::new(LoopbackDriver::new());
    let bus = Arc::new(RecordingBus::new());
    {
        let mut conn = link(&driver, &bus, 1);
        assert!(conn.init().is_ok());
        assert_eq!(driver.handler_count(), 1);
    }
    assert_eq!(driver.handler_count(), 0);
    assert_eq!(bus.count(Event::Disconnected), 1);
}

#[test]
fn test_large_budget_with_rejected_connects_fails_cleanly() {
    let driver = Arc::new(LoopbackDriver::new());
    driver.reject_connect(true);
    let bus = Arc::new(RecordingBus::new());
    let mut conn = link(&driver, &bus, 1_000_000);

    let result = conn.init();

    assert!(matches!(result, Err(Error::RetryExhausted { budget: 1_000_000 })));
    assert_eq!(driver.connect_calls(), 1_000_001);
    assert_eq!(conn.remaining_retries(), 0);
    assert_eq!(bus.events(), vec![Event::Connecting, Event::Disconnected]);
    conn.deinit().unwrap();
}
