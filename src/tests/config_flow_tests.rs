use std::sync::Arc;

use crate::bus::{Event, RecordingBus};
use crate::config::{load_or_default, DeviceConfig};
use crate::network::loopback::LoopbackDriver;
use crate::network::Connection;

fn device_config() -> DeviceConfig {
    DeviceConfig {
        wifi_ssid: "field-ap".into(),
        wifi_password: "hunter2hunter2".into(),
        wifi_retries: 3,
        connect_timeout_secs: Some(5),
        ..DeviceConfig::default()
    }
}

#[test]
fn test_stored_config_drives_connection() {
    let path = std::env::temp_dir().join(format!("wifi-ota-{}-device.json", std::process::id()));
    device_config().save(&path).unwrap();

    let loaded = load_or_default(&path).unwrap();
    let bus = Arc::new(RecordingBus::new());
    let link_config = loaded.connection_config().unwrap().with_bus(bus.clone());
    assert_eq!(link_config.retries, 3);

    let driver = Arc::new(LoopbackDriver::new());
    let mut conn = Connection::new(driver.clone(), link_config);
    assert!(conn.init().is_ok());
    assert_eq!(driver.configured_ssid().as_deref(), Some("field-ap"));
    conn.deinit().unwrap();
    assert_eq!(
        bus.events(),
        vec![Event::Connecting, Event::Connected, Event::Disconnected]
    );

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_bad_stored_credentials_are_rejected() {
    let mut config = device_config();
    config.wifi_password = "short".into();
    assert!(config.connection_config().is_err());

    config.wifi_password = "p".repeat(65);
    assert!(config.connection_config().is_err());
}

#[test]
fn test_ota_config_reads_trust_anchor() {
    let pem_path = std::env::temp_dir().join(format!("wifi-ota-{}-ca.pem", std::process::id()));
    std::fs::write(
        &pem_path,
        "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n",
    )
    .unwrap();

    let mut config = device_config();
    config.ota_url = "https://fw.example.net/node.bin".into();
    config.ota_cert_path = Some(pem_path.display().to_string());
    config.ota_timeout_secs = 30;

    let ota = config.ota_config().unwrap();
    assert!(ota.validate().is_ok());
    assert_eq!(ota.timeout.as_secs(), 30);

    config.ota_cert_path = Some("/nonexistent/ca.pem".into());
    assert!(config.ota_config().is_err());

    let _ = std::fs::remove_file(&pem_path);
}
