use anyhow::Result;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;

use log::info;

use wifi_ota::bus::{self, BusMessage, ChannelBus, Event};
use wifi_ota::network::{Connection, WifiDriver};
use wifi_ota::{config, logging, ota, version};

// Generate ESP-IDF app descriptor
#[cfg(feature = "esp-idf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(feature = "esp-idf")]
const DEFAULT_CONFIG_PATH: &str = "/spiffs/wifi_ota.json";
#[cfg(not(feature = "esp-idf"))]
const DEFAULT_CONFIG_PATH: &str = "wifi_ota.json";

fn main() -> Result<()> {
    #[cfg(feature = "esp-idf")]
    esp_idf_sys::link_patches();

    logging::init_logger(log::LevelFilter::Info)?;
    info!("ESP32 Wi-Fi/OTA node {}", version::full_version());

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    // Missing file means compiled-in credentials from wifi_config.h
    let device_config = config::load_or_default(&config_path)?;
    log::set_max_level(device_config.log_level());
    info!(
        "WiFi credentials: SSID='{}', Password={}",
        device_config.wifi_ssid,
        if device_config.wifi_password.is_empty() { "<empty>" } else { "<set>" }
    );

    let channel = Arc::new(ChannelBus::new());
    spawn_service_watcher(channel.subscribe())?;
    if !bus::set_default(channel.clone()) {
        log::warn!("Default event bus already installed");
    }

    let link_config = device_config.connection_config()?.with_bus(channel);
    let mut link = Connection::new(make_driver()?, link_config);

    if let Err(e) = link.init() {
        log::error!("WiFi bring-up failed: {} (status 0x{:x})", e, e.code());
        link.deinit()?;
        return Err(e.into());
    }
    info!("WiFi connected, {} reconnects left", link.remaining_retries());

    if device_config.ota_on_boot {
        let ota_config = device_config.ota_config()?;
        let mut transport = make_transport();
        match ota::update(link.config(), &ota_config, &mut transport) {
            Ok(desc) => {
                info!("Staged {} {}, restarting", desc.project_name(), desc.version());
                link.deinit()?;
                restart();
                return Ok(());
            }
            Err(e) => log::warn!("OTA skipped this boot: {}", e),
        }
    }

    let stats = link.stats();
    info!(
        "Link stats: {} connects, {} disconnects, {} reconnect attempts",
        stats.connects, stats.disconnects, stats.reconnect_attempts
    );
    link.deinit()?;
    Ok(())
}

/// Stand-in for the services that follow the link: start on CONNECTED,
/// stop on DISCONNECTED, report OTA progress.
fn spawn_service_watcher(events: Receiver<BusMessage>) -> Result<()> {
    thread::Builder::new()
        .name("service-watcher".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            for msg in events {
                match msg.event {
                    Event::Connected => info!("Link up, starting network services"),
                    Event::Disconnected => info!("Link down, stopping network services"),
                    Event::OtaRead => {
                        if let Some(read) = msg.bytes_read() {
                            log::debug!("OTA read {} bytes", read);
                        }
                    }
                    Event::OtaFailed => {
                        log::warn!("OTA failed with status 0x{:x}", msg.status().unwrap_or(-1))
                    }
                    other => log::debug!("Event {}", other.as_str()),
                }
            }
        })?;
    Ok(())
}

#[cfg(feature = "esp-idf")]
fn make_driver() -> Result<Arc<dyn WifiDriver>> {
    use esp_idf_hal::prelude::Peripherals;
    use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let driver = wifi_ota::network::esp::EspWifiDriver::new(peripherals.modem, sys_loop, Some(nvs))?;
    Ok(Arc::new(driver))
}

#[cfg(not(feature = "esp-idf"))]
fn make_driver() -> Result<Arc<dyn WifiDriver>> {
    log::warn!("Host build: using loopback WiFi driver");
    Ok(Arc::new(wifi_ota::network::loopback::LoopbackDriver::new()))
}

#[cfg(feature = "esp-idf")]
fn make_transport() -> ota::esp::EspHttpsOta {
    ota::esp::EspHttpsOta::new()
}

#[cfg(not(feature = "esp-idf"))]
fn make_transport() -> ota::image::ImageTransport {
    ota::image::ImageTransport::new("wifi-ota-staged.bin")
}

#[cfg(feature = "esp-idf")]
fn restart() {
    // Give the log a moment to drain
    thread::sleep(std::time::Duration::from_millis(1000));
    unsafe { esp_idf_sys::esp_restart() };
}

#[cfg(not(feature = "esp-idf"))]
fn restart() {
    info!("Host build: restart skipped, image left in wifi-ota-staged.bin");
}
