// ESP-IDF station driver: EspWifi for bring-up, raw event handlers for callbacks

use core::ffi::c_void;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
    wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi},
};
use esp_idf_sys::EspError;

use crate::config::Credentials;
use crate::error::{Error, Result};

use super::driver::{DriverEvent, EventHandler, Subscription, WifiDriver};

fn esp_err(what: &str, e: EspError) -> Error {
    Error::transport(what, e.code())
}

struct Registration {
    handler: *mut EventHandler,
    wifi_instance: esp_idf_sys::esp_event_handler_instance_t,
    ip_instance: esp_idf_sys::esp_event_handler_instance_t,
}

pub struct EspWifiDriver {
    wifi: Mutex<EspWifi<'static>>,
    registrations: Mutex<HashMap<u32, Registration>>,
    next_subscription: AtomicU32,
}

// Raw handler pointers are only touched under the registrations lock and by
// the ESP-IDF event task, which serialises callbacks.
unsafe impl Send for EspWifiDriver {}
unsafe impl Sync for EspWifiDriver {}

impl EspWifiDriver {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
    ) -> anyhow::Result<Self> {
        log::info!("Initializing WiFi station driver");
        let wifi = EspWifi::new(modem, sys_loop, nvs)?;
        Ok(Self {
            wifi: Mutex::new(wifi),
            registrations: Mutex::new(HashMap::new()),
            next_subscription: AtomicU32::new(0),
        })
    }

    fn with_wifi<T>(&self, f: impl FnOnce(&mut EspWifi<'static>) -> T) -> T {
        let mut wifi = self.wifi.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut wifi)
    }
}

/// The boxed handler may only be freed once neither instance can call it.
fn handler_released(wifi_err: esp_idf_sys::esp_err_t, ip_err: esp_idf_sys::esp_err_t) -> bool {
    wifi_err == esp_idf_sys::ESP_OK && ip_err == esp_idf_sys::ESP_OK
}

unsafe extern "C" fn wifi_event_trampoline(
    arg: *mut c_void,
    event_base: esp_idf_sys::esp_event_base_t,
    event_id: i32,
    event_data: *mut c_void,
) {
    use esp_idf_sys::*;

    if arg.is_null() {
        return;
    }
    let handler = &*(arg as *const EventHandler);

    let event = if event_base == WIFI_EVENT {
        match event_id as u32 {
            wifi_event_t_WIFI_EVENT_STA_START => Some(DriverEvent::StaStarted),
            wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => {
                let reason = if event_data.is_null() {
                    0
                } else {
                    (*(event_data as *const wifi_event_sta_disconnected_t)).reason as u16
                };
                Some(DriverEvent::StaDisconnected { reason })
            }
            _ => None,
        }
    } else if event_base == IP_EVENT && event_id as u32 == ip_event_t_IP_EVENT_STA_GOT_IP {
        let ip = if event_data.is_null() {
            Ipv4Addr::UNSPECIFIED
        } else {
            let got_ip = &*(event_data as *const ip_event_got_ip_t);
            // esp_ip4_addr_t holds network byte order
            Ipv4Addr::from(got_ip.ip_info.ip.addr.to_le_bytes())
        };
        Some(DriverEvent::GotIp { ip })
    } else {
        None
    };

    if let Some(event) = event {
        handler(event);
    }
}

impl WifiDriver for EspWifiDriver {
    fn register_handler(&self, handler: EventHandler) -> Result<Subscription> {
        use esp_idf_sys::*;

        let boxed: *mut EventHandler = Box::into_raw(Box::new(handler));
        let mut wifi_instance: esp_event_handler_instance_t = core::ptr::null_mut();
        let mut ip_instance: esp_event_handler_instance_t = core::ptr::null_mut();

        let err = unsafe {
            esp_event_handler_instance_register(
                WIFI_EVENT,
                ESP_EVENT_ANY_ID,
                Some(wifi_event_trampoline),
                boxed as *mut c_void,
                &mut wifi_instance,
            )
        };
        if err != ESP_OK {
            unsafe { drop(Box::from_raw(boxed)) };
            return Err(Error::transport("register WIFI_EVENT handler", err));
        }

        let err = unsafe {
            esp_event_handler_instance_register(
                IP_EVENT,
                ESP_EVENT_ANY_ID,
                Some(wifi_event_trampoline),
                boxed as *mut c_void,
                &mut ip_instance,
            )
        };
        if err != ESP_OK {
            unsafe {
                esp_event_handler_instance_unregister(WIFI_EVENT, ESP_EVENT_ANY_ID, wifi_instance);
                drop(Box::from_raw(boxed));
            }
            return Err(Error::transport("register IP_EVENT handler", err));
        }

        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.registrations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                id,
                Registration {
                    handler: boxed,
                    wifi_instance,
                    ip_instance,
                },
            );
        Ok(Subscription(id))
    }

    fn unregister_handler(&self, subscription: Subscription) -> Result<()> {
        use esp_idf_sys::*;

        let registration = self
            .registrations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&subscription.0)
            .ok_or(Error::InvalidState("handler not registered"))?;

        let wifi_err = unsafe {
            esp_event_handler_instance_unregister(
                WIFI_EVENT,
                ESP_EVENT_ANY_ID,
                registration.wifi_instance,
            )
        };
        let ip_err = unsafe {
            esp_event_handler_instance_unregister(IP_EVENT, ESP_EVENT_ANY_ID, registration.ip_instance)
        };

        if !handler_released(wifi_err, ip_err) {
            // A live instance may still be handed this pointer
            log::error!(
                "wifi: handler {} left registered (0x{:x}/0x{:x}), leaking it",
                subscription.0,
                wifi_err,
                ip_err
            );
        } else {
            // Both instances are gone once unregister returns
            unsafe { drop(Box::from_raw(registration.handler)) };
        }

        if wifi_err != ESP_OK {
            return Err(Error::transport("unregister WIFI_EVENT handler", wifi_err));
        }
        if ip_err != ESP_OK {
            return Err(Error::transport("unregister IP_EVENT handler", ip_err));
        }
        Ok(())
    }

    fn configure(&self, credentials: &Credentials) -> Result<()> {
        let cfg = Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| Error::config("Invalid SSID format"))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| Error::config("Invalid password format"))?,
            auth_method: if credentials.is_open() {
                log::warn!("WiFi password is empty, using open network");
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });

        self.with_wifi(|wifi| wifi.set_configuration(&cfg))
            .map_err(|e| Error::config(format!("rejected station configuration: {}", e)))
    }

    fn start(&self) -> Result<()> {
        self.with_wifi(|wifi| wifi.start())
            .map_err(|e| esp_err("esp_wifi_start", e))
    }

    fn connect(&self) -> Result<()> {
        self.with_wifi(|wifi| wifi.connect())
            .map_err(|e| esp_err("esp_wifi_connect", e))
    }

    fn stop(&self) -> Result<()> {
        self.with_wifi(|wifi| wifi.stop())
            .map_err(|e| esp_err("esp_wifi_stop", e))
    }
}
