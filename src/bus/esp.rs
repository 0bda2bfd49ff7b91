// ESP-IDF event loop bus: posts WIFI_OTA_EVENTS to a user loop or the default loop

use core::ffi::c_void;
use esp_idf_sys::{
    esp_event_base_t, esp_event_loop_handle_t, esp_event_post, esp_event_post_to, ESP_OK,
};

use super::{Event, EventBus};

/// An `esp_event_base_t` that can live in a `static`.
#[repr(transparent)]
pub struct EventBase(esp_event_base_t);

// Only ever points at a 'static NUL-terminated string
unsafe impl Sync for EventBase {}

impl EventBase {
    pub const fn as_ptr(&self) -> esp_event_base_t {
        self.0
    }
}

/// Event base for lifecycle and OTA events. The loop matches bases by
/// pointer, so this is exported under the symbol C code reaches through
/// `ESP_EVENT_DECLARE_BASE(WIFI_OTA_EVENTS)`.
#[no_mangle]
pub static WIFI_OTA_EVENTS: EventBase = EventBase(c"WIFI_OTA_EVENTS".as_ptr());

const POST_TIMEOUT_TICKS: u32 = 10;

pub struct EspEventBus {
    event_loop: Option<esp_event_loop_handle_t>,
    base: esp_event_base_t,
}

// The loop handle is an opaque pointer owned by ESP-IDF; posting is thread-safe.
unsafe impl Send for EspEventBus {}
unsafe impl Sync for EspEventBus {}

impl EspEventBus {
    /// Post to the default system event loop.
    pub fn system() -> Self {
        Self {
            event_loop: None,
            base: WIFI_OTA_EVENTS.as_ptr(),
        }
    }

    /// Post to a user-created event loop.
    ///
    /// # Safety
    /// `handle` must stay valid for the lifetime of the bus.
    pub unsafe fn with_loop(handle: esp_event_loop_handle_t) -> Self {
        Self {
            event_loop: Some(handle),
            base: WIFI_OTA_EVENTS.as_ptr(),
        }
    }

    /// Post under a base defined by a C collaborator instead of ours.
    ///
    /// # Safety
    /// `base` must be the collaborator's `ESP_EVENT_DEFINE_BASE` symbol.
    pub unsafe fn with_base(mut self, base: esp_event_base_t) -> Self {
        self.base = base;
        self
    }
}

impl EventBus for EspEventBus {
    fn publish(&self, event: Event, payload: &[u8]) {
        let data = if payload.is_empty() {
            core::ptr::null()
        } else {
            payload.as_ptr() as *const c_void
        };

        let err = unsafe {
            match self.event_loop {
                Some(handle) => esp_event_post_to(
                    handle,
                    self.base,
                    event.id(),
                    data,
                    payload.len() as _,
                    POST_TIMEOUT_TICKS,
                ),
                None => esp_event_post(
                    self.base,
                    event.id(),
                    data,
                    payload.len() as _,
                    POST_TIMEOUT_TICKS,
                ),
            }
        };

        if err != ESP_OK {
            log::warn!("Failed to post {} to event loop: 0x{:x}", event.as_str(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ffi::CStr;

    #[test]
    fn test_default_base_is_the_exported_symbol() {
        let bus = EspEventBus::system();
        assert_eq!(bus.base, WIFI_OTA_EVENTS.as_ptr());
        let name = unsafe { CStr::from_ptr(WIFI_OTA_EVENTS.as_ptr()) };
        assert_eq!(name.to_str().ok(), Some("WIFI_OTA_EVENTS"));
    }
}
