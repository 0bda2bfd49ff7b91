// esp_https_ota backed transport

use std::ffi::CString;

use esp_idf_sys::{
    esp_app_desc_t, esp_err_t, esp_http_client_config_t, esp_https_ota_abort,
    esp_https_ota_begin, esp_https_ota_config_t, esp_https_ota_finish,
    esp_https_ota_get_image_len_read, esp_https_ota_get_img_desc, esp_https_ota_handle_t,
    esp_https_ota_is_complete_data_received, esp_https_ota_perform, ESP_ERR_HTTPS_OTA_IN_PROGRESS,
    ESP_ERR_INVALID_ARG, ESP_ERR_NO_MEM, ESP_OK,
};

use crate::config::OtaConfig;

use super::descriptor::{AppDescriptor, APP_DESC_SIZE};
use super::transport::{Fault, FaultKind, OtaSession, OtaTransport, Progress};

fn fault(rc: esp_err_t, what: &str) -> Fault {
    let kind = if rc == ESP_ERR_INVALID_ARG as esp_err_t {
        FaultKind::Config
    } else if rc == ESP_ERR_NO_MEM as esp_err_t {
        FaultKind::NoMemory
    } else {
        FaultKind::Transport
    };
    Fault::new(kind, rc, what)
}

#[derive(Default)]
pub struct EspHttpsOta;

impl EspHttpsOta {
    pub fn new() -> Self {
        Self
    }
}

impl OtaTransport for EspHttpsOta {
    type Session = EspHttpsOtaSession;

    fn begin(&mut self, config: &OtaConfig) -> Result<EspHttpsOtaSession, Fault> {
        let url = CString::new(config.url.as_str())
            .map_err(|_| Fault::new(FaultKind::Config, -1, "URL contains NUL"))?;
        let pem = config
            .cert_pem
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|_| Fault::new(FaultKind::Config, -1, "certificate contains NUL"))?;

        let http_config = esp_http_client_config_t {
            url: url.as_ptr(),
            cert_pem: pem.as_ref().map_or(core::ptr::null(), |p| p.as_ptr()),
            timeout_ms: config.timeout.as_millis() as _,
            buffer_size: config.buffer_size as _,
            ..Default::default()
        };
        let ota_config = esp_https_ota_config_t {
            http_config: &http_config,
            ..Default::default()
        };

        let mut handle: esp_https_ota_handle_t = core::ptr::null_mut();
        let rc = unsafe { esp_https_ota_begin(&ota_config, &mut handle) };
        if rc != ESP_OK {
            return Err(fault(rc, "esp_https_ota_begin"));
        }

        Ok(EspHttpsOtaSession {
            handle,
            _url: url,
            _pem: pem,
        })
    }
}

pub struct EspHttpsOtaSession {
    handle: esp_https_ota_handle_t,
    // The HTTP client may keep pointing at these until the session ends
    _url: CString,
    _pem: Option<CString>,
}

impl OtaSession for EspHttpsOtaSession {
    fn image_descriptor(&mut self) -> Result<AppDescriptor, Fault> {
        let mut desc: esp_app_desc_t = unsafe { core::mem::zeroed() };
        let rc = unsafe { esp_https_ota_get_img_desc(self.handle, &mut desc) };
        if rc != ESP_OK {
            return Err(fault(rc, "esp_https_ota_get_img_desc"));
        }

        let raw = unsafe {
            core::slice::from_raw_parts(
                &desc as *const esp_app_desc_t as *const u8,
                core::mem::size_of::<esp_app_desc_t>().min(APP_DESC_SIZE),
            )
        };
        AppDescriptor::from_bytes(raw).map_err(|e| Fault::new(FaultKind::Protocol, e.code(), e.to_string()))
    }

    fn perform(&mut self) -> Result<Progress, Fault> {
        let rc = unsafe { esp_https_ota_perform(self.handle) };
        if rc == ESP_OK {
            Ok(Progress::Complete)
        } else if rc == ESP_ERR_HTTPS_OTA_IN_PROGRESS as esp_err_t {
            Ok(Progress::InProgress)
        } else {
            Err(fault(rc, "esp_https_ota_perform"))
        }
    }

    fn image_len_read(&self) -> u32 {
        let read = unsafe { esp_https_ota_get_image_len_read(self.handle) };
        read.max(0) as u32
    }

    fn is_complete_data_received(&self) -> bool {
        unsafe { esp_https_ota_is_complete_data_received(self.handle) }
    }

    fn finish(self) -> Result<(), Fault> {
        let rc = unsafe { esp_https_ota_finish(self.handle) };
        if rc != ESP_OK {
            return Err(fault(rc, "esp_https_ota_finish"));
        }
        Ok(())
    }

    fn abort(self) {
        let rc = unsafe { esp_https_ota_abort(self.handle) };
        if rc != ESP_OK {
            log::warn!("esp_https_ota_abort returned 0x{:x}", rc);
        }
    }
}
