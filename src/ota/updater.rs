//! OTA update sequence.
//!
//! Runs to completion on the caller's thread:
//! 1. `begin`, no OTA_STARTED unless this succeeds
//! 2. OTA_STARTED
//! 3. image descriptor, then OTA_APP_DESC
//! 4. `perform` loop with one OTA_READ per in-progress step
//! 5. complete-data check, then `finish` (commit)
//! 6. exactly one of OTA_SUCCESS / OTA_FAILED, always last
//!
//! Nothing is retried; call `update` again to start over.

use crate::bus::{encode_status, encode_u32, Event, EventBus};
use crate::config::{ConnectionConfig, OtaConfig};
use crate::error::{Error, OtaStep, Result, STATUS_OK};

use super::descriptor::AppDescriptor;
use super::transport::{OtaSession, OtaTransport, Progress};

/// Run one update session, publishing on the connection config's bus.
pub fn update<T: OtaTransport>(
    config: &ConnectionConfig,
    ota: &OtaConfig,
    transport: &mut T,
) -> Result<AppDescriptor> {
    let bus = config.bus();
    run(bus.as_ref(), ota, transport)
}

/// Same as [`update`] with an explicit bus.
pub fn run<T: OtaTransport>(
    bus: &dyn EventBus,
    ota: &OtaConfig,
    transport: &mut T,
) -> Result<AppDescriptor> {
    log::info!("Starting OTA update from {}", ota.url);

    let result = session(bus, ota, transport);
    match &result {
        Ok(desc) => {
            log::info!(
                "OTA update complete: {} {}",
                desc.project_name(),
                desc.version()
            );
            bus.publish(Event::OtaSuccess, &encode_status(STATUS_OK));
        }
        Err(e) => {
            log::error!("OTA update failed: {}", e);
            bus.publish(Event::OtaFailed, &encode_status(e.code()));
        }
    }
    result
}

fn session<T: OtaTransport>(
    bus: &dyn EventBus,
    ota: &OtaConfig,
    transport: &mut T,
) -> Result<AppDescriptor> {
    ota.validate()?;

    let mut session = transport.begin(ota).map_err(|f| {
        log::error!("OTA begin failed: {}", f);
        f.into_begin_error()
    })?;
    bus.publish(Event::OtaStarted, &[]);

    match transfer(bus, &mut session) {
        Ok(desc) => {
            session
                .finish()
                .map_err(|f| {
                    log::error!("OTA commit failed: {}", f);
                    f.into_error(OtaStep::Commit)
                })
                .map(|_| desc)
        }
        Err(e) => {
            session.abort();
            Err(e)
        }
    }
}

fn transfer<S: OtaSession>(bus: &dyn EventBus, session: &mut S) -> Result<AppDescriptor> {
    let desc = session
        .image_descriptor()
        .map_err(|f| f.into_error(OtaStep::Descriptor))?;
    log::info!(
        "OTA image: {} version {} built {} {} (IDF {})",
        desc.project_name(),
        desc.version(),
        desc.build_date(),
        desc.build_time(),
        desc.idf_version()
    );
    bus.publish(Event::OtaAppDesc, desc.as_bytes());

    loop {
        match session.perform() {
            Ok(Progress::InProgress) => {
                let read = session.image_len_read();
                log::debug!("OTA progress: {} bytes", read);
                bus.publish(Event::OtaRead, &encode_u32(read));
            }
            Ok(Progress::Complete) => break,
            Err(f) => {
                log::error!("OTA transfer failed: {}", f);
                return Err(f.into_error(OtaStep::Transfer));
            }
        }
    }

    // Transports may report completion without having received everything
    if !session.is_complete_data_received() {
        log::error!(
            "OTA transfer ended after {} bytes without complete data",
            session.image_len_read()
        );
        return Err(Error::Protocol {
            step: OtaStep::IncompleteData,
            raw: session.image_len_read() as i32,
        });
    }

    Ok(desc)
}
