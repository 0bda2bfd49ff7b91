// OTA (Over-The-Air) update module

pub mod descriptor;
pub mod image;
pub mod transport;
pub mod updater;

#[cfg(feature = "esp-idf")]
pub mod esp;

pub use descriptor::AppDescriptor;
pub use transport::{Fault, FaultKind, OtaSession, OtaTransport, Progress};
pub use updater::update;

// OTA update flow:
// 1. Open secured session (TLS against the configured trust anchor)
// 2. Read the app descriptor from the image header
// 3. Stream image to the passive OTA partition
// 4. Confirm complete data, then validate and set boot partition
// 5. Caller decides when to restart
