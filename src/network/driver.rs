// Station-mode WiFi driver seam.
//
// The state machine never talks to the radio directly: it registers one
// handler and issues start/connect/stop through this trait. Handlers run on
// the driver's own callback context and must be delivered in order.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::config::Credentials;
use crate::error::Result;

/// Driver-level events the state machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// Station interface is up; a link attempt may begin
    StaStarted,
    /// Association lost or attempt failed, with the 802.11 reason code
    StaDisconnected { reason: u16 },
    /// DHCP lease obtained
    GotIp { ip: Ipv4Addr },
}

pub type EventHandler = Arc<dyn Fn(DriverEvent) + Send + Sync>;

/// Token identifying one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(pub u32);

pub trait WifiDriver: Send + Sync {
    fn register_handler(&self, handler: EventHandler) -> Result<Subscription>;

    fn unregister_handler(&self, subscription: Subscription) -> Result<()>;

    /// Store station credentials; takes effect on the next `connect`.
    fn configure(&self, credentials: &Credentials) -> Result<()>;

    /// Bring the station interface up. Raises `StaStarted` once running.
    fn start(&self) -> Result<()>;

    /// Begin one association attempt. Outcome arrives as an event.
    fn connect(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;
}
