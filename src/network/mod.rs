pub mod connection;
pub mod driver;
pub mod loopback;
pub mod signal;
pub mod stats;
pub mod supervisor;

#[cfg(feature = "esp-idf")]
pub mod esp;

pub use connection::{Connection, ConnectionState};
pub use driver::{DriverEvent, EventHandler, Subscription, WifiDriver};
pub use signal::CancelToken;
pub use stats::LinkStatsSnapshot;
pub use supervisor::SupervisorOutcome;
