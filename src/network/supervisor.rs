// Connection supervisor: keeps logging and bookkeeping off the driver callback.
//
// Consumes the latched connected/done/failed bits. Exits on done, failed or
// cancellation; its outcome is collected when `deinit` joins it.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::connection::ConnectionContext;
use super::signal::{Bits, Wake};

const SUPERVISOR_STACK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    Failed,
    Done,
    Cancelled,
}

pub(crate) fn spawn(ctx: Arc<ConnectionContext>) -> io::Result<JoinHandle<SupervisorOutcome>> {
    thread::Builder::new()
        .name("wifi-supervisor".to_string())
        .stack_size(SUPERVISOR_STACK_SIZE)
        .spawn(move || run(&ctx))
}

pub(crate) fn run(ctx: &ConnectionContext) -> SupervisorOutcome {
    log::debug!("wifi supervisor started");

    loop {
        let bits = match ctx
            .signals
            .wait_latched(Bits::CONNECTED | Bits::DONE | Bits::FAILED, None)
        {
            Wake::Bits(bits) => bits,
            Wake::Cancelled => {
                log::warn!("wifi supervisor: CANCELLED");
                return SupervisorOutcome::Cancelled;
            }
            // No deadline was given
            Wake::TimedOut => continue,
        };

        if bits.contains(Bits::CONNECTED) {
            let stats = ctx.stats.snapshot();
            log::info!(
                "wifi supervisor: CONNECTED (connects={}, disconnects={}, retries left={})",
                stats.connects,
                stats.disconnects,
                ctx.remaining_retries()
            );
        }
        if bits.contains(Bits::DONE) {
            log::warn!("wifi supervisor: DONE");
            return SupervisorOutcome::Done;
        }
        if bits.contains(Bits::FAILED) {
            let stats = ctx.stats.snapshot();
            log::error!(
                "wifi supervisor: FAILED after {} disconnects (last reason {})",
                stats.disconnects,
                stats.last_reason
            );
            if ctx.announce_link_down() {
                log::info!("wifi supervisor: announced DISCONNECTED to collaborators");
            }
            return SupervisorOutcome::Failed;
        }
    }
}
