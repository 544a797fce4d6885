//! Polling primitive shared by the provisioning pipeline and the convergence loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Mark the process as shutting down. Called from the Ctrl+C handler; any in-flight
/// [`wait_for`] call observes this on its next poll and returns [`Error::Interrupted`].
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Poll `predicate` every 500 ms until it returns true, `timeout` elapses, or a shutdown is
/// requested. Emits a progress dot to stderr per tick, wrapping every 5 dots with a space,
/// matching the operator-facing feedback of the tool this was modeled on.
pub fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut ticks: u32 = 0;

    loop {
        if predicate() {
            return Ok(());
        }

        if shutdown_requested() {
            return Err(Error::Interrupted);
        }

        if Instant::now() >= deadline {
            return Err(Error::DiscoveryTimeout(format!(
                "condition not met within {:.1}s",
                timeout.as_secs_f32()
            )));
        }

        ticks += 1;
        eprint!(".");
        if ticks % 5 == 0 {
            eprint!(" ");
        }
        debug!(ticks, "wait_for poll");

        std::thread::sleep(POLL_INTERVAL);
    }
}
