//! The outermost loop: wait for a batch of boards, provision them, then wait for the
//! operator to unplug before starting the next batch (or stop after one cycle).

use std::time::Duration;

use futures::channel::mpsc;
use tracing::info;

use crate::bundle::Bundle;
use crate::discovery::FleetSnapshot;
use crate::error::Result;
use crate::pipeline::{self, Stage};
use crate::wait::wait_for;

const ARRIVAL_TIMEOUT: Duration = Duration::from_secs(3600);
const RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);
const DEPARTURE_TIMEOUT: Duration = Duration::from_secs(3600);

/// A single request describing what to flash; constructed by the CLI from parsed flags or
/// interactive picker output.
pub struct ProvisionRequest {
    pub firmware: std::path::PathBuf,
    pub nuke: std::path::PathBuf,
    pub bundle: Bundle,
    pub skip_firmware: bool,
    pub once: bool,
}

/// Run the convergence loop. Returns once a single cycle has completed (`once: true`) or
/// when the operator interrupts the process (returns `Ok(())`, matching the "interrupted
/// means clean exit" contract in the error taxonomy).
pub fn run(request: &ProvisionRequest, mut chan: Option<mpsc::Sender<Stage>>) -> Result<()> {
    loop {
        info!("waiting for boards to connect");
        let arrived = match wait_for(ARRIVAL_TIMEOUT, || !FleetSnapshot::take().is_empty()) {
            Ok(()) => FleetSnapshot::take(),
            Err(crate::error::Error::Interrupted) => return Ok(()),
            Err(e) => return Err(e),
        };
        let batch_size = arrived.device_count();

        match pipeline::provision(
            &request.firmware,
            &request.nuke,
            &request.bundle,
            request.skip_firmware,
            chan.clone(),
        ) {
            Ok(()) => info!("batch of {batch_size} board(s) provisioned"),
            Err(crate::error::Error::Interrupted) => return Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "provisioning cycle failed");
                if request.once {
                    return Err(e);
                }
                // Continuous mode keeps going: log the failure and let the operator
                // re-seat the batch, matching the original tool's "unplug everything,
                // wait, retry" recovery instruction.
            }
        }

        if request.once {
            return Ok(());
        }

        info!("waiting for boards to reconnect as runtime devices");
        match wait_for(RECONCILE_TIMEOUT, || {
            FleetSnapshot::take().runtime.len() >= batch_size
        }) {
            Ok(()) | Err(crate::error::Error::DiscoveryTimeout(_)) => {}
            Err(crate::error::Error::Interrupted) => return Ok(()),
            Err(e) => return Err(e),
        }

        info!("waiting for the batch to be unplugged");
        match wait_for(DEPARTURE_TIMEOUT, || FleetSnapshot::take().is_empty()) {
            Ok(()) | Err(crate::error::Error::DiscoveryTimeout(_)) => {}
            Err(crate::error::Error::Interrupted) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Attach to the first visible runtime board's stdout and stream it until interrupted.
pub fn listen_after() -> Result<()> {
    let snapshot = FleetSnapshot::take();
    let Some(port) = snapshot.runtime.into_iter().next() else {
        return Ok(());
    };

    let ctrl = crate::board::BoardController::connect(&port)?;
    ctrl.listen(&mut std::io::stdout())
}
