//! The per-cycle provisioning pipeline: coerce every connected board through
//! bootloader → nuke → firmware → application-transfer → restart.

use std::path::Path;
use std::time::Duration;

use futures::channel::mpsc;
use tracing::{info, warn};

use crate::board::{self, BoardController};
use crate::bundle::Bundle;
use crate::discovery::FleetSnapshot;
use crate::error::{Error, Result};
use crate::uf2;
use crate::wait::wait_for;

const BOOTLOADER_TIMEOUT: Duration = Duration::from_secs(60);
const NUKE_REBOOT_TIMEOUT: Duration = Duration::from_secs(60);
const FIRMWARE_BOOT_TIMEOUT: Duration = Duration::from_secs(60);
const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Coarse stage of a provisioning cycle, reported independently of per-board [`board::Status`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stage {
    CoercingToBootloader,
    Wiping,
    FlashingFirmware,
    FlashingApplication,
}

pub(crate) fn chan_send(chan: Option<&mut mpsc::Sender<Stage>>, msg: Stage) {
    if let Some(c) = chan {
        let _ = c.try_send(msg);
    }
}

/// Run one full provisioning cycle over every board currently visible in either identity.
///
/// `firmware` and `nuke` are paths to `.uf2` images; `bundle` is a signature-verified set of
/// application files. Boards that fail transfer abort individually (their error is logged)
/// without aborting the rest of the batch, except for a bundle that already failed
/// verification, fleet-level timeouts, and interrupts, which abort the whole cycle.
pub fn provision(
    firmware: &Path,
    nuke: &Path,
    bundle: &Bundle,
    skip_firmware: bool,
    mut chan: Option<mpsc::Sender<Stage>>,
) -> Result<()> {
    let s0 = FleetSnapshot::take();
    if s0.is_empty() {
        return Err(Error::DiscoveryTimeout("no boards connected".to_string()));
    }

    if skip_firmware {
        chan_send(chan.as_mut(), Stage::FlashingApplication);
        return apply_bundle_to_runtime(&s0, bundle);
    }

    chan_send(chan.as_mut(), Stage::CoercingToBootloader);
    let target_bootloader_count = s0.bootloader.len() + s0.runtime.len();
    for port in &s0.runtime {
        match BoardController::connect(port) {
            Ok(ctrl) => ctrl.enter_bootloader(),
            Err(e) => warn!(port, error = %e, "could not connect to enter bootloader"),
        }
    }
    wait_for(BOOTLOADER_TIMEOUT, || {
        FleetSnapshot::take().bootloader.len() >= target_bootloader_count
    })?;

    chan_send(chan.as_mut(), Stage::Wiping);
    let pre_nuke = FleetSnapshot::take();
    for volume in &pre_nuke.bootloader {
        if let Err(e) = uf2::copy_to_volume(nuke, volume) {
            warn!(volume = %volume.display(), error = %e, "failed to copy nuke image");
        }
    }
    std::thread::sleep(SETTLE_DELAY);
    // The volume must actually disappear (board rebooting to consume the image) before we
    // start waiting for it to come back; otherwise the recovery check is trivially true the
    // instant it's first polled, racing ahead into firmware-flash before the nuke took.
    wait_for(NUKE_REBOOT_TIMEOUT, || {
        FleetSnapshot::take().bootloader.len() < pre_nuke.bootloader.len()
    })?;
    wait_for(NUKE_REBOOT_TIMEOUT, || {
        FleetSnapshot::take().bootloader.len() >= pre_nuke.bootloader.len()
    })?;

    chan_send(chan.as_mut(), Stage::FlashingFirmware);
    let post_nuke = FleetSnapshot::take();
    for volume in &post_nuke.bootloader {
        if let Err(e) = uf2::copy_to_volume(firmware, volume) {
            warn!(volume = %volume.display(), error = %e, "failed to copy firmware image");
        }
    }
    std::thread::sleep(SETTLE_DELAY);
    let target_runtime_count = post_nuke.bootloader.len();
    wait_for(FIRMWARE_BOOT_TIMEOUT, || {
        FleetSnapshot::take().runtime.len() >= target_runtime_count
    })?;

    chan_send(chan.as_mut(), Stage::FlashingApplication);
    let post_firmware = FleetSnapshot::take();
    apply_bundle_to_runtime(&post_firmware, bundle)
}

/// Transfer `bundle` to every runtime port in `snapshot`. A board that fails aborts only
/// itself; the whole cycle fails only if every board in the snapshot failed.
fn apply_bundle_to_runtime(snapshot: &FleetSnapshot, bundle: &Bundle) -> Result<()> {
    let mut failures = Vec::new();
    for port in &snapshot.runtime {
        match transfer_one_board(port, bundle) {
            Ok(()) => info!(port, "board provisioned"),
            Err(e) => {
                warn!(port, error = %e, "failed to provision board, continuing with the rest of the batch");
                failures.push(port.clone());
            }
        }
    }

    if failures.len() == snapshot.runtime.len() && !snapshot.runtime.is_empty() {
        return Err(Error::Verify(failures));
    }

    Ok(())
}

fn transfer_one_board(port: &str, bundle: &Bundle) -> Result<()> {
    let ctrl = BoardController::connect(port)?;
    ctrl.transfer(&bundle.files, None::<mpsc::Sender<board::Status>>)?;
    ctrl.restart();
    Ok(())
}
