//! UF2 image handling: locating bundled images and copying one onto a bootloader volume.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};

/// List `.uf2` files directly under `dir` (the bundled `uf2/` directory shipped alongside
/// the binary, or an extraction directory provided by a packer at runtime).
pub fn list_bundled(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("cannot read uf2 directory {}: {e}", dir.display())))?;

    let mut images: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("uf2")))
        .collect();
    images.sort();
    Ok(images)
}

/// The wipe image is any bundled file whose name contains `nuke` (case-insensitive).
pub fn find_nuke_image(dir: &Path) -> Result<PathBuf> {
    list_bundled(dir)?
        .into_iter()
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.to_lowercase().contains("nuke"))
        })
        .ok_or_else(|| Error::Config(format!("no *nuke*.uf2 image found under {}", dir.display())))
}

/// Copy `image` onto `volume`'s root, then best-effort flush the write before the OS
/// re-enumerates the device (a UF2 bootloader typically disconnects the instant it is
/// satisfied the file is fully written).
pub fn copy_to_volume(image: &Path, volume: &Path) -> Result<()> {
    let file_name = image
        .file_name()
        .ok_or_else(|| Error::Config(format!("uf2 image path has no file name: {}", image.display())))?;
    let dest = volume.join(file_name);

    info!(image = %image.display(), volume = %volume.display(), "copying uf2 image");
    std::fs::copy(image, &dest)
        .map_err(|e| Error::Config(format!("failed to copy {} to {}: {e}", image.display(), dest.display())))?;

    if let Ok(f) = std::fs::File::open(&dest) {
        let _ = f.sync_all();
    }

    Ok(())
}
