use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Opt {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision every connected board: flash firmware, then transfer a signed application
    /// bundle. With no flags, prompts interactively for a firmware image and a bundle.
    Provision {
        /// Path to the firmware `.uf2` image. Defaults to the bundled `uf2/` directory.
        #[arg(long)]
        firmware: Option<PathBuf>,

        /// Path to the signed update bundle.
        #[arg(long)]
        software: Option<PathBuf>,

        /// Directory to search for bundled `.uf2` images (firmware and the wipe image).
        #[arg(long, default_value = "uf2")]
        uf2_dir: PathBuf,

        /// Skip the firmware reflash step; only transfer the application bundle.
        #[arg(long)]
        skip_firmware: bool,

        /// Exit after a single provisioning cycle instead of looping for more batches.
        #[arg(long)]
        once: bool,

        /// After one cycle, attach to the first board's stdout and stream it until Ctrl+C.
        #[arg(long)]
        listen_after: bool,

        /// Suppress progress bars.
        #[arg(long)]
        quiet: bool,
    },

    /// List runtime ports and bootloader volumes currently visible.
    ListDevices,

    /// Verify a bundle's signature and hashes without touching any hardware.
    VerifyBundle {
        /// Path to the update bundle to verify.
        path: PathBuf,
    },

    /// Generate shell completion script.
    GenerateCompletion {
        shell: clap_complete::Shell,
    },
}
