//! # Introduction
//!
//! Library powering the pinball controller provisioning tool: discover boards over USB,
//! drive them through a raw-REPL transport, verify and transfer a signed application
//! bundle, and orchestrate a whole batch through bootloader → firmware → application flash.
//!
//! # Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//!
//! let raw = std::fs::read("update.bundle").unwrap();
//! let bundle = pinprov_core::bundle::Bundle::load(&raw).unwrap();
//!
//! let request = pinprov_core::convergence::ProvisionRequest {
//!     firmware: PathBuf::from("uf2/firmware.uf2"),
//!     nuke: PathBuf::from("uf2/nuke.uf2"),
//!     bundle,
//!     skip_firmware: false,
//!     once: true,
//! };
//!
//! pinprov_core::convergence::run(&request, None).unwrap();
//! ```

pub mod board;
pub mod bundle;
pub mod convergence;
pub mod discovery;
pub mod error;
pub mod pipeline;
pub mod transport;
pub mod uf2;
pub mod wait;

pub use error::Error;
