//! Error taxonomy shared across the provisioning pipeline.

use std::io;

use thiserror::Error;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by this crate. Display text is written for direct operator consumption.
#[derive(Error, Debug)]
pub enum Error {
    /// The bundle cannot be parsed: unknown format version, malformed line, truncated file.
    #[error("bundle is malformed: {0}")]
    Config(String),

    /// Bundle hash/signature verification failed. Must be treated as fatal before any board
    /// is touched.
    #[error("bundle failed signature verification: {0}")]
    Signature(String),

    /// A fleet-level wait (bootloader appearance, runtime reconnect, disconnect) exceeded its
    /// deadline.
    #[error("timed out waiting for boards: {0}")]
    DiscoveryTimeout(String),

    /// The serial channel was lost mid-command.
    #[error("lost connection to board on {port}: {source}")]
    Transport {
        port: String,
        #[source]
        source: io::Error,
    },

    /// The board's runtime raised an exception while executing a script.
    #[error("board reported an error: {0}")]
    Board(String),

    /// Post-transfer hash verification disagreed for one or more files.
    #[error("hash verification failed for: {0:?}")]
    Verify(Vec<String>),

    /// The operator requested a shutdown (signal); this is not a failure.
    #[error("interrupted")]
    Interrupted,
}
