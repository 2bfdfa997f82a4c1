//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

/// The prefix of the Azureus style peer id we announce with. The rest of the
/// id is filled with random ASCII digits, once, when the tracker client is
/// constructed.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-PC0001-";

/// The global configuration of a torrent download.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The directory in which the torrent's file is placed upon download.
    pub output_dir: PathBuf,

    /// The number of peer sessions kept running for the duration of the
    /// download. Each session cycles through peers from the shared queue.
    pub session_count: usize,

    /// The port we report to the tracker. We never accept inbound
    /// connections, so nothing actually listens on it.
    pub port: u16,

    /// A block request that has been outstanding for longer than this is
    /// handed out again by the piece manager, to whichever peer asks next.
    pub request_timeout: Duration,

    /// If the tracker doesn't provide an announce interval, we fall back to
    /// announcing every 30 minutes.
    pub announce_interval: Duration,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// output directory, as it is not sensible to guess that for the user.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            session_count: 40,
            port: 6889,
            request_timeout: Duration::from_secs(300),
            announce_interval: Duration::from_secs(30 * 60),
        }
    }
}
