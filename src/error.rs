//! Crate level error and result types.

use std::{fmt, io};

use crate::PieceIndex;

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// All errors that the torrent engine may produce.
///
/// Peer related errors (codec, handshake, connection) only abort the session
/// with the one peer; the session then moves on to the next peer in the
/// queue. Tracker errors are retried at the next announce. The remaining
/// variants are fatal for the whole download.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A peer message could not be decoded from or encoded to the wire.
    Codec(String),
    /// The peer's handshake was malformed or advertised a different info
    /// hash than ours.
    InvalidHandshake,
    /// A transient network error on a peer connection (refused, reset,
    /// timed out).
    Io(io::Error),
    /// The tracker could not be reached or reported a failure reason.
    Tracker(String),
    /// A fully downloaded piece did not match its expected SHA-1 hash. The
    /// piece is re-requested from scratch, so this never aborts a download.
    PieceHashMismatch(PieceIndex),
    /// The `.torrent` file could not be parsed or is internally
    /// inconsistent.
    InvalidMetainfo(String),
    /// The metainfo describes a multi-file torrent, which we don't support.
    MultiFileTorrent,
    /// Writing a verified piece to the output file failed. There is no way
    /// to make progress after this.
    Disk(io::Error),
}

impl Error {
    /// Whether the error only concerns a single peer connection. The peer
    /// session recovers from these by pulling the next peer from the queue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Codec(_) | Error::InvalidHandshake | Error::Io(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Codec(e) => write!(f, "codec error: {}", e),
            Error::InvalidHandshake => write!(f, "invalid peer handshake"),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Tracker(e) => write!(f, "tracker error: {}", e),
            Error::PieceHashMismatch(index) => {
                write!(f, "piece {} hash mismatch", index)
            }
            Error::InvalidMetainfo(e) => write!(f, "invalid metainfo: {}", e),
            Error::MultiFileTorrent => {
                write!(f, "multi-file torrents are not supported")
            }
            Error::Disk(e) => write!(f, "disk error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Tracker(e.to_string())
    }
}
