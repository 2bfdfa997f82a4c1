//! Parsing of `.torrent` metainfo files.

use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    PieceIndex, Sha1Hash,
};

/// The parsed and validated contents of a single file `.torrent`.
///
/// All fields are immutable after construction.
#[derive(Debug)]
pub struct Metainfo {
    /// The tracker's announce URL.
    pub announce: String,
    /// The name of the file the torrent downloads into.
    pub name: String,
    /// The nominal length of a piece. Only the last piece of the torrent may
    /// be shorter.
    pub piece_len: u32,
    /// The length of the downloaded file, in bytes.
    pub total_size: u64,
    /// The SHA-1 hash of the bencoded `info` dictionary, which uniquely
    /// identifies the torrent towards the tracker and peers.
    pub info_hash: Sha1Hash,
    /// The concatenation of all pieces' expected SHA-1 hashes.
    pieces: Vec<u8>,
}

impl Metainfo {
    /// Parses the raw contents of a `.torrent` file.
    ///
    /// Multi-file torrents (an `info` dictionary with a `files` key) are
    /// rejected.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: Raw = serde_bencode::from_bytes(buf)
            .map_err(|e| Error::InvalidMetainfo(e.to_string()))?;

        if raw.info.files.is_some() {
            return Err(Error::MultiFileTorrent);
        }
        let total_size = raw.info.length.ok_or_else(|| {
            Error::InvalidMetainfo("missing file length".into())
        })?;
        if total_size == 0 {
            return Err(Error::InvalidMetainfo("empty download".into()));
        }
        if raw.info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("zero piece length".into()));
        }
        if raw.info.pieces.is_empty() || raw.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(format!(
                "piece hashes are {} bytes, expected a multiple of 20",
                raw.info.pieces.len()
            )));
        }

        // the piece hashes must cover the download exactly
        let piece_len = raw.info.piece_length;
        let piece_count = raw.info.pieces.len() / 20;
        let expected_count =
            (total_size + piece_len as u64 - 1) / piece_len as u64;
        if piece_count as u64 != expected_count {
            return Err(Error::InvalidMetainfo(format!(
                "{} piece hashes for a {} byte download of {} byte pieces",
                piece_count, total_size, piece_len
            )));
        }

        // The info hash is the digest of the info dictionary exactly as it
        // appeared on the wire. Bencoded dictionary keys are required to be
        // sorted and serde_bencode emits them sorted, so re-encoding the
        // parsed dictionary reproduces the original bytes.
        let info = serde_bencode::to_bytes(&raw.info)
            .map_err(|e| Error::InvalidMetainfo(e.to_string()))?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);

        Ok(Self {
            announce: raw.announce,
            name: raw.info.name,
            piece_len,
            total_size,
            info_hash,
            pieces: raw.info.pieces,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Returns the expected hash of the piece at the index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.pieces[index * 20..index * 20 + 20]);
        hash
    }
}

#[derive(Debug, Deserialize)]
struct Raw {
    announce: String,
    info: Info,
}

#[derive(Debug, Serialize, Deserialize)]
struct Info {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    /// Present only in multi-file torrents, which we reject; the value is
    /// kept opaque as we never look inside it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<serde_bencode::value::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}
