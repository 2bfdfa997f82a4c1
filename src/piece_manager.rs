//! The shared coordinator of the download.
//!
//! The piece manager tracks which pieces are missing, being downloaded, or
//! done, decides which block a peer session should request next, verifies
//! completed pieces, and writes them to the output file.

use std::{
    collections::HashMap,
    io,
    time::{Duration, Instant},
};

use crate::{
    conf::Conf,
    disk::TorrentFile,
    download::Piece,
    error::{Error, Result},
    metainfo::Metainfo,
    Bitfield, BlockInfo, PeerId, PieceIndex,
};

/// A block request handed out to some peer, and when it was last issued.
#[derive(Debug)]
struct PendingRequest {
    block: BlockInfo,
    issued_at: Instant,
}

/// Tracks the download state of every piece across all peer sessions.
///
/// Every piece is in exactly one of three stages: `missing` (no block
/// requested yet), `ongoing` (at least one block requested), or `have`
/// (downloaded, verified and written to disk). None of the operations
/// suspend, so when the manager is shared behind an async lock each
/// operation is one atomic step.
pub(crate) struct PieceManager {
    piece_len: u32,
    total_pieces: usize,
    missing: Vec<Piece>,
    ongoing: Vec<Piece>,
    have: Vec<Piece>,
    /// The outstanding block requests, oldest first. A request that has
    /// been pending for longer than `request_timeout` is handed out again.
    pending: Vec<PendingRequest>,
    /// The bitfield each known peer has announced.
    peers: HashMap<PeerId, Bitfield>,
    request_timeout: Duration,
    /// The output file; `None` once the manager has been closed.
    file: Option<TorrentFile>,
}

impl PieceManager {
    /// Lays out the blocks of every piece and opens the output file in the
    /// configured directory, named after the torrent.
    pub fn new(metainfo: &Metainfo, conf: &Conf) -> Result<Self> {
        let piece_len = metainfo.piece_len;
        let total_pieces = metainfo.piece_count();
        let last_piece_len = (metainfo.total_size
            - piece_len as u64 * (total_pieces - 1) as u64)
            as u32;

        let missing = (0..total_pieces)
            .map(|index| {
                let len = if index == total_pieces - 1 {
                    last_piece_len
                } else {
                    piece_len
                };
                Piece::new(index, len, metainfo.piece_hash(index))
            })
            .collect();

        let file = TorrentFile::open(conf.output_dir.join(&metainfo.name))
            .map_err(Error::Disk)?;

        Ok(Self {
            piece_len,
            total_pieces,
            missing,
            ongoing: Vec::new(),
            have: Vec::new(),
            pending: Vec::new(),
            peers: HashMap::new(),
            request_timeout: conf.request_timeout,
            file: Some(file),
        })
    }

    /// Records (or overwrites) the pieces a peer has.
    pub fn add_peer(&mut self, peer_id: PeerId, mut bitfield: Bitfield) {
        // the wire bitfield is padded to a byte boundary
        bitfield.resize(self.total_pieces, false);
        self.peers.insert(peer_id, bitfield);
    }

    /// Marks a single piece as available from the peer, after a have
    /// message. A no-op if the peer hasn't announced a bitfield before.
    pub fn update_peer(&mut self, peer_id: &PeerId, piece_index: PieceIndex) {
        if let Some(bitfield) = self.peers.get_mut(peer_id) {
            if piece_index < bitfield.len() {
                bitfield.set(piece_index, true);
            } else {
                log::warn!("Peer announced invalid piece {}", piece_index);
            }
        }
    }

    /// Forgets the peer's piece availability, after its session ended.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    /// Picks the block the peer session should request next, or `None` if
    /// the peer has nothing we currently need.
    ///
    /// Expired requests take precedence, so that blocks assigned to stalled
    /// or vanished peers get a second chance. Then partially downloaded
    /// pieces are continued, to keep the number of in-progress pieces low,
    /// and only after that is a new piece started, rarest first.
    pub fn next_request(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        if !self.peers.contains_key(peer_id) {
            return None;
        }
        if let Some(block) = self.expired_request(peer_id) {
            return Some(block);
        }
        if let Some(block) = self.next_ongoing(peer_id) {
            return Some(block);
        }
        self.start_rarest(peer_id)
    }

    /// Hands in a block received from a peer.
    ///
    /// If this was the last missing block of its piece, the piece is hash
    /// checked: a valid piece is written to the output file at its offset
    /// and recorded as done, while a corrupt piece is reset wholesale and
    /// returned to the missing stage to be downloaded from scratch.
    pub fn block_received(
        &mut self,
        peer_id: &PeerId,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!(
            "Received block at offset {} of piece {} from peer {}",
            offset,
            piece_index,
            String::from_utf8_lossy(peer_id)
        );

        if let Some(pos) = self.pending.iter().position(|r| {
            r.block.piece_index == piece_index && r.block.offset == offset
        }) {
            self.pending.remove(pos);
        }

        let pos = match self
            .ongoing
            .iter()
            .position(|piece| piece.index == piece_index)
        {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Received block for piece {} that is not ongoing",
                    piece_index
                );
                return Ok(());
            }
        };

        self.ongoing[pos].block_received(offset, data);
        if !self.ongoing[pos].is_complete() {
            return Ok(());
        }

        if self.ongoing[pos].matches_hash() {
            // write before taking the piece out of its stage, so that a
            // disk error doesn't lose track of the piece
            self.write(&self.ongoing[pos])?;
            let mut piece = self.ongoing.remove(pos);
            piece.release_data();
            self.have.push(piece);
            log::info!(
                "{} / {} pieces downloaded ({:.3} %)",
                self.have.len(),
                self.total_pieces,
                self.have.len() as f64 * 100.0 / self.total_pieces as f64
            );
        } else {
            let mut piece = self.ongoing.remove(pos);
            log::warn!("Discarding: {}", Error::PieceHashMismatch(piece.index));
            piece.reset();
            self.missing.push(piece);
        }

        Ok(())
    }

    /// The approximate number of downloaded bytes. The last piece may be
    /// shorter than the nominal piece length, which this ignores.
    pub fn bytes_downloaded(&self) -> u64 {
        self.have.len() as u64 * self.piece_len as u64
    }

    /// The number of uploaded bytes, which for a pure leecher is zero.
    pub fn bytes_uploaded(&self) -> u64 {
        0
    }

    /// Returns true once every piece has been downloaded and verified.
    pub fn complete(&self) -> bool {
        self.have.len() == self.total_pieces
    }

    /// Releases the output file handle. Subsequent piece writes fail.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            log::debug!("Closed output file");
        }
    }

    /// Returns the first request that has been pending for longer than the
    /// request timeout, for a piece this peer has, refreshing its
    /// timestamp.
    fn expired_request(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let bitfield = self.peers.get(peer_id)?;
        let now = Instant::now();
        for request in self.pending.iter_mut() {
            if bitfield[request.block.piece_index]
                && now.duration_since(request.issued_at) > self.request_timeout
            {
                log::info!(
                    "Re-requesting block at offset {} of piece {}",
                    request.block.offset,
                    request.block.piece_index
                );
                request.issued_at = now;
                return Some(request.block);
            }
        }
        None
    }

    /// Continues a piece that already has requested blocks, if the peer has
    /// it and the piece has blocks left to request.
    fn next_ongoing(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let bitfield = self.peers.get(peer_id)?;
        for piece in self.ongoing.iter_mut() {
            if !bitfield[piece.index] {
                continue;
            }
            if let Some(block) = piece.next_missing_block() {
                self.pending.push(PendingRequest {
                    block,
                    issued_at: Instant::now(),
                });
                return Some(block);
            }
        }
        None
    }

    /// Starts downloading the piece that, among those the peer has, is held
    /// by the fewest known peers. Ties go to the piece that has been
    /// missing the longest.
    fn start_rarest(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let bitfield = self.peers.get(peer_id)?;
        let mut rarest: Option<(usize, usize)> = None;
        for (pos, piece) in self.missing.iter().enumerate() {
            if !bitfield[piece.index] {
                continue;
            }
            let holders = self
                .peers
                .values()
                .filter(|peer_pieces| peer_pieces[piece.index])
                .count();
            match rarest {
                Some((_, fewest)) if holders >= fewest => {}
                _ => rarest = Some((pos, holders)),
            }
        }

        let (pos, _) = rarest?;
        let mut piece = self.missing.remove(pos);
        log::debug!("Starting piece {}", piece.index);
        let block = piece.next_missing_block();
        // a missing piece by definition has all its blocks missing
        debug_assert!(block.is_some());
        if let Some(block) = block {
            self.pending.push(PendingRequest {
                block,
                issued_at: Instant::now(),
            });
        }
        self.ongoing.push(piece);
        block
    }

    /// Writes a verified piece to the output file at its torrent offset.
    fn write(&self, piece: &Piece) -> Result<()> {
        let file = self.file.as_ref().ok_or_else(|| {
            Error::Disk(io::Error::new(
                io::ErrorKind::Other,
                "output file is closed",
            ))
        })?;
        let blocks: Vec<&[u8]> =
            piece.blocks.iter().filter_map(|b| b.data.as_deref()).collect();
        debug_assert_eq!(blocks.len(), piece.blocks.len());
        log::debug!("Writing piece {} ({} bytes)", piece.index, piece.len());
        file.write_piece(piece.index as u64 * self.piece_len as u64, &blocks)
            .map_err(Error::Disk)
    }

    /// The indices in each of the three stages, for asserting on the state
    /// partition in tests.
    #[cfg(test)]
    fn stage_indices(&self) -> (Vec<PieceIndex>, Vec<PieceIndex>, Vec<PieceIndex>) {
        (
            self.missing.iter().map(|p| p.index).collect(),
            self.ongoing.iter().map(|p| p.index).collect(),
            self.have.iter().map(|p| p.index).collect(),
        )
    }
}
