//! Per piece bookkeeping of the blocks being downloaded.

use sha1::{Digest, Sha1};

use crate::{block_count, block_len, BlockInfo, PieceIndex, Sha1Hash};

/// The download state of a single block within a piece.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BlockStatus {
    /// The block has not been requested from any peer yet.
    Missing,
    /// The block has been requested and we are waiting for its data.
    Pending,
    /// The block's data has arrived.
    Retrieved,
}

/// A block of a piece and, once retrieved, its data.
#[derive(Debug)]
pub(crate) struct Block {
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub len: u32,
    pub status: BlockStatus,
    /// Set if and only if the status is `Retrieved`.
    pub data: Option<Vec<u8>>,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_index: self.piece_index,
            offset: self.offset,
            len: self.len,
        }
    }
}

/// A piece of the torrent and the state of its blocks.
///
/// Blocks are laid out once, at construction, ordered by their offset and
/// covering the piece exactly; they are then mutated in place as the
/// download progresses.
#[derive(Debug)]
pub(crate) struct Piece {
    /// The index of the piece within the torrent.
    pub index: PieceIndex,
    /// The expected hash of the piece's data, from the metainfo.
    pub expected_hash: Sha1Hash,
    /// The piece's blocks, ordered by offset.
    pub blocks: Vec<Block>,
}

impl Piece {
    /// Creates the block layout for a piece of the given length.
    pub fn new(index: PieceIndex, len: u32, expected_hash: Sha1Hash) -> Self {
        let blocks = (0..block_count(len))
            .map(|block_index| Block {
                piece_index: index,
                offset: block_index as u32 * crate::BLOCK_LEN,
                len: block_len(len, block_index),
                status: BlockStatus::Missing,
                data: None,
            })
            .collect();
        Self {
            index,
            expected_hash,
            blocks,
        }
    }

    /// The length of the piece, in bytes.
    pub fn len(&self) -> u32 {
        self.blocks.iter().map(|b| b.len).sum()
    }

    /// Marks the first missing block as pending and returns it, if the piece
    /// has any block left that hasn't been requested.
    pub fn next_missing_block(&mut self) -> Option<BlockInfo> {
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.status == BlockStatus::Missing)?;
        block.status = BlockStatus::Pending;
        Some(block.info())
    }

    /// Records the data of the block at the given offset. Data for an offset
    /// that doesn't match any block is dropped.
    pub fn block_received(&mut self, offset: u32, data: Vec<u8>) {
        match self.blocks.iter_mut().find(|b| b.offset == offset) {
            Some(block) => {
                block.status = BlockStatus::Retrieved;
                block.data = Some(data);
            }
            None => {
                log::warn!(
                    "Piece {} has no block at offset {}",
                    self.index,
                    offset
                );
            }
        }
    }

    /// Returns true if all of the piece's blocks have been retrieved.
    pub fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.status == BlockStatus::Retrieved)
    }

    /// Calculates the piece's hash from its blocks and returns whether it
    /// matches the expected hash. Only valid once the piece is complete.
    pub fn matches_hash(&self) -> bool {
        debug_assert!(self.is_complete());
        let mut hasher = Sha1::new();
        for block in self.blocks.iter() {
            if let Some(data) = &block.data {
                hasher.update(data);
            }
        }
        let hash = hasher.finalize();
        hash.as_slice() == self.expected_hash
    }

    /// Returns every block to the missing state, dropping any downloaded
    /// data. Used when the piece's hash didn't match and the piece has to be
    /// downloaded again from scratch.
    pub fn reset(&mut self) {
        for block in self.blocks.iter_mut() {
            block.status = BlockStatus::Missing;
            block.data = None;
        }
    }

    /// Drops the block buffers but keeps the piece's metadata. Used after
    /// the piece has been verified and written to disk.
    pub fn release_data(&mut self) {
        for block in self.blocks.iter_mut() {
            block.data = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sha1::{Digest, Sha1};

    use super::*;
    use crate::BLOCK_LEN;

    #[test]
    fn test_block_layout() {
        // an uneven piece: two full blocks and a 100 byte tail
        let piece = Piece::new(3, 2 * BLOCK_LEN + 100, [0; 20]);
        assert_eq!(piece.blocks.len(), 3);
        assert_eq!(piece.len(), 2 * BLOCK_LEN + 100);

        let offsets: Vec<_> = piece.blocks.iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, BLOCK_LEN, 2 * BLOCK_LEN]);
        assert_eq!(piece.blocks[2].len, 100);
        assert!(piece.blocks.iter().all(|b| b.piece_index == 3));
    }

    #[test]
    fn test_next_missing_block() {
        let mut piece = Piece::new(0, 2 * BLOCK_LEN, [0; 20]);

        let first = piece.next_missing_block().unwrap();
        assert_eq!(first.offset, 0);
        let second = piece.next_missing_block().unwrap();
        assert_eq!(second.offset, BLOCK_LEN);
        // both blocks are pending now, so there is nothing left to hand out
        assert_eq!(piece.next_missing_block(), None);
    }

    #[test]
    fn test_block_received_completes_piece() {
        let mut piece = Piece::new(0, 2 * BLOCK_LEN, [0; 20]);
        assert!(!piece.is_complete());

        piece.block_received(0, vec![1; BLOCK_LEN as usize]);
        assert!(!piece.is_complete());
        piece.block_received(BLOCK_LEN, vec![2; BLOCK_LEN as usize]);
        assert!(piece.is_complete());
    }

    #[test]
    fn test_block_received_unknown_offset_ignored() {
        let mut piece = Piece::new(0, BLOCK_LEN, [0; 20]);
        piece.block_received(7, vec![1, 2, 3]);
        assert!(!piece.is_complete());
        assert_eq!(piece.blocks[0].status, BlockStatus::Missing);
    }

    #[test]
    fn test_hash_verification() {
        let data_a = vec![0xaa; BLOCK_LEN as usize];
        let data_b = vec![0xbb; 50];
        let mut hasher = Sha1::new();
        hasher.update(&data_a);
        hasher.update(&data_b);
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(&hasher.finalize());

        let mut piece = Piece::new(0, BLOCK_LEN + 50, expected_hash);
        piece.block_received(0, data_a);
        piece.block_received(BLOCK_LEN, data_b);
        assert!(piece.matches_hash());

        // corrupt data fails the check
        let mut piece = Piece::new(0, BLOCK_LEN + 50, expected_hash);
        piece.block_received(0, vec![0xcc; BLOCK_LEN as usize]);
        piece.block_received(BLOCK_LEN, vec![0xbb; 50]);
        assert!(!piece.matches_hash());
    }

    #[test]
    fn test_reset() {
        let mut piece = Piece::new(0, 2 * BLOCK_LEN, [0; 20]);
        piece.next_missing_block();
        piece.block_received(BLOCK_LEN, vec![1; BLOCK_LEN as usize]);

        piece.reset();
        assert!(piece
            .blocks
            .iter()
            .all(|b| b.status == BlockStatus::Missing && b.data.is_none()));
        // after a reset the first block is handed out again
        assert_eq!(piece.next_missing_block().unwrap().offset, 0);
    }
}
