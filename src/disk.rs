//! Writing verified pieces to the output file.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::PathBuf,
};

use nix::sys::uio::{pwritev, IoVec};

/// The single output file of the download.
///
/// The file is opened read-write at construction, created if absent, and
/// pieces are written at their natural offset in whatever order they
/// complete.
#[derive(Debug)]
pub(crate) struct TorrentFile {
    path: PathBuf,
    handle: File,
}

impl TorrentFile {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        log::debug!("Opening output file {:?}", path);
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(Self { path, handle })
    }

    /// Writes the piece's blocks at the given byte offset in the file.
    ///
    /// The blocks are gathered into a single positional vectored write so
    /// they don't have to be copied into one contiguous buffer first. IO
    /// syscalls are not guaranteed to write the whole input in one go, so
    /// this loops until every byte has been written (or an error occurs).
    pub fn write_piece(
        &self,
        mut offset: u64,
        blocks: &[&[u8]],
    ) -> io::Result<()> {
        let mut remaining: Vec<&[u8]> =
            blocks.iter().copied().filter(|b| !b.is_empty()).collect();

        while !remaining.is_empty() {
            let iovecs: Vec<_> =
                remaining.iter().map(|b| IoVec::from_slice(b)).collect();
            let write_count =
                pwritev(self.handle.as_raw_fd(), &iovecs, offset as i64)
                    .map_err(|e| {
                        log::warn!("File {:?} write error: {}", self.path, e);
                        io::Error::new(io::ErrorKind::Other, e)
                    })?;
            if write_count == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "zero length write to output file",
                ));
            }
            offset += write_count as u64;

            // drop the buffers that were fully written and trim the first
            // partially written one
            let mut advance = write_count;
            while advance > 0 && !remaining.is_empty() {
                if advance >= remaining[0].len() {
                    advance -= remaining[0].len();
                    remaining.remove(0);
                } else {
                    remaining[0] = &remaining[0][advance..];
                    advance = 0;
                }
            }
        }

        Ok(())
    }
}
