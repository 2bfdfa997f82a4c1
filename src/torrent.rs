//! The driver of a download: the announce loop and the peer session pool.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::{
    sync::{Mutex, RwLock, Semaphore},
    task::JoinHandle,
    time,
};

use crate::{
    conf::Conf,
    error::Result,
    metainfo::Metainfo,
    peer::{self, PeerSession},
    piece_manager::PieceManager,
    tracker::Tracker,
};

/// How often the driver wakes up between announces to check for completion
/// and shutdown.
const TICK: Duration = Duration::from_secs(1);

/// An upper bound on the peer queue; trackers that send more peers per
/// announce than this just have the excess dropped.
const PEER_QUEUE_CAPACITY: usize = 512;

/// The queue of peer addresses received from the tracker.
///
/// The driver pushes into it on every announce (draining whatever the
/// previous announce left behind), while all peer sessions pop from it,
/// suspending while it is empty.
pub(crate) struct PeerQueue {
    peers: Mutex<VecDeque<SocketAddr>>,
    /// Carries one permit per queued peer, waking up a popping session
    /// whenever a peer is available.
    available: Semaphore,
}

impl PeerQueue {
    fn new() -> Self {
        Self {
            peers: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
        }
    }

    pub async fn push(&self, addr: SocketAddr) {
        let mut peers = self.peers.lock().await;
        if peers.len() >= PEER_QUEUE_CAPACITY {
            log::debug!("Peer queue full, dropping peer {}", addr);
            return;
        }
        peers.push_back(addr);
        self.available.add_permits(1);
    }

    pub async fn pop(&self) -> SocketAddr {
        loop {
            self.available.acquire().await.forget();
            if let Some(addr) = self.peers.lock().await.pop_front() {
                return addr;
            }
            // a drain consumed the peer between our permit and the lock, so
            // go back to waiting
        }
    }

    pub async fn drain(&self) {
        let mut peers = self.peers.lock().await;
        while let Ok(permit) = self.available.try_acquire() {
            permit.forget();
        }
        peers.clear();
    }
}

/// A handle for stopping a running download from another task, typically a
/// signal handler.
pub struct TorrentHandle {
    abort: Arc<AtomicBool>,
}

impl TorrentHandle {
    /// Asks the download to stop. The driver notices within a tick, shuts
    /// down every peer session and releases the output file.
    pub fn stop(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

/// A single torrent download: the piece manager, the tracker client and a
/// fixed pool of peer sessions, glued together by the announce loop.
pub struct Torrent {
    conf: Conf,
    metainfo: Metainfo,
    piece_manager: Arc<RwLock<PieceManager>>,
    tracker: Tracker,
    peer_queue: Arc<PeerQueue>,
    abort: Arc<AtomicBool>,
}

impl Torrent {
    /// Sets up the download: lays out the piece bookkeeping, opens the
    /// output file and creates the tracker client.
    pub fn new(metainfo: Metainfo, conf: Conf) -> Result<Self> {
        let piece_manager = PieceManager::new(&metainfo, &conf)?;
        let tracker = Tracker::new(
            &metainfo.announce,
            metainfo.info_hash,
            metainfo.total_size,
            conf.port,
        )?;
        Ok(Self {
            conf,
            metainfo,
            piece_manager: Arc::new(RwLock::new(piece_manager)),
            tracker,
            peer_queue: Arc::new(PeerQueue::new()),
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns a handle with which the download can be stopped.
    pub fn handle(&self) -> TorrentHandle {
        TorrentHandle {
            abort: Arc::clone(&self.abort),
        }
    }

    /// Runs the download until it completes, is stopped, or hits a fatal
    /// error. In every case the peer sessions are shut down and the output
    /// file is released before returning.
    pub async fn start(&mut self) -> Result<()> {
        log::info!(
            "Starting download of {} ({} bytes in {} pieces)",
            self.metainfo.name,
            self.metainfo.total_size,
            self.metainfo.piece_count()
        );

        let mut cmd_chans = Vec::with_capacity(self.conf.session_count);
        let mut sessions = Vec::with_capacity(self.conf.session_count);
        for _ in 0..self.conf.session_count {
            let (mut session, cmd_chan) = PeerSession::new(
                Arc::clone(&self.piece_manager),
                Arc::clone(&self.peer_queue),
                Arc::clone(&self.abort),
                self.metainfo.info_hash,
                self.tracker.peer_id(),
                self.metainfo.piece_count(),
            );
            cmd_chans.push(cmd_chan);
            sessions.push(tokio::spawn(async move { session.run().await }));
        }

        // The announce loop. The first announce carries the started event;
        // subsequent ones are spaced by the interval the tracker asks for.
        let mut last_announce: Option<Instant> = None;
        let mut interval = self.conf.announce_interval;
        loop {
            if self.piece_manager.read().await.complete() {
                log::info!("Torrent fully downloaded");
                break;
            }
            if self.abort.load(Ordering::SeqCst) {
                log::info!("Aborting download");
                break;
            }

            if last_announce.map_or(true, |at| at.elapsed() >= interval) {
                let first = last_announce.is_none();
                let (uploaded, downloaded) = {
                    let manager = self.piece_manager.read().await;
                    (manager.bytes_uploaded(), manager.bytes_downloaded())
                };
                match self.tracker.announce(first, uploaded, downloaded).await
                {
                    Ok(resp) => {
                        if resp.interval > 0 {
                            interval = Duration::from_secs(resp.interval);
                        }
                        log::info!(
                            "Tracker sent {} peers, next announce in {:?}",
                            resp.peers.len(),
                            interval
                        );
                        self.peer_queue.drain().await;
                        for addr in &resp.peers {
                            self.peer_queue.push(*addr).await;
                        }
                    }
                    // tracker problems don't stop the download, the
                    // announce is retried after the interval
                    Err(e) => log::warn!("Announce failed: {}", e),
                }
                last_announce = Some(Instant::now());
            } else {
                time::delay_for(TICK).await;
            }
        }

        self.shutdown(cmd_chans, sessions).await
    }

    /// Stops every peer session, waits for them to exit and releases the
    /// output file. Returns the first fatal session error, if any.
    async fn shutdown(
        &mut self,
        cmd_chans: Vec<peer::Sender>,
        sessions: Vec<JoinHandle<Result<()>>>,
    ) -> Result<()> {
        log::info!("Shutting down peer sessions");
        self.abort.store(true, Ordering::SeqCst);
        for cmd_chan in cmd_chans.iter() {
            // sessions that exited early have dropped their receiver
            let _ = cmd_chan.send(peer::Command::Shutdown);
        }

        let mut result = Ok(());
        for session in sessions {
            match session.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("Peer session failed: {}", e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => log::warn!("Peer session task panicked: {}", e),
            }
        }

        self.piece_manager.write().await.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 6881)
    }

    #[tokio::test]
    async fn test_peer_queue_fifo() {
        let queue = PeerQueue::new();
        queue.push(addr(1)).await;
        queue.push(addr(2)).await;

        assert_eq!(queue.pop().await, addr(1));
        assert_eq!(queue.pop().await, addr(2));
    }

    #[tokio::test]
    async fn test_peer_queue_drain() {
        let queue = PeerQueue::new();
        queue.push(addr(1)).await;
        queue.push(addr(2)).await;
        queue.drain().await;
        queue.push(addr(3)).await;

        // the drained peers are gone; only the new one is handed out
        assert_eq!(queue.pop().await, addr(3));
    }

    #[tokio::test]
    async fn test_peer_queue_wakes_up_waiting_popper() {
        let queue = Arc::new(PeerQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        // give the popper a chance to park on the empty queue
        time::delay_for(Duration::from_millis(10)).await;
        queue.push(addr(9)).await;
        assert_eq!(popper.await.unwrap(), addr(9));
    }
}
