//! Peer sessions: the per peer state machine driving the download.

pub(crate) mod codec;

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{
    select,
    stream::{Fuse, SplitSink},
    FutureExt, SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::{Error, Result},
    piece_manager::PieceManager,
    torrent::PeerQueue,
    PeerId, Sha1Hash,
};
use codec::*;

/// The channel on which the torrent driver sends commands to a peer session
/// task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
}

/// A slot in the session pool.
///
/// A session lives for the whole download and owns at most one outbound
/// connection at a time: it pulls a peer address from the shared queue, runs
/// a full session against that peer, and on disconnect or error goes back to
/// pulling the next address.
pub(crate) struct PeerSession {
    /// The piece manager, shared with every other session.
    piece_manager: Arc<RwLock<PieceManager>>,
    /// The queue of peer addresses the tracker gave us.
    peer_queue: Arc<PeerQueue>,
    /// The port on which the peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// Set when the download is aborted because of a fatal error, so the
    /// driver stops even though some sessions may still be healthy.
    abort: Arc<AtomicBool>,
    info_hash: Sha1Hash,
    /// Our own id, as announced to the tracker.
    client_id: PeerId,
    /// The number of pieces in the torrent, for trimming the padding off
    /// received bitfields.
    piece_count: usize,
    state: State,
    /// Connection state with the current peer; reset for every new peer.
    status: Status,
    /// The id the current peer sent in its handshake.
    remote_id: Option<PeerId>,
    /// Set once the session was told to shut down; the session then exits
    /// instead of pulling another peer.
    is_stopped: bool,
}

impl PeerSession {
    pub fn new(
        piece_manager: Arc<RwLock<PieceManager>>,
        peer_queue: Arc<PeerQueue>,
        abort: Arc<AtomicBool>,
        info_hash: Sha1Hash,
        client_id: PeerId,
        piece_count: usize,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                piece_manager,
                peer_queue,
                cmd_port: cmd_port.fuse(),
                abort,
                info_hash,
                client_id,
                piece_count,
                state: State::default(),
                status: Status::default(),
                remote_id: None,
                is_stopped: false,
            },
            cmd_chan,
        )
    }

    /// Cycles through peers from the queue until told to shut down.
    ///
    /// Errors that only concern one peer (refused connections, handshake
    /// and framing problems) are logged and the session moves on to the
    /// next peer; anything else aborts the whole download.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.is_stopped {
                return Ok(());
            }

            let queue = Arc::clone(&self.peer_queue);
            let mut pop = Box::pin(queue.pop().fuse());
            let addr = select! {
                addr = pop => addr,
                cmd = self.cmd_port.select_next_some() => match cmd {
                    Command::Shutdown => {
                        self.is_stopped = true;
                        continue;
                    }
                },
            };

            let result = self.start(addr).await;

            // the peer's availability is no longer usable for requests
            if let Some(id) = self.remote_id.take() {
                self.piece_manager.write().await.remove_peer(&id);
            }
            self.state = State::Disconnected;

            match result {
                Ok(()) => log::info!("Peer {} disconnected", addr),
                Err(e) if e.is_recoverable() => {
                    log::info!("Dropping peer {}: {}", addr, e)
                }
                Err(e) => {
                    log::error!("Peer {} session fatal error: {}", addr, e);
                    self.abort.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
    }

    /// Runs one full session with the peer at the given address, from TCP
    /// connect to disconnect.
    async fn start(&mut self, addr: SocketAddr) -> Result<()> {
        log::info!("Connecting to peer {}", addr);
        self.state = State::Connecting;
        self.status = Status::default();
        let socket = TcpStream::connect(addr).await?;
        log::info!("Connected to peer {}", addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.state = State::Handshaking;
        let handshake = Handshake::new(self.info_hash, self.client_id);
        log::debug!("Sending handshake to peer {}", addr);
        socket.send(handshake).await?;

        let peer_handshake = match socket.next().await {
            Some(peer_handshake) => peer_handshake?,
            None => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection during the handshake",
                )))
            }
        };
        log::debug!("Peer {} handshake: {:?}", addr, peer_handshake);
        // the codec only returns a handshake with a valid protocol string
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.info_hash {
            log::info!("Peer {} handshake has invalid info hash", addr);
            return Err(Error::InvalidHandshake);
        }
        self.remote_id = Some(peer_handshake.peer_id);

        // Now that we have the handshake we switch to the peer message
        // codec. The peer may have sent bytes after its handshake already,
        // so the read buffer is carried over to seed the new framer.
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.state = State::Connected;
        log::debug!("Peer {} session state: {:?}", addr, self.state);

        self.drive(addr, socket).await
    }

    /// The message loop of a connected session.
    async fn drive(
        &mut self,
        addr: SocketAddr,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        // split the sink and stream so that the sink can be passed to the
        // message handlers while the loop holds the stream
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // both sides start out choked; only the peer's interest matters as
        // we have nothing to offer
        self.status.is_choked = true;
        log::info!("Interested in peer {}", addr);
        sink.send(Message::Interested).await?;
        self.status.is_interested = true;

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        // the framer terminated: the peer is gone
                        None => break,
                    };
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        addr
                    );
                    self.handle_msg(addr, msg).await?;
                    self.make_request(&mut sink).await?;
                }
                cmd = self.cmd_port.select_next_some() => match cmd {
                    Command::Shutdown => {
                        log::info!("Shutting down peer {} session", addr);
                        self.is_stopped = true;
                        break;
                    }
                }
            }
        }

        // closing our write half is best effort, the peer may be gone
        let _ = sink.close().await;
        Ok(())
    }

    /// Applies the effect of one incoming message to the session and the
    /// shared piece manager.
    async fn handle_msg(
        &mut self,
        addr: SocketAddr,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", addr);
            }
            Message::Bitfield(mut bitfield) => {
                log::info!("Peer {} sent its bitfield", addr);
                // the wire bitfield is padded out to a byte boundary
                bitfield.resize(self.piece_count, false);
                if let Some(id) = self.remote_id {
                    self.piece_manager.write().await.add_peer(id, bitfield);
                }
            }
            Message::Have { piece_index } => {
                if let Some(id) = self.remote_id {
                    self.piece_manager
                        .write()
                        .await
                        .update_peer(&id, piece_index);
                }
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", addr);
                    self.status.is_choked = true;
                    // a request in flight won't be served while we're
                    // choked; the piece manager will eventually expire it
                    self.status.is_pending_request = false;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", addr);
                    self.status.is_choked = false;
                }
            }
            Message::Interested => {
                self.status.is_peer_interested = true;
            }
            Message::NotInterested => {
                self.status.is_peer_interested = false;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.status.is_pending_request = false;
                if let Some(id) = self.remote_id {
                    self.piece_manager
                        .write()
                        .await
                        .block_received(&id, piece_index, offset, data)?;
                }
            }
            // we never upload, so requests and cancels are ignored
            Message::Request(block) | Message::Cancel(block) => {
                log::debug!(
                    "Ignoring request related message for {:?} from peer {}",
                    block,
                    addr
                );
            }
        }

        Ok(())
    }

    /// Requests the next block from the peer, if the session is in a state
    /// to do so: interested, unchoked, and with no request outstanding.
    async fn make_request(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if !self.status.is_interested
            || self.status.is_choked
            || self.status.is_pending_request
        {
            return Ok(());
        }
        let peer_id = match self.remote_id {
            Some(id) => id,
            None => return Ok(()),
        };

        self.status.is_pending_request = true;
        let block = self.piece_manager.write().await.next_request(&peer_id);
        match block {
            Some(block) => {
                log::debug!("Requesting {:?}", block);
                sink.send(Message::Request(block)).await?;
            }
            None => {
                // the peer has nothing we need right now; a later have or
                // unchoke message may change that
                self.status.is_pending_request = false;
            }
        }

        Ok(())
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// The normal state of a peer session, in which any message apart from
    /// the handshake may be exchanged.
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The status of a connection with one peer.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// If we're choked, the peer doesn't allow us to download from them.
    is_choked: bool,
    /// If we're interested, the peer has pieces that we don't have.
    is_interested: bool,
    /// If the peer is interested, they mean to download pieces we have. As
    /// a pure leecher we never act on this.
    is_peer_interested: bool,
    /// Set while a block request to the peer is outstanding. We keep a
    /// single request in flight at a time.
    is_pending_request: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_interested: false,
            is_pending_request: false,
        }
    }
}
