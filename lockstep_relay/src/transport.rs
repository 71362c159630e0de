// Physical transports.
//
// The connection layer only ever sees raw wire frames (header byte plus
// payload, see `lockstep_protocol::fragment`). A transport moves those frames
// and nothing else; it knows no kinds, states or sessions. Each medium is split
// into an outbound half (`Transport`, shared behind the link's mutex) and an
// inbound half (`TransportReceiver`, owned by the connection's reader thread).
//
// Implementations:
// - TCP: frames are length-delimited with `framing::write_packet`. Everything
//   arrives as `Delivery::Reliable`, whatever the sender asked for. Sending
//   only queues the frame; a writer thread per stream does the socket writes.
//   The queue is bounded, and a peer that lets it fill up is cut off: its
//   socket is shut down, which its reader thread sees as end of stream.
// - Loopback: an in-process pair over `mpsc` channels that preserves the
//   sender's delivery class. Used for embedded clients and tests.
//
// `send_raw` never waits on a peer. Broadcasts run under session locks, and a
// peer that stops reading must not hold those locks hostage.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::thread;

use lockstep_protocol::{Delivery, FrameLimits, read_packet, write_packet};
use tracing::{debug, warn};

/// Frames queued for a TCP peer before it counts as stalled.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 1024;

/// Outbound half of a transport.
pub trait Transport: Send {
    fn send_raw(&mut self, frame: &[u8], delivery: Delivery) -> io::Result<()>;
    /// Close both directions. The peer's and our own receiver see end of
    /// stream.
    fn close(&mut self);
}

/// Inbound half of a transport. Blocks until a frame arrives.
pub trait TransportReceiver: Send {
    fn recv_raw(&mut self) -> io::Result<(Vec<u8>, Delivery)>;
}

enum Outgoing {
    Frame(Vec<u8>),
    /// Flush what is queued, then shut the stream down.
    Close,
}

pub struct TcpTransport {
    queue: SyncSender<Outgoing>,
    /// For cutting the stream off without going through the queue.
    stream: TcpStream,
    max_frame: usize,
    closed: bool,
}

pub struct TcpReceiver {
    reader: BufReader<TcpStream>,
    max_frame: usize,
}

/// Split a connected stream into its two halves and start its writer thread.
/// At most `queue_frames` frames wait for the socket at once.
pub fn tcp_pair(
    stream: TcpStream,
    limits: FrameLimits,
    queue_frames: usize,
) -> io::Result<(TcpTransport, TcpReceiver)> {
    stream.set_nodelay(true)?;
    let reader_stream = stream.try_clone()?;
    let writer_stream = stream.try_clone()?;
    let max_frame = limits.max_frame_size();
    let (queue, outgoing) = mpsc::sync_channel(queue_frames.max(1));
    thread::Builder::new()
        .name("relay-writer".into())
        .spawn(move || write_loop(writer_stream, outgoing, max_frame))?;
    Ok((
        TcpTransport {
            queue,
            stream,
            max_frame,
            closed: false,
        },
        TcpReceiver {
            reader: BufReader::new(reader_stream),
            max_frame,
        },
    ))
}

/// Writer thread body. Ends on close, on a write error, or when the
/// transport is dropped; the stream is shut down either way.
fn write_loop(stream: TcpStream, outgoing: Receiver<Outgoing>, max_frame: usize) {
    let mut writer = BufWriter::new(stream);
    while let Ok(Outgoing::Frame(frame)) = outgoing.recv() {
        if let Err(err) = write_packet(&mut writer, &frame, max_frame) {
            debug!(%err, "stream write failed");
            break;
        }
    }
    let _ = writer.get_ref().shutdown(Shutdown::Both);
}

impl TcpTransport {
    fn cut_off(&mut self) {
        self.closed = true;
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Transport for TcpTransport {
    fn send_raw(&mut self, frame: &[u8], _delivery: Delivery) -> io::Result<()> {
        if self.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if frame.len() > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame too large: {} bytes (max {})", frame.len(), self.max_frame),
            ));
        }
        match self.queue.try_send(Outgoing::Frame(frame.to_vec())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("peer is not reading; dropping the connection");
                self.cut_off();
                Err(io::ErrorKind::WouldBlock.into())
            }
            Err(TrySendError::Disconnected(_)) => {
                self.closed = true;
                Err(io::ErrorKind::BrokenPipe.into())
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.queue.try_send(Outgoing::Close).is_err() {
            self.cut_off();
        }
    }
}

impl TransportReceiver for TcpReceiver {
    fn recv_raw(&mut self) -> io::Result<(Vec<u8>, Delivery)> {
        let frame = read_packet(&mut self.reader, self.max_frame)?;
        Ok((frame, Delivery::Reliable))
    }
}

/// `None` marks end of stream.
type LoopbackItem = Option<(Vec<u8>, Delivery)>;

pub struct LoopbackTransport {
    peer: Sender<LoopbackItem>,
    own: Sender<LoopbackItem>,
    closed: bool,
}

pub struct LoopbackReceiver {
    inbox: Receiver<LoopbackItem>,
}

/// One end of a loopback pair.
pub type LoopbackEnd = (LoopbackTransport, LoopbackReceiver);

/// Two connected in-process ends.
pub fn loopback_pair() -> (LoopbackEnd, LoopbackEnd) {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    let a = (
        LoopbackTransport {
            peer: b_tx.clone(),
            own: a_tx.clone(),
            closed: false,
        },
        LoopbackReceiver { inbox: a_rx },
    );
    let b = (
        LoopbackTransport {
            peer: a_tx,
            own: b_tx,
            closed: false,
        },
        LoopbackReceiver { inbox: b_rx },
    );
    (a, b)
}

impl Transport for LoopbackTransport {
    fn send_raw(&mut self, frame: &[u8], delivery: Delivery) -> io::Result<()> {
        if self.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.peer
            .send(Some((frame.to_vec(), delivery)))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.peer.send(None);
            let _ = self.own.send(None);
        }
    }
}

impl TransportReceiver for LoopbackReceiver {
    fn recv_raw(&mut self) -> io::Result<(Vec<u8>, Delivery)> {
        match self.inbox.recv() {
            Ok(Some(item)) => Ok(item),
            Ok(None) | Err(_) => Err(io::ErrorKind::UnexpectedEof.into()),
        }
    }
}
