//! Production `Communicator` over real sockets. Wire framing is an 8-byte
//! little-endian length prefix followed by the message bytes, with an
//! exponential-backoff connect retry; `Communicator` deals in opaque
//! `Vec<u8>`, so callers choose their own payload encoding.

use log::{error, info};
use std::io::prelude::*;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;

use super::Communicator;

type SendSink = crossbeam_channel::Sender<(usize, Vec<u8>)>;
type RecvSink = crossbeam_channel::Sender<Vec<u8>>;
type RecvSrc = crossbeam_channel::Receiver<Vec<u8>>;

fn read_exact_or_die(stream: &mut TcpStream, buf: &mut [u8]) {
    stream.read_exact(buf).expect("connection closed mid-message");
}

fn read_usize(stream: &mut TcpStream) -> usize {
    let mut bytes = [0u8; 8];
    read_exact_or_die(stream, &mut bytes);
    usize::from_le_bytes(bytes)
}

fn read_bytes_vec(stream: &mut TcpStream, size: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; size];
    read_exact_or_die(stream, &mut bytes);
    bytes
}

/// Owns the background listener and sender threads for one rank's TCP
/// endpoint. Dropping the returned channels (via dropping `TcpCommunicator`)
/// lets the sender thread exit; the listener thread runs for the process's
/// lifetime.
pub struct TcpHost {
    send_thread: Option<thread::JoinHandle<()>>,
    listen_thread: Option<thread::JoinHandle<()>>,
}

impl TcpHost {
    /// Spawn the listener for `peers[rank]` and the background sender,
    /// returning the host plus the channel endpoints `TcpCommunicator` needs.
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> (Self, SendSink, RecvSink, RecvSrc) {
        let (send_sink, send_src): (SendSink, _) = crossbeam_channel::unbounded();
        let send_thread = Self::start_sender(peers.clone(), send_src);

        let (recv_sink, recv_src) = crossbeam_channel::unbounded();
        let listen_thread = Self::start_listener(peers[rank], recv_sink.clone());

        (
            TcpHost { send_thread: Some(send_thread), listen_thread: Some(listen_thread) },
            send_sink,
            recv_sink,
            recv_src,
        )
    }

    pub fn join(&mut self) {
        if let Some(t) = self.send_thread.take() {
            t.join().expect("sender thread panicked");
        }
        if let Some(t) = self.listen_thread.take() {
            t.join().expect("listener thread panicked");
        }
    }

    fn start_sender(peers: Vec<SocketAddr>, send_src: crossbeam_channel::Receiver<(usize, Vec<u8>)>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for (rank, message) in send_src {
                let mut sleep_ms = 250;
                loop {
                    match TcpStream::connect(peers[rank]) {
                        Ok(mut stream) => {
                            stream.write_all(&message.len().to_le_bytes()).expect("write length prefix");
                            stream.write_all(&message).expect("write message body");
                            break;
                        }
                        Err(err) => {
                            error!("send to rank {} failed: {}", rank, err);
                            info!("retrying in {}ms", sleep_ms);
                            thread::sleep(std::time::Duration::from_millis(sleep_ms));
                            sleep_ms = if sleep_ms < 5000 { 2 * sleep_ms } else { 5000 };
                        }
                    }
                }
            }
        })
    }

    fn start_listener(addr: SocketAddr, recv_sink: RecvSink) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!("listening on {}", addr);
            let listener = TcpListener::bind(addr).expect("failed to bind listen address");
            for stream in listener.incoming() {
                match stream {
                    Ok(mut stream) => Self::handle_connection(&mut stream, recv_sink.clone()),
                    Err(err) => error!("accept failed: {}", err),
                }
            }
        })
    }

    fn handle_connection(stream: &mut TcpStream, recv_sink: RecvSink) {
        loop {
            let size = read_usize(stream);
            let bytes = read_bytes_vec(stream, size);
            if recv_sink.send(bytes).is_err() {
                error!("local receive queue dropped; closing connection");
                break;
            }
        }
    }
}

/// A `Communicator` backed by one `TcpHost` per rank, addressed by a shared
/// `peers` table of socket addresses (`peers[rank]` is where rank `rank`
/// listens).
#[derive(Clone)]
pub struct TcpCommunicator {
    rank: usize,
    num_peers: usize,
    send_sink: SendSink,
    recv_sink: RecvSink,
    recv_src: RecvSrc,
}

impl TcpCommunicator {
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> (TcpHost, Self) {
        let (host, send_sink, recv_sink, recv_src) = TcpHost::new(rank, peers.clone());
        let comm = Self { rank, num_peers: peers.len(), send_sink, recv_sink, recv_src };
        (host, comm)
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.num_peers
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        self.send_sink.send((rank, message)).expect("send thread exited");
    }

    fn recv(&self) -> Vec<u8> {
        self.recv_src.recv().expect("listener thread exited")
    }

    fn requeue_recv(&self, bytes: Vec<u8>) {
        self.recv_sink.send(bytes).expect("listener thread exited");
    }
}
