//! The rank-to-rank, MPI-like message-passing collaborator every other
//! component is parameterized over.
//!
//! `Communicator`'s shape (rank/size, non-blocking `send`, blocking `recv`,
//! a `requeue_recv` escape hatch, binomial-tree `broadcast`/`reduce`/
//! `all_reduce` as default methods) matches what `Domain`'s prefix-sum and
//! neighbor-index exchange need.

pub mod local;
pub mod tcp;

mod util {
    pub fn ceil_log2(x: usize) -> u32 {
        if x <= 1 {
            0
        } else {
            (usize::BITS - (x - 1).leading_zeros()) as u32
        }
    }
}

/// A group of processes that can exchange byte-string messages. The
/// transport may be TCP (`tcp::TcpCommunicator`), in-process channels
/// (`local::LocalCommunicator`), or, in principle, real MPI.
pub trait Communicator {
    /// This process's rank within the communicator.
    fn rank(&self) -> usize;

    /// The number of processes in the communicator.
    fn size(&self) -> usize;

    /// Send a message to a peer. Must return without waiting for a
    /// matching receive.
    fn send(&self, rank: usize, message: Vec<u8>);

    /// Receive a message from any peer, blocking until one is ready.
    fn recv(&self) -> Vec<u8>;

    /// Push a received message that wasn't the one being waited for back
    /// onto this rank's receive queue, so a later `recv` can pick it up.
    fn requeue_recv(&self, bytes: Vec<u8>);

    /// Binomial-tree broadcast from the root. `value` must be `Some` on the
    /// root and `None` everywhere else.
    fn broadcast(&self, value: Option<Vec<u8>>) -> Vec<u8> {
        let r = self.rank();
        let p = self.size();

        let value = match value {
            Some(value) => value,
            None => self.recv(),
        };
        for level in (0..util::ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 && r + one <= p {
                self.send(r + one, value.clone())
            }
        }
        value
    }

    /// Binomial-tree reduce over a commutative `f`. Every rank but the root
    /// returns `None`.
    fn reduce<F>(&self, f: F, mut value: Vec<u8>) -> Option<Vec<u8>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        let r = self.rank();
        let p = self.size();

        for level in (0..util::ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                value = f(value, self.recv())
            } else {
                self.send(r - one, value);
                return None;
            }
        }
        Some(value)
    }

    /// All-reduce: reduce to the root, then broadcast the result back out.
    fn all_reduce<F>(&self, f: F, value: Vec<u8>) -> Vec<u8>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        self.broadcast(self.reduce(f, value))
    }
}

/// A point-to-point message carrying a distinct tag per exchange, so two
/// concurrent exchanges over the same communicator don't interleave.
#[derive(serde::Serialize, serde::Deserialize)]
struct Envelope {
    tag: u32,
    payload: Vec<u8>,
}

/// Send `payload` to `rank` tagged with `tag`.
pub fn send_tagged<C: Communicator>(comm: &C, rank: usize, tag: u32, payload: Vec<u8>) {
    let envelope = Envelope { tag, payload };
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&envelope, &mut buf).expect("envelope always encodes");
    comm.send(rank, buf);
}

/// Block until a message tagged `tag` arrives, requeueing anything else
/// that shows up in the meantime.
pub fn recv_tagged<C: Communicator>(comm: &C, tag: u32) -> Vec<u8> {
    loop {
        let bytes = comm.recv();
        let envelope: Envelope = ciborium::de::from_reader(&bytes[..]).expect("malformed envelope");
        if envelope.tag == tag {
            return envelope.payload;
        }
        comm.requeue_recv(bytes);
    }
}
