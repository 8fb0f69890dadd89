//! An in-process `Communicator` for tests and single-machine multi-rank
//! simulation, over `crossbeam-channel` rather than real sockets: build a
//! wired-up group, hand one endpoint to each simulated rank.

use super::Communicator;
use crossbeam_channel::{Receiver, Sender};

#[derive(Clone)]
pub struct LocalCommunicator {
    rank: usize,
    senders: Vec<Sender<Vec<u8>>>,
    receiver: Receiver<Vec<u8>>,
    requeue: Sender<Vec<u8>>,
}

impl LocalCommunicator {
    /// Build `size` communicators, each wired to every other, simulating
    /// `size` ranks within one process.
    pub fn new_group(size: usize) -> Vec<Self> {
        let channels: Vec<(Sender<Vec<u8>>, Receiver<Vec<u8>>)> = (0..size).map(|_| crossbeam_channel::unbounded()).collect();
        let senders: Vec<Sender<Vec<u8>>> = channels.iter().map(|(s, _)| s.clone()).collect();

        channels
            .into_iter()
            .enumerate()
            .map(|(rank, (requeue, receiver))| LocalCommunicator {
                rank,
                senders: senders.clone(),
                receiver,
                requeue,
            })
            .collect()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        self.senders[rank].send(message).expect("peer communicator dropped");
    }

    fn recv(&self) -> Vec<u8> {
        self.receiver.recv().expect("no more messages will arrive")
    }

    fn requeue_recv(&self, bytes: Vec<u8>) {
        self.requeue.send(bytes).expect("own receive queue dropped");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn two_ranks_can_exchange_a_message() {
        let mut group = LocalCommunicator::new_group(2);
        let b = group.pop().unwrap();
        let a = group.pop().unwrap();

        a.send(1, b"hello".to_vec());
        assert_eq!(b.recv(), b"hello".to_vec());
    }

    #[test]
    fn requeue_recv_is_seen_by_a_later_recv() {
        let group = LocalCommunicator::new_group(1);
        let a = &group[0];
        a.requeue_recv(vec![1, 2, 3]);
        assert_eq!(a.recv(), vec![1, 2, 3]);
    }

    #[test]
    fn all_reduce_sums_across_ranks() {
        let group = LocalCommunicator::new_group(4);
        let handles: Vec<_> = group
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                std::thread::spawn(move || comm.all_reduce(|a, b| vec![a[0] + b[0]], vec![rank as u8]))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![0 + 1 + 2 + 3]);
        }
    }
}
