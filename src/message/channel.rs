use crossbeam_channel::{unbounded, Receiver, Sender};

use super::comm::Communicator;

/// A communicator whose transport is a set of in-process crossbeam channels,
/// one per ordered pair of ranks. Useful for exercising multi-rank code
/// paths (pairwise distribution, reductions) inside a single process, with
/// one thread standing in for each rank.
///
pub struct ChannelCommunicator {
    rank: usize,
    peers: Vec<Sender<Vec<u8>>>,
    inboxes: Vec<Receiver<Vec<u8>>>,
}

impl ChannelCommunicator {
    /// Create a fully-connected group of the given size. Member `n` of the
    /// returned vec is the communicator endpoint for rank `n`.
    ///
    pub fn group(size: usize) -> Vec<Self> {
        let mut txs: Vec<Vec<Sender<Vec<u8>>>> = (0..size).map(|_| Vec::new()).collect();
        let mut rxs: Vec<Vec<Receiver<Vec<u8>>>> = (0..size).map(|_| Vec::new()).collect();

        for dst in 0..size {
            for src in 0..size {
                let (tx, rx) = unbounded();
                txs[src].push(tx);
                rxs[dst].push(rx);
            }
        }
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (peers, inboxes))| Self {
                rank,
                peers,
                inboxes,
            })
            .collect()
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        self.peers[rank].send(message).unwrap()
    }

    fn recv(&self, from: usize) -> Vec<u8> {
        self.inboxes[from].recv().unwrap()
    }
}
