use super::util;

/// Interface for a group of processes that can exchange messages over a
/// network. The underlying transport can in principle be TCP, UDP, or a
/// higher level abstraction like MPI. Every cross-process step in the mesh
/// engine is a blocking exchange or reduction built from these primitives;
/// nothing is overlapped or pipelined.
///
pub trait Communicator: Send + Sync {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peer processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until a
    /// matching receive is posted.
    fn send(&self, rank: usize, message: Vec<u8>);

    /// Must be implemented to receive the next message sent by the given
    /// peer. This method is allowed to block until such a message arrives.
    /// Messages from a single peer arrive in the order they were sent;
    /// messages from other peers must be held back, not dropped.
    fn recv(&self, from: usize) -> Vec<u8>;

    /// Implements a two-party blocking exchange with the given peer. The
    /// lower rank of the pair sends first; correctness relies on both sides
    /// of the pair calling this in the same communication round, which the
    /// pairing matrix guarantees.
    ///
    fn exchange(&self, peer: usize, message: Vec<u8>) -> Vec<u8> {
        if self.rank() < peer {
            self.send(peer, message);
            self.recv(peer)
        } else {
            let reply = self.recv(peer);
            self.send(peer, message);
            reply
        }
    }

    /// Implements a binomial tree broadcast from the root node. The message
    /// buffer must be `Some` if this is the root node, and it must be `None`
    /// otherwise.
    ///
    fn broadcast(&self, value: Option<Vec<u8>>) -> Vec<u8> {
        let r = self.rank();
        let p = self.size();

        let mut value = value;
        for level in (0..util::ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == one {
                value = Some(self.recv(r - one))
            } else if r % two == 0 && r + one < p {
                let message = value.clone().expect("broadcast value set by root or a prior round");
                self.send(r + one, message)
            }
        }
        value.expect("broadcast reaches every rank in the group")
    }

    /// Implements a binomial tree reduce. All ranks return `None` except for
    /// the root. The operator is a dyn reference so the trait stays usable
    /// through `dyn Communicator`.
    ///
    fn reduce(&self, f: &dyn Fn(Vec<u8>, Vec<u8>) -> Vec<u8>, mut value: Vec<u8>) -> Option<Vec<u8>> {
        let r = self.rank();
        let p = self.size();

        for level in 0..util::ceil_log2(p) {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                if r + one < p {
                    value = f(value, self.recv(r + one))
                }
            } else {
                self.send(r - one, value);
                return None;
            }
        }
        Some(value)
    }

    /// Implements an all-reduce (symmetric fold) operation over a commutative
    /// binary operator.
    ///
    fn all_reduce(&self, f: &dyn Fn(Vec<u8>, Vec<u8>) -> Vec<u8>, value: Vec<u8>) -> Vec<u8> {
        self.broadcast(self.reduce(f, value))
    }
}

/// A communicator for runs with a single process. The point-to-point methods
/// are unreachable because every collective degenerates to a no-op when
/// `size() == 1`.
///
pub struct NullCommunicator;

impl Communicator for NullCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, _rank: usize, _message: Vec<u8>) {
        unreachable!("single-rank communicator has no peers")
    }

    fn recv(&self, _from: usize) -> Vec<u8> {
        unreachable!("single-rank communicator has no peers")
    }
}

/// All-reduce a u64 sum over the communicator. Used for global tag counts.
///
pub fn all_reduce_sum(comm: &dyn Communicator, value: u64) -> u64 {
    if comm.size() == 1 {
        return value;
    }
    let f = |a: Vec<u8>, b: Vec<u8>| {
        let x: u64 = rmp_serde::decode::from_slice(&a).unwrap();
        let y: u64 = rmp_serde::decode::from_slice(&b).unwrap();
        rmp_serde::encode::to_vec(&(x + y)).unwrap()
    };
    let bytes = comm.all_reduce(&f, rmp_serde::encode::to_vec(&value).unwrap());
    rmp_serde::decode::from_slice(&bytes).unwrap()
}

/// All-gather a serializable list: every rank contributes its items and all
/// ranks return the same concatenation, in tree-reduce order. Layouts are
/// built independently on each rank from the result, so the ordering must
/// agree everywhere even though it is not the rank order.
///
pub fn all_gather_vec<T>(comm: &dyn Communicator, items: Vec<T>) -> Vec<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    if comm.size() == 1 {
        return items;
    }
    let f = |a: Vec<u8>, b: Vec<u8>| {
        let mut x: Vec<T> = rmp_serde::decode::from_slice(&a).unwrap();
        let mut y: Vec<T> = rmp_serde::decode::from_slice(&b).unwrap();
        x.append(&mut y);
        rmp_serde::encode::to_vec(&x).unwrap()
    };
    let bytes = comm.all_reduce(&f, rmp_serde::encode::to_vec(&items).unwrap());
    rmp_serde::decode::from_slice(&bytes).unwrap()
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::{Communicator, NullCommunicator};

    #[test]
    fn collectives_are_usable_through_a_trait_object() {
        let comm: Box<dyn Communicator> = Box::new(NullCommunicator);
        assert_eq!(comm.broadcast(Some(vec![3])), vec![3]);
        assert_eq!(comm.reduce(&|a, _| a, vec![7]), Some(vec![7]));
        assert_eq!(comm.all_reduce(&|a, _| a, vec![9]), vec![9]);
    }
}
