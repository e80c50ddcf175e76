use std::{io, thread};
use std::{collections::HashMap, io::prelude::*};
use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    time::Duration,
};

use log::{error, info};

use super::{backoff::ExponentialBackoff, comm::Communicator, util};

const CXN_R_TIMEOUT_MS: Duration = Duration::from_millis(250);
const CXN_W_TIMEOUT_MS: Duration = Duration::from_millis(250);
const RETRY_WAIT_MS: Duration = Duration::from_millis(250);
const RETRY_MAX_WAIT_MS: Duration = Duration::from_millis(5000);

type Sender = crossbeam_channel::Sender<(usize, Vec<u8>)>;
type Inboxes = Vec<crossbeam_channel::Receiver<Vec<u8>>>;

/// Owns the background IO threads for one rank of a TCP-backed group. Each
/// frame on the wire is a (source rank, payload length, payload) triple, and
/// the receiver acks every frame with the payload length it read. The
/// listener routes incoming frames into one inbox per source rank, so a
/// receive posted for one peer never consumes a frame from another.
///
pub struct TcpHost {
    listen_thread: Option<thread::JoinHandle<()>>,
    send_thread: Option<thread::JoinHandle<()>>,
}

impl TcpHost {
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> (Self, Sender, Inboxes) {
        let (send_sink, send_src): (Sender, _) = crossbeam_channel::unbounded();
        let send_thread = Self::start_serial_sender(rank, peers.clone(), send_src);

        let (recv_sinks, recv_srcs): (Vec<_>, Vec<_>) =
            (0..peers.len()).map(|_| crossbeam_channel::unbounded()).unzip();
        let listen_thread = Self::start_listener(peers[rank], recv_sinks);

        (
            TcpHost {
                send_thread: Some(send_thread),
                listen_thread: Some(listen_thread),
            },
            send_sink,
            recv_srcs,
        )
    }

    pub fn join(&mut self) {
        self.send_thread.take().unwrap().join().unwrap();
        // the listener blocks in accept with no shutdown signal; detach it
        // rather than join it
        drop(self.listen_thread.take());
    }

    fn start_serial_sender(
        my_rank: usize,
        peers: Vec<SocketAddr>,
        send_src: crossbeam_channel::Receiver<(usize, Vec<u8>)>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut table: HashMap<usize, TcpStream> = HashMap::new();

            for (rank, message) in send_src {
                if !table.contains_key(&rank) {
                    table.insert(
                        rank,
                        Self::connect_with_retry(peers[rank], RETRY_WAIT_MS, RETRY_MAX_WAIT_MS)
                            .unwrap(),
                    );
                }
                let client = table.get_mut(&rank).unwrap();

                loop {
                    let msg_sz = message.len();
                    match client
                        .write_all(&my_rank.to_le_bytes())
                        .and_then(|()| client.write_all(&msg_sz.to_le_bytes()))
                        .and_then(|()| client.write_all(&message))
                        .and_then(|()| {
                            util::read_usize(client).and_then(|ack| {
                                if ack != msg_sz {
                                    panic!("Bytes read by receiver did not match bytes sent by this node.  Sent {} bytes but receiver Acked {} bytes", msg_sz, ack)
                                }
                                Ok(())
                            })
                        }) {
                        Ok(()) => break,
                        Err(msg) => {
                            error!("Failed to send message to {}: {}", peers[rank], msg);
                            *client = Self::connect_with_retry(peers[rank], RETRY_WAIT_MS, RETRY_MAX_WAIT_MS).unwrap();
                        }
                    }
                }
            }
        })
    }

    fn start_listener(
        addr: SocketAddr,
        recv_sinks: Vec<crossbeam_channel::Sender<Vec<u8>>>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!("Listening to: {}", addr);
            let listener = TcpListener::bind(addr).unwrap();
            loop {
                let (stream, remote) = listener.accept().unwrap();
                Self::handle_connection(stream, remote, recv_sinks.clone());
            }
        })
    }

    fn handle_connection(
        mut stream: TcpStream,
        remote: SocketAddr,
        recv_sinks: Vec<crossbeam_channel::Sender<Vec<u8>>>,
    ) -> thread::JoinHandle<Result<(), std::io::Error>> {
        info!("Receiving connection from {}", remote);
        stream.set_read_timeout(Some(CXN_R_TIMEOUT_MS)).unwrap();
        stream.set_write_timeout(Some(CXN_W_TIMEOUT_MS)).unwrap();
        thread::spawn(move || loop {
            util::read_usize(&mut stream)
                .and_then(|src| {
                    util::read_usize(&mut stream)
                        .and_then(|size| util::read_bytes_vec(&mut stream, size))
                        .map(|bytes| (src, bytes))
                })
                .and_then(|(src, bytes)| {
                    let num_bytes = bytes.len();
                    recv_sinks[src]
                        .send(bytes)
                        .map(|()| num_bytes)
                        .map_err(|msg| io::Error::new(io::ErrorKind::Other, msg))
                })
                .and_then(|size| stream.write(&size.to_le_bytes()).map(|_| ()))
                .map_err(|e| {
                    std::io::Error::new(
                        e.kind(),
                        format!("Connection from {} failed: {}", remote, e),
                    )
                })?
        })
    }

    fn connect_with_retry(
        addr: SocketAddr,
        initial_wait: Duration,
        max_wait: Duration,
    ) -> Option<TcpStream> {
        let mut with_retries = ExponentialBackoff::new(initial_wait, max_wait, 2);

        with_retries.find_map(|sleep| match TcpStream::connect(&addr) {
            Ok(s) => {
                s.set_read_timeout(Some(CXN_R_TIMEOUT_MS)).unwrap();
                s.set_write_timeout(Some(CXN_W_TIMEOUT_MS)).unwrap();
                Some(s)
            }
            Err(msg) => {
                info!("Connect to {} failed, will retry: {}", addr, msg);
                thread::sleep(sleep);
                None
            }
        })
    }
}

/////////////////////////////////////////////////////
/////////////////////////////////////////////////////
/////////////////////////////////////////////////////
/////////////////////////////////////////////////////

pub struct TcpCommunicator {
    rank: usize,
    num_peers: usize,
    send_sink: Option<crossbeam_channel::Sender<(usize, Vec<u8>)>>,
    recv_srcs: Option<Inboxes>,
}

impl TcpCommunicator {
    pub fn new(
        rank: usize,
        peers: Vec<SocketAddr>,
        send_sink: crossbeam_channel::Sender<(usize, Vec<u8>)>,
        recv_srcs: Inboxes,
    ) -> Self {
        let num_peers = peers.len();
        Self {
            rank,
            num_peers,
            send_sink: Some(send_sink),
            recv_srcs: Some(recv_srcs),
        }
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
        self.send_sink
            .as_ref()
            .unwrap()
            .send((rank, message))
            .unwrap()
    }

    fn recv(&self, from: usize) -> Vec<u8> {
        self.recv_srcs.as_ref().unwrap()[from].recv().unwrap()
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        self.send_sink.take().unwrap();
        self.recv_srcs.take().unwrap();
    }
}

/////////////////////////////////////////////////////
/////////////////////////////////////////////////////
/////////////////////////////////////////////////////
/////////////////////////////////////////////////////
