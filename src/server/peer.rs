//! The per-peer outbound RPC actor (SPEC_FULL.md §4.3/§4.8). Mirrors the
//! teacher's `Peer`/`PeerHandle` pair almost exactly -- a dedicated thread
//! per peer, fed commands over an `mpsc` channel -- but issues plain TCP
//! request/reply exchanges instead of capnp messages over a `mio` event
//! loop, since each peer call here is a short-lived blocking connection
//! rather than a long-lived multiplexed stream.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{channel, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::config::NodeId;
use crate::log::{LogEntry, Term};
use crate::rpc::Message;

use super::{Server, RPC_IO_TIMEOUT};

pub enum PeerCommand {
    RequestVote {
        term: Term,
        candidate_log_length: usize,
        candidate_log_term: Term,
    },
    AppendEntries {
        term: Term,
        prefix_length: usize,
        prefix_term: Term,
        commit_length: usize,
        suffix: Vec<LogEntry>,
    },
    Shutdown,
}

/// Owns the channel to a `Peer`'s background thread. Dropping it tells the
/// peer to shut down and waits for the thread to exit, matching the
/// teacher's `PeerHandle::drop`.
pub struct PeerHandle {
    tx: Sender<PeerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl PeerHandle {
    pub fn start(id: NodeId, addr: SocketAddr, server: Weak<Server>) -> PeerHandle {
        let (tx, rx) = channel();
        let thread = thread::spawn(move || {
            let peer = Peer { id, addr, server };
            for command in rx {
                match command {
                    PeerCommand::Shutdown => break,
                    PeerCommand::RequestVote { term, candidate_log_length, candidate_log_term } => {
                        peer.send_request_vote(term, candidate_log_length, candidate_log_term);
                    }
                    PeerCommand::AppendEntries { term, prefix_length, prefix_term, commit_length, suffix } => {
                        peer.send_append_entries(term, prefix_length, prefix_term, commit_length, suffix);
                    }
                }
            }
        });
        PeerHandle { tx, thread: Some(thread) }
    }

    /// Enqueues a command for this peer's thread. Silently dropped if the
    /// thread has already exited (shutdown race); never panics the caller.
    pub fn send(&self, command: PeerCommand) {
        let _ = self.tx.send(command);
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(PeerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Peer {
    id: NodeId,
    addr: SocketAddr,
    server: Weak<Server>,
}

impl Peer {
    fn send_request_vote(&self, term: Term, candidate_log_length: usize, candidate_log_term: Term) {
        let Some(server) = self.server.upgrade() else { return };
        let request = Message::VoteRequest {
            candidate_id: server.id.clone(),
            term,
            log_length: candidate_log_length,
            last_log_term: candidate_log_term,
        };
        match Self::exchange(self.addr, &request) {
            Ok(Message::VoteResponse { node_id, term, granted }) => {
                server.note_rpc_success(&self.id);
                server.handle_vote_response(node_id, term, granted);
            }
            Ok(_) => server.note_rpc_failure(&self.id),
            Err(e) => {
                debug!("{}: vote request to {} failed: {e}", server.id, self.id);
                server.note_rpc_failure(&self.id);
            }
        }
    }

    fn send_append_entries(
        &self,
        term: Term,
        prefix_length: usize,
        prefix_term: Term,
        commit_length: usize,
        suffix: Vec<LogEntry>,
    ) {
        let Some(server) = self.server.upgrade() else { return };
        let request = Message::LogRequest {
            leader_id: server.id.clone(),
            term,
            prefix_length,
            prefix_term,
            commit_length,
            suffix,
        };
        match Self::exchange(self.addr, &request) {
            Ok(Message::LogResponse { node_id, term, ack, success, .. }) => {
                server.note_rpc_success(&self.id);
                server.handle_log_response(node_id, term, ack, success);
            }
            Ok(_) => server.note_rpc_failure(&self.id),
            Err(e) => {
                debug!("{}: append entries to {} failed: {e}", server.id, self.id);
                server.note_rpc_failure(&self.id);
            }
        }
    }

    /// Opens a fresh connection, writes one request line, reads one reply
    /// line. One connection per RPC keeps this side of the protocol
    /// completely stateless (SPEC_FULL.md §4.8).
    fn exchange(addr: SocketAddr, request: &Message) -> std::io::Result<Message> {
        let mut stream = TcpStream::connect_timeout(&addr, RPC_IO_TIMEOUT)?;
        stream.set_read_timeout(Some(RPC_IO_TIMEOUT))?;
        stream.set_write_timeout(Some(RPC_IO_TIMEOUT))?;
        stream.write_all(format!("{}\n", request.encode()).as_bytes())?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        Message::decode(&line).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }
}
