//! The consensus core: per-node state, role transitions, RPC handlers, and
//! the client write path (SPEC_FULL.md §4.2-§4.5). Mirrors the teacher's
//! `Server`/`ServerState` (a struct behind a single `Mutex`, generalized
//! from capnp/mio to the spec's plain TCP transport and text RPC grammar),
//! but the lock-ordering discipline and the peer-actor-per-thread shape both
//! come straight from `server::peer` in the teacher.
//!
//! Lock order, enforced everywhere in this module: `state` before `log`
//! before `store` before `applier`. A handler may drop a lock and never
//! re-acquire an earlier one -- that is the whole deadlock-avoidance
//! argument, so do not reorder these.

pub mod election;
pub mod peer;
pub mod replication;

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::{Config, NodeId, PeerRegistry};
use crate::error::{CommandError, RaftError};
use crate::kv::{Applier, Command};
use crate::log::{Log, LogEntry, StateStore, StateTriple, Term};
use crate::rpc::Message;

use election::ElectionHandle;
use peer::{PeerCommand, PeerHandle};
use replication::ReplicatorHandle;

/// Lower/upper bound of the randomized election timeout (SPEC_FULL.md §4.2).
pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(1500);
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(3000);

/// Leader broadcast period, well under `ELECTION_TIMEOUT_MIN` so a healthy
/// leader is never suspected by its own followers.
pub const BROADCAST_PERIOD: Duration = Duration::from_millis(500);

/// Connect/read/write timeout for a single peer RPC exchange.
pub const RPC_IO_TIMEOUT: Duration = Duration::from_millis(750);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy, Default)]
struct PeerBook {
    sent_length: usize,
    acked_length: usize,
}

/// Everything that changes as the node runs, behind one `Mutex` (SPEC_FULL.md
/// §5: "a struct behind one mutex whose invariants are documented per
/// transition", the chosen resolution of the teacher's `// TODO: RW locks?`).
struct NodeState {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    commit_length: usize,
    leader_id: Option<NodeId>,
    acked_length_self: usize,
    peers: std::collections::HashMap<NodeId, PeerBook>,
    votes_received: std::collections::HashSet<NodeId>,
    suspected: std::collections::HashSet<NodeId>,
}

impl NodeState {
    fn from_triple(triple: &StateTriple) -> Self {
        NodeState {
            role: Role::Follower,
            current_term: triple.current_term,
            voted_for: triple.voted_for.clone(),
            commit_length: triple.commit_length,
            leader_id: None,
            acked_length_self: 0,
            peers: std::collections::HashMap::new(),
            votes_received: std::collections::HashSet::new(),
            suspected: std::collections::HashSet::new(),
        }
    }

    fn triple(&self) -> StateTriple {
        StateTriple {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            commit_length: self.commit_length,
        }
    }
}

/// A single node in the cluster: the consensus core, the applied key-value
/// state, and the actor handles (peers, election timer, leader broadcaster)
/// that drive it.
pub struct Server {
    pub id: NodeId,
    cluster_size: usize,
    registry: PeerRegistry,
    state: Mutex<NodeState>,
    commit_cv: Condvar,
    log: Mutex<Log>,
    store: Mutex<StateStore>,
    applier: Mutex<Applier>,
    peer_handles: Mutex<std::collections::HashMap<NodeId, PeerHandle>>,
    election: Mutex<Option<ElectionHandle>>,
    replicator: Mutex<Option<ReplicatorHandle>>,
    /// A weak handle to its own `Arc`, so methods reached only through `&self`
    /// (RPC handlers on a connection thread, the election actor) can still
    /// hand an `Arc<Server>` to the replicator actor when becoming leader.
    /// Set once in `start`, immediately after the `Arc` is created.
    self_weak: Mutex<Weak<Server>>,
}

impl Server {
    /// Builds the node from durable state, wires up the peer actors and the
    /// election timer, and starts the node as a follower. The returned `Arc`
    /// is the handle every listener thread (transport, http) and every actor
    /// thread (peer, election, replicator) shares.
    pub fn start(config: &Config, registry: PeerRegistry) -> Result<Arc<Server>, RaftError> {
        let store = StateStore::new(&config.data_dir, &config.node_id)?;
        let (triple, log) = store.load_or_init()?;
        info!(
            "node {} loaded term={} commitLength={} logLen={}",
            config.node_id,
            triple.current_term,
            triple.commit_length,
            log.len()
        );

        let server = Arc::new(Server {
            id: config.node_id.clone(),
            cluster_size: registry.len(),
            registry,
            state: Mutex::new(NodeState::from_triple(&triple)),
            commit_cv: Condvar::new(),
            log: Mutex::new(log),
            store: Mutex::new(store),
            applier: Mutex::new(Applier::new()),
            peer_handles: Mutex::new(std::collections::HashMap::new()),
            election: Mutex::new(None),
            replicator: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
        });
        *server.self_weak.lock().unwrap() = Arc::downgrade(&server);

        // Replay the durable log into the applier up to commitLength, so a
        // restarted node serves GETs consistent with what it had committed.
        {
            let log = server.log.lock().unwrap();
            let mut applier = server.applier.lock().unwrap();
            for i in 1..=triple.commit_length.min(log.len()) {
                if let Some(entry) = log.entry(i) {
                    applier.apply(&entry.command);
                }
            }
        }

        let peer_ids: Vec<(NodeId, std::net::SocketAddr)> = server
            .registry
            .other_peers(&server.id)
            .map(|(id, _)| {
                let addr = server.registry.peer_addr(id).expect("registered peer has an address");
                (id.to_string(), addr)
            })
            .collect();
        {
            let mut handles = server.peer_handles.lock().unwrap();
            for (peer_id, addr) in peer_ids {
                handles.insert(peer_id.clone(), PeerHandle::start(peer_id, addr, Arc::downgrade(&server)));
            }
        }

        let election = ElectionHandle::start(Arc::downgrade(&server));
        election.reset();
        *server.election.lock().unwrap() = Some(election);

        Ok(server)
    }

    fn arc(&self) -> Option<Arc<Server>> {
        self.self_weak.lock().unwrap().upgrade()
    }

    // ---- quorum arithmetic (SPEC_FULL.md §4.3/§4.4) ----------------------

    /// Peers not currently suspected, including self.
    fn alive_n(&self, state: &NodeState) -> usize {
        self.cluster_size - state.suspected.len()
    }

    /// Acknowledgements required to commit an entry, or to win an election.
    ///
    /// A genuine single-node cluster always needs just its own ack. Any
    /// larger cluster always needs at least two acks (itself plus one other)
    /// regardless of how many peers are currently suspected -- otherwise a
    /// leader cut off from a suspected majority could spuriously advance
    /// commit using nothing but its own acknowledgement, which the
    /// suspected-node narrowing is explicitly not meant to permit (see
    /// DESIGN.md).
    fn required_acks(&self, alive_n: usize) -> usize {
        if self.cluster_size == 1 {
            return 1;
        }
        (alive_n / 2 + 1).max(2)
    }

    fn mark_suspected(&self, peer_id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.suspected.insert(peer_id.to_string()) {
            debug!("{}: marking {peer_id} suspected", self.id);
        }
    }

    fn clear_suspected(&self, peer_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.suspected.remove(peer_id);
    }

    fn persist_or_die(&self, state: &NodeState) {
        let triple = state.triple();
        if let Err(e) = self.store.lock().unwrap().persist(&triple) {
            error!("{}: persistence failure, node cannot continue: {e}", self.id);
            std::process::exit(1);
        }
    }

    // ---- role transitions ----------------------------------------------

    /// Adopts a larger term observed from any RPC, stepping down to follower
    /// (SPEC_FULL.md §4.2 "Term dominance"). No-op if `term` is not larger.
    ///
    /// Returns `Some(old_replicator)` if a step-down happened, where
    /// `old_replicator` is the replicator actor handle that was running (if
    /// any), still unjoined. The caller must drop `state` before dropping
    /// this value: `ReplicatorHandle`'s `Drop` joins its thread, and that
    /// thread calls back into `replicate_to_all_peers`, which locks `state`
    /// itself -- joining it while still holding `state` deadlocks.
    fn maybe_step_down(&self, state: &mut NodeState, term: Term) -> Option<Option<ReplicatorHandle>> {
        if term > state.current_term {
            state.current_term = term;
            state.role = Role::Follower;
            state.voted_for = None;
            state.votes_received.clear();
            self.persist_or_die(state);
            let old_replicator = self.take_replicator();
            if let Some(handle) = self.election.lock().unwrap().as_ref() {
                handle.reset();
            }
            Some(old_replicator)
        } else {
            None
        }
    }

    /// Removes the replicator actor handle, if any running, without
    /// dropping it. The caller owns the join from here.
    fn take_replicator(&self) -> Option<ReplicatorHandle> {
        self.replicator.lock().unwrap().take()
    }

    /// Transitions a winning candidate to leader. Safe to call speculatively
    /// (from `start_election` or `handle_vote_response`) after dropping the
    /// state lock: re-checks role under lock and is a no-op if the role
    /// already moved on.
    fn become_leader(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.role != Role::Candidate {
                return;
            }
            state.role = Role::Leader;
            state.leader_id = Some(self.id.clone());
            let log_len = self.log.lock().unwrap().len();
            state.peers.clear();
            for peer_id in self.registry.other_peers(&self.id).map(|(id, _)| id.to_string()) {
                state.peers.insert(peer_id, PeerBook { sent_length: log_len, acked_length: 0 });
            }
            state.acked_length_self = log_len;
            info!("{}: became leader for term {}", self.id, state.current_term);
        }
        if let Some(handle) = self.election.lock().unwrap().as_ref() {
            handle.stop();
        }
        if let Some(arc) = self.arc() {
            *self.replicator.lock().unwrap() = Some(ReplicatorHandle::start(Arc::downgrade(&arc)));
        }
        self.replicate_to_all_peers();
    }

    // ---- election (SPEC_FULL.md §4.2/§4.4) ------------------------------

    /// Called by the election timer actor when it fires.
    pub fn on_election_timeout(&self) {
        let is_leader = self.state.lock().unwrap().role == Role::Leader;
        if is_leader {
            return; // the timer is stopped while leading; ignore a stray fire
        }
        self.start_election();
    }

    fn start_election(&self) {
        let (term, log_len, last_term, already_won) = {
            let mut state = self.state.lock().unwrap();
            state.current_term += 1;
            state.role = Role::Candidate;
            state.voted_for = Some(self.id.clone());
            state.votes_received.clear();
            state.votes_received.insert(self.id.clone());
            self.persist_or_die(&state);
            let log = self.log.lock().unwrap();
            let log_len = log.len();
            let last_term = log.last_term();
            drop(log);
            info!("{}: starting election for term {}", self.id, state.current_term);
            let already_won = self.has_quorum_votes(&state);
            (state.current_term, log_len, last_term, already_won)
        };
        if let Some(handle) = self.election.lock().unwrap().as_ref() {
            handle.reset();
        }
        if already_won {
            // Single-node cluster: our own vote is already a quorum.
            self.become_leader();
            return;
        }
        let peer_handles = self.peer_handles.lock().unwrap();
        for handle in peer_handles.values() {
            handle.send(PeerCommand::RequestVote {
                term,
                candidate_log_length: log_len,
                candidate_log_term: last_term,
            });
        }
    }

    fn has_quorum_votes(&self, state: &NodeState) -> bool {
        let alive = self.alive_n(state);
        state.votes_received.len() >= self.required_acks(alive)
    }

    pub fn handle_vote_request(&self, candidate_id: String, term: Term, log_length: usize, last_log_term: Term) -> Message {
        let mut state = self.state.lock().unwrap();
        let stepped_down_replicator = self.maybe_step_down(&mut state, term);
        let log_ok = {
            let log = self.log.lock().unwrap();
            log.is_at_least_as_up_to_date_as(log_length, last_log_term)
        };
        let grant = term == state.current_term
            && log_ok
            && (state.voted_for.is_none() || state.voted_for.as_deref() == Some(candidate_id.as_str()));
        if grant {
            state.voted_for = Some(candidate_id);
            self.persist_or_die(&state);
            if let Some(handle) = self.election.lock().unwrap().as_ref() {
                handle.reset();
            }
        }
        let reply = Message::VoteResponse {
            node_id: self.id.clone(),
            term: state.current_term,
            granted: grant,
        };
        drop(state);
        drop(stepped_down_replicator);
        reply
    }

    pub fn handle_vote_response(&self, from: NodeId, term: Term, granted: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(old_replicator) = self.maybe_step_down(&mut state, term) {
            drop(state);
            drop(old_replicator);
            return;
        }
        if state.role != Role::Candidate || term != state.current_term || !granted {
            return;
        }
        state.votes_received.insert(from);
        let won = self.has_quorum_votes(&state);
        drop(state);
        if won {
            self.become_leader();
        }
    }

    // ---- log replication (SPEC_FULL.md §4.3) -----------------------------

    pub fn handle_log_request(
        &self,
        leader_id: String,
        term: Term,
        prefix_length: usize,
        prefix_term: Term,
        commit_length: usize,
        suffix: Vec<LogEntry>,
    ) -> Message {
        let mut state = self.state.lock().unwrap();
        let stepped_down_replicator = self.maybe_step_down(&mut state, term);
        if term == state.current_term {
            state.role = Role::Follower;
            state.leader_id = Some(leader_id);
            if let Some(handle) = self.election.lock().unwrap().as_ref() {
                handle.reset();
            }
        }
        if term < state.current_term {
            let reply = self.log_response(&state, 0, false);
            drop(state);
            drop(stepped_down_replicator);
            return reply;
        }

        let mut log = self.log.lock().unwrap();
        let log_ok = prefix_length == 0 || (prefix_length <= log.len() && prefix_term == log.term_at(prefix_length));
        if !log_ok {
            let reply = self.log_response(&state, 0, false);
            drop(log);
            drop(state);
            drop(stepped_down_replicator);
            return reply;
        }

        if !suffix.is_empty() || log.len() > prefix_length {
            self.append_entries_locked(&mut log, prefix_length, &suffix);
        }
        let ack = prefix_length + suffix.len();
        if commit_length > state.commit_length {
            self.advance_commit_to_locked(&mut state, &log, commit_length);
        }
        self.persist_or_die(&state);
        let reply = self.log_response(&state, ack, true);
        drop(log);
        drop(state);
        drop(stepped_down_replicator);
        reply
    }

    fn log_response(&self, state: &NodeState, ack: usize, success: bool) -> Message {
        Message::LogResponse {
            node_id: self.id.clone(),
            port: self.registry.peer_port(&self.id).unwrap_or(0),
            term: state.current_term,
            ack,
            success,
        }
    }

    /// `AppendEntries` log-matching repair (SPEC_FULL.md §4.3): drop the
    /// conflicting tail and append the leader's suffix, persisting every new
    /// entry to the log file.
    fn append_entries_locked(&self, log: &mut Log, prefix_length: usize, suffix: &[LogEntry]) {
        if log.len() > prefix_length {
            let conflicts = match (log.entry(prefix_length + 1), suffix.first()) {
                (Some(existing), Some(incoming)) => existing.term != incoming.term,
                (Some(_), None) => false,
                (None, _) => false,
            };
            if conflicts {
                log.truncate_to(prefix_length);
            }
        }
        if prefix_length + suffix.len() > log.len() {
            let mut store = self.store.lock().unwrap();
            let new_entries = &suffix[log.len() - prefix_length..];
            for entry in new_entries {
                if let Err(e) = store.append_log_record(entry) {
                    error!("{}: persistence failure, node cannot continue: {e}", self.id);
                    std::process::exit(1);
                }
                log.push(entry.clone());
            }
        }
    }

    fn advance_commit_to_locked(&self, state: &mut NodeState, log: &Log, new_commit_length: usize) {
        let target = new_commit_length.min(log.len());
        if target <= state.commit_length {
            return;
        }
        let mut applier = self.applier.lock().unwrap();
        for i in (state.commit_length + 1)..=target {
            if let Some(entry) = log.entry(i) {
                applier.apply(&entry.command);
            }
        }
        drop(applier);
        state.commit_length = target;
        self.commit_cv.notify_all();
    }

    pub fn handle_log_response(&self, from: NodeId, term: Term, ack: usize, success: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(old_replicator) = self.maybe_step_down(&mut state, term) {
            drop(state);
            drop(old_replicator);
            return;
        }
        if state.role != Role::Leader || term != state.current_term {
            return;
        }
        if success {
            let book = state.peers.entry(from).or_insert_with(PeerBook::default);
            book.acked_length = book.acked_length.max(ack);
            book.sent_length = book.sent_length.max(ack);
            self.try_advance_commit(&mut state);
        } else {
            let book = state.peers.entry(from.clone()).or_insert_with(PeerBook::default);
            book.sent_length = book.sent_length.saturating_sub(1);
            let sent_length = book.sent_length;
            drop(state);
            self.replicate_to_one(&from, sent_length);
        }
    }

    /// Commit rule (SPEC_FULL.md §4.3): advance `commitLength` to the
    /// highest index acknowledged by a quorum of the cluster, restricted to
    /// entries from the current term (the standard Raft safety guard against
    /// committing a previous leader's uncommitted entry indirectly). Must be
    /// called with `state` already locked; locks `log` and `applier`
    /// internally.
    fn try_advance_commit(&self, state: &mut NodeState) {
        let log = self.log.lock().unwrap();
        let alive = self.alive_n(state);
        let quorum = self.required_acks(alive);
        let mut new_commit_length = state.commit_length;
        for i in (state.commit_length + 1)..=log.len() {
            if log.term_at(i) != state.current_term {
                continue;
            }
            let acks = 1 + state.peers.values().filter(|book| book.acked_length >= i).count();
            if acks >= quorum {
                new_commit_length = i;
            }
        }
        if new_commit_length > state.commit_length {
            let mut applier = self.applier.lock().unwrap();
            for i in (state.commit_length + 1)..=new_commit_length {
                if let Some(entry) = log.entry(i) {
                    applier.apply(&entry.command);
                }
            }
            drop(applier);
            drop(log);
            state.commit_length = new_commit_length;
            self.persist_or_die(state);
            self.commit_cv.notify_all();
        }
    }

    // ---- leader broadcast (invoked by the replicator actor) --------------

    /// Sends `AppendEntries` to every peer, each tailored to that peer's
    /// `sentLength` (SPEC_FULL.md §4.3). Called periodically by the
    /// replicator while leading, and once immediately after a client write.
    pub fn replicate_to_all_peers(&self) {
        let targets: Vec<(NodeId, usize)> = {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return;
            }
            state.peers.iter().map(|(id, book)| (id.clone(), book.sent_length)).collect()
        };
        for (peer_id, sent_length) in targets {
            self.replicate_to_one(&peer_id, sent_length);
        }
    }

    fn replicate_to_one(&self, peer_id: &str, sent_length: usize) {
        let (term, commit_length, prefix_term, suffix) = {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return;
            }
            let log = self.log.lock().unwrap();
            let prefix_term = log.term_at(sent_length);
            let suffix = log.suffix_from(sent_length).to_vec();
            (state.current_term, state.commit_length, prefix_term, suffix)
        };
        let handles = self.peer_handles.lock().unwrap();
        if let Some(handle) = handles.get(peer_id) {
            handle.send(PeerCommand::AppendEntries {
                term,
                prefix_length: sent_length,
                prefix_term,
                commit_length,
                suffix,
            });
        }
    }

    // ---- outbound RPC outcome reporting (called by peer actors) ----------

    pub fn note_rpc_failure(&self, peer_id: &str) {
        self.mark_suspected(peer_id);
    }

    pub fn note_rpc_success(&self, peer_id: &str) {
        self.clear_suspected(peer_id);
    }

    // ---- client-facing write/read path (SPEC_FULL.md §4.5/§4.6) ----------

    /// Serves a `GET` directly from the applier; never touches the log.
    pub fn client_get(&self, key: &str) -> Result<i64, CommandError> {
        self.applier.lock().unwrap().get(key)
    }

    /// Returns the node id currently believed to be leader, if any, for
    /// forwarding a write this node cannot serve itself.
    pub fn leader_hint(&self) -> Option<NodeId> {
        self.state.lock().unwrap().leader_id.clone()
    }

    pub fn peer_client_addr(&self, node_id: &str) -> Option<std::net::SocketAddr> {
        self.registry.peer_addr(node_id)
    }

    /// Validates, then either appends-and-waits-for-commit (if leader) or
    /// reports the current leader hint for the caller to forward to
    /// (SPEC_FULL.md §4.5).
    pub fn client_write(&self, raw: &str) -> ClientWriteOutcome {
        let command = match Command::parse(raw) {
            Ok(command) => command,
            Err(e) => return ClientWriteOutcome::Rejected(e),
        };
        if matches!(command, Command::Get { .. }) {
            return ClientWriteOutcome::Rejected(CommandError::UnknownOperation);
        }

        let new_index = {
            let mut state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return ClientWriteOutcome::NotLeader(state.leader_id.clone());
            }
            let term = state.current_term;
            let mut log = self.log.lock().unwrap();
            let entry = LogEntry::new(command.to_log_command(), term);
            if let Err(e) = self.store.lock().unwrap().append_log_record(&entry) {
                error!("{}: persistence failure, node cannot continue: {e}", self.id);
                std::process::exit(1);
            }
            log.push(entry);
            let new_index = log.len();
            state.acked_length_self = new_index;
            drop(log);
            self.try_advance_commit(&mut state);
            new_index
        };

        self.replicate_to_all_peers();
        if self.wait_for_commit(new_index) {
            ClientWriteOutcome::Applied
        } else {
            ClientWriteOutcome::NotCommitted
        }
    }

    /// Blocks until `index` commits, this node steps down from leader, or
    /// 5s elapses. Returns whether `index` actually committed (SPEC_FULL.md
    /// §4.5: success means `commitLength >= index`, not merely "we stopped
    /// waiting").
    fn wait_for_commit(&self, index: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.commit_length < index && state.role == Role::Leader {
            let (next, timeout) = self.commit_cv.wait_timeout(state, Duration::from_secs(5)).unwrap();
            state = next;
            if timeout.timed_out() {
                warn!("{}: client write at index {index} still uncommitted after 5s", self.id);
                break;
            }
        }
        state.commit_length >= index
    }

    /// Handles one inbound peer RPC, dispatching to the appropriate handler
    /// and returning the reply to write back over the same connection
    /// (SPEC_FULL.md §4.8). `VoteResponse`/`LogResponse` never arrive here:
    /// they are read directly by the peer actor that issued the request.
    pub fn dispatch(&self, message: Message) -> Option<Message> {
        match message {
            Message::VoteRequest { candidate_id, term, log_length, last_log_term } => {
                Some(self.handle_vote_request(candidate_id, term, log_length, last_log_term))
            }
            Message::LogRequest { leader_id, term, prefix_length, prefix_term, commit_length, suffix } => {
                Some(self.handle_log_request(leader_id, term, prefix_length, prefix_term, commit_length, suffix))
            }
            Message::VoteResponse { .. } | Message::LogResponse { .. } => None,
        }
    }
}

pub enum ClientWriteOutcome {
    Applied,
    Rejected(CommandError),
    NotLeader(Option<NodeId>),
    /// Appended but not confirmed committed before the node stepped down or
    /// the 5s wait elapsed. The client should retry.
    NotCommitted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerRegistry;
    use crate::log::StateTriple;

    /// Builds a bare `Server` with no peer/election/replicator actors
    /// running, so handler methods can be exercised directly and
    /// deterministically -- the actor threads exist to drive real network
    /// I/O, which these tests never need.
    fn bare_server(id: &str, registry_lines: &str) -> (Server, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let peers_path = dir.path().join("peers.txt");
        std::fs::write(&peers_path, registry_lines).unwrap();
        let registry = PeerRegistry::load(&peers_path).unwrap();
        let store = crate::log::StateStore::new(dir.path(), id).unwrap();

        let server = Server {
            id: id.to_string(),
            cluster_size: registry.len(),
            registry,
            state: Mutex::new(NodeState::from_triple(&StateTriple::initial())),
            commit_cv: Condvar::new(),
            log: Mutex::new(Log::new()),
            store: Mutex::new(store),
            applier: Mutex::new(Applier::new()),
            peer_handles: Mutex::new(std::collections::HashMap::new()),
            election: Mutex::new(None),
            replicator: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
        };
        (server, dir)
    }

    #[test]
    fn single_node_cluster_commits_immediately() {
        let (server, _dir) = bare_server("a", "a,9001\n");
        {
            let mut state = server.state.lock().unwrap();
            state.role = Role::Leader;
            state.current_term = 1;
        }
        match server.client_write("SET x 7") {
            ClientWriteOutcome::Applied => {}
            _ => panic!("expected a single-node cluster to commit immediately"),
        }
        assert_eq!(server.client_get("x").unwrap(), 7);
        assert_eq!(server.state.lock().unwrap().commit_length, 1);
    }

    #[test]
    fn non_leader_reports_leader_hint() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\n");
        {
            let mut state = server.state.lock().unwrap();
            state.leader_id = Some("b".to_string());
        }
        match server.client_write("SET x 7") {
            ClientWriteOutcome::NotLeader(Some(leader)) => assert_eq!(leader, "b"),
            _ => panic!("expected a forwarding hint to the known leader"),
        }
    }

    #[test]
    fn vote_request_grants_first_vote_in_term_then_refuses_a_second() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\nc,9003\n");
        let reply = server.handle_vote_request("b".to_string(), 1, 0, 0);
        assert!(matches!(reply, Message::VoteResponse { granted: true, term: 1, .. }));

        let reply = server.handle_vote_request("c".to_string(), 1, 0, 0);
        assert!(matches!(reply, Message::VoteResponse { granted: false, .. }));
    }

    #[test]
    fn vote_request_with_shorter_log_is_refused() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\n");
        {
            let mut log = server.log.lock().unwrap();
            log.push(LogEntry::new("SET a 1", 2));
            log.push(LogEntry::new("SET b 2", 2));
            let mut state = server.state.lock().unwrap();
            state.current_term = 2;
        }
        // Candidate's log is the same last term but strictly shorter.
        let reply = server.handle_vote_request("b".to_string(), 2, 1, 2);
        assert!(matches!(reply, Message::VoteResponse { granted: false, .. }));
    }

    #[test]
    fn append_entries_with_zero_prefix_always_succeeds_on_log_ok() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\n");
        let reply = server.handle_log_request(
            "b".to_string(),
            1,
            0,
            0,
            0,
            vec![LogEntry::new("SET x 7", 1)],
        );
        assert!(matches!(reply, Message::LogResponse { success: true, ack: 1, .. }));
        assert_eq!(server.log.lock().unwrap().len(), 1);
    }

    #[test]
    fn append_entries_commit_advance_applies_entries() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\n");
        server.handle_log_request("b".to_string(), 1, 0, 0, 0, vec![LogEntry::new("SET x 7", 1)]);
        let reply = server.handle_log_request("b".to_string(), 1, 1, 1, 1, vec![]);
        assert!(matches!(reply, Message::LogResponse { success: true, ack: 1, .. }));
        assert_eq!(server.client_get("x").unwrap(), 7);
        assert_eq!(server.state.lock().unwrap().commit_length, 1);
    }

    #[test]
    fn divergent_tail_is_truncated_on_conflicting_prefix_term() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\n");
        {
            let mut log = server.log.lock().unwrap();
            log.push(LogEntry::new("SET c1 1", 1));
            log.push(LogEntry::new("SET cx 99", 1));
        }
        // Leader's own history is [(c1,1),(c2,2)], commitLength=1: this
        // follower's divergent second entry must be discarded.
        let reply = server.handle_log_request("b".to_string(), 2, 1, 1, 1, vec![LogEntry::new("SET c2 2", 2)]);
        assert!(matches!(reply, Message::LogResponse { success: true, ack: 2, .. }));
        let log = server.log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.entry(2).unwrap().command, "SET c2 2");
    }

    #[test]
    fn stale_term_append_entries_is_rejected() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\n");
        {
            let mut state = server.state.lock().unwrap();
            state.current_term = 5;
        }
        let reply = server.handle_log_request("b".to_string(), 1, 0, 0, 0, vec![]);
        assert!(matches!(reply, Message::LogResponse { success: false, ack: 0, .. }));
    }

    #[test]
    fn commit_rule_requires_majority_ack_at_the_leaders_own_term() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\nc,9003\n");
        {
            let mut state = server.state.lock().unwrap();
            state.role = Role::Leader;
            state.current_term = 1;
            state.peers.insert("b".to_string(), PeerBook { sent_length: 0, acked_length: 0 });
            state.peers.insert("c".to_string(), PeerBook { sent_length: 0, acked_length: 0 });
        }
        {
            let mut log = server.log.lock().unwrap();
            log.push(LogEntry::new("SET x 7", 1));
        }
        {
            let mut state = server.state.lock().unwrap();
            server.try_advance_commit(&mut state);
            assert_eq!(state.commit_length, 0, "leader alone is not yet a majority of three");
        }

        server.handle_log_response("b".to_string(), 1, 1, true);
        assert_eq!(server.state.lock().unwrap().commit_length, 1, "leader + one follower is a majority of three");
    }

    #[test]
    fn commit_rule_never_commits_a_stale_terms_entry_alone() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\n");
        {
            let mut state = server.state.lock().unwrap();
            state.role = Role::Leader;
            state.current_term = 2;
            state.peers.insert("b".to_string(), PeerBook { sent_length: 0, acked_length: 2 });
        }
        {
            let mut log = server.log.lock().unwrap();
            log.push(LogEntry::new("SET x 7", 1)); // stale term, leader is now in term 2
            log.push(LogEntry::new("SET y 9", 2));
        }
        let mut state = server.state.lock().unwrap();
        server.try_advance_commit(&mut state);
        // Both entries commit together because the second (current-term) entry
        // pulls the first in transitively, but neither commits on its own merit.
        assert_eq!(state.commit_length, 2);
    }

    #[test]
    fn failed_append_entries_walks_sent_length_back() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\n");
        {
            let mut state = server.state.lock().unwrap();
            state.role = Role::Leader;
            state.current_term = 1;
            state.peers.insert("b".to_string(), PeerBook { sent_length: 3, acked_length: 0 });
        }
        server.handle_log_response("b".to_string(), 1, 0, false);
        let state = server.state.lock().unwrap();
        assert_eq!(state.peers.get("b").unwrap().sent_length, 2);
    }

    #[test]
    fn sent_length_does_not_walk_back_past_zero() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\n");
        {
            let mut state = server.state.lock().unwrap();
            state.role = Role::Leader;
            state.current_term = 1;
            state.peers.insert("b".to_string(), PeerBook { sent_length: 0, acked_length: 0 });
        }
        server.handle_log_response("b".to_string(), 1, 0, false);
        let state = server.state.lock().unwrap();
        assert_eq!(state.peers.get("b").unwrap().sent_length, 0);
    }

    #[test]
    fn larger_term_in_vote_request_steps_leader_down_to_follower() {
        let (server, _dir) = bare_server("a", "a,9001\nb,9002\n");
        {
            let mut state = server.state.lock().unwrap();
            state.role = Role::Leader;
            state.current_term = 1;
        }
        let _ = server.handle_vote_request("b".to_string(), 5, 0, 0);
        let state = server.state.lock().unwrap();
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.current_term, 5);
    }
}
